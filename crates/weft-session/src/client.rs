//! The client side of a session.
//!
//! A [`ClientSession`] wraps one authenticated connection to a relay server:
//! it opens substreams to dial remote clients and accepts substreams for
//! incoming dials, delivering them to the listener registered on the
//! destination port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::{STREAM_HANDSHAKE_TIMEOUT, TIMESTAMP_WINDOW};
use weft_crypto::{Keypair, PublicKey, SessionCipher, StreamHandshake};
use weft_proto::{reject, Addr, DialRequest, DialResponse};

use crate::mux::{self, MuxHandle, MuxIncoming, SubStream};
use crate::porter::{PortEntry, PortGuard, Porter, StreamEntry};
use crate::{codec, handshake, unix_now_ns, Conn, SessionError, Stream};

/// A client's session with one relay server. Cheap to clone; all clones
/// refer to the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

struct Inner {
    local: Keypair,
    remote: PublicKey,
    porter: Porter,
    cipher: Arc<SessionCipher>,
    mux: MuxHandle,
    incoming: AsyncMutex<MuxIncoming>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// Port reservations of streams born on this session, released on
    /// cascade close. Guards are also held by their streams; release is
    /// idempotent.
    children: Mutex<Vec<PortGuard>>,
}

impl ClientSession {
    /// Brings up a session over `conn`: runs the session handshake against
    /// the server identified by `remote_pk`, then starts the multiplexer.
    pub async fn connect<C>(
        conn: C,
        local: Keypair,
        remote_pk: PublicKey,
        porter: Porter,
    ) -> Result<Self, SessionError>
    where
        C: Conn + 'static,
    {
        let parts = handshake::initiate(conn, &local, remote_pk).await?;
        let (mux_handle, incoming) = mux::start(parts.conn, yamux::Mode::Client);
        debug!(server = %parts.remote, "session established");
        Ok(Self {
            inner: Arc::new(Inner {
                local,
                remote: parts.remote,
                porter,
                cipher: parts.cipher,
                mux: mux_handle,
                incoming: AsyncMutex::new(incoming),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Local identity of this session.
    pub fn local_pk(&self) -> PublicKey {
        self.inner.local.public()
    }

    /// Authenticated identity of the server.
    pub fn remote_pk(&self) -> PublicKey {
        self.inner.remote
    }

    /// The porter shared by this session.
    pub fn porter(&self) -> &Porter {
        &self.inner.porter
    }

    /// Dials a stream to `dst` through the relay.
    ///
    /// Reserves an ephemeral source port, sends a signed dial request
    /// carrying the first end-to-end handshake message, and completes the
    /// stream handshake from the response. Cancelling `cancel` unblocks any
    /// in-progress I/O; the reservation and substream are cleaned up on
    /// every failure path.
    pub async fn dial_stream(
        &self,
        dst: Addr,
        cancel: &CancellationToken,
    ) -> Result<Stream, SessionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::SessionClosed);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Canceled),
            _ = self.inner.cancel.cancelled() => Err(SessionError::SessionClosed),
            result = self.dial_inner(dst) => result,
        }
    }

    async fn dial_inner(&self, dst: Addr) -> Result<Stream, SessionError> {
        let inner = &self.inner;
        let mut sub = inner.mux.open().await?;
        // Dropping `guard` on any failure path below releases the port;
        // dropping `sub` resets the substream.
        let (port, guard) = inner
            .porter
            .reserve_ephemeral(|_| PortEntry::Stream(StreamEntry { remote: dst }))?;
        let local_addr = Addr::new(inner.local.public(), port);

        let mut hs = StreamHandshake::initiator(&inner.local, &dst.pk)
            .map_err(SessionError::HandshakeFailed)?;
        let first = hs.write_message().map_err(SessionError::HandshakeFailed)?;
        let request = DialRequest::new_signed(
            unix_now_ns(),
            local_addr,
            dst,
            first,
            inner.local.secret(),
        );
        codec::write_request(&mut sub, &inner.cipher, &request).await?;

        let response = codec::read_response(&mut sub, &inner.cipher).await?;
        response
            .verify(&dst.pk, &request.hash())
            .map_err(SessionError::from_proto)?;
        if !response.accepted {
            return Err(match response.reject_reason() {
                reject::NO_LISTENER => SessionError::NoListener,
                reject::BUSY_LISTENER => SessionError::BusyListener,
                _ => SessionError::Rejected,
            });
        }
        hs.read_message(&response.handshake)
            .map_err(SessionError::HandshakeFailed)?;
        let cipher = hs.into_transport().map_err(SessionError::HandshakeFailed)?;

        debug!(local = %local_addr, remote = %dst, "stream dialed");
        let stream = Stream::new(
            sub,
            cipher,
            local_addr,
            dst,
            guard.clone(),
            inner.cancel.child_token(),
        );
        self.track(guard);
        Ok(stream)
    }

    /// Accepts one inbound substream and runs the responder side of the
    /// stream handshake, delivering the stream to the listener on the
    /// requested port. The whole exchange is bounded by the stream
    /// handshake timeout.
    pub async fn accept_stream(&self) -> Result<(), SessionError> {
        let sub = {
            let mut incoming = self.inner.incoming.lock().await;
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(SessionError::SessionClosed),
                sub = incoming.next() => sub.ok_or(SessionError::SessionClosed)?,
            }
        };
        match tokio::time::timeout(STREAM_HANDSHAKE_TIMEOUT, self.handle_inbound(sub)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeTimeout),
        }
    }

    async fn handle_inbound(&self, mut sub: SubStream) -> Result<(), SessionError> {
        let inner = &self.inner;
        let request = codec::read_request(&mut sub, &inner.cipher).await?;

        if let Err(e) = request.verify(unix_now_ns(), TIMESTAMP_WINDOW.as_nanos() as u64) {
            self.reject(&mut sub, &request, reject::GENERIC).await;
            return Err(SessionError::from_proto(e));
        }
        if request.dst.pk != inner.local.public() {
            self.reject(&mut sub, &request, reject::GENERIC).await;
            return Err(SessionError::InvalidDestination);
        }

        let listener = match inner.porter.lookup(request.dst.port) {
            Some(PortEntry::Listener(handle)) => handle,
            _ => {
                self.reject(&mut sub, &request, reject::NO_LISTENER).await;
                return Err(SessionError::NoListener);
            }
        };
        // Claim the inbox slot before telling the dialer "accepted".
        let permit = match listener.reserve_slot() {
            Ok(permit) => permit,
            Err(e) => {
                let reason = match e {
                    SessionError::BusyListener => reject::BUSY_LISTENER,
                    _ => reject::NO_LISTENER,
                };
                self.reject(&mut sub, &request, reason).await;
                return Err(e);
            }
        };
        // The stream's backing reservation, distinct from the listener port.
        let (_port, guard) = match inner
            .porter
            .reserve_ephemeral(|_| PortEntry::Stream(StreamEntry { remote: request.src }))
        {
            Ok(reserved) => reserved,
            Err(e) => {
                self.reject(&mut sub, &request, reject::GENERIC).await;
                return Err(e);
            }
        };

        let mut hs = match StreamHandshake::responder(&inner.local, &request.src.pk) {
            Ok(hs) => hs,
            Err(e) => {
                self.reject(&mut sub, &request, reject::GENERIC).await;
                return Err(SessionError::HandshakeFailed(e));
            }
        };
        if let Err(e) = hs.read_message(&request.handshake) {
            self.reject(&mut sub, &request, reject::GENERIC).await;
            return Err(SessionError::HandshakeFailed(e));
        }
        let second = match hs.write_message() {
            Ok(msg) => msg,
            Err(e) => {
                self.reject(&mut sub, &request, reject::GENERIC).await;
                return Err(SessionError::HandshakeFailed(e));
            }
        };

        let response =
            DialResponse::new_signed(request.hash(), true, second, inner.local.secret());
        codec::write_response(&mut sub, &inner.cipher, &response).await?;
        let cipher = hs.into_transport().map_err(SessionError::HandshakeFailed)?;

        // The stream keeps the listener's address as its local address so
        // both ends agree on the address pair.
        let local_addr = Addr::new(inner.local.public(), request.dst.port);
        debug!(local = %local_addr, remote = %request.src, "stream accepted");
        let stream = Stream::new(
            sub,
            cipher,
            local_addr,
            request.src,
            guard.clone(),
            inner.cancel.child_token(),
        );
        permit.send(stream);
        self.track(guard);
        Ok(())
    }

    /// Runs the accept loop: per-stream failures are logged and skipped,
    /// session-fatal failures close the session and end the loop.
    pub async fn serve(&self) {
        loop {
            match self.accept_stream().await {
                Ok(()) => {}
                Err(e) if e.is_session_fatal() => {
                    debug!(server = %self.inner.remote, "session accept loop exiting: {e}");
                    self.close().await;
                    break;
                }
                Err(e) => debug!("inbound stream rejected: {e}"),
            }
        }
    }

    /// Closes the session: cancels all child streams, releases their port
    /// reservations, and shuts the multiplexer down. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let guards: Vec<PortGuard> = {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            children.drain(..).collect()
        };
        for guard in guards {
            guard.release();
        }
        self.inner.mux.close();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn reject(&self, sub: &mut SubStream, request: &DialRequest, reason: u8) {
        let response = DialResponse::new_signed(
            request.hash(),
            false,
            vec![reason],
            self.inner.local.secret(),
        );
        if let Err(e) = codec::write_response(sub, &self.inner.cipher, &response).await {
            debug!("failed to send rejection: {e}");
        }
    }

    fn track(&self, guard: PortGuard) {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        children.retain(|g| !g.is_released());
        children.push(guard);
    }
}
