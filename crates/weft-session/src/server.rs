//! The server side of a session: relay forwarding.
//!
//! A [`ServerSession`] is the relay's view of one connected client. Its
//! accept loop takes inbound substreams and hands each to an independent
//! forward task, which walks the dial exchange
//! (`request -> destination lookup -> response`) and then turns into an
//! opaque byte pump between the two substreams. The relay re-encrypts dial
//! records between the two session ciphers but never holds a stream key:
//! relayed stream traffic is ciphertext it cannot read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::io::relay_bidirectional;
use weft_core::{
    DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_RELAY_IDLE_TIMEOUT, STREAM_HANDSHAKE_TIMEOUT,
    TIMESTAMP_WINDOW,
};
use weft_crypto::{Keypair, PublicKey, SessionCipher};

use crate::mux::{self, MuxHandle, MuxIncoming, SubStream};
use crate::{codec, handshake, unix_now_ns, Conn, SessionError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Resolves a destination key to its live session, if any.
///
/// Implemented by the server's session registry; the relay consults it for
/// every forwarded dial.
pub trait SessionLookup: Send + Sync {
    fn session(&self, pk: &PublicKey) -> Option<ServerSessionHandle>;
}

/// Clonable handle to a server session, as stored in the registry and used
/// by forward tasks to reach the destination client.
#[derive(Clone)]
pub struct ServerSessionHandle {
    id: u64,
    peer: PublicKey,
    mux: MuxHandle,
    cipher: Arc<SessionCipher>,
    cancel: CancellationToken,
}

impl ServerSessionHandle {
    /// Unique id of the session behind this handle, for registry bookkeeping
    /// when a reconnecting client replaces its old session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The authenticated client identity of this session.
    pub fn peer_pk(&self) -> PublicKey {
        self.peer
    }

    /// Asks the session to shut down: its accept loop exits and the
    /// multiplexer closes.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// The relay's side of one client session.
pub struct ServerSession {
    handle: ServerSessionHandle,
    incoming: MuxIncoming,
    lookup: Arc<dyn SessionLookup>,
    relay_idle_timeout: Duration,
    relay_buffer_size: usize,
}

impl ServerSession {
    /// Responds to the session handshake on `conn` and starts the
    /// multiplexer. The peer's identity is learned, and authenticated,
    /// during the handshake.
    pub async fn respond<C>(
        conn: C,
        local: Keypair,
        lookup: Arc<dyn SessionLookup>,
    ) -> Result<Self, SessionError>
    where
        C: Conn + 'static,
    {
        let parts = handshake::respond(conn, &local).await?;
        let (mux_handle, incoming) = mux::start(parts.conn, yamux::Mode::Server);
        debug!(peer = %parts.remote, "client session established");
        Ok(Self {
            handle: ServerSessionHandle {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                peer: parts.remote,
                mux: mux_handle,
                cipher: parts.cipher,
                cancel: CancellationToken::new(),
            },
            incoming,
            lookup,
            relay_idle_timeout: DEFAULT_RELAY_IDLE_TIMEOUT,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        })
    }

    /// Overrides the relay idle timeout.
    pub fn set_relay_idle_timeout(&mut self, timeout: Duration) {
        self.relay_idle_timeout = timeout;
    }

    /// The authenticated client identity of this session.
    pub fn peer_pk(&self) -> PublicKey {
        self.handle.peer
    }

    /// A clonable handle for the registry.
    pub fn handle(&self) -> ServerSessionHandle {
        self.handle.clone()
    }

    /// Accepts inbound substreams and spawns a forward task for each; the
    /// accept loop itself never blocks on a forward. Exits when the session
    /// is closed or the multiplexer ends, closing the multiplexer on the
    /// way out.
    pub async fn serve(&mut self) {
        loop {
            let sub = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => break,
                sub = self.incoming.next() => match sub {
                    Some(sub) => sub,
                    None => break,
                },
            };
            let forward = Forward {
                local: self.handle.clone(),
                lookup: Arc::clone(&self.lookup),
                idle_timeout: self.relay_idle_timeout,
                buffer_size: self.relay_buffer_size,
            };
            tokio::spawn(async move {
                if let Err(e) = forward.run(sub).await {
                    debug!("forward closed: {e}");
                }
            });
        }
        self.handle.mux.close();
        debug!(peer = %self.handle.peer, "session accept loop stopped");
    }

    /// Closes the session.
    pub fn close(&self) {
        self.handle.close();
    }
}

/// One forwarded substream: request, peer lookup, response, then relay.
struct Forward {
    local: ServerSessionHandle,
    lookup: Arc<dyn SessionLookup>,
    idle_timeout: Duration,
    buffer_size: usize,
}

impl Forward {
    async fn run(&self, mut sub: SubStream) -> Result<(), SessionError> {
        // Await request. A poisoned session cipher makes every further
        // frame on that session untrustworthy, so cipher failures close the
        // session they happened on; everything else closes only this
        // forward.
        let request = match tokio::time::timeout(
            STREAM_HANDSHAKE_TIMEOUT,
            codec::read_request(&mut sub, &self.local.cipher),
        )
        .await
        {
            Err(_) => return Err(SessionError::HandshakeTimeout),
            Ok(Err(e)) => {
                if e.is_session_fatal() {
                    self.local.close();
                }
                return Err(e);
            }
            Ok(Ok(request)) => request,
        };

        request
            .verify(unix_now_ns(), TIMESTAMP_WINDOW.as_nanos() as u64)
            .map_err(SessionError::from_proto)?;
        // The claimed source must be the client this session authenticated.
        if request.src.pk != self.local.peer {
            return Err(SessionError::InvalidSource);
        }

        // Await peer session.
        let dst = self
            .lookup
            .session(&request.dst.pk)
            .ok_or(SessionError::NoSession)?;

        // Await peer response: forward the request re-encrypted under the
        // destination session's cipher, and verify what comes back before
        // letting it anywhere near the dialer.
        let mut sub2 = dst
            .mux
            .open()
            .await
            .map_err(|_| SessionError::NoSession)?;
        let forwarded = tokio::time::timeout(STREAM_HANDSHAKE_TIMEOUT, async {
            codec::write_request(&mut sub2, &dst.cipher, &request).await?;
            codec::read_response(&mut sub2, &dst.cipher).await
        })
        .await;
        let response = match forwarded {
            Err(_) => return Err(SessionError::HandshakeTimeout),
            Ok(Err(e)) => {
                if e.is_session_fatal() {
                    dst.close();
                }
                return Err(e);
            }
            Ok(Ok(response)) => response,
        };
        response
            .verify(&request.dst.pk, &request.hash())
            .map_err(SessionError::from_proto)?;

        if let Err(e) = codec::write_response(&mut sub, &self.local.cipher, &response).await {
            if e.is_session_fatal() {
                self.local.close();
            }
            return Err(e);
        }
        if !response.accepted {
            return Ok(());
        }

        // Relaying: opaque bytes both ways until either side finishes.
        debug!(src = %request.src, dst = %request.dst, "relaying");
        let stats =
            relay_bidirectional(sub, sub2, self.idle_timeout, self.buffer_size).await?;
        debug!(
            src = %request.src,
            dst = %request.dst,
            up = stats.a_to_b,
            down = stats.b_to_a,
            "relay finished"
        );
        Ok(())
    }
}
