//! Streams: end-to-end encrypted byte channels between two clients.
//!
//! User bytes never cross the relay in the clear: writes are chunked,
//! encrypted under the stream cipher established by the KK handshake, and
//! length-framed; reads deframe and decrypt, serving partial reads from a
//! plaintext carry-over buffer. The relay only ever copies ciphertext.

use std::fmt;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use weft_core::{MAX_FRAME, STREAM_WRITE_CHUNK};
use weft_crypto::StreamCipher;
use weft_proto::Addr;

use crate::mux::SubStream;
use crate::porter::PortGuard;
use crate::SessionError;

/// A reliable, ordered, end-to-end encrypted byte channel.
///
/// Created by [`ClientSession::dial_stream`](crate::ClientSession::dial_stream)
/// on the initiator and delivered through a [`Listener`](crate::Listener) on
/// the responder.
pub struct Stream {
    sub: SubStream,
    cipher: StreamCipher,
    local: Addr,
    remote: Addr,
    guard: PortGuard,
    session_closed: CancellationToken,
    pending: Vec<u8>,
    pending_pos: usize,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    eof: bool,
    closed: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        sub: SubStream,
        cipher: StreamCipher,
        local: Addr,
        remote: Addr,
        guard: PortGuard,
        session_closed: CancellationToken,
    ) -> Self {
        Self {
            sub,
            cipher,
            local,
            remote,
            guard,
            session_closed,
            pending: Vec::new(),
            pending_pos: 0,
            read_deadline: None,
            write_deadline: None,
            eof: false,
            closed: false,
        }
    }

    /// Local address of the stream.
    pub fn local_addr(&self) -> Addr {
        self.local
    }

    /// Remote address of the stream.
    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    /// Reads decrypted bytes into `buf`. Returns `Ok(0)` on EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.closed {
            return Err(SessionError::SubStreamClosed);
        }
        loop {
            let carried = self.pending.len() - self.pending_pos;
            if carried > 0 {
                let n = carried.min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                if self.pending_pos == self.pending.len() {
                    self.pending.clear();
                    self.pending_pos = 0;
                }
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            let deadline = self.read_deadline;
            let frame = tokio::select! {
                biased;
                _ = self.session_closed.cancelled() => return Err(SessionError::SessionClosed),
                r = with_deadline(deadline, read_stream_frame(&mut self.sub, &mut self.cipher)) => r?,
            };
            match frame {
                Some(plain) => {
                    self.pending = plain;
                    self.pending_pos = 0;
                }
                None => {
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
    }

    /// Encrypts and writes all of `buf`, chunked into frames.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SessionError> {
        if self.closed {
            return Err(SessionError::SubStreamClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.write_deadline;
        for chunk in buf.chunks(STREAM_WRITE_CHUNK) {
            let sealed = self.cipher.seal(chunk).map_err(SessionError::Crypto)?;
            let mut frame = Vec::with_capacity(4 + sealed.len());
            frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            frame.extend_from_slice(&sealed);

            let sub = &mut self.sub;
            tokio::select! {
                biased;
                _ = self.session_closed.cancelled() => return Err(SessionError::SessionClosed),
                r = with_deadline(deadline, async move {
                    sub.write_all(&frame).await?;
                    Ok::<(), SessionError>(())
                }) => r?,
            }
        }
        self.sub.flush().await?;
        Ok(buf.len())
    }

    /// Writes all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        self.write(buf).await.map(|_| ())
    }

    /// Sets both deadlines. `None` clears.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.write_deadline = deadline;
    }

    /// Sets the read deadline. `None` clears.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    /// Sets the write deadline. `None` clears.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Closes the stream: releases the port reservation (exactly once) and
    /// half-closes the substream so the peer observes EOF. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.guard.release();
        let _ = self.sub.shutdown().await;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.guard.release();
    }
}

/// Reads one encrypted frame; `Ok(None)` on clean EOF at a frame boundary.
async fn read_stream_frame(
    sub: &mut SubStream,
    cipher: &mut StreamCipher,
) -> Result<Option<Vec<u8>>, SessionError> {
    let mut len_bytes = [0u8; 4];
    match sub.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SessionError::Io(e)),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(SessionError::FrameTooLarge(len));
    }
    let mut sealed = vec![0u8; len];
    sub.read_exact(&mut sealed).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SessionError::ShortRead,
        _ => SessionError::Io(e),
    })?;
    let plain = cipher
        .open(&sealed)
        .map_err(|_| SessionError::DecryptFailed)?;
    Ok(Some(plain))
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    match deadline {
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "stream deadline exceeded",
            ))),
        },
        None => fut.await,
    }
}
