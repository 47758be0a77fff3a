//! Listeners: the accepting side of the port registry.
//!
//! A listener owns its port until closed and holds a bounded inbox of
//! streams that completed the accept handshake but have not been claimed by
//! the application yet. The porter stores a [`ListenerHandle`], which is
//! what the accept path uses to introduce new streams.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use weft_core::LISTENER_INBOX_CAPACITY;

use crate::porter::{PortEntry, PortGuard, Porter};
use crate::{SessionError, Stream};

/// Application-facing accepting endpoint bound to one local port.
pub struct Listener {
    port: u16,
    rx: mpsc::Receiver<Stream>,
    guard: PortGuard,
    closed_signal: CancellationToken,
    closed: bool,
}

/// Porter-side handle used to deliver accepted streams. Cheap to clone.
#[derive(Clone)]
pub struct ListenerHandle {
    tx: mpsc::Sender<Stream>,
    closed_signal: CancellationToken,
}

/// Binds a listener on a specific port.
pub fn listen(porter: &Porter, port: u16) -> Result<Listener, SessionError> {
    let (tx, rx) = mpsc::channel(LISTENER_INBOX_CAPACITY);
    let closed_signal = CancellationToken::new();
    let handle = ListenerHandle {
        tx,
        closed_signal: closed_signal.clone(),
    };
    let guard = porter.reserve(port, PortEntry::Listener(handle))?;
    Ok(Listener {
        port,
        rx,
        guard,
        closed_signal,
        closed: false,
    })
}

/// Binds a listener on a porter-chosen ephemeral port.
pub fn listen_ephemeral(porter: &Porter) -> Result<Listener, SessionError> {
    let (tx, rx) = mpsc::channel(LISTENER_INBOX_CAPACITY);
    let closed_signal = CancellationToken::new();
    let handle = ListenerHandle {
        tx,
        closed_signal: closed_signal.clone(),
    };
    let (port, guard) = porter.reserve_ephemeral(|_| PortEntry::Listener(handle))?;
    Ok(Listener {
        port,
        rx,
        guard,
        closed_signal,
        closed: false,
    })
}

impl Listener {
    /// The local port this listener owns.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for the next incoming stream.
    ///
    /// Returns `ListenerClosed` once the listener has been closed, including
    /// for calls made after the fact.
    pub async fn accept(&mut self) -> Result<Stream, SessionError> {
        if self.closed {
            return Err(SessionError::ListenerClosed);
        }
        tokio::select! {
            _ = self.closed_signal.cancelled() => Err(SessionError::ListenerClosed),
            stream = self.rx.recv() => stream.ok_or(SessionError::ListenerClosed),
        }
    }

    /// Closes the listener: stops introductions, closes any queued streams,
    /// and releases the port. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.closed_signal.cancel();
        self.rx.close();
        while let Ok(mut stream) = self.rx.try_recv() {
            let _ = stream.close().await;
        }
        self.guard.release();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Queued streams release their own ports on drop.
        self.closed_signal.cancel();
        self.guard.release();
    }
}

impl ListenerHandle {
    /// Reserves an inbox slot ahead of the accept response, so a full or
    /// closed inbox is known before the dialer is told "accepted".
    pub(crate) fn reserve_slot(&self) -> Result<mpsc::Permit<'_, Stream>, SessionError> {
        if self.closed_signal.is_cancelled() {
            return Err(SessionError::NoListener);
        }
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => SessionError::BusyListener,
            mpsc::error::TrySendError::Closed(()) => SessionError::NoListener,
        })
    }
}
