//! Substream multiplexer plumbing.
//!
//! A dedicated driver task owns the `yamux::Connection`; everything else
//! talks to it through channels. Opening a substream is a command with a
//! oneshot reply; inbound substreams are delivered through a bounded queue.
//! When the driver exits, pending opens fail with `SessionClosed` and the
//! inbound queue ends.

use std::collections::VecDeque;
use std::task::Poll;

use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use weft_core::{MUX_CLOSE_TIMEOUT, SESSION_INBOX_CAPACITY};

use crate::{Conn, SessionError};

/// A multiplexed substream, exposed with tokio I/O traits.
pub(crate) type SubStream = Compat<yamux::Stream>;

struct OpenCmd {
    reply: oneshot::Sender<SubStream>,
}

/// Handle for opening substreams and closing the multiplexer. Cheap to clone.
#[derive(Clone)]
pub(crate) struct MuxHandle {
    cmd_tx: mpsc::Sender<OpenCmd>,
    shutdown: CancellationToken,
}

impl MuxHandle {
    /// Opens a new outbound substream.
    pub(crate) async fn open(&self) -> Result<SubStream, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(OpenCmd { reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Initiates a graceful close of the multiplexer.
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Receiving side for inbound substreams. Owned by the session accept loop.
pub(crate) struct MuxIncoming {
    rx: mpsc::Receiver<SubStream>,
}

impl MuxIncoming {
    /// Next inbound substream; `None` once the multiplexer is gone.
    pub(crate) async fn next(&mut self) -> Option<SubStream> {
        self.rx.recv().await
    }
}

/// Starts the multiplexer on `conn` and spawns its driver task.
pub(crate) fn start(conn: Box<dyn Conn + 'static>, mode: yamux::Mode) -> (MuxHandle, MuxIncoming) {
    let connection = yamux::Connection::new(conn.compat(), yamux::Config::default(), mode);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_INBOX_CAPACITY);
    let shutdown = CancellationToken::new();

    tokio::spawn(drive(connection, cmd_rx, inbound_tx, shutdown.clone()));

    (MuxHandle { cmd_tx, shutdown }, MuxIncoming { rx: inbound_rx })
}

/// Owns the connection: serves open commands, surfaces inbound substreams,
/// and performs the goodbye when asked to shut down.
async fn drive(
    mut connection: yamux::Connection<Compat<Box<dyn Conn + 'static>>>,
    mut cmd_rx: mpsc::Receiver<OpenCmd>,
    inbound_tx: mpsc::Sender<SubStream>,
    shutdown: CancellationToken,
) {
    let mut pending: VecDeque<oneshot::Sender<SubStream>> = VecDeque::new();
    let mut cmds_done = false;

    let result = {
        let pending = &mut pending;
        let cmds_done = &mut cmds_done;
        let connection = &mut connection;
        let cmd_rx = &mut cmd_rx;
        let inbound_tx = &inbound_tx;

        let driver = std::future::poll_fn(move |cx| {
            if !*cmds_done {
                loop {
                    match cmd_rx.poll_recv(cx) {
                        Poll::Ready(Some(cmd)) => pending.push_back(cmd.reply),
                        Poll::Ready(None) => {
                            *cmds_done = true;
                            break;
                        }
                        Poll::Pending => break,
                    }
                }
            }

            while !pending.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        if let Some(reply) = pending.pop_front() {
                            // A dropped receiver means the dial was canceled;
                            // the substream is dropped and reset here.
                            let _ = reply.send(stream.compat());
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }

            loop {
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(stream))) => {
                        if let Err(e) = inbound_tx.try_send(stream.compat()) {
                            trace!("inbound substream dropped: {e}");
                        }
                    }
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }
        });
        tokio::pin!(driver);

        tokio::select! {
            r = &mut driver => Some(r),
            _ = shutdown.cancelled() => None,
        }
    };

    match result {
        Some(Ok(())) => debug!("multiplexer closed by peer"),
        Some(Err(e)) => debug!("multiplexer terminated: {e}"),
        None => {
            // Asked to shut down; give the goodbye a bounded moment.
            let close = std::future::poll_fn(|cx| connection.poll_close(cx));
            if tokio::time::timeout(MUX_CLOSE_TIMEOUT, close).await.is_err() {
                debug!("multiplexer close timed out");
            }
        }
    }
    // Dropping `pending` and `cmd_rx` fails outstanding and future opens;
    // dropping `inbound_tx` ends the accept loop.
}
