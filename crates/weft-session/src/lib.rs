//! Session and stream layer of the weft overlay fabric.
//!
//! A *session* is the authenticated, encrypted, multiplexed transport
//! between one client and one server. A *stream* is an end-to-end encrypted
//! byte channel between two clients, carried in two session substreams
//! joined at a relay server.
//!
//! The client side is [`ClientSession`] (dialing and accepting streams, port
//! registry in [`Porter`]); the server side is [`ServerSession`] (relay
//! forwarding between the sessions of the two endpoints).

mod client;
mod codec;
mod error;
mod handshake;
mod listener;
mod mux;
mod porter;
mod server;
mod stream;

pub use client::ClientSession;
pub use error::SessionError;
pub use listener::{listen, listen_ephemeral, Listener, ListenerHandle};
pub use porter::{PortEntry, PortGuard, Porter, StreamEntry};
pub use server::{ServerSession, ServerSessionHandle, SessionLookup};
pub use stream::Stream;

use tokio::io::{AsyncRead, AsyncWrite};

/// A reliable, ordered byte connection a session can be brought up on.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Wall-clock nanoseconds since the Unix epoch.
pub(crate) fn unix_now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
