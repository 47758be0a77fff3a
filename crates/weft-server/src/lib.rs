//! Relay server for the weft overlay fabric.
//!
//! The server keeps long-lived authenticated sessions with clients and
//! forwards streams between any two clients connected to it. It holds no
//! stream keys: everything it relays after the dial exchange is opaque
//! ciphertext.

mod config;
mod error;
mod registry;
mod server;

pub use config::{load_config, validate_config, ServerConfig};
pub use error::ServerError;
pub use registry::SessionRegistry;
pub use server::Server;

pub use tokio_util::sync::CancellationToken;
