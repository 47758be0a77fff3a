//! Server error types.

use weft_session::SessionError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("session: {0}")]
    Session(#[from] SessionError),
}
