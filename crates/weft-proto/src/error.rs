//! Protocol error types.

/// Errors from decoding or verifying wire records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("record truncated: need at least {0} bytes")]
    Truncated(usize),
    #[error("trailing bytes after record")]
    TrailingBytes,
    #[error("invalid public key in record")]
    InvalidKey,
    #[error("handshake payload exceeds maximum length")]
    PayloadTooLarge,
    #[error("invalid record signature")]
    InvalidSignature,
    #[error("timestamp outside accepted window")]
    InvalidTimestamp,
    #[error("response does not match request hash")]
    RequestHashMismatch,
}
