//! Crypto error types.

/// Errors from key handling and Noise operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("noise: {0}")]
    Noise(#[from] snow::Error),
    #[error("invalid public key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("remote static key missing after handshake")]
    MissingRemoteStatic,
    #[error("ciphertext truncated")]
    Truncated,
}
