//! Session-layer error types.

use weft_crypto::CryptoError;
use weft_proto::ProtoError;

/// Errors from session bring-up, dialing, accepting and stream I/O.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("residual bytes left on the connection after the session handshake")]
    HandshakeResidue,
    #[error("handshake failed: {0}")]
    HandshakeFailed(CryptoError),
    #[error("stream handshake timed out")]
    HandshakeTimeout,
    #[error("request timestamp outside accepted window")]
    InvalidTimestamp,
    #[error("invalid record signature")]
    InvalidSignature,
    #[error("request source does not match the session peer")]
    InvalidSource,
    #[error("request destination does not match the local key")]
    InvalidDestination,
    #[error("response does not match the request hash")]
    RequestHashMismatch,
    #[error("dial rejected by the remote")]
    Rejected,
    #[error("no session for the destination key")]
    NoSession,
    #[error("no listener on the destination port")]
    NoListener,
    #[error("listener inbox is full")]
    BusyListener,
    #[error("port already reserved")]
    PortTaken,
    #[error("no free ephemeral port")]
    NoFreePort,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("record decode failed: {0}")]
    DecodeFailed(ProtoError),
    #[error("frame decryption failed")]
    DecryptFailed,
    #[error("frame truncated mid-read")]
    ShortRead,
    #[error("substream closed")]
    SubStreamClosed,
    #[error("session closed")]
    SessionClosed,
    #[error("listener closed")]
    ListenerClosed,
    #[error("canceled")]
    Canceled,
    #[error("crypto: {0}")]
    Crypto(CryptoError),
}

impl SessionError {
    /// Maps a record-verification error onto its session-level kind.
    pub(crate) fn from_proto(err: ProtoError) -> Self {
        match err {
            ProtoError::InvalidSignature => SessionError::InvalidSignature,
            ProtoError::InvalidTimestamp => SessionError::InvalidTimestamp,
            ProtoError::RequestHashMismatch => SessionError::RequestHashMismatch,
            other => SessionError::DecodeFailed(other),
        }
    }

    /// Whether this error makes the whole session untrustworthy.
    ///
    /// Cipher failures on the session codec poison the session; everything
    /// else terminates at most the substream it happened on.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::DecryptFailed | SessionError::SessionClosed | SessionError::Crypto(_)
        )
    }
}
