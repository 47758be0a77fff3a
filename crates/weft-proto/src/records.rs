//! Dial request/response records.
//!
//! Both records use a deterministic binary encoding with a fixed field
//! order and big-endian integers:
//!
//! ```text
//! DialRequest:
//! +----------+--------+----------+--------+----------+--------+---------+--------+
//! | u64 ts   | src pk | u16 port | dst pk | u16 port | u32 len| payload | sig    |
//! +----------+--------+----------+--------+----------+--------+---------+--------+
//! |    8     |   32   |    2     |   32   |    2     |   4    |   var   |  64    |
//! +----------+--------+----------+--------+----------+--------+---------+--------+
//!
//! DialResponse:
//! +--------------+-------------+---------+---------+--------+
//! | request hash | u8 accepted | u32 len | payload | sig    |
//! +--------------+-------------+---------+---------+--------+
//! |      32      |      1      |    4    |   var   |  64    |
//! +--------------+-------------+---------+---------+--------+
//! ```
//!
//! Signatures cover every field before them. The request hash is SHA-256
//! over the request's signed fields and binds a response to exactly one
//! outstanding request.

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};

use weft_core::MAX_DIAL_PAYLOAD;
use weft_crypto::{PublicKey, SecretKey, Signature, PUBLIC_KEY_LEN, SIGNATURE_LEN};

use crate::{Addr, ProtoError};

/// Length of a request hash in bytes.
pub const REQUEST_HASH_LEN: usize = 32;

/// Rejection reasons carried in the payload slot of a non-accepted response.
///
/// The response layout has no dedicated reason field, and a rejected dial
/// carries no handshake message, so the payload slot is free. Unknown values
/// degrade to a generic rejection on the dialer.
pub mod reject {
    /// Rejected without a specific reason (includes verification failures).
    pub const GENERIC: u8 = 0;
    /// No listener on the requested destination port.
    pub const NO_LISTENER: u8 = 1;
    /// The listener exists but its inbox is full.
    pub const BUSY_LISTENER: u8 = 2;
}

/// A signed request to open a stream, relayed from dialer to destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DialRequest {
    /// Nanoseconds since the Unix epoch at the dialer.
    pub timestamp_ns: u64,
    /// Dialer address, with its reserved ephemeral port.
    pub src: Addr,
    /// Destination address; the port identifies the listener.
    pub dst: Addr,
    /// First message of the end-to-end stream handshake.
    pub handshake: Vec<u8>,
    /// Signature by `src.pk` over all prior fields.
    pub signature: Signature,
}

impl DialRequest {
    /// Builds and signs a request.
    pub fn new_signed(
        timestamp_ns: u64,
        src: Addr,
        dst: Addr,
        handshake: Vec<u8>,
        secret: &SecretKey,
    ) -> Self {
        let mut req = Self {
            timestamp_ns,
            src,
            dst,
            handshake,
            signature: Signature::from_bytes(&[0u8; SIGNATURE_LEN]),
        };
        req.signature = secret.sign(&req.signed_bytes());
        req
    }

    /// The canonical encoding of the signed fields (everything before the
    /// signature).
    fn signed_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(80 + self.handshake.len());
        buf.put_u64(self.timestamp_ns);
        buf.put_slice(self.src.pk.as_bytes());
        buf.put_u16(self.src.port);
        buf.put_slice(self.dst.pk.as_bytes());
        buf.put_u16(self.dst.port);
        buf.put_u32(self.handshake.len() as u32);
        buf.put_slice(&self.handshake);
        buf
    }

    /// SHA-256 over the signed fields; binds responses to this request.
    pub fn hash(&self) -> [u8; REQUEST_HASH_LEN] {
        let digest = Sha256::digest(&self.signed_bytes());
        digest.into()
    }

    /// Checks the signature under `src.pk`.
    pub fn verify_signature(&self) -> Result<(), ProtoError> {
        self.src
            .pk
            .verify(&self.signed_bytes(), &self.signature)
            .map_err(|_| ProtoError::InvalidSignature)
    }

    /// Checks that the timestamp is within `max_skew_ns` of `now_ns`,
    /// in either direction. Duplicate timestamps are permitted.
    pub fn verify_timestamp(&self, now_ns: u64, max_skew_ns: u64) -> Result<(), ProtoError> {
        if now_ns.abs_diff(self.timestamp_ns) > max_skew_ns {
            return Err(ProtoError::InvalidTimestamp);
        }
        Ok(())
    }

    /// Full verification: timestamp freshness, then signature.
    pub fn verify(&self, now_ns: u64, max_skew_ns: u64) -> Result<(), ProtoError> {
        self.verify_timestamp(now_ns, max_skew_ns)?;
        self.verify_signature()
    }

    /// Encodes the full record, signature included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_bytes();
        buf.put_slice(&self.signature.to_bytes());
        buf.to_vec()
    }

    /// Decodes a full record. The input must contain exactly one record.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        const FIXED: usize = 8 + PUBLIC_KEY_LEN + 2 + PUBLIC_KEY_LEN + 2 + 4;
        if buf.len() < FIXED + SIGNATURE_LEN {
            return Err(ProtoError::Truncated(FIXED + SIGNATURE_LEN));
        }
        let timestamp_ns = read_u64(&buf[0..8]);
        let src_pk = read_pk(&buf[8..40])?;
        let src_port = read_u16(&buf[40..42]);
        let dst_pk = read_pk(&buf[42..74])?;
        let dst_port = read_u16(&buf[74..76]);
        let hs_len = read_u32(&buf[76..80]) as usize;
        if hs_len > MAX_DIAL_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge);
        }
        let total = FIXED + hs_len + SIGNATURE_LEN;
        if buf.len() < total {
            return Err(ProtoError::Truncated(total));
        }
        if buf.len() > total {
            return Err(ProtoError::TrailingBytes);
        }
        let handshake = buf[FIXED..FIXED + hs_len].to_vec();
        let signature = read_signature(&buf[FIXED + hs_len..total]);
        Ok(Self {
            timestamp_ns,
            src: Addr::new(src_pk, src_port),
            dst: Addr::new(dst_pk, dst_port),
            handshake,
            signature,
        })
    }
}

/// A signed response to a dial request, relayed back to the dialer.
#[derive(Debug, Clone)]
pub struct DialResponse {
    /// `DialRequest::hash()` of the request this answers.
    pub request_hash: [u8; REQUEST_HASH_LEN],
    /// Whether the destination accepted the stream.
    pub accepted: bool,
    /// Second message of the end-to-end stream handshake, or a rejection
    /// reason byte when `accepted` is false.
    pub handshake: Vec<u8>,
    /// Signature by the destination identity over all prior fields.
    pub signature: Signature,
}

impl DialResponse {
    /// Builds and signs a response.
    pub fn new_signed(
        request_hash: [u8; REQUEST_HASH_LEN],
        accepted: bool,
        handshake: Vec<u8>,
        secret: &SecretKey,
    ) -> Self {
        let mut resp = Self {
            request_hash,
            accepted,
            handshake,
            signature: Signature::from_bytes(&[0u8; SIGNATURE_LEN]),
        };
        resp.signature = secret.sign(&resp.signed_bytes());
        resp
    }

    fn signed_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(40 + self.handshake.len());
        buf.put_slice(&self.request_hash);
        buf.put_u8(u8::from(self.accepted));
        buf.put_u32(self.handshake.len() as u32);
        buf.put_slice(&self.handshake);
        buf
    }

    /// Verifies the response: first the hash binding to `expected_hash`,
    /// then the signature under `responder`. A response bound to a
    /// different request is never surfaced further.
    pub fn verify(
        &self,
        responder: &PublicKey,
        expected_hash: &[u8; REQUEST_HASH_LEN],
    ) -> Result<(), ProtoError> {
        if &self.request_hash != expected_hash {
            return Err(ProtoError::RequestHashMismatch);
        }
        responder
            .verify(&self.signed_bytes(), &self.signature)
            .map_err(|_| ProtoError::InvalidSignature)
    }

    /// The rejection reason carried by a non-accepted response.
    pub fn reject_reason(&self) -> u8 {
        self.handshake.first().copied().unwrap_or(reject::GENERIC)
    }

    /// Encodes the full record, signature included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_bytes();
        buf.put_slice(&self.signature.to_bytes());
        buf.to_vec()
    }

    /// Decodes a full record. The input must contain exactly one record.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        const FIXED: usize = REQUEST_HASH_LEN + 1 + 4;
        if buf.len() < FIXED + SIGNATURE_LEN {
            return Err(ProtoError::Truncated(FIXED + SIGNATURE_LEN));
        }
        let mut request_hash = [0u8; REQUEST_HASH_LEN];
        request_hash.copy_from_slice(&buf[..REQUEST_HASH_LEN]);
        let accepted = buf[REQUEST_HASH_LEN] != 0;
        let hs_len = read_u32(&buf[REQUEST_HASH_LEN + 1..FIXED]) as usize;
        if hs_len > MAX_DIAL_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge);
        }
        let total = FIXED + hs_len + SIGNATURE_LEN;
        if buf.len() < total {
            return Err(ProtoError::Truncated(total));
        }
        if buf.len() > total {
            return Err(ProtoError::TrailingBytes);
        }
        let handshake = buf[FIXED..FIXED + hs_len].to_vec();
        let signature = read_signature(&buf[FIXED + hs_len..total]);
        Ok(Self {
            request_hash,
            accepted,
            handshake,
            signature,
        })
    }
}

fn read_u16(buf: &[u8]) -> u16 {
    debug_assert!(buf.len() >= 2);
    u16::from_be_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    debug_assert!(buf.len() >= 4);
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u64(buf: &[u8]) -> u64 {
    debug_assert!(buf.len() >= 8);
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(b)
}

fn read_pk(buf: &[u8]) -> Result<PublicKey, ProtoError> {
    debug_assert!(buf.len() >= PUBLIC_KEY_LEN);
    let mut b = [0u8; PUBLIC_KEY_LEN];
    b.copy_from_slice(&buf[..PUBLIC_KEY_LEN]);
    PublicKey::from_bytes(b).map_err(|_| ProtoError::InvalidKey)
}

fn read_signature(buf: &[u8]) -> Signature {
    debug_assert!(buf.len() >= SIGNATURE_LEN);
    let mut b = [0u8; SIGNATURE_LEN];
    b.copy_from_slice(&buf[..SIGNATURE_LEN]);
    Signature::from_bytes(&b)
}
