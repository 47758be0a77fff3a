//! Overlay addresses.

use std::fmt;

use weft_crypto::PublicKey;

/// An overlay address: an identity key plus a port.
///
/// Port `0` means "unspecified"; it appears on the initiator side before a
/// port has been reserved and as a placeholder on an accepting side.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub pk: PublicKey,
    pub port: u16,
}

impl Addr {
    pub fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pk = self.pk.to_bytes();
        write!(f, "{}:{}", hex::encode_short(&pk), self.port)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

mod hex {
    use std::fmt::Write;

    /// First four bytes of a key as hex, enough to tell addresses apart in
    /// logs without flooding them.
    pub(super) fn encode_short(bytes: &[u8; 32]) -> String {
        let mut out = String::with_capacity(8);
        for b in &bytes[..4] {
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}
