//! Identity keys and Noise handshake state for the weft overlay fabric.
//!
//! Endpoints are addressed by long-lived Ed25519 public keys. The same
//! identity also drives the Noise handshakes: the X25519 static for a peer is
//! derived from its Ed25519 key (scalar for the secret half, Montgomery form
//! for the public half), so authenticating a Noise static authenticates the
//! identity key it was derived from.
//!
//! Two handshake patterns are used:
//! - `XK` between a client and a server (the server's static is known to the
//!   client up front; the server learns the client's identity during the
//!   handshake),
//! - `KK` end to end between two clients (both statics known), carried
//!   through the relay inside the dial records.

mod error;
mod keys;
mod noise;

pub use error::CryptoError;
pub use keys::{Keypair, PublicKey, SecretKey, Signature, PUBLIC_KEY_LEN, SIGNATURE_LEN};
pub use noise::{
    SessionCipher, SessionHandshake, StreamCipher, StreamHandshake, SESSION_FRAME_OVERHEAD,
};
