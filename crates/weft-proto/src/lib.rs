//! Wire records for the weft overlay fabric.
//!
//! This crate defines the deterministic binary encoding of the dial
//! request/response exchange, along with the verification rules: timestamp
//! freshness, signature binding to the source/destination identities, and
//! the response-to-request hash binding.

mod addr;
mod error;
mod records;

pub use addr::Addr;
pub use error::ProtoError;
pub use records::{reject, DialRequest, DialResponse, REQUEST_HASH_LEN};
