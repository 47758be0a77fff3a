//! Core constants and I/O primitives shared across weft crates.
//!
//! This crate provides:
//! - Default protocol constants and limits
//! - The bidirectional byte pump used by the relay server

pub mod defaults;
pub mod io;

pub use defaults::*;
