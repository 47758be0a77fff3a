//! I/O primitives.

mod relay;

pub use relay::{relay_bidirectional, RelayStats};
