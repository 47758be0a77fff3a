//! Default protocol constants and limits.
//!
//! Centralized defaults used across the session, client and server crates.

use std::time::Duration;

// ============================================================================
// Framing limits
// ============================================================================

/// Maximum encrypted frame size accepted off the wire (1 MiB).
pub const MAX_FRAME: usize = 1 << 20;
/// Maximum size of a single Noise message (protocol-imposed).
pub const MAX_NOISE_MESSAGE: usize = 65535;
/// Chunk size for stream writes. Each chunk becomes one encrypted frame and
/// must stay well under [`MAX_NOISE_MESSAGE`] after cipher overhead.
pub const STREAM_WRITE_CHUNK: usize = 32 * 1024;
/// Maximum size of a session-handshake message on the raw connection.
pub const MAX_HANDSHAKE_MESSAGE: usize = 512;
/// Maximum size of the handshake payload carried inside a dial record.
pub const MAX_DIAL_PAYLOAD: usize = 4096;

// ============================================================================
// Ports
// ============================================================================

/// First port of the ephemeral allocation range.
pub const EPHEMERAL_PORT_MIN: u16 = 49152;
/// Last port of the ephemeral allocation range (inclusive).
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

// ============================================================================
// Timeouts & capacities
// ============================================================================

/// Time budget for a stream handshake, from substream accept until the
/// response has been written.
pub const STREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Accepted clock skew for dial-request timestamps, in either direction.
pub const TIMESTAMP_WINDOW: Duration = Duration::from_secs(30);
/// Bound on a listener's inbox of not-yet-accepted streams.
pub const LISTENER_INBOX_CAPACITY: usize = 64;
/// Bound on the queue of accepted-but-unclaimed substreams per session.
pub const SESSION_INBOX_CAPACITY: usize = 64;
/// Default relay buffer size per copy direction.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32 * 1024;
/// Default idle timeout for an established relay.
pub const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// How long a closing multiplexer is given to flush its goodbye.
pub const MUX_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
