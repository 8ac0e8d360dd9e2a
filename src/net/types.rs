//! Overlay constants.
//!
//! Timer values are deliberately short: the mesh is designed to converge
//! quickly after a cold start, and the store's age limit keeps memory
//! bounded even when every timer fires late.

// =============================================================================
// PORTS
// =============================================================================

/// TCP port peers dial and listen on.
pub const BEBO_PORT: u16 = 0xbeb0;

/// Default port for the HTTP API.
pub const HTTP_PORT: u16 = 4000;

// =============================================================================
// QUEUES AND BACKPRESSURE
// =============================================================================

/// Capacity of each peer's outbound record queue. The flood engine blocks
/// when a queue is full, which throttles injection under slow peers.
pub const OUTBOUND_QUEUE_LIMIT: usize = 10_000;

/// Capacity of the neighbor-manager event channel. Producers that must not
/// block (the DNS resolver) use try-send and drop on full.
pub const NEIGHBOR_EVENT_QUEUE_LIMIT: usize = 10;

/// Upper bound on a single framed record. Anything larger is treated as a
/// wire-syntax error and the connection is closed.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// TIMERS
// =============================================================================

/// Wall-clock deadline for the bidirectional handshake.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// The neighbor notifier emits a beacon at least this often, or immediately
/// when woken by the manager.
pub const NEIGHBOR_NOTIFIER_WAKE_TIMEOUT_SECS: u64 = 10;

/// How long a deleted or refused peer address stays suppressed.
pub const IGNORE_INTERVAL_SECS: u64 = 300;

/// How often expired ignore entries are swept.
pub const IGNORE_PURGE_INTERVAL_SECS: u64 = 300;

/// Interval between periodic store purges.
pub const PURGE_INTERVAL_SECS: u64 = 10;

/// First reconnect delay; doubled per failure up to [`MAX_BACKOFF_SECS`].
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Reconnect backoff cap.
pub const MAX_BACKOFF_SECS: u64 = 32;

// =============================================================================
// DNS RE-RESOLUTION
// =============================================================================

/// Steady-state interval between resolver sweeps.
pub const RESOLUTION_INTERVAL_SECS: u64 = 60;

/// Resolver sweep interval while the cluster is starting up, so a freshly
/// launched mesh finds itself quickly.
pub const STARTUP_RESOLUTION_INTERVAL_SECS: u64 = 5;

/// How long after launch the startup resolution interval applies.
pub const STARTUP_INTERVAL_SECS: u64 = 120;

// =============================================================================
// HTTP
// =============================================================================

/// Cap on the `count` parameter of ranged message reads.
pub const MAX_GET_COUNT: u64 = 100;
