//! Compile-time defaults for `EvhConfig`.

/// Worker threads (each owns one multiplexer).
pub const WORKERS: usize = 4;

/// Event records fetched per wait.
pub const MAX_EVENTS: usize = 256;

/// Per-worker read buffer.
pub const READ_BUFFER: usize = 16 * 1024;

/// Listen backlog.
pub const BACKLOG: i32 = 1024;

/// Upper bound on how long a worker or the acceptor sleeps in a wait
/// before checking its inbox and stop flag.
pub const POLL_INTERVAL_MS: u64 = 10;

/// Connection slots per worker.
pub const MAX_CONNECTIONS: usize = 16 * 1024;

/// Queued output bytes per connection before reads pause.
pub const MAX_QUEUED: usize = 1024 * 1024;

pub const MAX_WORKERS: usize = 256;
