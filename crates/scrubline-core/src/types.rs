//! Shared type aliases.

/// Job identifier (ULID string)
pub type JobId = String;

/// Correlation id of a worker RPC message
pub type MessageId = u64;

/// Time in seconds
pub type TimeSec = f64;

/// Progress percentage (0 - 100)
pub type Percent = u8;
