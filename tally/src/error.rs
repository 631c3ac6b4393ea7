//! Error types for the reconciliation harness
//!
//! Each failure class the harness distinguishes gets its own enum so callers can
//! decide locally whether it is fatal (configuration), counted (publish, stream)
//! or a distinct reconciliation outcome (empty tracker).

use std::time::Duration;
use thiserror::Error;

/// Configuration problems detected before any task is spawned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Message count must be positive
    #[error("message count should be greater than zero")]
    ZeroMessages,

    /// At least one consumer worker is required
    #[error("worker count should be greater than zero")]
    ZeroWorkers,

    /// More workers than messages leaves workers idle and makes the run degenerate
    #[error("workers ({workers}) should not exceed the number of messages ({messages})")]
    WorkersExceedMessages { workers: usize, messages: u64 },

    /// Partition count for an in-memory backend
    #[error("invalid partition count: {0} (must be at least 1)")]
    InvalidPartitions(i32),

    /// Grace period must stay bounded
    #[error("grace period {0:?} exceeds the maximum of {max:?}", max = crate::harness::MAX_GRACE_PERIOD)]
    GraceTooLong(Duration),

    /// A value that failed to parse
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Reconciliation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    /// No partition has been recorded yet
    #[error("offset tracker is empty: no partition has been recorded")]
    EmptyTracker,
}

/// Failure to publish a single message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Network or framing failure talking to the broker
    #[error("transport error: {0}")]
    Transport(String),

    /// Broker answered with a non-zero error code for the partition
    #[error("partition {partition} rejected the record (code {code}): {message}")]
    Rejected {
        partition: i32,
        code: i16,
        message: String,
    },

    /// Record could not be encoded
    #[error("failed to encode record: {0}")]
    Encoding(String),

    /// Target already exists; a soft duplicate rather than a failure
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Publisher was closed
    #[error("publisher is closed")]
    Closed,
}

impl PublishError {
    /// Soft duplicates are tallied separately from publish errors
    pub fn is_duplicate(&self) -> bool {
        matches!(self, PublishError::Duplicate(_))
    }
}

/// Receive-side error surfaced through a message stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Network or decoding failure of a fetch round-trip
    #[error("transport error: {0}")]
    Transport(String),

    /// Fetch did not complete in time
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Broker returned an error code for one partition
    #[error("partition {partition} fetch error (code {code}): {message}")]
    Partition {
        partition: i32,
        code: i16,
        message: String,
    },

    /// Record batch failed integrity checks
    #[error("corrupt record batch on partition {partition}: {reason}")]
    Corrupt { partition: i32, reason: String },

    /// Error raised deliberately by a test transport
    #[error("injected: {0}")]
    Injected(String),
}

/// Outcome of a coordination-service create call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    /// Node is already present
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    /// Any other coordination failure
    #[error("coordination error: {0}")]
    Other(String),
}
