//! tally - load generation and offset reconciliation for partitioned message queues
//!
//! A run publishes a fixed number of messages, consumes them with a pool of
//! concurrent workers, and checks the produced count, the consumed count and
//! the number of offsets spanned per partition against each other.

pub mod args;
pub mod consumer;
pub mod counters;
pub mod error;
pub mod harness;
pub mod kafka_client;
pub mod monitor;
pub mod producer;
pub mod shutdown;
pub mod tracker;
pub mod transport;
pub mod utils;
pub mod verdict;

pub use error::{ConfigError, CreateError, PublishError, StreamError, TrackerError};
pub use harness::{Harness, HarnessConfig, RunReport};
pub use verdict::Verdict;
