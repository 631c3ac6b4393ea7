//! Command-line argument types for tally
//!
//! This module contains the clap `Args` struct, the backend and key selection
//! enums, and the conversion from raw arguments into a validated
//! [`HarnessConfig`].

use crate::error::ConfigError;
use crate::harness::{default_grace, HarnessConfig};
use crate::transport::StartOffset;
use crate::utils::{parse_bytes, parse_duration};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments for one reconciliation run
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Load generation and offset reconciliation for partitioned message queues")]
pub struct Args {
    /// Kafka broker address
    #[arg(short, long, default_value = "localhost:9092")]
    pub broker: String,

    /// Topic to produce to and consume from
    #[arg(short, long, default_value = "defaultTopic")]
    pub topic: String,

    /// Number of messages to produce
    #[arg(short = 'n', long, alias = "element", default_value = "10")]
    pub messages: u64,

    /// Delay between publishes (e.g. "1s", "250ms"); "0" sends as fast as possible
    #[arg(short, long, default_value = "1s")]
    pub interval: String,

    /// Number of consumer workers sharing the subscription
    #[arg(short, long, alias = "goroutines", default_value = "2")]
    pub workers: usize,

    /// Where the subscription starts reading
    #[arg(long, value_enum, default_value_t = StartOffset::Newest)]
    pub offset: StartOffset,

    /// Wait after the last publish (or an interrupt) before shutting down consumers.
    /// Defaults to a tenth of the interval, at least 100ms.
    #[arg(long)]
    pub grace: Option<String>,

    /// Stop a consumer worker after this long without a delivery
    #[arg(long)]
    pub idle_timeout: Option<String>,

    /// Message queue to run against
    #[arg(long, value_enum, default_value_t = Backend::Kafka)]
    pub backend: Backend,

    /// Partition count for the in-memory backends
    #[arg(short, long, default_value = "1")]
    pub partitions: i32,

    /// How message keys are generated
    #[arg(long, value_enum, default_value_t = KeyKind::Timestamp)]
    pub keys: KeyKind,

    /// Pick keys randomly from a pre-generated pool of this size (overrides --keys)
    #[arg(long)]
    pub key_pool: Option<usize>,

    /// Pad message values to this size in bytes (e.g., "64") or a range (e.g., "10-100")
    #[arg(short, long)]
    pub message_size: Option<String>,

    /// Also record every offset seen and report duplicates and holes per partition
    #[arg(long, default_value = "false")]
    pub track_gaps: bool,

    /// Progress log interval; "0" disables progress reporting
    #[arg(long, default_value = "5s")]
    pub progress_interval: String,

    /// Print the full run report as JSON
    #[arg(long, default_value = "false")]
    pub json: bool,

    /// Quiet mode: only errors are logged
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    pub quiet: bool,

    /// Debug logging
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,
}

/// Message queue implementation backing a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Kafka over the wire protocol
    Kafka,
    /// In-process partitioned log
    Memory,
    /// In-process coordination store; each message creates a node
    Coordination,
}

/// Key generation selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeyKind {
    /// Current unix time in seconds
    Timestamp,
    /// Message index
    Sequence,
    /// Fresh UUID per message
    Random,
}

fn invalid(flag: &str, value: &str, err: anyhow::Error) -> ConfigError {
    ConfigError::InvalidValue(format!("--{} {}: {}", flag, value, err))
}

impl Args {
    /// Validated harness configuration
    ///
    /// Every configuration error surfaces here, before anything connects or
    /// spawns.
    pub fn to_config(&self) -> Result<HarnessConfig, ConfigError> {
        let interval =
            parse_duration(&self.interval).map_err(|e| invalid("interval", &self.interval, e))?;
        let grace = match &self.grace {
            Some(grace) => parse_duration(grace).map_err(|e| invalid("grace", grace, e))?,
            None => default_grace(interval),
        };
        let idle_timeout = self
            .idle_timeout
            .as_deref()
            .map(|s| parse_duration(s).map_err(|e| invalid("idle-timeout", s, e)))
            .transpose()?;
        let progress_interval = parse_duration(&self.progress_interval)
            .map_err(|e| invalid("progress-interval", &self.progress_interval, e))?;
        let message_size = self
            .message_size
            .as_deref()
            .map(|s| MessageSize::parse(s).map_err(|e| invalid("message-size", s, e)))
            .transpose()?;

        if self.partitions < 1 {
            return Err(ConfigError::InvalidPartitions(self.partitions));
        }
        if idle_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue(
                "--idle-timeout must be greater than zero".to_string(),
            ));
        }
        if self.key_pool == Some(0) {
            return Err(ConfigError::InvalidValue(
                "--key-pool must be greater than zero".to_string(),
            ));
        }

        let config = HarnessConfig {
            topic: self.topic.clone(),
            messages: self.messages,
            workers: self.workers,
            interval,
            grace,
            idle_timeout,
            key_strategy: KeyStrategy::from_args(self.keys, self.key_pool),
            message_size,
            track_gaps: self.track_gaps,
            progress_interval: (!self.quiet && !progress_interval.is_zero())
                .then_some(progress_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Represents the size configuration for message values
/// Supports both fixed-size messages and variable-size ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSize {
    /// Fixed message size in bytes
    Fixed(usize),
    /// Variable message size with min and max bounds (inclusive)
    Range(usize, usize),
}

impl MessageSize {
    /// Parses "1024", "1KB" for a fixed size or "100-1000" for a range
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((min_str, max_str)) = s.split_once('-') {
            let min = parse_bytes(min_str)? as usize;
            let max = parse_bytes(max_str)? as usize;
            if min > max {
                return Err(anyhow!("Invalid range: min {} > max {}", min, max));
            }
            Ok(MessageSize::Range(min, max))
        } else {
            Ok(MessageSize::Fixed(parse_bytes(s)? as usize))
        }
    }

    /// Fixed size, or a random size within the range (inclusive)
    pub fn generate_size(&self) -> usize {
        match self {
            MessageSize::Fixed(size) => *size,
            MessageSize::Range(min, max) => thread_rng().gen_range(*min..=*max),
        }
    }
}

/// Strategy for generating message keys
///
/// With the coordination backend the key becomes the node name, so strategies
/// that repeat keys (timestamps within one second, a small pool) show up as
/// duplicates there.
#[derive(Debug, Clone)]
pub enum KeyStrategy {
    /// Unix timestamp in seconds at publish time
    Timestamp,
    /// Index of the message within the run
    Sequence,
    /// Generate unique random keys on the fly for each message
    RandomOnTheFly,
    /// Pick keys randomly from a pre-generated pool
    RandomPool(Arc<Vec<Bytes>>),
}

impl KeyStrategy {
    /// Creates a KeyStrategy from the command-line values
    ///
    /// A pool size wins over `kind`; a pool of zero falls back to `kind`.
    pub fn from_args(kind: KeyKind, pool_size: Option<usize>) -> Self {
        match pool_size {
            Some(size) if size > 0 => KeyStrategy::random_pool(size),
            _ => match kind {
                KeyKind::Timestamp => KeyStrategy::Timestamp,
                KeyKind::Sequence => KeyStrategy::Sequence,
                KeyKind::Random => KeyStrategy::RandomOnTheFly,
            },
        }
    }

    /// Pool of `size` pre-generated UUID keys
    pub fn random_pool(size: usize) -> Self {
        let keys: Vec<Bytes> = (0..size)
            .map(|_| Bytes::from(uuid::Uuid::new_v4().to_string()))
            .collect();
        KeyStrategy::RandomPool(Arc::new(keys))
    }

    /// Key for the message at `index`
    pub fn generate_key(&self, index: u64) -> Bytes {
        match self {
            KeyStrategy::Timestamp => Bytes::from(chrono::Utc::now().timestamp().to_string()),
            KeyStrategy::Sequence => Bytes::from(index.to_string()),
            KeyStrategy::RandomOnTheFly => Bytes::from(uuid::Uuid::new_v4().to_string()),
            KeyStrategy::RandomPool(pool) => pool
                .choose(&mut thread_rng())
                .cloned()
                .unwrap_or_else(|| Bytes::from(index.to_string())),
        }
    }
}
