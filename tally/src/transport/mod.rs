//! Transport seam between the harness and a message queue
//!
//! The harness only needs three capabilities from a broker: publish a record and
//! learn where it landed, receive records as they are delivered, and close both
//! handles. Everything else (connections, wire protocol, partition assignment)
//! stays behind these traits.

pub mod coordination;
pub mod kafka;
pub mod memory;

use crate::error::{CreateError, PublishError, StreamError};
use async_trait::async_trait;
use bytes::Bytes;

pub use coordination::{MemoryCoordinator, NodePublisher};
pub use kafka::{KafkaPublisher, KafkaStream};
pub use memory::{MemoryBroker, MemoryPublisher, MemoryStream};

/// A record as observed by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// Where the broker stored a published record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub partition: i32,
    pub offset: i64,
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StartOffset {
    /// Everything still retained by the broker
    Oldest,
    /// Only records appended after the subscription
    #[default]
    Newest,
}

impl StartOffset {
    /// Kafka ListOffsets timestamp sentinel for this position
    pub fn list_offsets_timestamp(self) -> i64 {
        match self {
            StartOffset::Oldest => -2,
            StartOffset::Newest => -1,
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError>;

    /// Idempotent, best-effort
    async fn close(&self);
}

/// Shared receive side of a subscription
///
/// `recv` takes `&self` so a pool of workers can pull from one stream.
/// `None` means the stream is closed and fully drained.
#[async_trait]
pub trait MessageStream: Send + Sync {
    async fn recv(&self) -> Option<Result<Delivery, StreamError>>;

    /// Idempotent, best-effort
    async fn close(&self);
}

/// Coordination-service client (node creation only)
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Creates `path` and returns its creation id
    async fn create(&self, path: &str, data: Bytes) -> Result<i64, CreateError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offset_sentinels() {
        assert_eq!(StartOffset::Oldest.list_offsets_timestamp(), -2);
        assert_eq!(StartOffset::Newest.list_offsets_timestamp(), -1);
        assert_eq!(StartOffset::default(), StartOffset::Newest);
    }
}
