//! In-process partitioned log used for broker-less runs and tests
//!
//! Offsets are assigned per partition by the broker, starting at a configurable
//! base offset. Every subscriber gets its own copy of each appended record,
//! pushed at append time. Faults can be scheduled so that the harness's error
//! paths can be driven deterministically.

use super::{Delivery, MessageStream, Published, Publisher, StartOffset};
use crate::error::{PublishError, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, StreamError>>;
type DeliveryReceiver = mpsc::UnboundedReceiver<Result<Delivery, StreamError>>;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
}

#[derive(Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
    subscribers: Vec<DeliverySender>,
}

impl TopicLog {
    fn with_partitions(partitions: i32) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions as usize],
            ..Default::default()
        }
    }

    /// Pushes to every live subscriber, forgetting the ones that hung up
    fn broadcast(&mut self, item: Result<Delivery, StreamError>) {
        self.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }
}

struct BrokerState {
    default_partitions: i32,
    base_offset: i64,
    topics: HashMap<String, TopicLog>,
    attempts: u64,
    failing_attempts: HashSet<u64>,
}

impl BrokerState {
    fn topic(&mut self, topic: &str) -> &mut TopicLog {
        let partitions = self.default_partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::with_partitions(partitions))
    }
}

/// Shared handle to an in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Broker whose topics are created on first use with `partitions` partitions
    pub fn new(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                default_partitions: partitions.max(1),
                base_offset: 0,
                topics: HashMap::new(),
                attempts: 0,
                failing_attempts: HashSet::new(),
            })),
        }
    }

    /// Offset assigned to the first record of every partition
    pub fn with_base_offset(self, base_offset: i64) -> Self {
        self.state.lock().base_offset = base_offset;
        self
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, topic: &str, start: StartOffset) -> MemoryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let base_offset = state.base_offset;
        let log = state.topic(topic);

        if start == StartOffset::Oldest {
            for (partition, records) in log.partitions.iter().enumerate() {
                for (index, record) in records.iter().enumerate() {
                    let _ = tx.send(Ok(Delivery {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: base_offset + index as i64,
                        key: record.key.clone(),
                        value: Some(record.value.clone()),
                    }));
                }
            }
        }
        log.subscribers.push(tx);
        MemoryStream::new(rx)
    }

    /// Makes the given 0-based publish attempts fail
    pub fn fail_attempts(&self, attempts: impl IntoIterator<Item = u64>) {
        self.state.lock().failing_attempts.extend(attempts);
    }

    /// Sends a stream error to every subscriber of `topic`
    pub fn inject_stream_error(&self, topic: &str, reason: &str) {
        self.state
            .lock()
            .topic(topic)
            .broadcast(Err(StreamError::Injected(reason.to_string())));
    }

    /// Closes every subscription; buffered deliveries can still be drained
    pub fn shutdown(&self) {
        for log in self.state.lock().topics.values_mut() {
            log.subscribers.clear();
        }
    }

    /// Number of records stored for `topic`
    pub fn record_count(&self, topic: &str) -> u64 {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(|p| p.len() as u64).sum())
            .unwrap_or(0)
    }

    fn append(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError> {
        let mut state = self.state.lock();
        let attempt = state.attempts;
        state.attempts += 1;
        if state.failing_attempts.contains(&attempt) {
            debug!("Rejecting publish attempt {} on '{}'", attempt, topic);
            return Err(PublishError::Transport(format!(
                "injected failure on attempt {}",
                attempt
            )));
        }

        let base_offset = state.base_offset;
        let log = state.topic(topic);
        let partition = log.next_partition % log.partitions.len();
        log.next_partition += 1;

        let records = &mut log.partitions[partition];
        let offset = base_offset + records.len() as i64;
        records.push(StoredRecord {
            key: key.clone(),
            value: value.clone(),
        });

        log.broadcast(Ok(Delivery {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
            key,
            value: Some(value),
        }));

        Ok(Published {
            partition: partition as i32,
            offset,
        })
    }
}

pub struct MemoryPublisher {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        self.broker.append(topic, key, value)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Receive side backed by an unbounded channel
///
/// Also used by the coordination variant's node watch.
pub struct MemoryStream {
    receiver: tokio::sync::Mutex<DeliveryReceiver>,
    closed: CancellationToken,
}

impl MemoryStream {
    pub(crate) fn new(receiver: DeliveryReceiver) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn recv(&self) -> Option<Result<Delivery, StreamError>> {
        let mut receiver = self.receiver.lock().await;
        if self.closed.is_cancelled() {
            receiver.close();
            return receiver.recv().await;
        }
        tokio::select! {
            item = receiver.recv() => item,
            _ = self.closed.cancelled() => {
                receiver.close();
                receiver.recv().await
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
