//! Kafka-backed publisher and message stream
//!
//! `KafkaPublisher` sends one record per PRODUCE request with `acks=-1` and
//! reports the broker-assigned base offset. `KafkaStream` runs a background
//! fetch loop over every partition of the topic and forwards each decoded
//! record through a bounded channel that the consumer workers share.

use super::{Delivery, MessageStream, Published, Publisher, StartOffset};
use crate::error::{PublishError, StreamError};
use crate::kafka_client::{error_message, KafkaClient};
use crate::utils::{is_truncated_batch, verify_record_batch_crc};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchRequest, FetchTopic};
use kafka_protocol::messages::fetch_response::FetchResponse;
use kafka_protocol::messages::produce_request::{
    PartitionProduceData, ProduceRequest, TopicProduceData,
};
use kafka_protocol::messages::produce_response::ProduceResponse;
use kafka_protocol::messages::{ApiKey, TopicName};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
    TimestampType,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client-side bound on a FETCH round-trip; longer than the broker's max wait
const FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long the broker may hold a FETCH open waiting for data
const FETCH_MAX_WAIT_MS: i32 = 1000;

/// Pause after a failed fetch before retrying
const FETCH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Deliveries buffered between the fetch loop and the workers
pub const DEFAULT_STREAM_BUFFER: usize = 1024;

pub struct KafkaPublisher {
    client: Arc<KafkaClient>,
    partitions: i32,
    closed: AtomicBool,
}

impl KafkaPublisher {
    /// Publisher spreading records randomly over `partitions` partitions
    pub fn new(client: Arc<KafkaClient>, partitions: i32) -> Self {
        Self {
            client,
            partitions: partitions.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn build_request(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<ProduceRequest, PublishError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PublishError::Encoding(e.to_string()))?
            .as_millis() as i64;

        // Offset is a placeholder; the broker assigns the real one
        let record = Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: 0,
            sequence: -1,
            timestamp,
            key,
            value: Some(value),
            headers: indexmap::IndexMap::new(),
        };

        let options = RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        };
        let mut batch_buf = bytes::BytesMut::new();
        RecordBatchEncoder::encode(&mut batch_buf, vec![&record], &options)
            .map_err(|e| PublishError::Encoding(e.to_string()))?;

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(batch_buf.freeze());

        let mut topic_data = TopicProduceData::default();
        topic_data.name = TopicName(StrBytes::from_string(topic.to_string()));
        topic_data.partition_data.push(partition_data);

        let mut request = ProduceRequest::default();
        request.acks = -1;
        request.timeout_ms = 30000;
        request.topic_data.push(topic_data);
        Ok(request)
    }
}

/// Finds the result for `partition` in a PRODUCE response
fn placed_offset(response: &ProduceResponse, partition: i32) -> Result<Published, PublishError> {
    let partition_response = response
        .responses
        .iter()
        .flat_map(|topic| topic.partition_responses.iter())
        .find(|p| p.index == partition)
        .ok_or_else(|| {
            PublishError::Transport(format!(
                "no result for partition {} in produce response",
                partition
            ))
        })?;

    if partition_response.error_code != 0 {
        return Err(PublishError::Rejected {
            partition,
            code: partition_response.error_code,
            message: error_message(partition_response.error_code),
        });
    }
    Ok(Published {
        partition,
        offset: partition_response.base_offset,
    })
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let partition = (rand::random::<u32>() % self.partitions as u32) as i32;
        let request = self.build_request(topic, partition, key, value)?;
        let version = self.client.get_supported_version(ApiKey::Produce, 3);

        let response_bytes = self
            .client
            .send_request(ApiKey::Produce, &request, version)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let response: ProduceResponse =
            KafkaClient::decode_response(ApiKey::Produce, version, &response_bytes)
                .map_err(|e| PublishError::Transport(e.to_string()))?;

        let placed = placed_offset(&response, partition)?;
        debug!(
            "Produced to partition {} at offset {}",
            placed.partition, placed.offset
        );
        Ok(placed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Shared receive side of a Kafka subscription
pub struct KafkaStream {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Result<Delivery, StreamError>>>,
    cancel: CancellationToken,
    fetch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl KafkaStream {
    /// Resolves partitions and start offsets, then starts the fetch loop
    pub async fn subscribe(
        client: Arc<KafkaClient>,
        topic: &str,
        start: StartOffset,
        buffer: usize,
    ) -> Result<Self> {
        let partitions = client.partition_count(topic).await?;
        let offsets = client
            .list_offsets(topic, partitions, start.list_offsets_timestamp())
            .await?;
        info!(
            "Subscribed to '{}' ({} partitions, starting at {:?})",
            topic, partitions, start
        );

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let fetcher = FetchLoop {
            client,
            topic: topic.to_string(),
            offsets,
            tx,
            cancel: cancel.clone(),
        };
        let fetch_task = tokio::spawn(fetcher.run());

        Ok(Self {
            receiver: tokio::sync::Mutex::new(rx),
            cancel,
            fetch_task: parking_lot::Mutex::new(Some(fetch_task)),
        })
    }
}

#[async_trait]
impl MessageStream for KafkaStream {
    async fn recv(&self) -> Option<Result<Delivery, StreamError>> {
        self.receiver.lock().await.recv().await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let task = self.fetch_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Fetch task ended abnormally: {}", e);
            }
        }
    }
}

/// Background task polling every partition of one topic
struct FetchLoop {
    client: Arc<KafkaClient>,
    topic: String,
    /// Next offset to fetch per partition
    offsets: HashMap<i32, i64>,
    tx: mpsc::Sender<Result<Delivery, StreamError>>,
    cancel: CancellationToken,
}

impl FetchLoop {
    async fn run(mut self) {
        let version = self.client.get_supported_version(ApiKey::Fetch, 4);

        loop {
            let request = self.build_request();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = tokio::time::timeout(
                    FETCH_TIMEOUT,
                    self.client.send_request(ApiKey::Fetch, &request, version),
                ) => outcome,
            };

            let failure = match outcome {
                Ok(Ok(response_bytes)) => {
                    match KafkaClient::decode_response::<FetchResponse>(
                        ApiKey::Fetch,
                        version,
                        &response_bytes,
                    ) {
                        Ok(response) => match self.forward(&response).await {
                            Some(failed) => failed,
                            None => break,
                        },
                        Err(e) => Some(StreamError::Transport(e.to_string())),
                    }
                }
                Ok(Err(e)) => Some(StreamError::Transport(e.to_string())),
                Err(_) => Some(StreamError::Timeout(FETCH_TIMEOUT)),
            };

            if let Some(error) = failure {
                if !self.emit(Err(error)).await {
                    break;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_BACKOFF) => {}
                }
            }
        }
        debug!("Fetch loop for '{}' stopped", self.topic);
    }

    fn build_request(&self) -> FetchRequest {
        let mut fetch_partitions = Vec::with_capacity(self.offsets.len());
        for (&partition, &offset) in &self.offsets {
            let mut fetch_partition = FetchPartition::default();
            fetch_partition.partition = partition;
            fetch_partition.current_leader_epoch = -1;
            fetch_partition.fetch_offset = offset;
            fetch_partition.log_start_offset = -1;
            fetch_partition.partition_max_bytes = 1024 * 1024;
            fetch_partitions.push(fetch_partition);
        }

        let mut fetch_topic = FetchTopic::default();
        fetch_topic.topic = TopicName(StrBytes::from_string(self.topic.clone()));
        fetch_topic.partitions = fetch_partitions;

        let mut request = FetchRequest::default();
        request.max_wait_ms = FETCH_MAX_WAIT_MS;
        request.min_bytes = 1;
        request.max_bytes = 50 * 1024 * 1024;
        request.isolation_level = 0;
        request.session_id = 0;
        request.session_epoch = -1;
        request.topics.push(fetch_topic);
        request.rack_id = StrBytes::from_static_str("");
        request
    }

    /// Forwards every new record in `response`
    ///
    /// Returns `None` once the receiving side is gone, otherwise `Some` with the
    /// first partition-level failure to report after the round-trip (if any).
    async fn forward(&mut self, response: &FetchResponse) -> Option<Option<StreamError>> {
        let mut failure = None;

        for topic_response in &response.responses {
            for partition_response in &topic_response.partitions {
                let partition = partition_response.partition_index;
                if partition_response.error_code != 0 {
                    failure.get_or_insert(StreamError::Partition {
                        partition,
                        code: partition_response.error_code,
                        message: error_message(partition_response.error_code),
                    });
                    continue;
                }
                let Some(records) = &partition_response.records else {
                    continue;
                };

                let next_offset = self.offsets.get(&partition).copied().unwrap_or(0);
                let deliveries = match decode_partition(&self.topic, partition, next_offset, records) {
                    Ok(deliveries) => deliveries,
                    Err(error) => {
                        failure.get_or_insert(error);
                        continue;
                    }
                };
                for delivery in deliveries {
                    self.offsets.insert(partition, delivery.offset + 1);
                    if !self.emit(Ok(delivery)).await {
                        return None;
                    }
                }
            }
        }
        Some(failure)
    }

    /// Returns `false` once the stream is closed or every receiver is gone
    async fn emit(&self, item: Result<Delivery, StreamError>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// Decodes every record batch in a partition's fetch payload
///
/// Records before `next_offset` are dropped, since a batch may start before the
/// requested offset.
fn decode_partition(
    topic: &str,
    partition: i32,
    next_offset: i64,
    records: &Bytes,
) -> Result<Vec<Delivery>, StreamError> {
    let mut deliveries = Vec::new();
    let mut cursor = std::io::Cursor::new(records.as_ref());

    while (cursor.position() as usize) < records.len() {
        let remaining = &records.as_ref()[cursor.position() as usize..];
        // Max bytes can cut the last batch short; the next fetch picks it up
        if is_truncated_batch(remaining) {
            break;
        }
        verify_record_batch_crc(remaining).map_err(|e| StreamError::Corrupt {
            partition,
            reason: e.to_string(),
        })?;

        let record_set = RecordBatchDecoder::decode(&mut cursor).map_err(|e| {
            StreamError::Corrupt {
                partition,
                reason: e.to_string(),
            }
        })?;
        deliveries.extend(
            record_set
                .records
                .into_iter()
                .filter(|record| record.offset >= next_offset)
                .map(|record| Delivery {
                    topic: topic.to_string(),
                    partition,
                    offset: record.offset,
                    key: record.key,
                    value: record.value,
                }),
        );
    }
    Ok(deliveries)
}
