//! Kafka wire-protocol client
//!
//! A single TCP connection to one broker speaking the Kafka protocol through
//! `kafka-protocol`: length-prefixed frames, correlation ids and API version
//! negotiation. The harness never administers the cluster; it only asks which
//! partitions a topic has, where each partition currently starts or ends, and
//! then produces and fetches records.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        list_offsets_request::{ListOffsetsPartition, ListOffsetsRequest, ListOffsetsTopic},
        list_offsets_response::ListOffsetsResponse,
        metadata_request::{MetadataRequest, MetadataRequestTopic},
        metadata_response::MetadataResponse,
        ApiKey, BrokerId, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

/// Client id sent in every request header
const CLIENT_ID: &str = "tally";

/// Largest response frame accepted from a broker
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Human-readable message for a Kafka error code
pub fn error_message(code: i16) -> String {
    match code {
        0 => "None".to_string(),
        1 => "Offset out of range".to_string(),
        2 => "Corrupt message".to_string(),
        3 => "Unknown topic or partition".to_string(),
        5 => "Leader not available".to_string(),
        6 => "Not leader or follower".to_string(),
        7 => "Request timed out".to_string(),
        10 => "Message too large".to_string(),
        19 => "Not enough replicas".to_string(),
        20 => "Not enough replicas after append".to_string(),
        29 => "Topic authorization failed".to_string(),
        31 => "Invalid topic exception".to_string(),
        35 => "Unsupported version".to_string(),
        36 => "Not controller".to_string(),
        65 => "Unknown server error".to_string(),
        _ => format!("Unknown Kafka error code: {}", code),
    }
}

/// Connection to a single Kafka broker
///
/// The stream sits behind an async mutex: one request/response exchange at a
/// time per connection. Callers that need parallelism open more clients.
pub struct KafkaClient {
    stream: Mutex<TcpStream>,
    correlation_id: AtomicU64,
    /// API key → (min_version, max_version) as advertised by the broker
    pub api_versions: HashMap<i16, (i16, i16)>,
}

impl KafkaClient {
    /// Connects (with retry) and negotiates API versions
    pub async fn connect(broker: &str) -> Result<Self> {
        info!("Connecting to Kafka broker at {}", broker);
        let stream = Self::connect_with_retry(broker).await?;
        info!("Connected to Kafka broker at {}", broker);

        let mut client = KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            api_versions: HashMap::new(),
        };
        client.discover_api_versions().await?;
        Ok(client)
    }

    /// Connects reusing versions another client already negotiated
    pub async fn connect_with_versions(
        broker: &str,
        api_versions: HashMap<i16, (i16, i16)>,
    ) -> Result<Self> {
        debug!(
            "Connecting to Kafka broker at {} (reusing negotiated API versions)",
            broker
        );
        let stream = TcpStream::connect(broker)
            .await
            .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", broker, e))?;

        Ok(KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            api_versions,
        })
    }

    /// Up to 10 attempts, one second apart
    async fn connect_with_retry(broker: &str) -> Result<TcpStream> {
        let max_attempts = 10;
        let retry_interval = Duration::from_secs(1);

        let mut attempt = 1;
        loop {
            match TcpStream::connect(broker).await {
                Ok(stream) => {
                    if attempt > 1 {
                        info!("Connected to Kafka broker on attempt {}", attempt);
                    }
                    return Ok(stream);
                }
                Err(e) if attempt == max_attempts => {
                    return Err(anyhow!(
                        "Failed to connect to Kafka broker at {} after {} attempts: {}",
                        broker,
                        max_attempts,
                        e
                    ));
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} failed, retrying in 1 second: {}",
                        attempt, e
                    );
                    sleep(retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Encodes and sends one request, returning the raw response frame
    ///
    /// The returned bytes still start with the response header; use
    /// [`KafkaClient::decode_response`] to strip it and decode the body.
    pub async fn send_request<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
    ) -> Result<Bytes> {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) as i32;
        debug!(
            "Sending {:?} request (correlation_id: {}, version: {})",
            api_key, correlation_id, version
        );

        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_static_str(CLIENT_ID));
        let header_version = api_key.request_header_version(version);

        let mut buf = Vec::new();
        header
            .encode(&mut buf, header_version)
            .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
        request
            .encode(&mut buf, version)
            .map_err(|e| anyhow!("Failed to encode request body: {}", e))?;

        let mut message = Vec::with_capacity(4 + buf.len());
        message.extend_from_slice(&(buf.len() as i32).to_be_bytes());
        message.extend_from_slice(&buf);

        let mut stream = self.stream.lock().await;
        stream
            .write_all(&message)
            .await
            .map_err(|e| anyhow!("Failed to write request to stream: {}", e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await.map_err(|e| {
            anyhow!(
                "Failed to read response size: {} (the broker may have closed the connection)",
                e
            )
        })?;

        let response_size = i32::from_be_bytes(size_buf) as usize;
        if response_size > MAX_RESPONSE_SIZE {
            return Err(anyhow!("Response size too large: {} bytes", response_size));
        }

        let mut response_buf = vec![0u8; response_size];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        debug!("Received {} byte {:?} response", response_size, api_key);
        Ok(Bytes::from(response_buf))
    }

    /// Strips the response header and decodes the body
    pub fn decode_response<R: Decodable>(
        api_key: ApiKey,
        version: i16,
        response_bytes: &Bytes,
    ) -> Result<R> {
        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());
        let header_version = api_key.response_header_version(version);
        ResponseHeader::decode(&mut cursor, header_version)
            .map_err(|e| anyhow!("Failed to decode {:?} response header: {}", api_key, e))?;
        R::decode(&mut cursor, version)
            .map_err(|e| anyhow!("Failed to decode {:?} response: {}", api_key, e))
    }

    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is understood by every broker
        let request = ApiVersionsRequest::default();
        let response_bytes = self.send_request(ApiKey::ApiVersions, &request, 0).await?;
        let response: ApiVersionsResponse =
            Self::decode_response(ApiKey::ApiVersions, 0, &response_bytes)?;

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
            if let Ok(api_key) = ApiKey::try_from(api_version.api_key) {
                debug!(
                    "API {:?}: versions {}-{}",
                    api_key, api_version.min_version, api_version.max_version
                );
            }
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Picks `preferred_version` if the broker supports it, else the broker's max
    ///
    /// Falls back to `preferred_version` for APIs missing from discovery.
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        match self.api_versions.get(&(api_key as i16)) {
            Some(&(min_version, max_version))
                if (min_version..=max_version).contains(&preferred_version) =>
            {
                preferred_version
            }
            Some(&(min_version, max_version)) => {
                debug!(
                    "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                    preferred_version, api_key, min_version, max_version, max_version
                );
                max_version
            }
            None => {
                warn!(
                    "API {:?} not found in version discovery, using version {}",
                    api_key, preferred_version
                );
                preferred_version
            }
        }
    }

    /// Number of partitions of an existing topic
    pub async fn partition_count(&self, topic: &str) -> Result<i32> {
        let mut request_topic = MetadataRequestTopic::default();
        request_topic.name = Some(TopicName(StrBytes::from_string(topic.to_string())));

        let mut request = MetadataRequest::default();
        request.topics = Some(vec![request_topic]);

        let version = self.get_supported_version(ApiKey::Metadata, 1);
        let response_bytes = self
            .send_request(ApiKey::Metadata, &request, version)
            .await
            .map_err(|e| anyhow!("Metadata request for '{}' failed: {}", topic, e))?;
        let response: MetadataResponse =
            Self::decode_response(ApiKey::Metadata, version, &response_bytes)?;

        let topic_metadata = response
            .topics
            .iter()
            .find(|t| t.name.as_ref().map(|n| n.0.as_str()) == Some(topic))
            .ok_or_else(|| anyhow!("Topic '{}' missing from metadata response", topic))?;

        if topic_metadata.error_code != 0 {
            return Err(anyhow!(
                "Metadata for topic '{}' failed: {}",
                topic,
                error_message(topic_metadata.error_code)
            ));
        }
        if topic_metadata.partitions.is_empty() {
            return Err(anyhow!("Topic '{}' has no partitions", topic));
        }

        debug!(
            "Topic '{}' has {} partitions",
            topic,
            topic_metadata.partitions.len()
        );
        Ok(topic_metadata.partitions.len() as i32)
    }

    /// Offset at `timestamp` (-2 earliest, -1 latest) for partitions `0..partitions`
    pub async fn list_offsets(
        &self,
        topic: &str,
        partitions: i32,
        timestamp: i64,
    ) -> Result<HashMap<i32, i64>> {
        let mut list_topic = ListOffsetsTopic::default();
        list_topic.name = TopicName(StrBytes::from_string(topic.to_string()));
        for partition in 0..partitions {
            let mut list_partition = ListOffsetsPartition::default();
            list_partition.partition_index = partition;
            list_partition.current_leader_epoch = -1;
            list_partition.timestamp = timestamp;
            list_topic.partitions.push(list_partition);
        }

        let mut request = ListOffsetsRequest::default();
        request.replica_id = BrokerId(-1); // -1 identifies a regular consumer
        request.isolation_level = 0;
        request.topics.push(list_topic);

        let version = self.get_supported_version(ApiKey::ListOffsets, 1);
        let response_bytes = self
            .send_request(ApiKey::ListOffsets, &request, version)
            .await
            .map_err(|e| anyhow!("ListOffsets request for '{}' failed: {}", topic, e))?;
        let response: ListOffsetsResponse =
            Self::decode_response(ApiKey::ListOffsets, version, &response_bytes)?;

        let mut offsets = HashMap::new();
        for topic_response in &response.topics {
            for partition_response in &topic_response.partitions {
                if partition_response.error_code != 0 {
                    return Err(anyhow!(
                        "ListOffsets for '{}' partition {} failed: {}",
                        topic,
                        partition_response.partition_index,
                        error_message(partition_response.error_code)
                    ));
                }
                offsets.insert(partition_response.partition_index, partition_response.offset);
            }
        }

        if offsets.len() != partitions as usize {
            return Err(anyhow!(
                "ListOffsets for '{}' returned {} of {} partitions",
                topic,
                offsets.len(),
                partitions
            ));
        }
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::produce_request::ProduceRequest;

    #[test]
    fn test_error_code_mapping() {
        let test_cases = vec![
            (1, "Offset out of range"),
            (3, "Unknown topic or partition"),
            (5, "Leader not available"),
            (6, "Not leader or follower"),
            (29, "Topic authorization failed"),
            (65, "Unknown server error"),
            (999, "Unknown Kafka error code: 999"),
        ];
        for (code, expected) in test_cases {
            assert_eq!(error_message(code), expected);
        }
    }

    #[test]
    fn test_metadata_request_encoding() {
        let mut request_topic = MetadataRequestTopic::default();
        request_topic.name = Some(TopicName(StrBytes::from_string("defaultTopic".to_string())));
        let mut request = MetadataRequest::default();
        request.topics = Some(vec![request_topic]);

        let mut buf = Vec::new();
        request.encode(&mut buf, 1).unwrap();
        // array length (4) + string length (2) + name
        assert_eq!(buf.len(), 4 + 2 + "defaultTopic".len());
        assert_eq!(&buf[..4], &1i32.to_be_bytes());
    }

    #[test]
    fn test_list_offsets_request_encoding() {
        let mut list_topic = ListOffsetsTopic::default();
        list_topic.name = TopicName(StrBytes::from_string("t".to_string()));
        for partition in 0..3 {
            let mut list_partition = ListOffsetsPartition::default();
            list_partition.partition_index = partition;
            list_partition.timestamp = -1;
            list_topic.partitions.push(list_partition);
        }
        let mut request = ListOffsetsRequest::default();
        request.replica_id = BrokerId(-1);
        request.topics.push(list_topic);

        let mut buf = Vec::new();
        request.encode(&mut buf, 1).unwrap();
        assert_eq!(&buf[..4], &(-1i32).to_be_bytes());
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_header_versions_are_classic_for_pinned_versions() {
        // Versions we prefer all predate flexible headers
        assert_eq!(ApiKey::Metadata.request_header_version(1), 1);
        assert_eq!(ApiKey::ListOffsets.request_header_version(1), 1);
        assert_eq!(ApiKey::Produce.request_header_version(3), 1);
        assert_eq!(ApiKey::Fetch.request_header_version(4), 1);
        assert_eq!(ApiKey::Fetch.response_header_version(4), 0);
    }

    #[test]
    fn test_request_header_and_body_concatenate() {
        let request = ProduceRequest::default();
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::Produce as i16;
        header.request_api_version = 3;
        header.correlation_id = 7;
        header.client_id = Some(StrBytes::from_static_str(CLIENT_ID));

        let mut header_buf = Vec::new();
        let mut body_buf = Vec::new();
        header.encode(&mut header_buf, 1).unwrap();
        request.encode(&mut body_buf, 3).unwrap();

        let mut combined = Vec::new();
        header.encode(&mut combined, 1).unwrap();
        request.encode(&mut combined, 3).unwrap();
        assert_eq!(combined.len(), header_buf.len() + body_buf.len());
    }
}
