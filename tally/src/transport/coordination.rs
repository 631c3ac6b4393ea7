//! Node-creation variant of the harness
//!
//! Instead of appending to a partitioned log, each message creates a node in a
//! coordination service. The service hands out a monotonically increasing
//! creation id for every successful create, which plays the role of the offset
//! on a single partition. Creating a path that already exists is a soft
//! duplicate, not a failure.

use super::memory::MemoryStream;
use super::{Coordinator, Delivery, MessageStream, Published, Publisher};
use crate::error::{CreateError, PublishError, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Partition reported for every node-creation delivery
pub const NODE_PARTITION: i32 = 0;

struct CoordinatorState {
    nodes: BTreeMap<String, (i64, Bytes)>,
    next_id: i64,
    watchers: Vec<mpsc::UnboundedSender<Result<Delivery, StreamError>>>,
}

/// In-process coordination store with a watch on node creation
#[derive(Clone)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                nodes: BTreeMap::new(),
                next_id: 0,
                watchers: Vec::new(),
            })),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stream of nodes created from now on
    pub fn watch(&self) -> MemoryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(tx);
        MemoryStream::new(rx)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str, data: Bytes) -> Result<i64, CreateError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CreateError::Other("session closed".to_string()));
        }

        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(CreateError::AlreadyExists(path.to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.nodes.insert(path.to_string(), (id, data.clone()));

        let delivery = Delivery {
            topic: path.to_string(),
            partition: NODE_PARTITION,
            offset: id,
            key: Some(Bytes::from(path.to_string())),
            value: Some(data),
        };
        state
            .watchers
            .retain(|tx| tx.send(Ok(delivery.clone())).is_ok());
        Ok(id)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().watchers.clear();
        }
    }
}

/// Publishes messages as nodes under `{root}/{topic}/{key}`
pub struct NodePublisher<C> {
    coordinator: C,
    root: String,
}

impl<C: Coordinator> NodePublisher<C> {
    pub fn new(coordinator: C, root: impl Into<String>) -> Self {
        Self {
            coordinator,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    fn node_path(&self, topic: &str, key: &[u8]) -> String {
        format!("{}/{}/{}", self.root, topic, String::from_utf8_lossy(key))
    }
}

#[async_trait]
impl<C: Coordinator> Publisher for NodePublisher<C> {
    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError> {
        // Node names need a key; fall back to the payload itself
        let name = key.unwrap_or_else(|| value.clone());
        let path = self.node_path(topic, &name);
        match self.coordinator.create(&path, value).await {
            Ok(id) => Ok(Published {
                partition: NODE_PARTITION,
                offset: id,
            }),
            Err(CreateError::AlreadyExists(path)) => Err(PublishError::Duplicate(path)),
            Err(CreateError::Other(reason)) => Err(PublishError::Transport(reason)),
        }
    }

    async fn close(&self) {
        self.coordinator.close().await;
    }
}
