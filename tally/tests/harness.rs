//! End-to-end runs of the harness over the in-memory transports

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tally::args::KeyStrategy;
use tally::consumer::WorkerExit;
use tally::error::{ConfigError, PublishError, StreamError};
use tally::harness::{Harness, HarnessConfig, RunReport};
use tally::shutdown::Trigger;
use tally::transport::{
    Delivery, MemoryBroker, MemoryCoordinator, MemoryPublisher, MemoryStream, MessageStream,
    NodePublisher, Published, Publisher, StartOffset,
};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "defaultTopic";

fn config(messages: u64, workers: usize) -> HarnessConfig {
    let mut config = HarnessConfig::new(TOPIC, messages, workers);
    config.grace = Duration::from_millis(200);
    config
}

async fn run_memory(broker: &MemoryBroker, config: HarnessConfig) -> RunReport {
    let stream = broker.subscribe(TOPIC, StartOffset::Newest);
    let harness = Harness::new(config, Arc::new(broker.publisher()), Arc::new(stream)).unwrap();
    harness.run().await
}

/// Cancels the run's interrupt token once `after` publishes have succeeded
struct InterruptingPublisher {
    inner: MemoryPublisher,
    after: u64,
    published: AtomicU64,
    interrupt: OnceLock<CancellationToken>,
}

#[async_trait]
impl Publisher for InterruptingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<Published, PublishError> {
        let placed = self.inner.publish(topic, key, value).await?;
        if self.published.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            if let Some(interrupt) = self.interrupt.get() {
                interrupt.cancel();
            }
        }
        Ok(placed)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Delivers every offset divisible by three twice
struct RedeliveringStream {
    inner: MemoryStream,
    pending: parking_lot::Mutex<Option<Delivery>>,
}

#[async_trait]
impl MessageStream for RedeliveringStream {
    async fn recv(&self) -> Option<Result<Delivery, StreamError>> {
        if let Some(again) = self.pending.lock().take() {
            return Some(Ok(again));
        }
        let item = self.inner.recv().await;
        if let Some(Ok(delivery)) = &item {
            if delivery.offset % 3 == 0 {
                *self.pending.lock() = Some(delivery.clone());
            }
        }
        item
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[tokio::test]
async fn test_single_partition_all_delivered() {
    let broker = MemoryBroker::new(1);
    let report = run_memory(&broker, config(10, 2)).await;

    let verdict = report.verdict;
    assert_eq!(verdict.produced, 10);
    assert_eq!(verdict.consumed, 10);
    assert_eq!(verdict.reconciled, Some(10));
    assert!(verdict.produced_matches_consumed);
    assert!(verdict.produced_matches_reconciled);
    assert!(verdict.consumed_matches_reconciled);
    assert!(verdict.passed());

    assert_eq!(report.shutdown_trigger, Some(Trigger::ProducerDone));
    assert_eq!(report.workers.len(), 2);
    assert!(report.workers.iter().all(|w| w.exit == WorkerExit::Shutdown));
    assert_eq!(report.partitions[&0].min(), Some(0));
    assert_eq!(report.partitions[&0].max(), Some(9));
}

#[tokio::test]
async fn test_failed_publishes_shrink_the_offset_span() {
    let broker = MemoryBroker::new(1);
    broker.fail_attempts([1, 4, 8]);
    let report = run_memory(&broker, config(10, 2)).await;

    assert_eq!(report.producer.attempted, 10);
    assert_eq!(report.producer.failed, 3);
    assert_eq!(report.counters.publish_errors, 3);
    assert_eq!(report.verdict.produced, 7);
    assert_eq!(report.verdict.consumed, 7);
    assert_eq!(report.verdict.reconciled, Some(7));
    assert!(report.verdict.passed());
}

#[tokio::test]
async fn test_interrupt_stops_production_early() {
    let broker = MemoryBroker::new(1);
    let stream = broker.subscribe(TOPIC, StartOffset::Newest);
    let publisher = Arc::new(InterruptingPublisher {
        inner: broker.publisher(),
        after: 4,
        published: AtomicU64::new(0),
        interrupt: OnceLock::new(),
    });

    let mut cfg = config(10, 2);
    cfg.interval = Duration::from_millis(10);
    let harness = Harness::new(cfg, publisher.clone(), Arc::new(stream)).unwrap();
    publisher.interrupt.set(harness.interrupt_handle()).unwrap();
    let report = harness.run().await;

    assert!(report.producer.interrupted);
    assert!(!report.producer.abandoned);
    assert_eq!(report.verdict.produced, 4);
    assert!(report.verdict.consumed <= 4);
    assert_eq!(report.verdict.reconciled, Some(report.verdict.consumed));
    assert_eq!(report.shutdown_trigger, Some(Trigger::Interrupt));
    assert_eq!(broker.record_count(TOPIC), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_count_does_not_change_the_result() {
    let mut results = Vec::new();
    for workers in [1, 2, 8] {
        let broker = MemoryBroker::new(4);
        let report = run_memory(&broker, config(64, workers)).await;
        assert!(report.verdict.passed(), "{} workers: {}", workers, report.verdict);
        results.push((report.verdict.consumed, report.verdict.reconciled));
    }
    assert!(results.iter().all(|r| *r == (64, Some(64))));
}

#[tokio::test]
async fn test_nonzero_base_offsets_reconcile() {
    let broker = MemoryBroker::new(2).with_base_offset(100);
    let report = run_memory(&broker, config(10, 2)).await;

    assert_eq!(report.partitions[&0].min(), Some(100));
    assert_eq!(report.partitions[&1].max(), Some(104));
    assert_eq!(report.verdict.reconciled, Some(10));
    assert!(report.verdict.passed());
}

#[tokio::test]
async fn test_coordination_duplicates_are_soft() {
    let coordinator = MemoryCoordinator::new();
    let stream = coordinator.watch();
    let publisher = NodePublisher::new(coordinator.clone(), "/tally");

    let mut cfg = config(5, 1);
    cfg.key_strategy = KeyStrategy::random_pool(1);
    let harness = Harness::new(cfg, Arc::new(publisher), Arc::new(stream)).unwrap();
    let report = harness.run().await;

    assert_eq!(report.counters.duplicates, 4);
    assert_eq!(report.counters.publish_errors, 0);
    assert_eq!(report.verdict.produced, 1);
    assert_eq!(report.verdict.consumed, 1);
    assert_eq!(report.verdict.reconciled, Some(1));
    assert!(report.verdict.passed());
    assert_eq!(coordinator.node_count(), 1);
}

#[tokio::test]
async fn test_coordination_sequence_keys_create_every_node() {
    let coordinator = MemoryCoordinator::new();
    let stream = coordinator.watch();
    let publisher = NodePublisher::new(coordinator.clone(), "/tally");

    let harness = Harness::new(config(10, 3), Arc::new(publisher), Arc::new(stream)).unwrap();
    let report = harness.run().await;

    assert_eq!(report.verdict.reconciled, Some(10));
    assert!(report.verdict.passed());
    assert_eq!(coordinator.node_count(), 10);
}

#[tokio::test]
async fn test_redelivery_inflates_consumed_but_not_span() {
    let broker = MemoryBroker::new(1);
    let stream = RedeliveringStream {
        inner: broker.subscribe(TOPIC, StartOffset::Newest),
        pending: parking_lot::Mutex::new(None),
    };
    let mut cfg = config(9, 1);
    cfg.track_gaps = true;
    let harness = Harness::new(cfg, Arc::new(broker.publisher()), Arc::new(stream)).unwrap();
    let report = harness.run().await;

    // offsets 0, 3 and 6 arrive twice
    assert_eq!(report.verdict.produced, 9);
    assert_eq!(report.verdict.consumed, 12);
    assert_eq!(report.verdict.reconciled, Some(9));
    assert!(report.verdict.produced_matches_reconciled);
    assert!(!report.verdict.produced_matches_consumed);
    assert!(!report.verdict.passed());

    let audit = report.audit.expect("gap tracking enabled");
    assert_eq!(audit.total_duplicates(), 3);
    assert_eq!(audit.total_missing(), 0);
}

#[tokio::test]
async fn test_idle_workers_exit_before_slow_producer() {
    let broker = MemoryBroker::new(1);
    let mut cfg = config(3, 1);
    cfg.interval = Duration::from_millis(100);
    cfg.grace = Duration::from_millis(100);
    cfg.idle_timeout = Some(Duration::from_millis(20));
    let report = run_memory(&broker, cfg).await;

    assert_eq!(report.workers[0].exit, WorkerExit::IdleTimeout);
    assert_eq!(report.verdict.produced, 3);
    assert_eq!(report.verdict.consumed, 0);
    assert_eq!(report.verdict.reconciled, None);
    assert!(!report.verdict.passed());
}

#[tokio::test]
async fn test_closed_stream_ends_workers() {
    let broker = MemoryBroker::new(1);
    let stream = broker.subscribe(TOPIC, StartOffset::Newest);
    broker.shutdown();

    let harness = Harness::new(config(3, 2), Arc::new(broker.publisher()), Arc::new(stream)).unwrap();
    let report = harness.run().await;

    assert!(report.workers.iter().all(|w| w.exit == WorkerExit::StreamClosed));
    assert_eq!(report.verdict.produced, 3);
    assert_eq!(report.verdict.consumed, 0);
    assert!(!report.verdict.passed());
}

#[tokio::test]
async fn test_shutdown_before_run_produces_nothing() {
    let broker = MemoryBroker::new(1);
    let stream = broker.subscribe(TOPIC, StartOffset::Newest);
    let harness = Harness::new(config(5, 1), Arc::new(broker.publisher()), Arc::new(stream)).unwrap();
    harness.shutdown_handle().fire(Trigger::Interrupt);

    let report = harness.run().await;
    assert!(report.producer.interrupted);
    assert_eq!(report.producer.attempted, 0);
    assert_eq!(report.verdict.reconciled, None);
    assert_eq!(report.shutdown_trigger, Some(Trigger::Interrupt));
}

#[test]
fn test_invalid_configuration_is_rejected_up_front() {
    let broker = MemoryBroker::new(1);
    let build = |cfg: HarnessConfig| {
        Harness::new(
            cfg,
            Arc::new(broker.publisher()),
            Arc::new(broker.subscribe(TOPIC, StartOffset::Newest)),
        )
        .err()
    };

    assert_eq!(
        build(config(2, 3)),
        Some(ConfigError::WorkersExceedMessages {
            workers: 3,
            messages: 2
        })
    );
    assert_eq!(build(config(0, 1)), Some(ConfigError::ZeroMessages));
    assert_eq!(build(config(1, 0)), Some(ConfigError::ZeroWorkers));
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    let broker = MemoryBroker::new(2);
    let mut cfg = config(4, 2);
    cfg.track_gaps = true;
    let report = run_memory(&broker, cfg).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["verdict"]["produced"], 4);
    assert_eq!(json["verdict"]["reconciled"], 4);
    assert_eq!(json["shutdown_trigger"], "ProducerDone");
    assert_eq!(json["partitions"]["0"]["initialized"], true);
    assert!(json["audit"]["partitions"].is_array());
}
