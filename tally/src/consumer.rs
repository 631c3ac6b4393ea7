//! Consumer pool
//!
//! W workers pull from one shared message stream. Each worker waits on the
//! stream, the shutdown signal and (optionally) an idle timer at the same time,
//! and exits on whichever resolves to a terminal event. Every delivery bumps the
//! consumed counter and feeds the offset tracker.

use crate::counters::Counters;
use crate::shutdown::Shutdown;
use crate::tracker::OffsetTracker;
use crate::transport::MessageStream;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerExit {
    /// Shutdown signal fired
    Shutdown,
    /// Stream closed and drained
    StreamClosed,
    /// No delivery within the idle timeout
    IdleTimeout,
    /// Worker task panicked
    Failed,
}

/// Per-worker tallies, returned once the worker has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub messages: u64,
    pub stream_errors: u64,
    pub exit: WorkerExit,
}

pub struct ConsumerPool {
    stream: Arc<dyn MessageStream>,
    workers: usize,
    idle_timeout: Option<Duration>,
}

impl ConsumerPool {
    /// Pool of `workers` workers sharing `stream`
    pub fn new(
        stream: Arc<dyn MessageStream>,
        workers: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream,
            workers,
            idle_timeout,
        }
    }

    /// Spawns the workers and waits for all of them to exit
    ///
    /// Returning is the join barrier: once this resolves no worker touches
    /// `counters` or `tracker` again.
    pub async fn run(
        &self,
        counters: Arc<Counters>,
        tracker: Arc<OffsetTracker>,
        shutdown: Shutdown,
    ) -> Vec<WorkerReport> {
        info!("Starting {} consumer workers", self.workers);

        let handles: Vec<_> = (0..self.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    stream: self.stream.clone(),
                    counters: counters.clone(),
                    tracker: tracker.clone(),
                    shutdown: shutdown.clone(),
                    idle_timeout: self.idle_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(worker_id, joined)| match joined {
                Ok(report) => report,
                Err(e) => {
                    error!("Consumer worker {} failed: {}", worker_id, e);
                    WorkerReport {
                        worker_id,
                        messages: 0,
                        stream_errors: 0,
                        exit: WorkerExit::Failed,
                    }
                }
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    stream: Arc<dyn MessageStream>,
    counters: Arc<Counters>,
    tracker: Arc<OffsetTracker>,
    shutdown: Shutdown,
    idle_timeout: Option<Duration>,
}

impl Worker {
    async fn run(self) -> WorkerReport {
        let mut messages = 0;
        let mut stream_errors = 0;

        let exit = loop {
            // Re-armed on every iteration, so it measures time since the last event
            let idle = async {
                match self.idle_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.fired() => break WorkerExit::Shutdown,
                item = self.stream.recv() => match item {
                    Some(Ok(delivery)) => {
                        self.counters.record_consumed();
                        self.tracker.record(delivery.partition, delivery.offset);
                        messages += 1;
                        debug!(
                            "Worker {} consumed partition {} offset {}",
                            self.id, delivery.partition, delivery.offset
                        );
                    }
                    Some(Err(e)) => {
                        self.counters.record_stream_error();
                        stream_errors += 1;
                        warn!("Worker {} stream error: {}", self.id, e);
                    }
                    None => break WorkerExit::StreamClosed,
                },
                _ = idle => break WorkerExit::IdleTimeout,
            }
        };

        match exit {
            WorkerExit::IdleTimeout => warn!(
                "Worker {} idle for {:?}, exiting after {} messages",
                self.id,
                self.idle_timeout.unwrap_or_default(),
                messages
            ),
            _ => info!(
                "Worker {} exiting ({:?}) after {} messages",
                self.id, exit, messages
            ),
        }

        WorkerReport {
            worker_id: self.id,
            messages,
            stream_errors,
            exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Trigger;
    use crate::transport::{MemoryBroker, Publisher, StartOffset};
    use bytes::Bytes;

    async fn publish_n(broker: &MemoryBroker, n: usize) {
        let publisher = broker.publisher();
        for i in 0..n {
            publisher
                .publish("t", None, Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_workers_drain_until_stream_closes() {
        let broker = MemoryBroker::new(2);
        let stream = Arc::new(broker.subscribe("t", StartOffset::Newest));
        publish_n(&broker, 10).await;
        broker.shutdown();

        let counters = Arc::new(Counters::new());
        let tracker = Arc::new(OffsetTracker::new());
        let pool = ConsumerPool::new(stream, 3, None);
        let reports = pool
            .run(counters.clone(), tracker.clone(), Shutdown::new())
            .await;

        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.exit == WorkerExit::StreamClosed));
        assert_eq!(reports.iter().map(|r| r.messages).sum::<u64>(), 10);
        assert_eq!(counters.consumed(), 10);
        assert_eq!(tracker.total_reconciled(), Ok(10));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_workers() {
        let broker = MemoryBroker::new(1);
        let stream = Arc::new(broker.subscribe("t", StartOffset::Newest));
        let shutdown = Shutdown::new();

        let pool = ConsumerPool::new(stream, 4, None);
        let counters = Arc::new(Counters::new());
        let tracker = Arc::new(OffsetTracker::new());
        let firing = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                shutdown.fire(Trigger::Interrupt);
            })
        };

        let reports = tokio::time::timeout(
            Duration::from_secs(2),
            pool.run(counters, tracker, shutdown),
        )
        .await
        .expect("workers should exit after shutdown");
        firing.await.unwrap();
        assert!(reports.iter().all(|r| r.exit == WorkerExit::Shutdown));
    }

    #[tokio::test]
    async fn test_stream_errors_do_not_stop_workers() {
        let broker = MemoryBroker::new(1);
        let stream = Arc::new(broker.subscribe("t", StartOffset::Newest));
        broker.inject_stream_error("t", "flaky");
        publish_n(&broker, 3).await;
        broker.shutdown();

        let counters = Arc::new(Counters::new());
        let pool = ConsumerPool::new(stream, 1, None);
        let reports = pool
            .run(counters.clone(), Arc::new(OffsetTracker::new()), Shutdown::new())
            .await;

        assert_eq!(reports[0].stream_errors, 1);
        assert_eq!(reports[0].messages, 3);
        assert_eq!(reports[0].exit, WorkerExit::StreamClosed);
        assert_eq!(counters.snapshot().stream_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_exits() {
        let broker = MemoryBroker::new(1);
        let stream = Arc::new(broker.subscribe("t", StartOffset::Newest));
        publish_n(&broker, 2).await;

        let pool = ConsumerPool::new(stream, 2, Some(Duration::from_secs(10)));
        let reports = pool
            .run(
                Arc::new(Counters::new()),
                Arc::new(OffsetTracker::new()),
                Shutdown::new(),
            )
            .await;

        assert!(reports.iter().all(|r| r.exit == WorkerExit::IdleTimeout));
        assert_eq!(reports.iter().map(|r| r.messages).sum::<u64>(), 2);
        drop(broker);
    }
}
