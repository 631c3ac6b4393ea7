//! One reconciliation run, end to end
//!
//! `Harness` owns every piece of run-scoped state (counters, offset tracker,
//! interrupt token, shutdown signal) and wires the producer, the consumer pool,
//! the interrupt watcher and the progress monitor together. `run` returns only
//! after every consumer worker has joined, so the report it builds reads final
//! values.

use crate::args::{KeyStrategy, MessageSize};
use crate::consumer::{ConsumerPool, WorkerReport};
use crate::counters::{CounterSnapshot, Counters};
use crate::error::ConfigError;
use crate::monitor::{ProgressMonitor, RateStats};
use crate::producer::{ProduceConfig, Producer, ProducerSummary};
use crate::shutdown::{spawn_interrupt_watcher, Shutdown, Trigger};
use crate::tracker::{GapAudit, OffsetRange, OffsetTracker};
use crate::transport::{MessageStream, Publisher};
use crate::verdict::Verdict;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest accepted grace period
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Lower bound of the derived default grace period
const MIN_DEFAULT_GRACE: Duration = Duration::from_millis(100);

/// A tenth of the publish interval, at least 100ms
pub fn default_grace(interval: Duration) -> Duration {
    (interval / 10).clamp(MIN_DEFAULT_GRACE, MAX_GRACE_PERIOD)
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub topic: String,
    /// Messages to produce
    pub messages: u64,
    /// Consumer workers
    pub workers: usize,
    pub interval: Duration,
    pub grace: Duration,
    pub idle_timeout: Option<Duration>,
    pub key_strategy: KeyStrategy,
    pub message_size: Option<MessageSize>,
    /// Keep every offset seen for the gap audit
    pub track_gaps: bool,
    /// `None` disables progress logging
    pub progress_interval: Option<Duration>,
}

impl HarnessConfig {
    /// Back-to-back publishing with sequence keys and the default grace period
    pub fn new(topic: impl Into<String>, messages: u64, workers: usize) -> Self {
        Self {
            topic: topic.into(),
            messages,
            workers,
            interval: Duration::ZERO,
            grace: default_grace(Duration::ZERO),
            idle_timeout: None,
            key_strategy: KeyStrategy::Sequence,
            message_size: None,
            track_gaps: false,
            progress_interval: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messages == 0 {
            return Err(ConfigError::ZeroMessages);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.workers as u64 > self.messages {
            return Err(ConfigError::WorkersExceedMessages {
                workers: self.workers,
                messages: self.messages,
            });
        }
        if self.grace > MAX_GRACE_PERIOD {
            return Err(ConfigError::GraceTooLong(self.grace));
        }
        Ok(())
    }

    fn produce_config(&self) -> ProduceConfig {
        ProduceConfig {
            topic: self.topic.clone(),
            messages: self.messages,
            interval: self.interval,
            grace: self.grace,
            key_strategy: self.key_strategy.clone(),
            message_size: self.message_size.clone(),
        }
    }
}

/// Everything observed during one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub verdict: Verdict,
    pub counters: CounterSnapshot,
    pub producer: ProducerSummary,
    pub workers: Vec<WorkerReport>,
    /// Offset range seen per partition
    pub partitions: BTreeMap<i32, OffsetRange>,
    /// Present when gap tracking was enabled
    pub audit: Option<GapAudit>,
    pub shutdown_trigger: Option<Trigger>,
    /// Present when progress monitoring was enabled
    pub rates: Option<RateStats>,
}

pub struct Harness {
    config: HarnessConfig,
    publisher: Arc<dyn Publisher>,
    stream: Arc<dyn MessageStream>,
    counters: Arc<Counters>,
    tracker: Arc<OffsetTracker>,
    interrupt: CancellationToken,
    shutdown: Shutdown,
}

impl Harness {
    /// Validates `config` and sets up fresh run state
    ///
    /// `stream` should already be subscribed so nothing published by the run
    /// is missed.
    pub fn new(
        config: HarnessConfig,
        publisher: Arc<dyn Publisher>,
        stream: Arc<dyn MessageStream>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let tracker = if config.track_gaps {
            OffsetTracker::with_gap_tracking()
        } else {
            OffsetTracker::new()
        };
        Ok(Self {
            config,
            publisher,
            stream,
            counters: Arc::new(Counters::new()),
            tracker: Arc::new(tracker),
            interrupt: CancellationToken::new(),
            shutdown: Shutdown::new(),
        })
    }

    /// Cancel to stop production early; shutdown follows after the grace period
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Fire to stop everything immediately
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Live view of the run's counters
    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Produces, consumes and reconciles, then closes both transport handles
    pub async fn run(self) -> RunReport {
        let config = &self.config;
        info!(
            "Starting run: {} messages to '{}', {} workers, grace {:?}",
            config.messages, config.topic, config.workers, config.grace
        );

        let watcher =
            spawn_interrupt_watcher(self.interrupt.clone(), self.shutdown.clone(), config.grace);

        let monitor = config.progress_interval.map(|period| {
            let monitor = ProgressMonitor::new(self.counters.clone(), config.messages);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { monitor.run(period, shutdown).await })
        });

        // Workers are waiting before the first publish
        let pool = ConsumerPool::new(self.stream.clone(), config.workers, config.idle_timeout);
        let consumers = {
            let counters = self.counters.clone();
            let tracker = self.tracker.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { pool.run(counters, tracker, shutdown).await })
        };

        let producer = Producer::new(
            self.publisher.clone(),
            self.counters.clone(),
            self.interrupt.clone(),
            self.shutdown.clone(),
        );
        let producer_summary = producer.produce_messages(&config.produce_config()).await;

        let workers = match consumers.await {
            Ok(reports) => reports,
            Err(e) => {
                error!("Consumer pool failed: {}", e);
                Vec::new()
            }
        };

        // Every path above ends with shutdown fired, which stops the watcher
        if let Err(e) = watcher.await {
            warn!("Interrupt watcher failed: {}", e);
        }
        let rates = match monitor {
            Some(handle) => handle
                .await
                .map_err(|e| warn!("Progress monitor failed: {}", e))
                .ok(),
            None => None,
        };

        self.publisher.close().await;
        self.stream.close().await;

        let counters = self.counters.snapshot();
        let verdict = Verdict::compute(counters, self.tracker.total_reconciled());
        if verdict.passed() {
            info!("Verification passed: {}", verdict);
        } else {
            for mismatch in verdict.mismatches() {
                warn!("Verification mismatch: {}", mismatch);
            }
        }

        let audit = self.tracker.gap_audit();
        if let Some(audit) = &audit {
            if !audit.is_clean() {
                warn!(
                    "Gap audit: {} duplicate deliveries, {} missing offsets",
                    audit.total_duplicates(),
                    audit.total_missing()
                );
            }
        }

        RunReport {
            verdict,
            counters,
            producer: producer_summary,
            workers,
            partitions: self.tracker.snapshot(),
            audit,
            shutdown_trigger: self.shutdown.trigger(),
            rates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grace_bounds() {
        assert_eq!(default_grace(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(default_grace(Duration::from_secs(1)), Duration::from_millis(100));
        assert_eq!(default_grace(Duration::from_secs(3)), Duration::from_millis(300));
        assert_eq!(default_grace(Duration::from_secs(3600)), MAX_GRACE_PERIOD);
    }

    #[test]
    fn test_validate() {
        assert!(HarnessConfig::new("t", 10, 2).validate().is_ok());
        assert!(HarnessConfig::new("t", 10, 10).validate().is_ok());
        assert_eq!(
            HarnessConfig::new("t", 0, 1).validate(),
            Err(ConfigError::ZeroMessages)
        );
        assert_eq!(
            HarnessConfig::new("t", 5, 0).validate(),
            Err(ConfigError::ZeroWorkers)
        );
        assert_eq!(
            HarnessConfig::new("t", 5, 6).validate(),
            Err(ConfigError::WorkersExceedMessages {
                workers: 6,
                messages: 5
            })
        );

        let mut config = HarnessConfig::new("t", 5, 1);
        config.grace = MAX_GRACE_PERIOD + Duration::from_millis(1);
        assert!(matches!(config.validate(), Err(ConfigError::GraceTooLong(_))));
    }
}
