//! Producer loop
//!
//! Publishes a fixed number of messages at a fixed interval (or back to back),
//! counting only successful publishes as produced. Completion arms the shared
//! shutdown signal after a grace period so consumers can observe the tail of
//! the run. An external interrupt stops the loop early; the interrupt watcher
//! then owns the shutdown sequencing.

use crate::args::{KeyStrategy, MessageSize};
use crate::counters::Counters;
use crate::shutdown::{Shutdown, Trigger};
use crate::transport::Publisher;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one run of the producer loop should send
#[derive(Debug, Clone)]
pub struct ProduceConfig {
    pub topic: String,
    pub messages: u64,
    /// Wait before each publish; zero sends as fast as possible
    pub interval: Duration,
    /// Wait between the last publish and firing shutdown
    pub grace: Duration,
    pub key_strategy: KeyStrategy,
    /// Pad values to this size; `None` sends the bare description
    pub message_size: Option<MessageSize>,
}

/// Outcome of the producer loop
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerSummary {
    /// Publishes started
    pub attempted: u64,
    /// Publishes the transport confirmed
    pub produced: u64,
    /// Publishes that failed
    pub failed: u64,
    /// Publishes reported as already present
    pub duplicates: u64,
    /// Key and value bytes of produced messages
    pub bytes_sent: u64,
    /// Loop stopped before sending every message
    pub interrupted: bool,
    /// A publish was in flight when shutdown fired and its result was dropped
    pub abandoned: bool,
    /// Time spent in the send loop, excluding the grace period
    pub elapsed_secs: f64,
}

/// Value for message `index`: a short description, right-padded with `x`
pub fn build_value(index: u64, size: Option<&MessageSize>) -> Bytes {
    let mut value = format!("Something Cool: {}", index);
    if let Some(size) = size {
        let target = size.generate_size();
        if target > value.len() {
            value.extend(std::iter::repeat('x').take(target - value.len()));
        }
    }
    Bytes::from(value)
}

/// Single producer task publishing through a shared transport
pub struct Producer {
    /// Transport handle for publishing
    publisher: Arc<dyn Publisher>,
    /// Shared tallies; only `produced`, `publish_errors` and `duplicates` are touched
    counters: Arc<Counters>,
    /// External interrupt, checked between publishes
    interrupt: CancellationToken,
    /// Run-wide shutdown signal
    shutdown: Shutdown,
}

impl Producer {
    /// Creates a new Producer instance
    ///
    /// # Arguments
    /// * `publisher` - Transport used for every publish
    /// * `counters` - Shared counters updated per publish outcome
    /// * `interrupt` - Cancelled on external interrupt; stops the loop early
    /// * `shutdown` - Fired by the producer once it has finished and the grace period elapsed
    pub fn new(
        publisher: Arc<dyn Publisher>,
        counters: Arc<Counters>,
        interrupt: CancellationToken,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            publisher,
            counters,
            interrupt,
            shutdown,
        }
    }

    /// Sends `config.messages` messages and then arms shutdown
    ///
    /// The loop waits one interval before every publish, then publishes. A
    /// failed publish is counted and the loop moves on to the next message.
    ///
    /// On normal completion the producer sleeps for the grace period and fires
    /// shutdown with [`Trigger::ProducerDone`], unless something else fired it
    /// first. When the interrupt stops the loop the producer returns right
    /// away; the interrupt watcher is already counting down its own grace
    /// period.
    ///
    /// If shutdown fires while a publish is in flight, the publish is
    /// abandoned and not counted.
    pub async fn produce_messages(&self, config: &ProduceConfig) -> ProducerSummary {
        let start = Instant::now();
        let mut summary = ProducerSummary::default();

        let mut ticker = (!config.interval.is_zero()).then(|| {
            let mut ticker = interval_at(start + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            "Producing {} messages to '{}' (interval {:?})",
            config.messages, config.topic, config.interval
        );

        for index in 0..config.messages {
            if self.interrupt.is_cancelled() || self.shutdown.is_fired() {
                summary.interrupted = true;
                break;
            }

            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.interrupt.cancelled() => {
                        summary.interrupted = true;
                        break;
                    }
                    _ = self.shutdown.fired() => {
                        summary.interrupted = true;
                        break;
                    }
                }
            }

            let key = config.key_strategy.generate_key(index);
            let value = build_value(index, config.message_size.as_ref());
            let size = (key.len() + value.len()) as u64;
            summary.attempted += 1;

            let outcome = tokio::select! {
                biased;
                result = self.publisher.publish(&config.topic, Some(key), value) => Some(result),
                _ = self.shutdown.fired() => None,
            };

            match outcome {
                None => {
                    warn!("Shutdown fired during publish of message {}, abandoning it", index);
                    summary.abandoned = true;
                    summary.interrupted = true;
                    break;
                }
                Some(Ok(placed)) => {
                    self.counters.record_produced();
                    summary.produced += 1;
                    summary.bytes_sent += size;
                    debug!(
                        "Message {} stored at partition {} offset {}",
                        index, placed.partition, placed.offset
                    );
                }
                Some(Err(e)) if e.is_duplicate() => {
                    self.counters.record_duplicate();
                    summary.duplicates += 1;
                    debug!("Message {} is a duplicate: {}", index, e);
                }
                Some(Err(e)) => {
                    self.counters.record_publish_error();
                    summary.failed += 1;
                    warn!("Failed to publish message {}: {}", index, e);
                }
            }
        }

        summary.elapsed_secs = start.elapsed().as_secs_f64();

        if summary.interrupted {
            info!(
                "Producer stopped early after {} of {} messages ({} produced)",
                summary.attempted, config.messages, summary.produced
            );
            return summary;
        }

        info!(
            "Producer finished: {} produced, {} failed, {} duplicates; waiting {:?} before shutdown",
            summary.produced, summary.failed, summary.duplicates, config.grace
        );
        tokio::select! {
            _ = tokio::time::sleep(config.grace) => {
                self.shutdown.fire(Trigger::ProducerDone);
            }
            _ = self.shutdown.fired() => {}
        }
        summary
    }
}
