//! Periodic progress reporting while a run is in flight
//!
//! The monitor samples the shared counters on a fixed interval, logs how far
//! production and consumption have come, and keeps the lowest and highest
//! consumption rate it observed. It stops as soon as shutdown fires.

use crate::counters::Counters;
use crate::shutdown::Shutdown;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Consumption rates observed by the monitor, in messages per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateStats {
    /// Lowest non-zero rate, 0 if nothing was consumed between samples
    pub min_rate: f64,
    pub max_rate: f64,
    /// Samples taken
    pub samples: u64,
    pub elapsed_secs: f64,
}

pub struct ProgressMonitor {
    counters: Arc<Counters>,
    /// Messages the producer intends to send
    target: u64,
}

impl ProgressMonitor {
    pub fn new(counters: Arc<Counters>, target: u64) -> Self {
        Self { counters, target }
    }

    /// Logs progress every `period` until shutdown fires
    ///
    /// # Returns
    /// * `RateStats` - minimum/maximum consumption rates and the time monitored
    pub async fn run(&self, period: Duration, shutdown: Shutdown) -> RateStats {
        let start_time = Instant::now();
        let mut rate_interval = interval_at(start_time + period, period);
        rate_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_count = self.counters.consumed();
        let mut last_rate_time = start_time;

        // min starts at MAX so the first valid measurement becomes the minimum
        let mut min_rate = f64::MAX;
        let mut max_rate = 0.0f64;
        let mut samples = 0;

        loop {
            select! {
                _ = shutdown.fired() => break,
                _ = rate_interval.tick() => {
                    let now = Instant::now();
                    let snapshot = self.counters.snapshot();
                    let time_elapsed = now.duration_since(last_rate_time).as_secs_f64();
                    if time_elapsed <= 0.0 {
                        continue;
                    }

                    let current_rate =
                        snapshot.consumed.saturating_sub(last_count) as f64 / time_elapsed;
                    // Idle samples would pin the minimum to zero
                    if current_rate > 0.0 {
                        min_rate = min_rate.min(current_rate);
                        max_rate = max_rate.max(current_rate);
                    }
                    samples += 1;
                    last_count = snapshot.consumed;
                    last_rate_time = now;

                    info!(
                        "Progress: produced {}/{}, consumed {}, backlog {}, {:.1} msg/s (errors: {} publish, {} stream)",
                        snapshot.produced,
                        self.target,
                        snapshot.consumed,
                        snapshot.backlog(),
                        current_rate,
                        snapshot.publish_errors,
                        snapshot.stream_errors
                    );
                }
            }
        }

        RateStats {
            min_rate: if min_rate == f64::MAX { 0.0 } else { min_rate },
            max_rate,
            samples,
            elapsed_secs: start_time.elapsed().as_secs_f64(),
        }
    }
}
