//! One-shot shutdown signal shared by the producer, consumers and interrupt handling
//!
//! The signal is a `CancellationToken` guarded by a `OnceLock` that records which
//! trigger won. Firing is idempotent: the first caller flips it and every later
//! caller is told the signal was already fired.

use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What caused the shutdown signal to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    /// Producer finished its send loop and the grace period elapsed
    ProducerDone,
    /// External interrupt (Ctrl-C, SIGTERM or SIGHUP)
    Interrupt,
}

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    trigger: Arc<OnceLock<Trigger>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Returns `false` if it had already been fired.
    pub fn fire(&self, trigger: Trigger) -> bool {
        match self.trigger.set(trigger) {
            Ok(()) => {
                info!("Shutdown signaled by {:?}", trigger);
                self.token.cancel();
                true
            }
            Err(_) => {
                debug!(
                    "Shutdown already signaled by {:?}, ignoring {:?}",
                    self.trigger.get(),
                    trigger
                );
                false
            }
        }
    }

    /// Completes once the signal has fired; returns immediately if it already has
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The trigger that won, if any
    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger.get().copied()
    }
}

/// Turns an external interrupt into a shutdown after the grace period
///
/// The producer watches `interrupt` too and stops sending; this watcher makes
/// sure shutdown still happens if the producer is stuck in a publish. If the
/// producer fires first, the watcher exits without doing anything.
pub fn spawn_interrupt_watcher(
    interrupt: CancellationToken,
    shutdown: Shutdown,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.cancelled() => {}
            _ = shutdown.fired() => return,
        }

        info!(
            "Interrupt received, waiting {:?} for in-flight messages",
            grace
        );
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                shutdown.fire(Trigger::Interrupt);
            }
            _ = shutdown.fired() => {}
        }
    })
}

/// Escalates repeated interrupt events into an immediate shutdown
///
/// Each event names its source (e.g. "Ctrl-C"). The first one cancels
/// `interrupt`, which stops production and starts the watcher's grace period.
/// A second one fires shutdown right away. The task ends once shutdown fires
/// or every event sender is dropped.
pub fn spawn_interrupt_escalation(
    mut events: mpsc::Receiver<&'static str>,
    interrupt: CancellationToken,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let first = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.fired() => None,
        };
        let Some(source) = first else {
            return;
        };
        warn!(
            "{} received, stopping production (send again to stop immediately)",
            source
        );
        interrupt.cancel();

        let second = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.fired() => None,
        };
        if let Some(source) = second {
            warn!("Second interrupt ({}), shutting down now", source);
            shutdown.fire(Trigger::Interrupt);
        }
    })
}
