//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Coalescing trigger queue, periodic timer and pass driver."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! One queue of reconcile requests consumed by a single worker.
//!
//! The queue holds at most one pending request. While a pass runs, any number
//! of further requests collapse into that single pending slot.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use upwatch_metrics::ReconcileMetrics;

use crate::reconciler::{PassOutcome, Reconciler};

/// What asked for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    Event,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Timer => "timer",
            Trigger::Event => "event",
        }
    }
}

/// Cloneable sender side of the trigger queue.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
    metrics: Option<ReconcileMetrics>,
}

impl TriggerHandle {
    /// Ask for a pass. Returns `false` when the request was absorbed by an
    /// already pending one or the worker is gone.
    pub fn request(&self, trigger: Trigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => {
                trace!(trigger = trigger.as_str(), "reconcile requested");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(trigger = trigger.as_str(), "reconcile request coalesced");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_coalesced();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiver side of the trigger queue.
#[derive(Debug)]
pub struct TriggerQueue {
    rx: mpsc::Receiver<Trigger>,
}

impl TriggerQueue {
    pub async fn next(&mut self) -> Option<Trigger> {
        self.rx.recv().await
    }
}

/// Create a coalescing trigger queue.
pub fn trigger_queue(metrics: Option<ReconcileMetrics>) -> (TriggerHandle, TriggerQueue) {
    let (tx, rx) = mpsc::channel(1);
    (TriggerHandle { tx, metrics }, TriggerQueue { rx })
}

/// Fixed-period ticker. The first tick fires one full period after creation.
#[derive(Debug)]
pub struct PassTimer {
    interval: Interval,
}

impl PassTimer {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Feed a [`Trigger::Timer`] request every `period` until shutdown.
pub fn spawn_timer(
    trigger: TriggerHandle,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = PassTimer::new(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("reconcile timer stopped");
                    break;
                }
                _ = timer.tick() => {
                    trigger.request(Trigger::Timer);
                }
            }
        }
    })
}

/// Serialized worker: takes one request at a time and runs one pass for it.
#[derive(Debug)]
pub struct Driver {
    reconciler: Reconciler,
    queue: TriggerQueue,
    passes: u64,
}

impl Driver {
    pub fn new(reconciler: Reconciler, queue: TriggerQueue) -> Self {
        Self {
            reconciler,
            queue,
            passes: 0,
        }
    }

    /// Run until shutdown or until every trigger handle is dropped. A pass in
    /// progress always finishes; requests still queued are dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Reconciler {
        loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                trigger = self.queue.next() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            self.run_one(trigger).await;
        }
        info!(passes = self.passes, "reconcile driver stopped");
        self.reconciler
    }

    async fn run_one(&mut self, trigger: Trigger) {
        self.passes += 1;
        match self.reconciler.run_pass().await {
            Ok(PassOutcome::Applied(diff)) => {
                debug!(trigger = trigger.as_str(), keys = diff.len(), "pass applied");
            }
            Ok(PassOutcome::Unchanged) => {
                debug!(trigger = trigger.as_str(), "pass found nothing to write");
            }
            Err(err) => {
                warn!(
                    trigger = trigger.as_str(),
                    outcome = err.outcome(),
                    error = %err,
                    "reconcile pass failed; retrying on next trigger"
                );
            }
        }
    }
}
