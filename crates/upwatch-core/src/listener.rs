//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Change listener turning inventory notifications into reconcile requests."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use upwatch_inventory::{InventoryError, NotificationChannel};
use upwatch_metrics::ReconcileMetrics;
use upwatch_resilience::{Backoff, BackoffPolicy};

use crate::scheduler::{Trigger, TriggerHandle};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("notification stream closed")]
    Disconnected,
    #[error("notification stream failed: {0}")]
    Channel(#[from] InventoryError),
}

/// Turns change notifications into reconcile requests and keeps the
/// subscription alive across disconnects.
pub struct ChangeListener {
    channel: Arc<dyn NotificationChannel>,
    trigger: TriggerHandle,
    backoff: Backoff,
    metrics: Option<ReconcileMetrics>,
}

impl ChangeListener {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        trigger: TriggerHandle,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            channel,
            trigger,
            backoff: Backoff::new(policy),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Listen until shutdown. Never gives up on the channel.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut sessions: u64 = 0;
        loop {
            let err = tokio::select! {
                _ = shutdown.recv() => break,
                err = self.session(sessions) => err,
            };
            sessions += 1;
            let delay = self.backoff.next_delay();
            warn!(
                error = %err,
                failures = self.backoff.failures(),
                retry_in_ms = delay.as_millis() as u64,
                "change listener disconnected; periodic timer still active"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_listener_reconnect();
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!("change listener stopped");
    }

    async fn session(&mut self, previous: u64) -> ListenerError {
        let mut subscription = match self.channel.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => return err.into(),
        };
        info!("subscribed to inventory change notifications");
        if previous > 0 {
            // Changes made while disconnected were never announced.
            self.trigger.request(Trigger::Event);
        }
        // A subscription only counts as healthy once it delivers something.
        let mut delivered = false;
        loop {
            match subscription.next_event().await {
                Ok(Some(event)) => {
                    if !delivered {
                        delivered = true;
                        self.backoff.reset();
                    }
                    debug!(
                        event = event.kind(),
                        service = event.service().unwrap_or("-"),
                        "inventory change notified"
                    );
                    self.trigger.request(Trigger::Event);
                }
                Ok(None) => return ListenerError::Disconnected,
                Err(err) => return err.into(),
            }
        }
    }
}
