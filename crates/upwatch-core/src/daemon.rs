//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Daemon lifecycle: identity handshake and task assembly."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use upwatch_common::{AppConfig, DeviceIdentity, RemoteBackend};
use upwatch_inventory::{ChannelVersionSource, InventoryClient};
use upwatch_metrics::{DaemonMetrics, ReconcileMetrics};
use upwatch_remote::{FirestoreRemote, MemoryRemote, RemoteStateStore};
use upwatch_resilience::{Backoff, BackoffPolicy, RetryLoop};

use crate::listener::ChangeListener;
use crate::reconciler::Reconciler;
use crate::scheduler::{spawn_timer, trigger_queue, Driver, Trigger};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Starting,
    /// The identity handshake keeps failing; the daemon is still retrying.
    ConfigUnresolved { attempts: u32, last_error: String },
    Running { device_id: String },
    Stopped,
}

/// Ask for the device identity until it arrives. Past `escalate_after`
/// consecutive failures every failure is reported as
/// [`DaemonStatus::ConfigUnresolved`].
pub async fn resolve_identity<F, Fut, E>(
    mut fetch: F,
    policy: BackoffPolicy,
    escalate_after: u32,
    status: &watch::Sender<DaemonStatus>,
    metrics: Option<&DaemonMetrics>,
) -> DeviceIdentity
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<DeviceIdentity, E>>,
    E: Display,
{
    let mut retry = RetryLoop::new(Backoff::new(policy), escalate_after);
    let identity = retry
        .run(
            "device identity handshake",
            |_| fetch(),
            |attempts, err| {
                if let Some(metrics) = metrics {
                    metrics.set_config_unresolved(true);
                }
                status.send_replace(DaemonStatus::ConfigUnresolved {
                    attempts,
                    last_error: err.to_string(),
                });
            },
        )
        .await;
    if let Some(metrics) = metrics {
        metrics.set_config_unresolved(false);
    }
    identity
}

/// Metric handles shared with the daemon tasks.
#[derive(Debug, Clone)]
pub struct DaemonTelemetry {
    pub daemon: DaemonMetrics,
    pub reconcile: ReconcileMetrics,
}

// Subscribed before the daemon task starts so no shutdown is missed.
struct ShutdownReceivers {
    main: broadcast::Receiver<()>,
    timer: broadcast::Receiver<()>,
    listener: broadcast::Receiver<()>,
}

/// Wires inventory, remote store, reconciler, timer and listener together.
pub struct Daemon {
    config: AppConfig,
    telemetry: Option<DaemonTelemetry>,
    remote_override: Option<Arc<dyn RemoteStateStore>>,
}

impl Daemon {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            telemetry: None,
            remote_override: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: DaemonTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Use `store` instead of the configured backend.
    pub fn with_remote(mut self, store: Arc<dyn RemoteStateStore>) -> Self {
        self.remote_override = Some(store);
        self
    }

    /// Spawn the daemon. It keeps running until [`DaemonHandle::shutdown`].
    pub fn start(self) -> DaemonHandle {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (status_tx, status_rx) = watch::channel(DaemonStatus::Starting);
        let receivers = ShutdownReceivers {
            main: shutdown_tx.subscribe(),
            timer: shutdown_tx.subscribe(),
            listener: shutdown_tx.subscribe(),
        };
        let task = tokio::spawn(async move {
            self.run(receivers, &status_tx).await;
            status_tx.send_replace(DaemonStatus::Stopped);
        });
        DaemonHandle {
            shutdown: shutdown_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(self, receivers: ShutdownReceivers, status: &watch::Sender<DaemonStatus>) {
        let ShutdownReceivers {
            main: mut shutdown_rx,
            timer: timer_shutdown,
            listener: listener_shutdown,
        } = receivers;
        let client = InventoryClient::from_config(&self.config.inventory);
        let listener_cfg = &self.config.listener;
        let policy = BackoffPolicy::new(
            listener_cfg.base_delay,
            listener_cfg.max_delay,
            listener_cfg.jitter,
        );
        let daemon_metrics = self.telemetry.as_ref().map(|t| &t.daemon);

        info!(channel = %client.address(), "resolving device identity");
        let identity = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("shutdown requested during identity handshake");
                return;
            }
            identity = resolve_identity(
                || client.device_identity(),
                policy,
                self.config.startup.escalate_after,
                status,
                daemon_metrics,
            ) => identity,
        };
        info!(
            device_id = %identity.device_id,
            project_id = %identity.project_id,
            "device identity resolved"
        );

        let remote = match self.remote_store(&identity) {
            Ok(remote) => remote,
            Err(err) => {
                error!(error = %err, "remote store could not be configured");
                status.send_replace(DaemonStatus::ConfigUnresolved {
                    attempts: 0,
                    last_error: err.to_string(),
                });
                if let Some(metrics) = daemon_metrics {
                    metrics.set_config_unresolved(true);
                }
                let _ = shutdown_rx.recv().await;
                return;
            }
        };

        let reconcile_metrics = self.telemetry.as_ref().map(|t| t.reconcile.clone());
        let mut reconciler =
            Reconciler::new(Arc::new(ChannelVersionSource::new(client.clone())), remote);
        if let Some(metrics) = &reconcile_metrics {
            reconciler = reconciler.with_metrics(metrics.clone());
        }
        let (trigger, queue) = trigger_queue(reconcile_metrics.clone());
        let mut listener = ChangeListener::new(Arc::new(client), trigger.clone(), policy);
        if let Some(metrics) = reconcile_metrics {
            listener = listener.with_metrics(metrics);
        }

        trigger.request(Trigger::Startup);
        let tasks: Vec<JoinHandle<()>> = vec![
            spawn_timer(trigger, self.config.reconcile.poll_interval, timer_shutdown),
            tokio::spawn(listener.run(listener_shutdown)),
        ];
        status.send_replace(DaemonStatus::Running {
            device_id: identity.device_id.clone(),
        });
        info!(
            poll_interval_secs = self.config.reconcile.poll_interval.as_secs(),
            "reconciliation running"
        );

        Driver::new(reconciler, queue).run(shutdown_rx).await;
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "daemon task join error");
            }
        }
    }

    fn remote_store(&self, identity: &DeviceIdentity) -> Result<Arc<dyn RemoteStateStore>> {
        if let Some(store) = &self.remote_override {
            return Ok(store.clone());
        }
        let store: Arc<dyn RemoteStateStore> = match self.config.remote.backend {
            RemoteBackend::Firestore => {
                Arc::new(FirestoreRemote::new(&self.config.remote, identity)?)
            }
            RemoteBackend::Memory => {
                info!("using in-memory remote store; nothing leaves this device");
                Arc::new(MemoryRemote::new())
            }
        };
        Ok(store)
    }
}

/// Handle to a started daemon.
#[derive(Debug)]
pub struct DaemonHandle {
    shutdown: broadcast::Sender<()>,
    status: watch::Receiver<DaemonStatus>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn status(&self) -> watch::Receiver<DaemonStatus> {
        self.status.clone()
    }

    /// Stop the daemon, letting an in-flight pass finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await?;
        info!("daemon shutdown complete");
        Ok(())
    }
}
