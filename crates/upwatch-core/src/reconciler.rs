//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Reconciliation pass computing and writing the minimal map diff."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{debug, info, warn};
use upwatch_common::{InstalledService, ServiceDiff, UpdatableServicesMap};
use upwatch_inventory::{InventoryError, VersionSource};
use upwatch_metrics::ReconcileMetrics;
use upwatch_remote::{RemoteError, RemoteStateStore};
use upwatch_versioning::is_newer;

/// Why a pass ended without converging. Every variant is retried by the next
/// pass; none is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("inventory unavailable: {0}")]
    InventoryUnavailable(#[source] InventoryError),
    #[error("remote store unreachable: {0}")]
    RemoteUnreachable(#[source] RemoteError),
    #[error("remote store rejected write: {0}")]
    RemoteWriteRejected(#[source] RemoteError),
}

impl ReconcileError {
    /// Metric label for the pass outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            ReconcileError::InventoryUnavailable(_) => "inventory_unavailable",
            ReconcileError::RemoteUnreachable(_) => "remote_unreachable",
            ReconcileError::RemoteWriteRejected(_) => "remote_write_rejected",
        }
    }
}

impl From<RemoteError> for ReconcileError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::WriteRejected { .. } => ReconcileError::RemoteWriteRejected(err),
            other => ReconcileError::RemoteUnreachable(other),
        }
    }
}

/// Last map confirmed on the remote record. Empty until the first remote read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    confirmed: Option<UpdatableServicesMap>,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.confirmed.is_some()
    }

    pub fn current(&self) -> Option<&UpdatableServicesMap> {
        self.confirmed.as_ref()
    }

    fn confirm(&mut self, map: UpdatableServicesMap) {
        self.confirmed = Some(map);
    }
}

/// Result of a pass that reached the remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Remote state already matched; nothing was written.
    Unchanged,
    /// The diff was written and confirmed.
    Applied(ServiceDiff),
}

impl PassOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PassOutcome::Unchanged => "unchanged",
            PassOutcome::Applied(_) => "applied",
        }
    }
}

/// Computes the updatable set and pushes the minimal diff to the remote store.
///
/// Not re-entrant: `run_pass` takes `&mut self`, and the driver owns the only
/// instance.
pub struct Reconciler {
    source: Arc<dyn VersionSource>,
    remote: Arc<dyn RemoteStateStore>,
    state: ReconciliationState,
    metrics: Option<ReconcileMetrics>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(source: Arc<dyn VersionSource>, remote: Arc<dyn RemoteStateStore>) -> Self {
        Self {
            source,
            remote,
            state: ReconciliationState::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    /// Run one full pass: installed -> desired -> diff -> write.
    pub async fn run_pass(&mut self) -> Result<PassOutcome, ReconcileError> {
        let result = self.reconcile().await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(outcome) => metrics.record_pass(outcome.label()),
                Err(err) => metrics.record_pass(err.outcome()),
            }
        }
        result
    }

    async fn reconcile(&mut self) -> Result<PassOutcome, ReconcileError> {
        let installed = self
            .source
            .list_installed()
            .await
            .map_err(ReconcileError::InventoryUnavailable)?;
        let current = self.seeded_state().await?;
        let desired = self.desired(&installed, &current).await;

        let diff = ServiceDiff::between(&current, &desired);
        if diff.is_empty() {
            debug!(entries = desired.len(), "updatable services already in sync");
            return Ok(PassOutcome::Unchanged);
        }

        self.remote.write_updatable_services(&diff).await?;
        info!(
            upserts = diff.upsert_count(),
            removals = diff.removal_count(),
            entries = desired.len(),
            "updatable services written"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_write(desired.len());
        }
        self.state.confirm(desired);
        Ok(PassOutcome::Applied(diff))
    }

    async fn seeded_state(&mut self) -> Result<UpdatableServicesMap, ReconcileError> {
        if let Some(current) = self.state.current() {
            return Ok(current.clone());
        }
        let seeded = match self.remote.read_updatable_services().await {
            Ok(map) => map,
            Err(RemoteError::RecordNotFound(record)) => {
                warn!(record = %record, "device record missing; starting from an empty map");
                UpdatableServicesMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        info!(entries = seeded.len(), "reconciliation state seeded from remote record");
        if let Some(metrics) = &self.metrics {
            metrics.set_updatable(seeded.len());
        }
        self.state.confirm(seeded.clone());
        Ok(seeded)
    }

    async fn desired(
        &self,
        installed: &[InstalledService],
        current: &UpdatableServicesMap,
    ) -> UpdatableServicesMap {
        let mut desired = UpdatableServicesMap::new();
        for service in installed {
            let available = match self.source.latest_available(&service.name).await {
                Ok(Some(available)) => available,
                Ok(None) => {
                    debug!(service = %service.name, "no published version");
                    continue;
                }
                Err(err) => {
                    // Keep whatever is recorded until the feed answers again.
                    warn!(service = %service.name, error = %err, "version feed query failed");
                    if let Some(recorded) = current.get(&service.name) {
                        desired.insert(service.name.clone(), recorded.clone());
                    }
                    continue;
                }
            };
            match is_newer(&service.version, &available.version) {
                Ok(true) => {
                    desired.insert(service.name.clone(), available.version);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        service = %service.name,
                        installed = %service.version,
                        available = %available.version,
                        error = %err,
                        "excluding service with unparsable version"
                    );
                }
            }
        }
        desired
    }
}
