//! ---
//! upw_section: "03-persistence-logging"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Metric families recorded by the daemon and the reconciler."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::core::Collector;
use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts};

use crate::SharedRegistry;

fn register<C>(registry: &SharedRegistry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Process-level metrics.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    build_info: GaugeVec,
    config_unresolved: IntGauge,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = register(
            &registry,
            IntCounter::new(
                "upwatchd_starts_total",
                "Total number of times the upwatch daemon has initialised",
            )?,
        )?;
        let build_info = register(
            &registry,
            GaugeVec::new(
                Opts::new("upwatchd_build_info", "Build metadata for the running daemon binary"),
                &["version", "target", "profile"],
            )?,
        )?;
        let config_unresolved = register(
            &registry,
            IntGauge::new(
                "upwatch_config_unresolved",
                "1 while the device identity cannot be obtained from the local channel",
            )?,
        )?;
        Ok(Self {
            registry,
            starts_total,
            build_info,
            config_unresolved,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn set_build_info(&self, version: &str, target: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, target, profile])
            .set(1.0);
    }

    pub fn set_config_unresolved(&self, unresolved: bool) {
        self.config_unresolved.set(i64::from(unresolved));
    }
}

/// Reconciliation passes, writes and trigger bookkeeping.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    passes: IntCounterVec,
    remote_writes: IntCounter,
    updatable_services: IntGauge,
    listener_reconnects: IntCounter,
    coalesced_triggers: IntCounter,
}

impl ReconcileMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        Ok(Self {
            passes: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("upwatch_reconcile_passes_total", "Reconciliation passes by outcome"),
                    &["outcome"],
                )?,
            )?,
            remote_writes: register(
                &registry,
                IntCounter::new(
                    "upwatch_remote_writes_total",
                    "Confirmed partial writes of the updatable_services field",
                )?,
            )?,
            updatable_services: register(
                &registry,
                IntGauge::new(
                    "upwatch_updatable_services",
                    "Entries in the last confirmed updatable_services map",
                )?,
            )?,
            listener_reconnects: register(
                &registry,
                IntCounter::new(
                    "upwatch_listener_reconnects_total",
                    "Reconnect attempts made by the change listener",
                )?,
            )?,
            coalesced_triggers: register(
                &registry,
                IntCounter::new(
                    "upwatch_coalesced_triggers_total",
                    "Reconcile requests absorbed by an already pending pass",
                )?,
            )?,
        })
    }

    /// `outcome` is one of the pass labels (`unchanged`, `applied`, or an error kind).
    pub fn record_pass(&self, outcome: &str) {
        self.passes.with_label_values(&[outcome]).inc();
    }

    pub fn record_write(&self, entries_after: usize) {
        self.remote_writes.inc();
        self.set_updatable(entries_after);
    }

    pub fn set_updatable(&self, entries: usize) {
        self.updatable_services
            .set(i64::try_from(entries).unwrap_or(i64::MAX));
    }

    pub fn inc_listener_reconnect(&self) {
        self.listener_reconnects.inc();
    }

    pub fn inc_coalesced(&self) {
        self.coalesced_triggers.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_registry;

    fn gauge(registry: &SharedRegistry, name: &str) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_gauge().get_value())
    }

    #[test]
    fn reconcile_metrics_are_gathered() {
        let registry = new_registry();
        let metrics = ReconcileMetrics::new(registry.clone()).unwrap();
        metrics.record_pass("applied");
        metrics.record_write(3);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"upwatch_reconcile_passes_total".to_owned()));
        assert_eq!(gauge(&registry, "upwatch_updatable_services"), Some(3.0));
    }

    #[test]
    fn config_unresolved_gauge_toggles() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).unwrap();
        metrics.set_config_unresolved(true);
        assert_eq!(gauge(&registry, "upwatch_config_unresolved"), Some(1.0));
        metrics.set_config_unresolved(false);
        assert_eq!(gauge(&registry, "upwatch_config_unresolved"), Some(0.0));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        DaemonMetrics::new(registry.clone()).unwrap();
        assert!(DaemonMetrics::new(registry).is_err());
    }
}
