//! ---
//! upw_section: "03-persistence-logging"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Metrics collection and export utilities."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Prometheus registry, metric families and the `/metrics` exporter.

use std::sync::Arc;

use prometheus::Registry;

pub mod exporter;
pub mod families;

pub use exporter::{serve_metrics, MetricsServer};
pub use families::{DaemonMetrics, ReconcileMetrics};
pub use prometheus;

/// Registry shared by every metric family in the process.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}
