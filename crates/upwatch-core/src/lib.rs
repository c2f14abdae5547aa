//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Reconciliation of the updatable services map."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Reconciliation engine, trigger scheduling, change listener and daemon
//! lifecycle for upwatch.

pub mod daemon;
pub mod listener;
pub mod reconciler;
pub mod scheduler;

pub use daemon::{resolve_identity, Daemon, DaemonHandle, DaemonStatus, DaemonTelemetry};
pub use listener::{ChangeListener, ListenerError};
pub use reconciler::{PassOutcome, ReconcileError, Reconciler, ReconciliationState};
pub use scheduler::{spawn_timer, trigger_queue, Driver, PassTimer, Trigger, TriggerHandle, TriggerQueue};
