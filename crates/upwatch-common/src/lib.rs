//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Shared primitives and utilities for the daemon runtime."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Core shared primitives for the upwatch workspace.
//! This crate exposes configuration loading, logging initialisation, and the
//! service/version data model consumed by every other crate.

pub mod config;
pub mod logging;
pub mod model;

pub use config::{
    AppConfig, InventoryConfig, ListenerConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    ReconcileConfig, RemoteBackend, RemoteConfig, StartupConfig,
};
pub use logging::{init_tracing, LogFormat, LogLevel};
pub use model::{
    AvailableVersion, DeviceIdentity, DiffOp, InstalledService, ServiceDiff, UpdatableServicesMap,
};
