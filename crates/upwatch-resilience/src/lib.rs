//! ---
//! upw_section: "07-resilience-fault-tolerance"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Reconnect and retry strategies."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Backoff policies shared by the change listener and the startup handshake.

pub mod backoff;
pub mod retry;

pub use backoff::{Backoff, BackoffPolicy};
pub use retry::RetryLoop;
