//! ---
//! upw_section: "02-messaging-ipc-data-model"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Local inventory channel client and version source."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Access to the device's local service inventory: which services are
//! installed, which versions are published, and a stream of change events.

pub mod client;
pub mod protocol;
pub mod source;

/// Shared result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;

/// Failures talking to the local inventory channel. Every variant means the
/// inventory is unavailable for the current pass.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// The channel could not be reached or the connection broke.
    #[error("inventory channel unreachable: {0}")]
    Io(#[from] std::io::Error),
    /// No response within the configured request timeout.
    #[error("inventory request {command} timed out after {timeout_ms} ms")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },
    /// The channel answered with an error status.
    #[error("inventory rejected {command}: {message}")]
    Rejected {
        /// Command that was rejected.
        command: String,
        /// Message returned by the channel.
        message: String,
    },
    /// The channel sent something that does not follow the line protocol.
    #[error("inventory protocol violation: {0}")]
    Protocol(String),
    /// A payload could not be encoded or decoded.
    #[error("inventory payload error: {0}")]
    Json(#[from] serde_json::Error),
    /// The device identity handed out by the channel is incomplete.
    #[error("device identity incomplete; missing {0:?}")]
    IncompleteIdentity(Vec<&'static str>),
}

pub use client::{EventSubscription, InventoryClient};
pub use protocol::{ChannelEvent, Command, Request, Response};
pub use source::{
    ChannelVersionSource, NotificationChannel, StaticInventory, Subscription, VersionSource,
};
