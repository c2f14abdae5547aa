//! ---
//! upw_section: "02-messaging-ipc-data-model"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Wire types for inventory channel requests, responses and events."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! Newline-delimited JSON exchanged with the local inventory channel.
//!
//! A request is one line `{"command": ..., "params": ...}` answered by one
//! [`Response`] line. After a successful `subscribe` the connection stays
//! open and carries one [`ChannelEvent`] per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands understood by the inventory channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// List installed services with their versions.
    GetInstalledServices,
    /// List every published version of one service.
    GetServiceVersions,
    /// Device identifier used to address the remote record.
    GetDeviceId,
    /// API key for the remote store's token endpoint.
    GetApiKey,
    /// Project hosting the remote store.
    GetProjectId,
    /// Long-lived refresh token for the remote store.
    GetRefreshToken,
    /// Open a change-notification stream on this connection.
    Subscribe,
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::GetInstalledServices => "get_installed_services",
            Command::GetServiceVersions => "get_service_versions",
            Command::GetDeviceId => "get_device_id",
            Command::GetApiKey => "get_api_key",
            Command::GetProjectId => "get_project_id",
            Command::GetRefreshToken => "get_refresh_token",
            Command::Subscribe => "subscribe",
        }
    }
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Wire name of the command.
    pub command: String,
    /// Command parameters; `null` when the command takes none.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request without parameters.
    pub fn new(command: Command) -> Self {
        Self {
            command: command.as_str().to_owned(),
            params: Value::Null,
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Build the `get_service_versions` request for one service.
    pub fn service_versions(service: &str) -> Self {
        Self::new(Command::GetServiceVersions).with_params(serde_json::json!({ "service": service }))
    }
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The command succeeded.
    Ok {
        /// Command-specific payload.
        #[serde(default)]
        data: Value,
    },
    /// The command failed on the channel side.
    Error {
        /// Human readable reason.
        message: String,
    },
}

/// Change notification pushed on a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A service was installed.
    ServiceInstalled {
        /// Service name.
        service: String,
        /// Installed version.
        version: String,
    },
    /// An installed service moved to a different version.
    ServiceUpdated {
        /// Service name.
        service: String,
        /// Newly installed version.
        version: String,
    },
    /// A service was uninstalled.
    ServiceRemoved {
        /// Service name.
        service: String,
    },
    /// The published version list of a service changed.
    VersionsPublished {
        /// Service name.
        service: String,
    },
    /// Something in the inventory changed; no detail available.
    InventoryChanged,
    /// An event this daemon does not know. Still treated as a change.
    #[serde(other)]
    Unknown,
}

impl ChannelEvent {
    /// Service the event refers to, when it names one.
    pub fn service(&self) -> Option<&str> {
        match self {
            ChannelEvent::ServiceInstalled { service, .. }
            | ChannelEvent::ServiceUpdated { service, .. }
            | ChannelEvent::ServiceRemoved { service }
            | ChannelEvent::VersionsPublished { service } => Some(service),
            ChannelEvent::InventoryChanged | ChannelEvent::Unknown => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelEvent::ServiceInstalled { .. } => "service_installed",
            ChannelEvent::ServiceUpdated { .. } => "service_updated",
            ChannelEvent::ServiceRemoved { .. } => "service_removed",
            ChannelEvent::VersionsPublished { .. } => "versions_published",
            ChannelEvent::InventoryChanged => "inventory_changed",
            ChannelEvent::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_shape() {
        let line = serde_json::to_string(&Request::service_versions("button-handler")).unwrap();
        assert_eq!(
            line,
            r#"{"command":"get_service_versions","params":{"service":"button-handler"}}"#
        );
        let bare = serde_json::to_string(&Request::new(Command::GetDeviceId)).unwrap();
        assert_eq!(bare, r#"{"command":"get_device_id","params":null}"#);
    }

    #[test]
    fn responses_decode_by_status() {
        let ok: Response = serde_json::from_str(r#"{"status":"ok","data":["0.1.0"]}"#).unwrap();
        assert_eq!(
            ok,
            Response::Ok {
                data: serde_json::json!(["0.1.0"])
            }
        );
        let err: Response =
            serde_json::from_str(r#"{"status":"error","message":"no such service"}"#).unwrap();
        assert!(matches!(err, Response::Error { message } if message == "no such service"));
    }

    #[test]
    fn unknown_events_are_tolerated() {
        let event: ChannelEvent =
            serde_json::from_str(r#"{"event":"service_updated","service":"a","version":"1.0.1"}"#)
                .unwrap();
        assert_eq!(event.service(), Some("a"));
        let unknown: ChannelEvent = serde_json::from_str(r#"{"event":"reboot_scheduled"}"#).unwrap();
        assert_eq!(unknown, ChannelEvent::Unknown);
    }
}
