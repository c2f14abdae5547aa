//! ---
//! upw_section: "02-messaging-ipc-data-model"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Newline-delimited JSON client for the local inventory channel."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
//! TCP client for the local inventory channel.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use upwatch_common::{DeviceIdentity, InstalledService, InventoryConfig};

use crate::protocol::{ChannelEvent, Command, Request, Response};
use crate::{InventoryError, Result};

/// Request/response client. Every request uses a fresh connection bounded by
/// the configured timeout.
#[derive(Debug, Clone)]
pub struct InventoryClient {
    address: String,
    timeout: Duration,
}

impl InventoryClient {
    /// Client for `address` (`host:port`).
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// Client built from the `[inventory]` configuration section.
    pub fn from_config(config: &InventoryConfig) -> Self {
        Self::new(config.address(), config.request_timeout)
    }

    /// Address the client connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and return the `data` payload of an `ok` response.
    pub async fn call(&self, request: &Request) -> Result<Value> {
        let exchange = async {
            let stream = TcpStream::connect(&self.address).await?;
            let (read_half, mut write_half) = stream.into_split();
            write_request(&mut write_half, request).await?;
            let mut reader = BufReader::new(read_half);
            read_response(&mut reader, &request.command).await
        };
        match timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(&request.command)),
        }
    }

    /// Send one request and decode its payload.
    pub async fn request<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let data = self.call(&request).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Installed services and their installed versions.
    pub async fn installed_services(&self) -> Result<Vec<InstalledService>> {
        self.request(Request::new(Command::GetInstalledServices))
            .await
    }

    /// Every published version of `service`, in channel order.
    pub async fn service_versions(&self, service: &str) -> Result<Vec<String>> {
        let versions: Option<Vec<String>> =
            self.request(Request::service_versions(service)).await?;
        Ok(versions.unwrap_or_default())
    }

    /// Fetch the identity of this device. Fails when any field is empty.
    pub async fn device_identity(&self) -> Result<DeviceIdentity> {
        let identity = DeviceIdentity {
            device_id: self.string_value(Command::GetDeviceId).await?,
            project_id: self.string_value(Command::GetProjectId).await?,
            api_key: self.string_value(Command::GetApiKey).await?,
            refresh_token: self.string_value(Command::GetRefreshToken).await?,
        };
        let missing = identity.missing_fields();
        if !missing.is_empty() {
            return Err(InventoryError::IncompleteIdentity(missing));
        }
        Ok(identity)
    }

    /// Open a long-lived subscription. The acknowledgement is bounded by the
    /// request timeout; events afterwards may arrive at any pace.
    pub async fn subscribe(&self) -> Result<EventSubscription> {
        let request = Request::new(Command::Subscribe);
        let handshake = async {
            let stream = TcpStream::connect(&self.address).await?;
            let (read_half, mut write_half) = stream.into_split();
            write_request(&mut write_half, &request).await?;
            let mut reader = BufReader::new(read_half);
            read_response(&mut reader, &request.command).await?;
            Ok::<_, InventoryError>((reader, write_half))
        };
        let (reader, writer) = match timeout(self.timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timed_out(&request.command)),
        };
        debug!(address = %self.address, "inventory subscription established");
        Ok(EventSubscription {
            reader,
            _writer: writer,
            line: String::new(),
        })
    }

    async fn string_value(&self, command: Command) -> Result<String> {
        let value: Option<String> = self.request(Request::new(command)).await?;
        Ok(value.unwrap_or_default())
    }

    fn timed_out(&self, command: &str) -> InventoryError {
        InventoryError::Timeout {
            command: command.to_owned(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

/// Event stream of a subscribed connection.
#[derive(Debug)]
pub struct EventSubscription {
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half would half-close the connection.
    _writer: OwnedWriteHalf,
    line: String,
}

impl EventSubscription {
    /// Next event, or `None` once the channel closed the connection.
    /// Lines that are not valid events are logged and skipped.
    pub async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChannelEvent>(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => {
                    warn!(error = %err, line = %trimmed, "ignoring malformed inventory event");
                }
            }
        }
    }
}

async fn write_request(writer: &mut OwnedWriteHalf, request: &Request) -> Result<()> {
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>, command: &str) -> Result<Value> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(InventoryError::Protocol(format!(
            "connection closed before {} response",
            command
        )));
    }
    let response: Response = serde_json::from_str(line.trim()).map_err(|err| {
        InventoryError::Protocol(format!("invalid {} response: {}", command, err))
    })?;
    match response {
        Response::Ok { data } => Ok(data),
        Response::Error { message } => Err(InventoryError::Rejected {
            command: command.to_owned(),
            message,
        }),
    }
}
