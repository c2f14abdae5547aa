//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Daemon configuration sections, file loading and validation."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_inventory_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_inventory_port() -> u16 {
    5555
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com".to_owned()
}

fn default_token_url() -> String {
    "https://securetoken.googleapis.com".to_owned()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_token_refresh() -> Duration {
    Duration::from_secs(58 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> Duration {
    Duration::from_millis(250)
}

fn default_escalate_after() -> u32 {
    5
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    "127.0.0.1:9899"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the upwatch daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "UPWATCH_CONFIG";

    /// Load configuration. Precedence: `explicit` (must exist), then the
    /// `UPWATCH_CONFIG` path, then the first existing candidate, then
    /// built-in defaults.
    pub fn load_with_source<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(anyhow!("configuration file {} does not exist", path.display()));
            }
            return Ok(LoadedAppConfig {
                config: Self::from_path(path)?,
                source: Some(path.to_path_buf()),
            });
        }

        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.inventory.validate()?;
        if self.reconcile.poll_interval.is_zero() {
            return Err(anyhow!("reconcile.poll_interval must be greater than zero"));
        }
        if self.listener.base_delay > self.listener.max_delay {
            return Err(anyhow!(
                "listener.base_delay ({:?}) exceeds listener.max_delay ({:?})",
                self.listener.base_delay,
                self.listener.max_delay
            ));
        }
        if self.startup.escalate_after == 0 {
            return Err(anyhow!("startup.escalate_after must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Address of the local configuration channel.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_inventory_host")]
    pub host: String,
    #[serde(default = "default_inventory_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl InventoryConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("inventory.host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("inventory.port must not be zero"));
        }
        Ok(())
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            host: default_inventory_host(),
            port: default_inventory_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Which remote store implementation backs the device record.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    #[default]
    Firestore,
    /// In-process store; nothing leaves the device.
    Memory,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub backend: RemoteBackend,
    #[serde(default = "default_firestore_url")]
    pub firestore_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_remote_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_token_refresh")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub token_refresh: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::default(),
            firestore_url: default_firestore_url(),
            token_url: default_token_url(),
            request_timeout: default_remote_timeout(),
            token_refresh: default_token_refresh(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

/// Reconnect backoff for the change listener, also reused by the startup handshake.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Consecutive identity handshake failures before the daemon reports a
    /// persistent error state.
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            escalate_after: default_escalate_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the rolling JSON log file. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_device_channel() {
        let config = AppConfig::default();
        assert_eq!(config.inventory.address(), "127.0.0.1:5555");
        assert_eq!(config.reconcile.poll_interval, Duration::from_secs(30));
        assert_eq!(config.remote.backend, RemoteBackend::Firestore);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = r#"
            [inventory]
            host = "10.0.0.2"
            port = 6000

            [reconcile]
            poll_interval = 5

            [listener]
            base_delay = 100
            max_delay = 2000

            [remote]
            backend = "memory"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.inventory.address(), "10.0.0.2:6000");
        assert_eq!(config.reconcile.poll_interval, Duration::from_secs(5));
        assert_eq!(config.listener.base_delay, Duration::from_millis(100));
        assert_eq!(config.remote.backend, RemoteBackend::Memory);
        assert_eq!(config.remote.token_refresh, Duration::from_secs(58 * 60));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = "[reconcile]\npoll_interval = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let result = "[listener]\nbase_delay = 5000\nmax_delay = 10\n".parse::<AppConfig>();
        assert!(result.is_err());
    }
}
