//! ---
//! upw_section: "01-core-functionality"
//! upw_subsection: "binary"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Binary entrypoint for the upwatch daemon."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::{info, warn};
use upwatch_common::{init_tracing, AppConfig, LogLevel};
use upwatch_core::{Daemon, DaemonTelemetry};
use upwatch_metrics::{new_registry, serve_metrics, DaemonMetrics, ReconcileMetrics};
use upwatch_versioning::BuildInfo;

const DEFAULT_CONFIG_PATH: &str = "configs/upwatch.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = concat!("upwatchd ", env!("CARGO_PKG_VERSION"), " (", env!("VERGEN_BUILD_DATE"), ")"),
    about = "Publishes which installed services have a newer version available",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        env = "CONFIG_HOST",
        value_name = "HOST",
        help = "Host of the local configuration channel [default: 127.0.0.1]"
    )]
    config_host: Option<String>,

    #[arg(
        long,
        env = "CONFIG_PORT",
        value_name = "PORT",
        help = "Port of the local configuration channel [default: 5555]"
    )]
    config_port: Option<u16>,

    #[arg(
        long,
        env = "LOG_LEVEL",
        value_enum,
        ignore_case = true,
        default_value_t = LogLevel::Info,
        help = "Diagnostic verbosity"
    )]
    log_level: LogLevel,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,
}

impl Cli {
    fn load_config(&self) -> Result<(AppConfig, Option<PathBuf>)> {
        let loaded =
            AppConfig::load_with_source(self.config.as_deref(), &[DEFAULT_CONFIG_PATH])?;
        let mut config = loaded.config;
        if let Some(host) = &self.config_host {
            config.inventory.host = host.clone();
        }
        if let Some(port) = self.config_port {
            config.inventory.port = port;
        }
        config
            .validate()
            .context("invalid configuration after applying command line overrides")?;
        Ok((config, loaded.source))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let build = BuildInfo::current();
    if cli.version {
        println!("{}", build.extended());
        return Ok(());
    }

    let (config, config_path) = cli.load_config()?;
    init_tracing("upwatchd", &config.logging, cli.log_level)?;

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    let reconcile_metrics = ReconcileMetrics::new(registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(build.version, build.target, build.profile.as_str());

    info!(
        version = %build,
        config = %config_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_owned()),
        channel = %config.inventory.address(),
        log_level = %cli.log_level,
        "starting upwatchd"
    );

    let metrics_server = if config.metrics.enabled {
        Some(serve_metrics(registry, config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let handle = Daemon::new(config)
        .with_telemetry(DaemonTelemetry {
            daemon: daemon_metrics,
            reconcile: reconcile_metrics,
        })
        .start();

    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_channel_address() {
        let cli = Cli::try_parse_from([
            "upwatchd",
            "--config-host",
            "10.1.1.1",
            "--config-port",
            "7000",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);

        let (config, _) = cli.load_config().unwrap();
        assert_eq!(config.inventory.address(), "10.1.1.1:7000");
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["upwatchd", "--log-level", "TRACE"]).is_err());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let cli = Cli::try_parse_from(["upwatchd", "--config", "/nonexistent/upwatch.toml"]).unwrap();
        assert!(cli.load_config().is_err());
    }
}
