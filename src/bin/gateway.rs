#![forbid(unsafe_code)]

//! Retrieval gateway server.
//!
//! Each `GET /retrieve` spawns one extractor process and streams its stdout
//! straight to the client. Nothing is written to disk and nothing is cached.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use newtube_gateway::{
    config::{ConfigOverrides, resolve_gateway_config},
    dispatcher::{GatewayState, router},
    security::ensure_not_root,
    telemetry::{LogLevel, init_tracing},
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "gateway")]
#[command(about = "Streams media retrieved by an external extractor over HTTP")]
struct Args {
    /// Address to listen on (IPv4 or IPv6).
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Extractor binary, `yt-dlp` on PATH by default.
    #[arg(long = "extractor")]
    extractor_bin: Option<PathBuf>,

    /// Maximum number of extractor processes alive at once.
    #[arg(long)]
    max_extractions: Option<usize>,

    /// TOML config file with limits and extra `[[formats]]`.
    #[arg(long = "config")]
    config_path: Option<PathBuf>,

    #[arg(long = "env-file")]
    env_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            extractor_bin: self.extractor_bin.clone(),
            max_extractions: self.max_extractions,
            config_path: self.config_path.clone(),
            env_path: self.env_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level)?;
    ensure_not_root("gateway")?;

    let config = resolve_gateway_config(args.overrides()).context("loading configuration")?;
    let state = GatewayState::from_config(&config).context("preparing format plans")?;
    info!(
        extractor = %config.extractor_bin.display(),
        max_extractions = config.max_extractions,
        default_format = %config.default_format,
        "gateway configured"
    );

    let addr = SocketAddr::new(config.listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_overrides() {
        let args = Args::try_parse_from([
            "gateway",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--extractor",
            "/opt/yt-dlp",
            "--max-extractions",
            "6",
            "--config",
            "gateway.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level, LogLevel::Debug);
        let overrides = args.overrides();
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.extractor_bin, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(overrides.max_extractions, Some(6));
        assert_eq!(overrides.config_path, Some(PathBuf::from("gateway.toml")));
        assert!(overrides.env_path.is_none());
    }

    #[test]
    fn defaults_leave_everything_to_config() {
        let args = Args::try_parse_from(["gateway"]).unwrap();
        assert_eq!(args.log_level, LogLevel::Info);
        let overrides = args.overrides();
        assert!(overrides.host.is_none());
        assert!(overrides.port.is_none());
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(Args::try_parse_from(["gateway", "--log-level", "loud"]).is_err());
    }
}
