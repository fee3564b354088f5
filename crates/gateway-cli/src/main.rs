//! CLI binary running the firehose gateway.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use firehose_gateway::{GatewayConfig, run_gateway};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Gateway library error
    #[error(transparent)]
    Gateway(#[from] firehose_gateway::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(long, env = "FIREHOSE_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Allow every client without checking tokens
    #[arg(long, env = "FIREHOSE_DISABLE_ACCESS_CONTROL")]
    disable_access_control: bool,

    /// Client listener address, overriding the config file
    #[arg(long, env = "FIREHOSE_GATEWAY_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,
}

fn load_config(args: Args) -> Result<GatewayConfig, Error> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            GatewayConfig::from_file(path)?
        }
        None => GatewayConfig::default(),
    };

    if args.disable_access_control {
        config.disable_access_control = true;
    }
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(args)?;

    let shutdown_token = CancellationToken::new();

    // Set up signal handlers
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler failed");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler failed");

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    run_gateway(config, shutdown_token).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "firehose-gateway",
            "--disable-access-control",
            "--listen-addr",
            "127.0.0.1:9999",
        ]);
        let config = load_config(args).unwrap();

        assert!(config.disable_access_control);
        assert_eq!(config.listen_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.max_concurrent_subscriptions, 1000);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let args = Args::parse_from(["firehose-gateway", "--config", "/nonexistent/gateway.toml"]);
        assert!(load_config(args).is_err());
    }
}
