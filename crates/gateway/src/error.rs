//! Error types for the gateway

use std::net::SocketAddr;
use std::path::PathBuf;

use firehose_discovery::DiscoveryError;
use firehose_pool::PoolError;
use thiserror::Error;

/// Gateway errors
#[derive(Debug, Error)]
pub enum Error {
    /// Could not bind a listener
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        /// Config file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for [`GatewayConfig`](crate::GatewayConfig)
    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration parsed but cannot be used
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Discovery source error
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Backend pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
