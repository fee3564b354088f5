//! Gateway configuration, loaded from TOML

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use firehose_multiplexer::MultiplexerConfig;
use firehose_pool::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::simulation::{MAX_NODES, MessageSize};

/// Top-level configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Client-facing listener
    pub listen_addr: SocketAddr,
    /// Health and metrics listener
    pub health_addr: SocketAddr,
    /// Ceiling on simultaneously open client streams
    pub max_concurrent_subscriptions: usize,
    /// How often open streams re-read pool membership
    pub reconcile_interval_ms: u64,
    /// Upper bound on one backend dial
    pub dial_timeout_ms: u64,
    /// Backoff after the first failed dial
    pub backoff_initial_ms: u64,
    /// Ceiling for the dial backoff
    pub backoff_max_ms: u64,
    /// Grace given to backend subscriptions after a stream closes
    pub close_grace_ms: u64,
    /// Envelopes buffered per client stream
    pub stream_buffer: usize,
    /// Write deadline for one client frame
    pub write_timeout_ms: u64,
    /// Reject subscriptions when the pool has members but none accepted
    pub require_backend: bool,
    /// Skip token checks entirely
    pub disable_access_control: bool,
    /// Where backend nodes come from
    pub discovery: DiscoveryConfig,
    /// Access tokens
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            health_addr: SocketAddr::from(([127, 0, 0, 1], 14825)),
            max_concurrent_subscriptions: 1000,
            reconcile_interval_ms: 1000,
            dial_timeout_ms: 5000,
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
            close_grace_ms: 1000,
            stream_buffer: 100,
            write_timeout_ms: 5000,
            require_backend: false,
            disable_access_control: false,
            discovery: DiscoveryConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Backend discovery source
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    /// Fixed list of `host:port` addresses
    Static {
        /// Backend addresses
        #[serde(default)]
        addrs: Vec<String>,
    },
    /// Periodically resolve a DNS name
    Dns {
        /// Name to resolve
        host: String,
        /// Port every resolved address serves on
        port: u16,
        /// Resolution interval
        #[serde(default = "default_dns_refresh_ms")]
        refresh_interval_ms: u64,
    },
    /// In-process nodes generating synthetic logs
    Simulated {
        /// Number of nodes
        #[serde(default = "default_simulated_nodes")]
        nodes: usize,
        /// Payload shape and size
        #[serde(default)]
        message_size: MessageSize,
        /// Delay between envelopes per node
        #[serde(default = "default_simulated_interval_ms")]
        interval_ms: u64,
    },
}

const fn default_dns_refresh_ms() -> u64 {
    30_000
}

const fn default_simulated_nodes() -> usize {
    2
}

const fn default_simulated_interval_ms() -> u64 {
    10
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::Static { addrs: Vec::new() }
    }
}

/// Token grants
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Tokens allowed on the firehose and on every app stream
    pub admin_tokens: Vec<String>,
    /// Tokens allowed on the listed apps' streams
    pub app_tokens: HashMap<String, Vec<String>>,
}

impl GatewayConfig {
    /// Read and validate a TOML config file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_subscriptions == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_subscriptions must be positive".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(Error::InvalidConfig(
                "stream_buffer must be positive".to_string(),
            ));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconcile_interval_ms must be positive".to_string(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(
                "backoff_initial_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        if let DiscoveryConfig::Simulated { nodes, interval_ms, .. } = self.discovery {
            if interval_ms == 0 {
                return Err(Error::InvalidConfig(
                    "simulated interval_ms must be positive".to_string(),
                ));
            }
            if nodes == 0 || nodes > MAX_NODES {
                return Err(Error::InvalidConfig(format!(
                    "simulated nodes must be between 1 and {MAX_NODES}"
                )));
            }
        }
        Ok(())
    }

    /// Backend pool settings
    #[must_use]
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Multiplexer settings
    #[must_use]
    pub const fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            max_concurrent_subscriptions: self.max_concurrent_subscriptions,
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms),
            buffer_size: self.stream_buffer,
            close_grace: Duration::from_millis(self.close_grace_ms),
            require_backend: self.require_backend,
        }
    }

    /// Write deadline for one client frame
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8081".parse().unwrap());
        assert_eq!(config.max_concurrent_subscriptions, 1000);
        assert_eq!(config.discovery, DiscoveryConfig::Static { addrs: vec![] });
        assert!(!config.require_backend);
        assert_eq!(config.pool_config().dial_timeout, Duration::from_secs(5));
        assert_eq!(
            config.multiplexer_config().reconcile_interval,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_full_config() {
        let config = GatewayConfig::from_toml(
            r#"
            listen_addr = "127.0.0.1:9000"
            max_concurrent_subscriptions = 5
            require_backend = true

            [discovery]
            kind = "dns"
            host = "doppler.service.internal"
            port = 8082

            [auth]
            admin_tokens = ["root"]

            [auth.app_tokens]
            viewer = ["app-a", "app-b"]
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.multiplexer_config().max_concurrent_subscriptions, 5);
        assert!(config.multiplexer_config().require_backend);
        assert_eq!(
            config.discovery,
            DiscoveryConfig::Dns {
                host: "doppler.service.internal".to_string(),
                port: 8082,
                refresh_interval_ms: 30_000,
            }
        );
        assert_eq!(config.auth.admin_tokens, vec!["root".to_string()]);
        assert_eq!(config.auth.app_tokens["viewer"].len(), 2);
    }

    #[test]
    fn test_simulated_discovery() {
        let config = GatewayConfig::from_toml(
            r#"
            [discovery]
            kind = "simulated"
            message_size = "uns1kbyte"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.discovery,
            DiscoveryConfig::Simulated {
                nodes: 2,
                message_size: MessageSize::Uns1kbyte,
                interval_ms: 10,
            }
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            GatewayConfig::from_toml("max_concurrent_subscriptions = 0"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            GatewayConfig::from_toml("backoff_initial_ms = 10\nbackoff_max_ms = 1"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            GatewayConfig::from_toml("listen_addr = 5"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_rejects_simulated_node_count_outside_port_range() {
        let config = |nodes: usize| {
            GatewayConfig::from_toml(&format!(
                "[discovery]\nkind = \"simulated\"\nnodes = {nodes}"
            ))
        };
        assert!(matches!(config(0), Err(Error::InvalidConfig(_))));
        assert!(matches!(config(70_000), Err(Error::InvalidConfig(_))));
        assert!(matches!(config(MAX_NODES + 1), Err(Error::InvalidConfig(_))));
        assert!(config(MAX_NODES).is_ok());
        assert!(config(4).is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "stream_buffer = 7\n").unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.stream_buffer, 7);

        let missing = GatewayConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::ConfigRead { .. })));
    }
}
