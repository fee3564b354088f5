//! Backend node identity

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DiscoveryError;

/// A telemetry-emitting backend, identified by host and port.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct BackendNode {
    host: String,
    port: u16,
}

impl BackendNode {
    /// Create a node from its host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP literal
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the backend listens on
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Resolve this node to a socket address.
    ///
    /// Resolves DNS and returns the first address.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not resolve.
    pub async fn socket_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| DiscoveryError::Source(format!("failed to resolve {self}: {e}")))?
            .next()
            .ok_or_else(|| DiscoveryError::Source(format!("no addresses for {self}")))
    }

    /// WebSocket base URL of this node
    #[must_use]
    pub fn websocket_url(&self) -> String {
        if self.host.contains(':') {
            format!("ws://[{}]:{}", self.host, self.port)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendNode {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidAddress(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(invalid());
        }

        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for BackendNode {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// A change in backend membership.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipEvent {
    /// A node appeared
    Added(BackendNode),
    /// A node went away
    Removed(BackendNode),
}

impl MembershipEvent {
    /// The node the event is about
    #[must_use]
    pub const fn node(&self) -> &BackendNode {
        match self {
            Self::Added(node) | Self::Removed(node) => node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let node: BackendNode = "doppler.service.internal:8082".parse().unwrap();
        assert_eq!(node.host(), "doppler.service.internal");
        assert_eq!(node.port(), 8082);
        assert_eq!(node.to_string(), "doppler.service.internal:8082");
    }

    #[test]
    fn test_parse_ipv6() {
        let node: BackendNode = "[::1]:8082".parse().unwrap();
        assert_eq!(node.host(), "::1");
        assert_eq!(node.to_string(), "[::1]:8082");
        assert_eq!(node.websocket_url(), "ws://[::1]:8082");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("no-port".parse::<BackendNode>().is_err());
        assert!(":8082".parse::<BackendNode>().is_err());
        assert!("host:notaport".parse::<BackendNode>().is_err());
    }

    #[test]
    fn test_identity_is_host_and_port() {
        let a = BackendNode::new("10.0.0.1", 8082);
        let b: BackendNode = "10.0.0.1:8082".parse().unwrap();
        let c = BackendNode::new("10.0.0.1", 8083);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
