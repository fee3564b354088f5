//! Error types for the backend pool

use std::time::Duration;

use firehose_discovery::{BackendNode, DiscoveryError};
use thiserror::Error;

/// Why a node could not be used right now
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UnavailableCause {
    /// The transport refused the dial or the subscription
    #[error("dial failed: {0}")]
    Dial(String),
    /// The dial or subscription did not finish within the timeout
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
    /// A recent failure put the node in backoff
    #[error("backing off, retry in {0:?}")]
    BackingOff(Duration),
}

/// Backend pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// The node cannot be reached right now
    #[error("backend {node} unavailable: {cause}")]
    ConnectionUnavailable {
        /// The node that failed
        node: Box<BackendNode>,
        /// What went wrong
        cause: UnavailableCause,
    },

    /// The node is not (or no longer) a pool member
    #[error("backend {0} is not a pool member")]
    NotMember(Box<BackendNode>),

    /// The discovery feed failed to start
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Result type alias
pub type PoolResult<T> = Result<T, PoolError>;
