//! Error types for discovery

use thiserror::Error;

/// Discovery-related errors
#[derive(Clone, Debug, Error)]
pub enum DiscoveryError {
    /// A backend address could not be parsed
    #[error("invalid backend address '{0}'")]
    InvalidAddress(String),

    /// The discovery source failed to list nodes
    #[error("discovery source error: {0}")]
    Source(String),

    /// The feed was started twice
    #[error("discovery feed already started")]
    AlreadyStarted,
}
