//! Error types for backend transports

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection to the node
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was closed
    #[error("connection closed")]
    ConnectionClosed,

    /// The node address is unusable
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The backend refused or failed to open the subscription
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// A received frame was not a valid envelope
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] firehose_envelope::EnvelopeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}
