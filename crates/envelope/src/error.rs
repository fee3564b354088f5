//! Error types for envelope encoding.

use thiserror::Error;

/// Envelope codec errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes could not be decoded as an envelope
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    /// The envelope could not be encoded
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}
