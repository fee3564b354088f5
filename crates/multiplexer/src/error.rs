//! Error types for the subscription multiplexer

use thiserror::Error;

/// Reasons a subscription cannot be opened
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MultiplexerError {
    /// The global ceiling of open subscriptions is reached
    #[error("subscription capacity of {limit} reached")]
    CapacityExceeded {
        /// Configured ceiling
        limit: usize,
    },

    /// Every backend in the pool refused the subscription
    #[error("no backend accepted the subscription ({attempted} attempted)")]
    ConnectionUnavailable {
        /// Nodes tried
        attempted: usize,
    },
}

/// Terminal outcomes of [`MergedStream::next`](crate::MergedStream::next)
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum StreamError {
    /// The stream was closed by its owner
    #[error("stream closed")]
    Closed,

    /// The stream's sources are gone and it can produce nothing more
    #[error("stream terminated")]
    Terminated,
}
