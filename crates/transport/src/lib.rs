//! Backend RPC abstraction for the firehose gateway
//!
//! A [`Transport`] dials backend nodes; the resulting [`Connection`] opens
//! streaming subscriptions. Each subscription is an independent
//! [`EnvelopeStream`]; dropping the stream cancels that call and nothing else.
//!
//! Specific transports (in-memory, WebSocket) live in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;

use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use firehose_discovery::BackendNode;
use firehose_envelope::{EncodedEnvelope, Filter};
use futures::Stream;
use serde::{Deserialize, Serialize};

pub use error::TransportError;

/// Stream of envelopes from one backend subscription
pub type EnvelopeStream =
    Pin<Box<dyn Stream<Item = Result<EncodedEnvelope, TransportError>> + Send>>;

/// What a client asks the backends for.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SubscriptionRequest {
    /// Group label; backends split output among subscribers sharing a
    /// non-empty shard id and give everyone else a full copy
    pub shard_id: String,
    /// Envelope class the client wants
    pub filter: Filter,
    /// Restrict output to one application
    pub app_id: Option<String>,
}

impl SubscriptionRequest {
    /// A firehose request for `shard_id`
    pub fn firehose(shard_id: impl Into<String>, filter: Filter) -> Self {
        Self {
            shard_id: shard_id.into(),
            filter,
            app_id: None,
        }
    }

    /// A per-application request
    pub fn app(shard_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            filter: Filter::None,
            app_id: Some(app_id.into()),
        }
    }
}

/// A live channel to one backend node
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Open a streaming subscription on this channel
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<EnvelopeStream, TransportError>;

    /// Whether the channel can still be used
    fn is_healthy(&self) -> bool;

    /// Close the channel; open subscriptions end
    async fn close(&self);
}

/// Dials backend nodes
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a channel to `node`
    async fn connect(&self, node: &BackendNode) -> Result<Box<dyn Connection>, TransportError>;
}

/// Configuration shared by transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum accepted frame size in bytes
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}
