//! WebSocket transport to backend nodes
//!
//! Each backend exposes `GET /subscribe?shard_id=..&filter=..&app_id=..` as a
//! WebSocket endpoint streaming one encoded envelope per binary frame.
//! `connect` only proves the node is reachable; every subscription opens its
//! own WebSocket so it can be cancelled on its own by dropping the stream.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use firehose_discovery::BackendNode;
use firehose_envelope::{EncodedEnvelope, Filter};
use firehose_transport::{
    Config, Connection, EnvelopeStream, SubscriptionRequest, Transport, TransportError,
};
use futures::StreamExt;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Path of the backend subscribe endpoint
pub const SUBSCRIBE_PATH: &str = "/subscribe";

/// WebSocket transport implementation
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: Config,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, node: &BackendNode) -> Result<Box<dyn Connection>, TransportError> {
        let base_url = Url::parse(&node.websocket_url())
            .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL: {e}")))?;

        let addr = node
            .socket_addr()
            .await
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;

        debug!("Probing backend {} at {}", node, addr);

        // Reachability check; subscriptions dial their own sockets.
        tokio::net::TcpStream::connect(addr).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("TCP connect to {node} failed: {e}"))
        })?;

        Ok(Box::new(WebSocketConnection {
            node: node.clone(),
            base_url,
            max_message_size: self.config.max_message_size,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }
}

/// Channel to one backend node
struct WebSocketConnection {
    node: BackendNode,
    base_url: Url,
    max_message_size: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("node", &self.node)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Build the subscribe URL for `request`
fn subscribe_url(base_url: &Url, request: &SubscriptionRequest) -> Url {
    let mut url = base_url.clone();
    url.set_path(SUBSCRIBE_PATH);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("shard_id", &request.shard_id);
        match request.filter {
            Filter::LogsOnly => {
                query.append_pair("filter", "logs");
            }
            Filter::MetricsOnly => {
                query.append_pair("filter", "metrics");
            }
            Filter::None => {}
        }
        if let Some(app_id) = &request.app_id {
            query.append_pair("app_id", app_id);
        }
    }
    url
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<EnvelopeStream, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let url = subscribe_url(&self.base_url, request);
        debug!("Subscribing to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            TransportError::SubscribeFailed(format!("WebSocket connect to {} failed: {e}", self.node))
        })?;

        let max_message_size = self.max_message_size;
        let frames = futures::stream::unfold(Some(ws_stream), move |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > max_message_size {
                            let err = TransportError::Other(format!(
                                "frame of {} bytes exceeds limit of {max_message_size}",
                                data.len()
                            ));
                            return Some((Err(err), None));
                        }
                        let item = EncodedEnvelope::from_bytes(data).map_err(TransportError::from);
                        return Some((item, Some(ws)));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {
                        // Ignore other message types (Text, Ping, Pong)
                    }
                    Some(Err(e)) => {
                        return Some((Err(TransportError::Io(std::io::Error::other(e))), None));
                    }
                }
            }
        });

        Ok(frames
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_url() {
        let base = Url::parse("ws://10.0.0.1:8082").unwrap();

        let url = subscribe_url(&base, &SubscriptionRequest::firehose("sub 1", Filter::LogsOnly));
        assert_eq!(
            url.as_str(),
            "ws://10.0.0.1:8082/subscribe?shard_id=sub+1&filter=logs"
        );

        let url = subscribe_url(&base, &SubscriptionRequest::app("viewer", "app-a"));
        assert_eq!(
            url.as_str(),
            "ws://10.0.0.1:8082/subscribe?shard_id=viewer&app_id=app-a"
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let _ = tracing_subscriber::fmt::try_init();

        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = WebSocketTransport::default();
        let result = transport.connect(&BackendNode::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
