//! Per-client connection handler
//!
//! A handler is created once a client is authorized. It opens a merged
//! subscription, then pulls envelopes from it and writes them to the client
//! until the client goes away, a write fails, the stream ends or the gateway
//! shuts down. The open-stream gauge is raised on admission and lowered
//! exactly once, whichever way the handler ends.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use firehose_envelope::Filter;
use firehose_multiplexer::{MergedStream, Multiplexer, MultiplexerError, StreamError};
use firehose_transport::{SubscriptionRequest, Transport};
use prometheus::IntGauge;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{Endpoint, GatewayMetrics, RejectReason};

/// Time allowed for the closing frame once draining
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A client write failed
#[derive(Debug, Error)]
#[error("client write failed: {0}")]
pub struct SinkError(pub String);

/// Client-facing half of a connection
#[async_trait]
pub trait ClientSink: Send {
    /// Deliver one encoded envelope
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError>;

    /// Tell the client the stream is over
    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Lifecycle of a handler
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerState {
    /// Authorized, counted as open
    Admitted,
    /// Opening the merged subscription
    Subscribing,
    /// Delivering envelopes
    Streaming,
    /// Closing the merged subscription
    Draining,
    /// Done; no longer counted
    Closed,
}

/// Why streaming stopped
#[derive(Debug)]
pub enum CloseReason {
    /// The client went away
    ClientDisconnected,
    /// A write failed
    WriteFailed(SinkError),
    /// A write did not finish in time
    WriteTimeout,
    /// The merged stream ended
    StreamEnded(StreamError),
    /// The gateway is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::WriteFailed(e) => write!(f, "{e}"),
            Self::WriteTimeout => write!(f, "write timed out"),
            Self::StreamEnded(e) => write!(f, "{e}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Holds one unit of the open-stream gauge
struct OpenStreamGuard(IntGauge);

impl OpenStreamGuard {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// One client connection
pub struct ConnectionHandler {
    endpoint: Endpoint,
    filter: Filter,
    metrics: GatewayMetrics,
    write_timeout: Duration,
    state: HandlerState,
    guard: Option<OpenStreamGuard>,
    delivered: u64,
}

impl ConnectionHandler {
    /// Admit an authorized client
    #[must_use]
    pub fn admit(endpoint: Endpoint, metrics: GatewayMetrics, write_timeout: Duration) -> Self {
        let gauge = metrics
            .open_streams
            .with_label_values(&[endpoint.as_str()]);
        Self {
            endpoint,
            filter: Filter::None,
            metrics,
            write_timeout,
            state: HandlerState::Admitted,
            guard: Some(OpenStreamGuard::new(gauge)),
            delivered: 0,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> HandlerState {
        self.state
    }

    /// Envelopes written so far
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    fn transition(&mut self, next: HandlerState) {
        debug!(
            endpoint = self.endpoint.as_str(),
            "Handler {:?} -> {:?}", self.state, next
        );
        self.state = next;
        if next == HandlerState::Closed {
            self.guard.take();
        }
    }

    /// Open the merged subscription for this client
    ///
    /// The stream also closes when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Passes on the multiplexer error; the handler is then closed.
    pub async fn subscribe<T>(
        &mut self,
        multiplexer: &Multiplexer<T>,
        request: SubscriptionRequest,
        shutdown: &CancellationToken,
    ) -> Result<MergedStream, MultiplexerError>
    where
        T: Transport + 'static,
    {
        self.transition(HandlerState::Subscribing);
        self.filter = request.filter;

        match multiplexer
            .subscribe_with_cancellation(request, shutdown)
            .await
        {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let reason = match e {
                    MultiplexerError::CapacityExceeded { .. } => RejectReason::Capacity,
                    MultiplexerError::ConnectionUnavailable { .. } => RejectReason::Unavailable,
                };
                self.metrics.reject(reason);
                warn!(endpoint = self.endpoint.as_str(), "Subscription refused: {}", e);
                self.transition(HandlerState::Closed);
                Err(e)
            }
        }
    }

    /// Pump `stream` into `sink` until something ends the connection
    ///
    /// `disconnect` is cancelled by whoever watches the client side;
    /// `shutdown` by the gateway.
    pub async fn run<S>(
        &mut self,
        stream: MergedStream,
        sink: &mut S,
        disconnect: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> CloseReason
    where
        S: ClientSink,
    {
        self.transition(HandlerState::Streaming);

        let egress = self
            .metrics
            .egress
            .with_label_values(&[self.endpoint.as_str(), self.filter.as_str()]);

        let reason = loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break CloseReason::Shutdown,
                () = disconnect.cancelled() => break CloseReason::ClientDisconnected,
                next = stream.next() => next,
            };

            let bytes = match next {
                Ok(bytes) => bytes,
                Err(StreamError::Closed) if shutdown.is_cancelled() => break CloseReason::Shutdown,
                Err(e) => break CloseReason::StreamEnded(e),
            };

            let written = tokio::select! {
                () = disconnect.cancelled() => break CloseReason::ClientDisconnected,
                written = timeout(self.write_timeout, sink.write(bytes)) => written,
            };
            match written {
                Ok(Ok(())) => {
                    egress.inc();
                    self.delivered += 1;
                }
                Ok(Err(e)) => break CloseReason::WriteFailed(e),
                Err(_) => break CloseReason::WriteTimeout,
            }
        };

        self.transition(HandlerState::Draining);
        stream.close();
        if !matches!(reason, CloseReason::ClientDisconnected | CloseReason::WriteFailed(_)) {
            match timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close frame not sent: {}", e),
                Err(_) => debug!("Close frame timed out"),
            }
        }

        info!(
            endpoint = self.endpoint.as_str(),
            delivered = self.delivered,
            "Client stream ended: {}",
            reason
        );
        self.transition(HandlerState::Closed);
        reason
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if self.state != HandlerState::Closed {
            self.transition(HandlerState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use firehose_discovery::{BackendNode, MembershipEvent};
    use firehose_envelope::{Envelope, LogMessage, MessageType, Payload};
    use firehose_multiplexer::MultiplexerConfig;
    use firehose_pool::{BackendPool, PoolConfig};
    use firehose_transport_memory::{MemoryBackend, MemoryNetwork, MemoryTransport};

    /// Records writes and fails the nth one
    struct RecordingSink {
        written: Vec<Bytes>,
        fail_on: Option<usize>,
        closes: usize,
    }

    impl RecordingSink {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                written: Vec::new(),
                fail_on,
                closes: 0,
            }
        }
    }

    #[async_trait]
    impl ClientSink for RecordingSink {
        async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
            if self.fail_on == Some(self.written.len() + 1) {
                return Err(SinkError("broken pipe".to_string()));
            }
            self.written.push(bytes);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            self.closes += 1;
            Ok(())
        }
    }

    fn log(line: &str) -> Envelope {
        Envelope {
            origin: "test".to_string(),
            timestamp: 0,
            deployment: String::new(),
            job: String::new(),
            index: String::new(),
            ip: String::new(),
            tags: BTreeMap::new(),
            payload: Payload::LogMessage(LogMessage {
                message: Bytes::from(line.to_string()),
                message_type: MessageType::Out,
                timestamp: 0,
                app_id: None,
                source_type: None,
                source_instance: None,
            }),
        }
    }

    fn setup(config: MultiplexerConfig) -> (MemoryBackend, Multiplexer<MemoryTransport>) {
        let network = MemoryNetwork::new();
        let node = BackendNode::new("10.0.0.1", 8082);
        let backend = network.add_node(node.clone());
        let pool = Arc::new(BackendPool::new(
            Arc::new(MemoryTransport::new(network)),
            PoolConfig::default(),
        ));
        pool.reconcile(MembershipEvent::Added(node));
        (backend, Multiplexer::new(pool, config))
    }

    #[tokio::test]
    async fn test_write_failure_drains_once() {
        let _ = tracing_subscriber::fmt::try_init();
        let (backend, multiplexer) = setup(MultiplexerConfig::default());
        let metrics = GatewayMetrics::new().unwrap();
        let shutdown = CancellationToken::new();
        let disconnect = CancellationToken::new();

        let mut handler =
            ConnectionHandler::admit(Endpoint::Firehose, metrics.clone(), Duration::from_secs(1));
        assert_eq!(metrics.open_stream_count(Endpoint::Firehose), 1);

        let stream = handler
            .subscribe(&multiplexer, SubscriptionRequest::default(), &shutdown)
            .await
            .unwrap();
        assert_eq!(handler.state(), HandlerState::Subscribing);

        for i in 0..10 {
            backend.emit(&log(&format!("line {i}"))).unwrap();
        }

        let mut sink = RecordingSink::new(Some(5));
        let reason = handler.run(stream, &mut sink, &disconnect, &shutdown).await;

        assert!(matches!(reason, CloseReason::WriteFailed(_)));
        assert_eq!(handler.state(), HandlerState::Closed);
        assert_eq!(sink.written.len(), 4);
        assert_eq!(handler.delivered(), 4);
        assert_eq!(metrics.egress_count(Endpoint::Firehose, "none"), 4);
        assert_eq!(metrics.open_stream_count(Endpoint::Firehose), 0);
        assert_eq!(multiplexer.open_subscriptions(), 0);

        // Dropping a closed handler must not decrement again
        drop(handler);
        assert_eq!(metrics.open_stream_count(Endpoint::Firehose), 0);
    }

    #[tokio::test]
    async fn test_capacity_rejection_closes_handler() {
        let (_backend, multiplexer) = setup(MultiplexerConfig {
            max_concurrent_subscriptions: 1,
            ..MultiplexerConfig::default()
        });
        let metrics = GatewayMetrics::new().unwrap();
        let shutdown = CancellationToken::new();

        let _held = multiplexer
            .subscribe(SubscriptionRequest::default())
            .await
            .unwrap();

        let mut handler =
            ConnectionHandler::admit(Endpoint::App, metrics.clone(), Duration::from_secs(1));
        let result = handler
            .subscribe(&multiplexer, SubscriptionRequest::default(), &shutdown)
            .await;

        assert!(matches!(
            result,
            Err(MultiplexerError::CapacityExceeded { limit: 1 })
        ));
        assert_eq!(handler.state(), HandlerState::Closed);
        assert_eq!(metrics.open_stream_count(Endpoint::App), 0);
        assert_eq!(metrics.rejected_count(RejectReason::Capacity), 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscription() {
        let _ = tracing_subscriber::fmt::try_init();
        let (backend, multiplexer) = setup(MultiplexerConfig::default());
        let metrics = GatewayMetrics::new().unwrap();
        let shutdown = CancellationToken::new();
        let disconnect = CancellationToken::new();

        let mut handler =
            ConnectionHandler::admit(Endpoint::Firehose, metrics.clone(), Duration::from_secs(1));
        let stream = handler
            .subscribe(&multiplexer, SubscriptionRequest::default(), &shutdown)
            .await
            .unwrap();

        let trigger = disconnect.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut sink = RecordingSink::new(None);
        let reason = handler.run(stream, &mut sink, &disconnect, &shutdown).await;

        assert!(matches!(reason, CloseReason::ClientDisconnected));
        assert_eq!(sink.closes, 0);
        assert_eq!(metrics.open_stream_count(Endpoint::Firehose), 0);
        assert_eq!(multiplexer.open_subscriptions(), 0);

        timeout(Duration::from_secs(1), async {
            while backend.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend subscription leaked");
    }

    #[tokio::test]
    async fn test_shutdown_sends_close() {
        let (_backend, multiplexer) = setup(MultiplexerConfig::default());
        let metrics = GatewayMetrics::new().unwrap();
        let shutdown = CancellationToken::new();

        let mut handler =
            ConnectionHandler::admit(Endpoint::Firehose, metrics, Duration::from_secs(1));
        let stream = handler
            .subscribe(&multiplexer, SubscriptionRequest::default(), &shutdown)
            .await
            .unwrap();

        shutdown.cancel();
        let mut sink = RecordingSink::new(None);
        let reason = handler
            .run(stream, &mut sink, &CancellationToken::new(), &shutdown)
            .await;

        assert!(matches!(reason, CloseReason::Shutdown));
        assert_eq!(sink.closes, 1);
    }
}
