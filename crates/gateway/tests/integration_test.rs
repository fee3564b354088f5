//! End-to-end tests: WebSocket clients against a gateway over memory backends

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use firehose_discovery::{BackendNode, ChannelDiscovery, DiscoveryHandle};
use firehose_envelope::{Envelope, LogMessage, MessageType, Payload, ValueMetric};
use firehose_gateway::{
    AuthConfig, Endpoint, Gateway, GatewayConfig, HealthReport, RejectReason,
    StaticTokenAuthorizer,
};
use firehose_transport_memory::{MemoryBackend, MemoryNetwork, MemoryTransport};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn log_for(app_id: &str, line: &str) -> Envelope {
    Envelope {
        origin: "rep".to_string(),
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
            app_id: Some(app_id.to_string()),
            source_type: None,
            source_instance: None,
        }),
    }
}

fn metric() -> Envelope {
    Envelope {
        payload: Payload::ValueMetric(ValueMetric {
            name: "cpu".to_string(),
            value: 0.5,
            unit: "percent".to_string(),
        }),
        ..log_for("none", "")
    }
}

struct TestGateway {
    gateway: Gateway,
    backend: MemoryBackend,
    _handle: DiscoveryHandle,
    shutdown: CancellationToken,
}

impl TestGateway {
    async fn start(config: GatewayConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let node = BackendNode::new("10.0.0.1", 8082);
        let backend = network.add_node(node.clone());

        let (discovery, handle) = ChannelDiscovery::new();
        handle.add(node);

        let shutdown = CancellationToken::new();
        let authorizer = Arc::new(StaticTokenAuthorizer::new(&config.auth));
        let gateway = Gateway::start(
            &config,
            MemoryTransport::new(network),
            discovery,
            authorizer,
            shutdown.clone(),
        )
        .await
        .expect("gateway failed to start");

        let test = Self {
            gateway,
            backend,
            _handle: handle,
            shutdown,
        };
        test.wait_for_backends(1).await;
        test
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.gateway.local_addr(), path)
    }

    async fn health(&self) -> HealthReport {
        let mut socket = TcpStream::connect(self.gateway.health_addr()).await.unwrap();
        socket
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();
        let (_, body) = response.split_once("\r\n\r\n").expect("malformed response");
        serde_json::from_str(body).expect("invalid health body")
    }

    async fn wait_for_backends(&self, count: usize) {
        timeout(WAIT, async {
            while self.health().await.backends != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool never reached expected size");
    }

    async fn wait_for_subscribers(&self, count: usize) {
        timeout(WAIT, async {
            while self.backend.subscriber_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend never reached expected subscriber count");
    }
}

fn config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        health_addr: "127.0.0.1:0".parse().unwrap(),
        auth: AuthConfig {
            admin_tokens: vec!["admin".to_string()],
            app_tokens: HashMap::from([("viewer".to_string(), vec!["app-a".to_string()])]),
        },
        ..GatewayConfig::default()
    }
}

fn status_of(result: Result<impl Sized, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connection unexpectedly accepted"),
    }
}

async fn next_binary<S>(ws: &mut S) -> Bytes
where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(bytes) = message {
            return bytes;
        }
    }
}

#[tokio::test]
async fn test_firehose_delivers_exact_bytes() {
    let gateway = TestGateway::start(config()).await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(gateway.url("/firehose/sub-1?access_token=admin"))
            .await
            .expect("upgrade refused");
    gateway.wait_for_subscribers(1).await;

    let envelope = log_for("app-a", "hello");
    gateway.backend.emit(&envelope).unwrap();

    let frame = next_binary(&mut ws).await;
    assert_eq!(frame, envelope.encode().unwrap());

    let metrics = gateway.gateway.metrics();
    assert_eq!(metrics.open_stream_count(Endpoint::Firehose), 1);
    timeout(WAIT, async {
        while metrics.egress_count(Endpoint::Firehose, "none") != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("egress not counted");
}

#[tokio::test]
async fn test_filter_type_query() {
    let gateway = TestGateway::start(config()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(
        gateway.url("/firehose/sub-1?filter-type=metrics&access_token=admin"),
    )
    .await
    .unwrap();
    gateway.wait_for_subscribers(1).await;

    gateway.backend.emit(&log_for("app-a", "dropped")).unwrap();
    gateway.backend.emit(&metric()).unwrap();

    let frame = next_binary(&mut ws).await;
    assert!(Envelope::decode(&frame).unwrap().kind().is_metric());
}

#[tokio::test]
async fn test_authorization_outcomes() {
    let gateway = TestGateway::start(config()).await;

    let missing = tokio_tungstenite::connect_async(gateway.url("/firehose/sub-1")).await;
    assert_eq!(status_of(missing), 401);

    let forbidden =
        tokio_tungstenite::connect_async(gateway.url("/firehose/sub-1?access_token=viewer")).await;
    assert_eq!(status_of(forbidden), 403);

    let other_app =
        tokio_tungstenite::connect_async(gateway.url("/apps/app-b/stream?access_token=viewer"))
            .await;
    assert_eq!(status_of(other_app), 403);

    let metrics = gateway.gateway.metrics();
    assert_eq!(metrics.rejected_count(RejectReason::Unauthorized), 3);
    // Denied clients never reach the multiplexer
    assert_eq!(gateway.backend.subscriber_count(), 0);
    assert_eq!(gateway.health().await.open_subscriptions, 0);
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    let gateway = TestGateway::start(config()).await;

    let mut request = tungstenite::client::IntoClientRequest::into_client_request(
        gateway.url("/apps/app-a/stream"),
    )
    .unwrap();
    request
        .headers_mut()
        .insert("authorization", "bearer viewer".parse().unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    gateway.wait_for_subscribers(1).await;

    gateway.backend.emit(&log_for("app-b", "not yours")).unwrap();
    let envelope = log_for("app-a", "yours");
    gateway.backend.emit(&envelope).unwrap();

    assert_eq!(next_binary(&mut ws).await, envelope.encode().unwrap());
    assert_eq!(gateway.health().await.app_streams, 1);
}

#[tokio::test]
async fn test_app_viewers_each_get_a_copy() {
    let gateway = TestGateway::start(config()).await;

    let url = gateway.url("/apps/app-a/stream?access_token=viewer");
    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    gateway.wait_for_subscribers(2).await;

    let envelope = log_for("app-a", "both");
    gateway.backend.emit(&envelope).unwrap();

    let expected = envelope.encode().unwrap();
    assert_eq!(next_binary(&mut first).await, expected);
    assert_eq!(next_binary(&mut second).await, expected);
}

#[tokio::test]
async fn test_capacity_exceeded_is_service_unavailable() {
    let gateway = TestGateway::start(GatewayConfig {
        max_concurrent_subscriptions: 1,
        ..config()
    })
    .await;

    let url = gateway.url("/firehose/sub-1?access_token=admin");
    let (first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let second = tokio_tungstenite::connect_async(url.as_str()).await;
    assert_eq!(status_of(second), 503);
    assert_eq!(
        gateway.gateway.metrics().rejected_count(RejectReason::Capacity),
        1
    );

    // Disconnecting frees the slot
    drop(first);
    timeout(WAIT, async {
        while gateway.health().await.open_subscriptions != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot never released");
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_ok());
}

#[tokio::test]
async fn test_client_disconnect_cleans_up() {
    let gateway = TestGateway::start(config()).await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(gateway.url("/firehose/sub-1?access_token=admin"))
            .await
            .unwrap();
    gateway.wait_for_subscribers(1).await;

    ws.close(None).await.unwrap();
    drop(ws);

    gateway.wait_for_subscribers(0).await;
    timeout(WAIT, async {
        loop {
            let health = gateway.health().await;
            if health.firehose_streams == 0 && health.open_subscriptions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream not released after disconnect");
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let gateway = TestGateway::start(config()).await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(gateway.url("/firehose/sub-1?access_token=admin"))
            .await
            .unwrap();
    gateway.wait_for_subscribers(1).await;

    gateway.shutdown.cancel();
    timeout(WAIT, gateway.gateway.wait())
        .await
        .expect("gateway did not stop");

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(gateway.gateway.metrics().open_stream_count(Endpoint::Firehose), 0);
}
