//! Integration tests for WebSocket transport

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use firehose_discovery::BackendNode;
use firehose_envelope::{Envelope, EnvelopeKind, Filter, Payload, ValueMetric};
use firehose_transport::{SubscriptionRequest, Transport};
use firehose_transport_ws::WebSocketTransport;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

fn metric(value: f64) -> Envelope {
    Envelope {
        origin: "backend".to_string(),
        timestamp: 1,
        deployment: String::new(),
        job: String::new(),
        index: String::new(),
        ip: String::new(),
        tags: BTreeMap::new(),
        payload: Payload::ValueMetric(ValueMetric {
            name: "cpu".to_string(),
            value,
            unit: "percent".to_string(),
        }),
    }
}

/// Accept one TCP reachability check, then one WebSocket subscription that receives
/// `frames` and closes.
async fn spawn_backend(frames: Vec<Bytes>) -> (BackendNode, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, uri_rx) = oneshot::channel();

    tokio::spawn(async move {
        // Reachability check from connect()
        let (check, _) = listener.accept().await.unwrap();
        drop(check);

        let (socket, _) = listener.accept().await.unwrap();
        let mut uri_tx = Some(uri_tx);
        let mut ws = tokio_tungstenite::accept_hdr_async(
            socket,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(tx) = uri_tx.take() {
                    let _ = tx.send(req.uri().to_string());
                }
                Ok(resp)
            },
        )
        .await
        .unwrap();

        for frame in frames {
            ws.send(Message::Binary(frame)).await.unwrap();
        }
        let _ = ws.close(None).await;
    });

    (BackendNode::new("127.0.0.1", port), uri_rx)
}

#[tokio::test]
async fn test_subscribe_streams_frames_verbatim() {
    let _ = tracing_subscriber::fmt::try_init();

    let frames = vec![metric(1.0).encode().unwrap(), metric(2.0).encode().unwrap()];
    let (node, uri_rx) = spawn_backend(frames.clone()).await;

    let transport = WebSocketTransport::default();
    let conn = transport.connect(&node).await.expect("connect failed");
    let mut stream = conn
        .subscribe(&SubscriptionRequest::firehose("group-1", Filter::MetricsOnly))
        .await
        .expect("subscribe failed");

    let uri = timeout(Duration::from_secs(5), uri_rx).await.unwrap().unwrap();
    assert_eq!(uri, "/subscribe?shard_id=group-1&filter=metrics");

    for expected in frames {
        let item = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended early")
            .expect("stream error");
        assert_eq!(item.kind(), EnvelopeKind::ValueMetric);
        assert_eq!(item.bytes(), &expected);
    }

    let end = timeout(Duration::from_secs(5), stream.next()).await.expect("timeout");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_invalid_frame_is_reported() {
    let _ = tracing_subscriber::fmt::try_init();

    let (node, _uri_rx) = spawn_backend(vec![Bytes::from_static(b"\xffnot an envelope")]).await;

    let transport = WebSocketTransport::default();
    let conn = transport.connect(&node).await.unwrap();
    let mut stream = conn.subscribe(&SubscriptionRequest::default()).await.unwrap();

    let item = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timeout")
        .expect("stream ended early");
    assert!(item.is_err());
}

#[tokio::test]
async fn test_closed_connection_refuses_subscribe() {
    let _ = tracing_subscriber::fmt::try_init();

    let (node, _uri_rx) = spawn_backend(vec![]).await;

    let transport = WebSocketTransport::default();
    let conn = transport.connect(&node).await.unwrap();
    conn.close().await;

    assert!(!conn.is_healthy());
    assert!(conn.subscribe(&SubscriptionRequest::default()).await.is_err());
}
