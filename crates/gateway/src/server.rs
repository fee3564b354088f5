//! HTTP surface: client stream endpoints and the health listener

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use firehose_envelope::Filter;
use firehose_multiplexer::{MergedStream, Multiplexer};
use firehose_transport::{SubscriptionRequest, Transport};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{AuthError, Authorizer, Resource, extract_token};
use crate::handler::{ClientSink, ConnectionHandler, SinkError};
use crate::metrics::{Endpoint, GatewayMetrics, RejectReason};

/// Shared by every request
pub struct GatewayState<T>
where
    T: Transport,
{
    pub(crate) multiplexer: Arc<Multiplexer<T>>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) metrics: GatewayMetrics,
    pub(crate) write_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl<T> Clone for GatewayState<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            multiplexer: self.multiplexer.clone(),
            authorizer: self.authorizer.clone(),
            metrics: self.metrics.clone(),
            write_timeout: self.write_timeout,
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FirehoseQuery {
    #[serde(rename = "filter-type")]
    filter_type: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AppQuery {
    access_token: Option<String>,
}

/// Body of `GET /health`
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HealthReport {
    /// Open firehose client streams
    pub firehose_streams: i64,
    /// Open per-app client streams
    pub app_streams: i64,
    /// Merged subscriptions holding a slot
    pub open_subscriptions: usize,
    /// Backend pool members
    pub backends: usize,
}

/// Client-facing routes
pub fn router<T>(state: GatewayState<T>) -> Router
where
    T: Transport + 'static,
{
    Router::new()
        .route("/firehose/{subscription_id}", get(firehose_stream::<T>))
        .route("/apps/{app_id}/stream", get(app_stream::<T>))
        .with_state(state)
}

/// Health and metrics routes
pub fn health_router<T>(state: GatewayState<T>) -> Router
where
    T: Transport + 'static,
{
    Router::new()
        .route("/health", get(health::<T>))
        .route("/metrics", get(metrics::<T>))
        .with_state(state)
}

async fn firehose_stream<T>(
    State(state): State<GatewayState<T>>,
    Path(subscription_id): Path<String>,
    Query(query): Query<FirehoseQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response
where
    T: Transport + 'static,
{
    let token = extract_token(&headers, query.access_token.as_deref());
    let filter = Filter::from_query(query.filter_type.as_deref());
    let request = SubscriptionRequest::firehose(subscription_id, filter);

    open_stream(state, Endpoint::Firehose, Resource::Firehose, request, token, ws).await
}

async fn app_stream<T>(
    State(state): State<GatewayState<T>>,
    Path(app_id): Path<String>,
    Query(query): Query<AppQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response
where
    T: Transport + 'static,
{
    let token = extract_token(&headers, query.access_token.as_deref());
    // A fresh shard per viewer so every viewer gets the full app stream
    let request = SubscriptionRequest::app(Uuid::new_v4().to_string(), app_id.clone());

    open_stream(state, Endpoint::App, Resource::App(app_id), request, token, ws).await
}

async fn open_stream<T>(
    state: GatewayState<T>,
    endpoint: Endpoint,
    resource: Resource,
    request: SubscriptionRequest,
    token: Option<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response
where
    T: Transport + 'static,
{
    if let Err(e) = state.authorizer.authorize(token.as_deref(), &resource) {
        state.metrics.reject(RejectReason::Unauthorized);
        debug!(endpoint = endpoint.as_str(), "Rejecting client: {}", e);
        let status = match e {
            AuthError::MissingToken => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
        };
        return (status, e.to_string()).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let mut handler =
        ConnectionHandler::admit(endpoint, state.metrics.clone(), state.write_timeout);
    let stream = match handler
        .subscribe(&state.multiplexer, request, &state.shutdown)
        .await
    {
        Ok(stream) => stream,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    let shutdown = state.shutdown.clone();
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| async move {
        tracker
            .track_future(serve_socket(handler, stream, socket, shutdown))
            .await;
    })
}

/// Writes envelopes as binary frames
struct WebSocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl ClientSink for WebSocketSink {
    async fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
        self.0
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| SinkError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.0
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "stream closed".into(),
            })))
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

async fn serve_socket(
    mut handler: ConnectionHandler,
    stream: MergedStream,
    socket: WebSocket,
    shutdown: CancellationToken,
) {
    let (sender, mut receiver) = socket.split();
    let disconnect = CancellationToken::new();

    // Clients never send data; reading only detects them going away.
    let watcher = {
        let disconnect = disconnect.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.next().await {
                if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
            disconnect.cancel();
        })
    };

    let mut sink = WebSocketSink(sender);
    handler.run(stream, &mut sink, &disconnect, &shutdown).await;
    watcher.abort();
}

async fn health<T>(State(state): State<GatewayState<T>>) -> impl IntoResponse
where
    T: Transport + 'static,
{
    axum::Json(HealthReport {
        firehose_streams: state.metrics.open_stream_count(Endpoint::Firehose),
        app_streams: state.metrics.open_stream_count(Endpoint::App),
        open_subscriptions: state.multiplexer.open_subscriptions(),
        backends: state.multiplexer.pool().len(),
    })
}

async fn metrics<T>(State(state): State<GatewayState<T>>) -> impl IntoResponse
where
    T: Transport + 'static,
{
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Serve `router` on `listener` until `shutdown` fires
pub(crate) fn spawn_server(
    tracker: &TaskTracker,
    name: &'static str,
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) {
    tracker.spawn(async move {
        tokio::select! {
            e = axum::serve(listener, router.into_make_service()).into_future() => {
                info!("{} server exited {:?}", name, e);
            }
            () = shutdown.cancelled() => {
                info!("{} server shutting down", name);
            }
        }
    });
}
