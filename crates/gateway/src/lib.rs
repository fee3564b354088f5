//! Streaming log and metric gateway
//!
//! Authorizes clients, opens merged subscriptions across the discovered
//! backend nodes and streams the envelopes to each client over a WebSocket.
//! A second listener serves health and Prometheus metrics.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

pub mod auth;
pub mod config;
mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod simulation;

pub use auth::{AllowAll, AuthError, Authorizer, Resource, StaticTokenAuthorizer};
pub use config::{AuthConfig, DiscoveryConfig, GatewayConfig};
pub use error::{Error, Result};
pub use handler::{ClientSink, CloseReason, ConnectionHandler, HandlerState, SinkError};
pub use metrics::{Endpoint, GatewayMetrics, RejectReason};
pub use server::{GatewayState, HealthReport};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use firehose_discovery::{
    Discovery, DnsAdaptor, PollingDiscovery, PollingDiscoveryConfig, StaticDiscovery,
};
use firehose_multiplexer::Multiplexer;
use firehose_pool::BackendPool;
use firehose_transport::Transport;
use firehose_transport_memory::MemoryTransport;
use firehose_transport_ws::WebSocketTransport;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Time allowed for open streams to drain on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running gateway
pub struct Gateway {
    local_addr: SocketAddr,
    health_addr: SocketAddr,
    metrics: GatewayMetrics,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Gateway {
    /// Bind both listeners and start serving
    ///
    /// Everything stops when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics cannot be registered or a listener cannot
    /// be bound.
    pub async fn start<T, D>(
        config: &GatewayConfig,
        transport: T,
        discovery: D,
        authorizer: Arc<dyn Authorizer>,
        shutdown: CancellationToken,
    ) -> Result<Self>
    where
        T: Transport + 'static,
        D: Discovery + 'static,
    {
        let metrics = GatewayMetrics::new()?;

        let listener = bind(config.listen_addr).await?;
        let health_listener = bind(config.health_addr).await?;
        let local_addr = bound_addr(&listener, config.listen_addr)?;
        let health_addr = bound_addr(&health_listener, config.health_addr)?;

        let tracker = TaskTracker::new();

        let pool = Arc::new(BackendPool::new(
            Arc::new(transport),
            config.pool_config(),
        ));
        let reconciler = pool.spawn_reconciler(Arc::new(discovery), shutdown.clone());
        {
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                match reconciler.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Backend discovery failed: {}", e);
                        shutdown.cancel();
                    }
                    Err(e) => error!("Backend reconciler panicked: {}", e),
                }
            });
        }

        let multiplexer = Arc::new(Multiplexer::new(pool, config.multiplexer_config()));

        let state = GatewayState {
            multiplexer,
            authorizer,
            metrics: metrics.clone(),
            write_timeout: config.write_timeout(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };

        server::spawn_server(
            &tracker,
            "client",
            listener,
            server::router(state.clone()),
            shutdown.clone(),
        );
        server::spawn_server(
            &tracker,
            "health",
            health_listener,
            server::health_router(state),
            shutdown.clone(),
        );
        tracker.close();

        info!(
            "Gateway listening on {} (health on {})",
            local_addr, health_addr
        );

        Ok(Self {
            local_addr,
            health_addr,
            metrics,
            shutdown,
            tracker,
        })
    }

    /// Client listener address
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Health listener address
    #[must_use]
    pub const fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// Gateway metrics
    #[must_use]
    pub const fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Wait for shutdown, then for open streams to drain
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
        info!("Gateway shutting down...");

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Gateway tasks did not finish within {:?}", SHUTDOWN_TIMEOUT);
        }

        info!("Gateway shutdown");
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

fn bound_addr(listener: &TcpListener, requested: SocketAddr) -> Result<SocketAddr> {
    listener.local_addr().map_err(|source| Error::Bind {
        addr: requested,
        source,
    })
}

fn authorizer(config: &GatewayConfig) -> Arc<dyn Authorizer> {
    if config.disable_access_control {
        warn!("Access control disabled, every client is allowed");
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticTokenAuthorizer::new(&config.auth))
    }
}

/// Run the gateway described by `config` until `shutdown` is cancelled
///
/// # Errors
///
/// Returns an error if the configuration is invalid or startup fails.
pub async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;
    let authorizer = authorizer(&config);

    let gateway = match &config.discovery {
        DiscoveryConfig::Static { addrs } => {
            info!("Using {} static backend addresses", addrs.len());
            let discovery = StaticDiscovery::from_addrs(addrs)?;
            Gateway::start(
                &config,
                WebSocketTransport::default(),
                discovery,
                authorizer,
                shutdown,
            )
            .await?
        }
        DiscoveryConfig::Dns {
            host,
            port,
            refresh_interval_ms,
        } => {
            info!("Discovering backends via DNS {}:{}", host, port);
            let discovery = PollingDiscovery::with_config(
                Arc::new(DnsAdaptor::new(host.clone(), *port)),
                PollingDiscoveryConfig {
                    refresh_interval: Duration::from_millis(*refresh_interval_ms),
                },
            );
            Gateway::start(
                &config,
                WebSocketTransport::default(),
                discovery,
                authorizer,
                shutdown,
            )
            .await?
        }
        DiscoveryConfig::Simulated {
            nodes,
            message_size,
            interval_ms,
        } => {
            let simulation = simulation::start(
                *nodes,
                *message_size,
                Duration::from_millis(*interval_ms),
                &shutdown,
            );
            Gateway::start(
                &config,
                MemoryTransport::new(simulation.network),
                simulation.discovery,
                authorizer,
                shutdown,
            )
            .await?
        }
    };

    gateway.wait().await;
    Ok(())
}
