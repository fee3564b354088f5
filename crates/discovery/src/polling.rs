//! Discovery by periodically listing a source and diffing the result

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::EventQueue;
use crate::{BackendNode, Discovery, DiscoveryError, MembershipEvent};

/// Default refresh interval for membership listings
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Source of the current backend membership
#[async_trait]
pub trait DiscoveryAdaptor: Send + Sync + 'static {
    /// List every backend node currently known to the source
    async fn list_nodes(&self) -> Result<Vec<BackendNode>, DiscoveryError>;
}

/// Configuration for [`PollingDiscovery`]
#[derive(Clone, Debug)]
pub struct PollingDiscoveryConfig {
    /// Interval between listings
    pub refresh_interval: Duration,
}

impl Default for PollingDiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Background refresh state
struct RefreshState {
    task: Option<JoinHandle<()>>,
    started: bool,
}

/// Turns periodic listings from a [`DiscoveryAdaptor`] into membership events.
pub struct PollingDiscovery<A>
where
    A: DiscoveryAdaptor,
{
    adaptor: Arc<A>,
    known: Arc<Mutex<BTreeSet<BackendNode>>>,
    queue: EventQueue,
    state: Mutex<RefreshState>,
    shutdown: CancellationToken,
    config: PollingDiscoveryConfig,
}

impl<A> PollingDiscovery<A>
where
    A: DiscoveryAdaptor,
{
    /// Create a polling feed with default configuration
    pub fn new(adaptor: Arc<A>) -> Self {
        Self::with_config(adaptor, PollingDiscoveryConfig::default())
    }

    /// Create a polling feed with custom configuration
    pub fn with_config(adaptor: Arc<A>, config: PollingDiscoveryConfig) -> Self {
        info!(
            "Creating polling discovery with refresh interval {:?}",
            config.refresh_interval
        );

        Self {
            adaptor,
            known: Arc::new(Mutex::new(BTreeSet::new())),
            queue: EventQueue::new(),
            state: Mutex::new(RefreshState {
                task: None,
                started: false,
            }),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Stop the background refresh task
    pub async fn shutdown(&self) {
        info!("Shutting down polling discovery");

        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        if let Some(task) = state.task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => debug!("Discovery refresh task completed"),
                Ok(Err(e)) => warn!("Discovery refresh task failed: {}", e),
                Err(_) => warn!("Discovery refresh task timed out"),
            }
        }
    }

    /// Nodes seen in the latest successful listing
    pub async fn known_nodes(&self) -> Vec<BackendNode> {
        self.known.lock().await.iter().cloned().collect()
    }
}

/// List the source once and queue the difference against `known`.
async fn refresh<A: DiscoveryAdaptor>(
    adaptor: &A,
    known: &Mutex<BTreeSet<BackendNode>>,
    tx: &flume::Sender<MembershipEvent>,
) -> Result<(), DiscoveryError> {
    let listed: BTreeSet<BackendNode> = adaptor.list_nodes().await?.into_iter().collect();

    let mut known = known.lock().await;

    let removed: Vec<_> = known.difference(&listed).cloned().collect();
    let added: Vec<_> = listed.difference(&known).cloned().collect();

    if added.is_empty() && removed.is_empty() {
        debug!("Membership unchanged ({} nodes)", listed.len());
        return Ok(());
    }

    info!(
        "Membership changed: {} added, {} removed",
        added.len(),
        removed.len()
    );

    for node in removed {
        let _ = tx.send(MembershipEvent::Removed(node));
    }
    for node in added {
        let _ = tx.send(MembershipEvent::Added(node));
    }

    *known = listed;

    Ok(())
}

#[async_trait]
impl<A> Discovery for PollingDiscovery<A>
where
    A: DiscoveryAdaptor,
{
    async fn start(&self) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Err(DiscoveryError::AlreadyStarted);
        }
        state.started = true;

        // A failing first listing is not fatal; the task keeps retrying.
        let tx = self.queue.sender();
        if let Err(e) = refresh(self.adaptor.as_ref(), &self.known, &tx).await {
            warn!("Initial discovery listing failed: {}", e);
        }

        let adaptor = self.adaptor.clone();
        let known = self.known.clone();
        let shutdown = self.shutdown.clone();
        let refresh_interval = self.config.refresh_interval;

        state.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the listing was just done.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Discovery refresh task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = refresh(adaptor.as_ref(), &known, &tx).await {
                            warn!("Discovery listing failed: {}", e);
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    async fn next(&self) -> Option<MembershipEvent> {
        tokio::select! {
            () = self.shutdown.cancelled() => None,
            event = self.queue.next() => event,
        }
    }
}

/// Lists backends by resolving a DNS name; one node per resolved address.
#[derive(Clone, Debug)]
pub struct DnsAdaptor {
    host: String,
    port: u16,
}

impl DnsAdaptor {
    /// Resolve `host` and use `port` for every address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl DiscoveryAdaptor for DnsAdaptor {
    async fn list_nodes(&self) -> Result<Vec<BackendNode>, DiscoveryError> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| DiscoveryError::Source(format!("failed to resolve {}: {e}", self.host)))?;

        Ok(addrs.map(BackendNode::from).collect())
    }
}
