//! Backend pool
//!
//! Tracks the current backend membership and lazily opens one reusable
//! transport connection per member. Membership changes arrive as discovery
//! events through [`BackendPool::reconcile`]; readers take a point-in-time
//! [`BackendPool::snapshot`] without blocking the reconciler.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::{PoolError, PoolResult, UnavailableCause};

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use firehose_discovery::{BackendNode, Discovery, MembershipEvent};
use firehose_transport::{Connection, EnvelopeStream, SubscriptionRequest, Transport, TransportError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the backend pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on a single dial
    pub dial_timeout: Duration,
    /// Backoff after the first failed dial
    pub backoff_initial: Duration,
    /// Ceiling for the doubling backoff
    pub backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Backoff to apply after `failures` consecutive failed dials
    #[must_use]
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_initial
            .saturating_mul(1 << exponent)
            .min(self.backoff_max)
    }
}

#[derive(Default)]
struct SlotState {
    connection: Option<Arc<dyn Connection>>,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Per-member bookkeeping. The mutex serializes dials to one node.
struct NodeSlot {
    state: Mutex<SlotState>,
    removed: CancellationToken,
}

impl NodeSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            removed: CancellationToken::new(),
        }
    }
}

/// A usable connection to one member, handed out by [`BackendPool::acquire`]
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    node: BackendNode,
    connection: Arc<dyn Connection>,
    removed: CancellationToken,
}

impl ConnectionHandle {
    /// The node this connection reaches
    #[must_use]
    pub const fn node(&self) -> &BackendNode {
        &self.node
    }

    /// Open a subscription over the pooled connection
    ///
    /// # Errors
    ///
    /// Returns the transport error if the backend refuses the subscription.
    pub async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<EnvelopeStream, TransportError> {
        self.connection.subscribe(request).await
    }

    /// Cancelled once the node leaves the pool
    #[must_use]
    pub const fn removed(&self) -> &CancellationToken {
        &self.removed
    }

    /// Whether the node has left the pool
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.is_cancelled()
    }
}

fn handle(node: &BackendNode, connection: Arc<dyn Connection>, slot: &NodeSlot) -> ConnectionHandle {
    ConnectionHandle {
        node: node.clone(),
        connection,
        removed: slot.removed.clone(),
    }
}

/// Take the cached connection if it is the one `handle` holds
fn take_if_current(
    state: &mut SlotState,
    handle: &ConnectionHandle,
) -> Option<Arc<dyn Connection>> {
    let current = state
        .connection
        .as_ref()
        .is_some_and(|connection| Arc::ptr_eq(connection, &handle.connection));
    if current { state.connection.take() } else { None }
}

/// The set of backend nodes currently eligible to serve subscriptions
pub struct BackendPool<T>
where
    T: Transport,
{
    transport: Arc<T>,
    /// Sorted membership, replaced wholesale on every change
    members: ArcSwap<Vec<BackendNode>>,
    slots: DashMap<BackendNode, Arc<NodeSlot>>,
    /// Serializes membership mutation
    membership_lock: parking_lot::Mutex<()>,
    config: PoolConfig,
}

impl<T> BackendPool<T>
where
    T: Transport + 'static,
{
    /// Create an empty pool
    pub fn new(transport: Arc<T>, config: PoolConfig) -> Self {
        Self {
            transport,
            members: ArcSwap::from_pointee(Vec::new()),
            slots: DashMap::new(),
            membership_lock: parking_lot::Mutex::new(()),
            config,
        }
    }

    /// Pool configuration
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Apply one membership event
    ///
    /// Adding a present node or removing an absent one is a no-op. Removal
    /// cancels the node's token and closes its cached connection in the
    /// background.
    pub fn reconcile(&self, event: MembershipEvent) {
        let _guard = self.membership_lock.lock();

        match event {
            MembershipEvent::Added(node) => {
                if self.slots.contains_key(&node) {
                    debug!("Backend {} already in pool", node);
                    return;
                }
                self.slots.insert(node.clone(), Arc::new(NodeSlot::new()));
                self.publish_members();
                info!("Backend {} joined pool", node);
            }
            MembershipEvent::Removed(node) => {
                let Some((_, slot)) = self.slots.remove(&node) else {
                    debug!("Backend {} not in pool, ignoring removal", node);
                    return;
                };
                self.publish_members();
                slot.removed.cancel();
                info!("Backend {} left pool", node);

                tokio::spawn(async move {
                    let connection = slot.state.lock().await.connection.take();
                    if let Some(connection) = connection {
                        debug!("Closing connection to removed backend {}", node);
                        connection.close().await;
                    }
                });
            }
        }
    }

    fn publish_members(&self) {
        let mut members: Vec<BackendNode> =
            self.slots.iter().map(|entry| entry.key().clone()).collect();
        members.sort();
        self.members.store(Arc::new(members));
    }

    /// Point-in-time membership
    pub fn snapshot(&self) -> Arc<Vec<BackendNode>> {
        self.members.load_full()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    /// Whether the pool has no members
    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    /// Whether `node` is a member
    pub fn contains(&self, node: &BackendNode) -> bool {
        self.slots.contains_key(node)
    }

    /// Get the connection to `node`, dialing it if needed
    ///
    /// Concurrent callers for the same node share a single dial. After a
    /// failure the node is skipped until its backoff expires.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotMember`] if the node is not in the pool and
    /// [`PoolError::ConnectionUnavailable`] if it cannot be reached.
    pub async fn acquire(&self, node: &BackendNode) -> PoolResult<ConnectionHandle> {
        let slot = self
            .slots
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::NotMember(Box::new(node.clone())))?;

        let mut state = slot.state.lock().await;

        if slot.removed.is_cancelled() {
            return Err(PoolError::NotMember(Box::new(node.clone())));
        }

        if let Some(connection) = &state.connection {
            if connection.is_healthy() {
                return Ok(handle(node, connection.clone(), &slot));
            }
            debug!("Dropping unhealthy connection to {}", node);
            state.connection = None;
        }

        if let Some(retry_at) = state.retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Err(PoolError::ConnectionUnavailable {
                    node: Box::new(node.clone()),
                    cause: UnavailableCause::BackingOff(retry_at - now),
                });
            }
        }

        debug!("Dialing backend {}", node);
        let cause = match timeout(self.config.dial_timeout, self.transport.connect(node)).await {
            Ok(Ok(connection)) => {
                let connection: Arc<dyn Connection> = Arc::from(connection);
                if slot.removed.is_cancelled() {
                    connection.close().await;
                    return Err(PoolError::NotMember(Box::new(node.clone())));
                }
                state.failures = 0;
                state.retry_at = None;
                state.connection = Some(connection.clone());
                return Ok(handle(node, connection, &slot));
            }
            Ok(Err(e)) => UnavailableCause::Dial(e.to_string()),
            Err(_) => UnavailableCause::Timeout(self.config.dial_timeout),
        };

        self.back_off(&mut state, node, &cause);

        Err(PoolError::ConnectionUnavailable {
            node: Box::new(node.clone()),
            cause,
        })
    }

    fn back_off(&self, state: &mut SlotState, node: &BackendNode, cause: &UnavailableCause) {
        state.failures = state.failures.saturating_add(1);
        let backoff = self.config.backoff_for(state.failures);
        state.retry_at = Some(Instant::now() + backoff);
        warn!(
            "Backend {} unavailable ({}), {} consecutive failures, backing off {:?}",
            node, cause, state.failures, backoff
        );
    }

    /// Count a failure that happened on an acquired connection
    ///
    /// Drops the cached connection if it is still `handle`'s and puts the
    /// node in backoff, the same as a failed dial.
    pub async fn record_failure(&self, handle: &ConnectionHandle, cause: &UnavailableCause) {
        let Some(slot) = self.slots.get(&handle.node).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if let Some(connection) = take_if_current(&mut state, handle) {
            connection.close().await;
        }
        self.back_off(&mut state, &handle.node, cause);
    }

    /// Drop the cached connection if it is still `handle`'s
    ///
    /// The next [`acquire`](Self::acquire) dials again.
    pub async fn invalidate(&self, handle: &ConnectionHandle) {
        let Some(slot) = self.slots.get(&handle.node).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if let Some(connection) = take_if_current(&mut state, handle) {
            debug!("Invalidating connection to {}", handle.node);
            connection.close().await;
        }
    }

    /// Drive the pool from a discovery feed until shutdown or the feed ends
    pub fn spawn_reconciler<D>(
        self: &Arc<Self>,
        discovery: Arc<D>,
        shutdown: CancellationToken,
    ) -> JoinHandle<PoolResult<()>>
    where
        D: Discovery + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            discovery.start().await?;
            info!("Backend pool reconciler started");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Backend pool reconciler shutting down");
                        break;
                    }
                    event = discovery.next() => {
                        let Some(event) = event else {
                            info!("Discovery feed ended");
                            break;
                        };
                        pool.reconcile(event);
                    }
                }
            }
            Ok(())
        })
    }
}
