//! In-memory transport implementation for testing
//!
//! Backend nodes live inside the process as [`MemoryBackend`]s registered on a
//! [`MemoryNetwork`]. They hand out envelopes with the same shard semantics a
//! real backend has: subscribers sharing a non-empty shard id split the
//! output, every other subscriber gets its own copy.
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use firehose_discovery::BackendNode;
use firehose_envelope::{EncodedEnvelope, Envelope};
use firehose_transport::{
    Connection, EnvelopeStream, SubscriptionRequest, Transport, TransportError,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Buffered envelopes per subscriber; beyond this `emit` sheds
pub const SUBSCRIBER_BUFFER: usize = 1024;

type EnvelopeSender = flume::Sender<Result<EncodedEnvelope, TransportError>>;

/// Registry of in-process backend nodes
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<BackendNode, MemoryBackend>>,
    connect_attempts: Arc<DashMap<BackendNode, u64>>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend for `node`, replacing any previous one
    pub fn add_node(&self, node: BackendNode) -> MemoryBackend {
        let backend = MemoryBackend::new(node.clone());
        if let Some(previous) = self.nodes.insert(node.clone(), backend.clone()) {
            previous.shutdown();
        }
        info!("Memory backend registered for {}", node);
        backend
    }

    /// Take a backend away; its open subscriptions end
    pub fn remove_node(&self, node: &BackendNode) -> bool {
        match self.nodes.remove(node) {
            Some((_, backend)) => {
                backend.shutdown();
                info!("Memory backend removed for {}", node);
                true
            }
            None => false,
        }
    }

    /// The backend registered for `node`
    #[must_use]
    pub fn backend(&self, node: &BackendNode) -> Option<MemoryBackend> {
        self.nodes.get(node).map(|b| b.clone())
    }

    /// Number of connect calls made against `node`
    #[must_use]
    pub fn connect_attempts(&self, node: &BackendNode) -> u64 {
        self.connect_attempts.get(node).map_or(0, |n| *n)
    }
}

/// Subscriber registered on a backend
#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: EnvelopeSender,
    app_id: Option<String>,
}

impl Subscriber {
    fn wants(&self, envelope: &Envelope) -> bool {
        match &self.app_id {
            Some(app_id) => envelope.payload.app_id() == Some(app_id.as_str()),
            None => true,
        }
    }
}

/// Subscribers sharing one shard id
#[derive(Debug, Default)]
struct ShardGroup {
    members: Vec<Subscriber>,
    next: usize,
}

impl ShardGroup {
    /// Pick the next live member that wants the envelope, round robin
    fn pick(&mut self, envelope: &Envelope) -> Option<EnvelopeSender> {
        self.members.retain(|m| !m.tx.is_disconnected());
        let len = self.members.len();
        for offset in 0..len {
            let index = (self.next + offset) % len;
            if self.members[index].wants(envelope) {
                self.next = (index + 1) % len;
                return Some(self.members[index].tx.clone());
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    independent: Vec<Subscriber>,
    shards: HashMap<String, ShardGroup>,
}

impl Subscribers {
    fn prune(&mut self) {
        self.independent.retain(|s| !s.tx.is_disconnected());
        for group in self.shards.values_mut() {
            group.members.retain(|m| !m.tx.is_disconnected());
        }
        self.shards.retain(|_, group| !group.members.is_empty());
    }

    fn count(&self) -> usize {
        self.independent.len() + self.shards.values().map(|g| g.members.len()).sum::<usize>()
    }
}

#[derive(Debug)]
struct BackendInner {
    node: BackendNode,
    subscribers: Mutex<Subscribers>,
    reachable: AtomicBool,
    closed: CancellationToken,
    next_subscriber_id: AtomicU64,
    dropped: AtomicU64,
}

/// One in-process backend node
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    fn new(node: BackendNode) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                node,
                subscribers: Mutex::new(Subscribers::default()),
                reachable: AtomicBool::new(true),
                closed: CancellationToken::new(),
                next_subscriber_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// The node this backend serves as
    #[must_use]
    pub fn node(&self) -> &BackendNode {
        &self.inner.node
    }

    /// Make new connects fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Release);
    }

    /// Number of subscriptions still attached
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.prune();
        subscribers.count()
    }

    /// Whether the backend has been removed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Envelopes shed because a subscriber's buffer was full
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Acquire)
    }

    /// Publish one envelope to the current subscribers.
    ///
    /// Never waits: a subscriber whose buffer is full misses the envelope, so
    /// one slow reader cannot hold up the others. Returns how many
    /// subscribers it was handed to.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or the backend was
    /// removed.
    pub fn emit(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let encoded = EncodedEnvelope::from_envelope(envelope)?;

        let targets: Vec<EnvelopeSender> = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.prune();

            let mut targets: Vec<EnvelopeSender> = subscribers
                .independent
                .iter()
                .filter(|s| s.wants(envelope))
                .map(|s| s.tx.clone())
                .collect();
            targets.extend(
                subscribers
                    .shards
                    .values_mut()
                    .filter_map(|group| group.pick(envelope)),
            );
            targets
        };

        let mut delivered = 0;
        for tx in targets {
            match tx.try_send(Ok(encoded.clone())) {
                Ok(()) => delivered += 1,
                Err(flume::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::AcqRel);
                    trace!(
                        "Memory backend {} shed an envelope for a slow subscriber",
                        self.inner.node
                    );
                }
                Err(flume::TrySendError::Disconnected(_)) => {}
            }
        }

        debug!(
            "Memory backend {} emitted {} to {} subscribers",
            self.inner.node,
            envelope.kind(),
            delivered
        );

        Ok(delivered)
    }

    /// Emit copies of `template` every `interval` until `shutdown` fires or
    /// the backend is removed. Each copy gets the current time.
    pub fn spawn_generator(
        &self,
        template: Envelope,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = backend.inner.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut envelope = template.clone();
                        envelope.timestamp = now_nanos();
                        if let Err(e) = backend.emit(&envelope) {
                            debug!("Generator on {} stopped: {}", backend.node(), e);
                            break;
                        }
                    }
                }
            }
        })
    }

    fn subscribe(&self, request: &SubscriptionRequest) -> Result<EnvelopeStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (tx, rx) = flume::bounded(SUBSCRIBER_BUFFER);
        let subscriber = Subscriber {
            id: self.inner.next_subscriber_id.fetch_add(1, Ordering::AcqRel),
            tx,
            app_id: request.app_id.clone(),
        };

        debug!(
            "Memory backend {} subscriber {} (shard '{}')",
            self.inner.node, subscriber.id, request.shard_id
        );

        {
            let mut subscribers = self.inner.subscribers.lock();
            if request.shard_id.is_empty() {
                subscribers.independent.push(subscriber);
            } else {
                subscribers
                    .shards
                    .entry(request.shard_id.clone())
                    .or_default()
                    .members
                    .push(subscriber);
            }
        }

        Ok(rx.into_stream().boxed())
    }

    fn shutdown(&self) {
        self.inner.closed.cancel();
        // Dropping the senders ends every open stream.
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.independent.clear();
        subscribers.shards.clear();
    }
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Memory transport implementation
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Create a transport dialing nodes on `network`
    #[must_use]
    pub const fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, node: &BackendNode) -> Result<Box<dyn Connection>, TransportError> {
        *self
            .network
            .connect_attempts
            .entry(node.clone())
            .or_insert(0) += 1;

        debug!("Connecting to memory node {}", node);

        let backend = self.network.backend(node).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("no memory backend for {node}"))
        })?;

        if !backend.inner.reachable.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionFailed(format!(
                "memory backend {node} unreachable"
            )));
        }

        Ok(Box::new(MemoryConnection {
            backend,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Memory connection implementation
#[derive(Debug)]
struct MemoryConnection {
    backend: MemoryBackend,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<EnvelopeStream, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.backend.subscribe(request)
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.backend.is_closed()
    }

    async fn close(&self) {
        debug!("Closing memory connection to {}", self.backend.node());
        self.closed.store(true, Ordering::Release);
    }
}
