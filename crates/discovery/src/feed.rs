//! The discovery feed consumed by the backend pool

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{BackendNode, DiscoveryError, MembershipEvent};

/// A lazy, non-restartable sequence of membership changes.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Begin producing events
    async fn start(&self) -> Result<(), DiscoveryError>;

    /// Wait for the next event.
    ///
    /// Returns `None` once the feed has ended; it never restarts after that.
    async fn next(&self) -> Option<MembershipEvent>;
}

/// Queue shared by the feed implementations
#[derive(Debug)]
pub(crate) struct EventQueue {
    tx: flume::Sender<MembershipEvent>,
    rx: flume::Receiver<MembershipEvent>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> flume::Sender<MembershipEvent> {
        self.tx.clone()
    }

    pub(crate) async fn next(&self) -> Option<MembershipEvent> {
        self.rx.recv_async().await.ok()
    }
}

/// Feed over a fixed list of backend addresses.
///
/// Emits one `Added` per address after `start` and then stays pending.
#[derive(Debug)]
pub struct StaticDiscovery {
    nodes: Vec<BackendNode>,
    queue: EventQueue,
    started: AtomicBool,
}

impl StaticDiscovery {
    /// Create a feed over the given nodes
    #[must_use]
    pub fn new(nodes: Vec<BackendNode>) -> Self {
        Self {
            nodes,
            queue: EventQueue::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Create a feed by parsing `host:port` addresses
    ///
    /// # Errors
    ///
    /// Returns an error if any address does not parse.
    pub fn from_addrs<S: AsRef<str>>(addrs: &[S]) -> Result<Self, DiscoveryError> {
        let nodes = addrs
            .iter()
            .map(|addr| addr.as_ref().parse())
            .collect::<Result<Vec<BackendNode>, _>>()?;
        Ok(Self::new(nodes))
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        info!("Starting static discovery with {} nodes", self.nodes.len());

        let tx = self.queue.sender();
        for node in &self.nodes {
            debug!("Static backend {}", node);
            // The queue owns a receiver, so this cannot fail.
            let _ = tx.send(MembershipEvent::Added(node.clone()));
        }

        Ok(())
    }

    async fn next(&self) -> Option<MembershipEvent> {
        self.queue.next().await
    }
}

/// Feed driven by hand through a [`DiscoveryHandle`].
#[derive(Debug)]
pub struct ChannelDiscovery {
    rx: flume::Receiver<MembershipEvent>,
}

/// Sending side of a [`ChannelDiscovery`]
#[derive(Clone, Debug)]
pub struct DiscoveryHandle {
    tx: flume::Sender<MembershipEvent>,
}

impl ChannelDiscovery {
    /// Create a feed and the handle that drives it
    #[must_use]
    pub fn new() -> (Self, DiscoveryHandle) {
        let (tx, rx) = flume::unbounded();
        (Self { rx }, DiscoveryHandle { tx })
    }
}

#[async_trait]
impl Discovery for ChannelDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn next(&self) -> Option<MembershipEvent> {
        self.rx.recv_async().await.ok()
    }
}

impl DiscoveryHandle {
    /// Announce a node
    pub fn add(&self, node: BackendNode) {
        let _ = self.tx.send(MembershipEvent::Added(node));
    }

    /// Withdraw a node
    pub fn remove(&self, node: BackendNode) {
        let _ = self.tx.send(MembershipEvent::Removed(node));
    }
}
