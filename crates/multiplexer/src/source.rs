//! Per-backend sources and the task that keeps them in step with the pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use firehose_discovery::BackendNode;
use firehose_pool::{BackendPool, ConnectionHandle, PoolError, UnavailableCause};
use firehose_transport::{EnvelopeStream, SubscriptionRequest, Transport, TransportError};
use futures::StreamExt;
use futures::future::join_all;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::Delivery;

/// Why a source task returned
#[derive(Debug)]
pub(crate) enum SourceEnd {
    Cancelled,
    NodeRemoved,
    ReceiverGone,
    Finished,
    Failed(TransportError),
}

/// Open one subscription on `node`
pub(crate) async fn open_source<T>(
    pool: &BackendPool<T>,
    node: &BackendNode,
    request: &SubscriptionRequest,
) -> Result<(ConnectionHandle, EnvelopeStream), PoolError>
where
    T: Transport + 'static,
{
    let handle = pool.acquire(node).await?;

    // Opening the stream is where most transports really dial.
    let dial_timeout = pool.config().dial_timeout;
    let cause = match timeout(dial_timeout, handle.subscribe(request)).await {
        Ok(Ok(stream)) => return Ok((handle, stream)),
        Ok(Err(e)) => UnavailableCause::Dial(e.to_string()),
        Err(_) => UnavailableCause::Timeout(dial_timeout),
    };
    pool.record_failure(&handle, &cause).await;

    Err(PoolError::ConnectionUnavailable {
        node: Box::new(node.clone()),
        cause,
    })
}

/// Log a failed open at a level matching how noteworthy it is
pub(crate) fn log_open_failure(node: &BackendNode, error: &PoolError) {
    match error {
        PoolError::ConnectionUnavailable {
            cause: UnavailableCause::BackingOff(_),
            ..
        } => debug!(node = %node, "Skipping backend: {}", error),
        PoolError::NotMember(_) => debug!(node = %node, "Backend left before subscribing"),
        _ => warn!(node = %node, "Skipping backend: {}", error),
    }
}

/// Forward one backend's envelopes until it ends or is told to stop
async fn pump(
    mut stream: EnvelopeStream,
    removed: CancellationToken,
    tx: flume::Sender<Delivery>,
    cancel: CancellationToken,
) -> SourceEnd {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return SourceEnd::Cancelled,
            () = removed.cancelled() => return SourceEnd::NodeRemoved,
            item = stream.next() => item,
        };

        let envelope = match item {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => return SourceEnd::Failed(e),
            None => return SourceEnd::Finished,
        };

        let delivery = Delivery {
            removed: removed.clone(),
            envelope,
        };
        // Waiting here is the backpressure from a slow client.
        tokio::select! {
            () = cancel.cancelled() => return SourceEnd::Cancelled,
            sent = tx.send_async(delivery) => {
                if sent.is_err() {
                    return SourceEnd::ReceiverGone;
                }
            }
        }
    }
}

struct ActiveSource {
    id: u64,
    cancel: CancellationToken,
}

/// The set of running sources of one merged stream
pub(crate) struct SourceSet {
    tasks: JoinSet<(BackendNode, u64, SourceEnd)>,
    active: HashMap<BackendNode, ActiveSource>,
    next_id: u64,
    tx: flume::Sender<Delivery>,
    cancel: CancellationToken,
}

impl SourceSet {
    pub(crate) fn new(tx: flume::Sender<Delivery>, cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            active: HashMap::new(),
            next_id: 0,
            tx,
            cancel,
        }
    }

    pub(crate) fn spawn(&mut self, handle: &ConnectionHandle, stream: EnvelopeStream) {
        let node = handle.node().clone();
        let id = self.next_id;
        self.next_id += 1;

        let cancel = self.cancel.child_token();
        self.active.insert(
            node.clone(),
            ActiveSource {
                id,
                cancel: cancel.clone(),
            },
        );

        let removed = handle.removed().clone();
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let end = pump(stream, removed, tx, cancel).await;
            (node, id, end)
        });
    }

    fn finished(&mut self, node: BackendNode, id: u64, end: SourceEnd) {
        if self.active.get(&node).is_some_and(|source| source.id == id) {
            self.active.remove(&node);
        }
        match end {
            SourceEnd::Failed(e) => warn!(node = %node, "Backend stream failed: {}", e),
            SourceEnd::Finished => info!(node = %node, "Backend stream ended"),
            SourceEnd::NodeRemoved => debug!(node = %node, "Source stopped, backend removed"),
            SourceEnd::Cancelled | SourceEnd::ReceiverGone => {}
        }
    }

    /// Stop sources for nodes missing from `members` and list the members
    /// without a source
    fn diff(&mut self, members: &[BackendNode]) -> Vec<BackendNode> {
        self.active.retain(|node, source| {
            let keep = members.binary_search(node).is_ok();
            if !keep {
                debug!(node = %node, "Stopping source for departed backend");
                source.cancel.cancel();
            }
            keep
        });

        members
            .iter()
            .filter(|node| !self.active.contains_key(*node))
            .cloned()
            .collect()
    }
}

/// Settings the supervisor runs with
pub(crate) struct Supervision<T>
where
    T: Transport,
{
    pub(crate) pool: Arc<BackendPool<T>>,
    pub(crate) request: SubscriptionRequest,
    pub(crate) reconcile_interval: Duration,
    pub(crate) close_grace: Duration,
}

/// Keep `sources` matched to the pool until the stream is cancelled, then
/// give the sources `close_grace` to stop before aborting them.
pub(crate) async fn supervise<T>(
    supervision: Supervision<T>,
    mut sources: SourceSet,
    cancel: CancellationToken,
) where
    T: Transport + 'static,
{
    let Supervision {
        pool,
        request,
        reconcile_interval,
        close_grace,
    } = supervision;

    let mut ticker = tokio::time::interval(reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial snapshot was just opened.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(joined) = sources.tasks.join_next(), if !sources.tasks.is_empty() => {
                match joined {
                    Ok((node, id, end)) => sources.finished(node, id, end),
                    Err(e) => warn!("Source task failed: {}", e),
                }
            }
            _ = ticker.tick() => {
                let members = pool.snapshot();
                let missing = sources.diff(&members);
                if missing.is_empty() {
                    continue;
                }

                debug!(shard_id = %request.shard_id, "Opening {} new sources", missing.len());
                let opened = tokio::select! {
                    () = cancel.cancelled() => break,
                    opened = join_all(
                        missing.iter().map(|node| open_source(&pool, node, &request)),
                    ) => opened,
                };
                for (node, result) in missing.iter().zip(opened) {
                    match result {
                        Ok((handle, stream)) => {
                            info!(node = %node, shard_id = %request.shard_id, "Source added");
                            sources.spawn(&handle, stream);
                        }
                        Err(e) => log_open_failure(node, &e),
                    }
                }
            }
        }
    }

    let drained = tokio::time::timeout(close_grace, async {
        while sources.tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} sources still running after {:?}, aborting",
            sources.tasks.len(),
            close_grace
        );
        sources.tasks.abort_all();
    }
    debug!(shard_id = %request.shard_id, "Subscription supervisor stopped");
}
