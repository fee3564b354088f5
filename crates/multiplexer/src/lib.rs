//! Subscription multiplexer
//!
//! Fans one client subscription out to every backend in the pool and fans the
//! per-backend envelope streams back into a single [`MergedStream`]. A
//! background supervisor per stream re-reads the pool on a fixed interval,
//! subscribing to nodes that joined and dropping nodes that left. The number
//! of simultaneously open streams is capped process-wide.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod source;
mod stream;

pub use error::{MultiplexerError, StreamError};
pub use stream::MergedStream;

use std::sync::Arc;
use std::time::Duration;

use firehose_pool::BackendPool;
use firehose_transport::{SubscriptionRequest, Transport};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{SourceSet, Supervision, log_open_failure, open_source, supervise};

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Ceiling on simultaneously open merged streams
    pub max_concurrent_subscriptions: usize,
    /// How often each stream re-reads pool membership
    pub reconcile_interval: Duration,
    /// Envelopes buffered per stream between sources and the reader
    pub buffer_size: usize,
    /// Time sources get to stop after close before they are aborted
    pub close_grace: Duration,
    /// Fail a subscription when the pool has members but none accepted it
    pub require_backend: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscriptions: 1000,
            reconcile_interval: Duration::from_secs(1),
            buffer_size: 100,
            close_grace: Duration::from_secs(1),
            require_backend: false,
        }
    }
}

/// Opens merged subscriptions over a shared backend pool
pub struct Multiplexer<T>
where
    T: Transport,
{
    pool: Arc<BackendPool<T>>,
    slots: Arc<Semaphore>,
    config: MultiplexerConfig,
}

impl<T> Multiplexer<T>
where
    T: Transport + 'static,
{
    /// Create a multiplexer over `pool`
    pub fn new(pool: Arc<BackendPool<T>>, config: MultiplexerConfig) -> Self {
        Self {
            pool,
            slots: Arc::new(Semaphore::new(config.max_concurrent_subscriptions)),
            config,
        }
    }

    /// The backing pool
    pub const fn pool(&self) -> &Arc<BackendPool<T>> {
        &self.pool
    }

    /// Multiplexer settings
    pub const fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Number of merged streams currently holding a slot
    pub fn open_subscriptions(&self) -> usize {
        self.config
            .max_concurrent_subscriptions
            .saturating_sub(self.slots.available_permits())
    }

    /// Open a merged subscription
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_cancellation`](Self::subscribe_with_cancellation).
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<MergedStream, MultiplexerError> {
        self.subscribe_with_cancellation(request, &CancellationToken::new())
            .await
    }

    /// Open a merged subscription that also closes when `parent` is cancelled
    ///
    /// Nodes that fail to open are skipped and retried at the next
    /// reconciliation. An empty pool yields an open stream that starts
    /// producing once nodes join.
    ///
    /// # Errors
    ///
    /// [`MultiplexerError::CapacityExceeded`] when the ceiling is reached.
    /// With `require_backend` set, [`MultiplexerError::ConnectionUnavailable`]
    /// when the pool has members and all of them failed.
    pub async fn subscribe_with_cancellation(
        &self,
        request: SubscriptionRequest,
        parent: &CancellationToken,
    ) -> Result<MergedStream, MultiplexerError> {
        let limit = self.config.max_concurrent_subscriptions;
        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            debug!(limit, "Rejecting subscription, capacity reached");
            MultiplexerError::CapacityExceeded { limit }
        })?;

        let cancel = parent.child_token();
        let (tx, rx) = flume::bounded(self.config.buffer_size);
        let mut sources = SourceSet::new(tx, cancel.clone());

        let members = self.pool.snapshot();
        let opened = join_all(
            members
                .iter()
                .map(|node| open_source(&self.pool, node, &request)),
        )
        .await;

        let mut accepted = 0usize;
        for (node, result) in members.iter().zip(opened) {
            match result {
                Ok((handle, stream)) => {
                    sources.spawn(&handle, stream);
                    accepted += 1;
                }
                Err(e) => log_open_failure(node, &e),
            }
        }

        if accepted == 0 && !members.is_empty() {
            if self.config.require_backend {
                cancel.cancel();
                warn!(
                    shard_id = %request.shard_id,
                    "All {} backends refused the subscription",
                    members.len()
                );
                return Err(MultiplexerError::ConnectionUnavailable {
                    attempted: members.len(),
                });
            }
            warn!(
                shard_id = %request.shard_id,
                "No backend accepted the subscription yet, retrying on reconciliation"
            );
        }

        info!(
            shard_id = %request.shard_id,
            filter = %request.filter,
            "Subscription opened on {}/{} backends",
            accepted,
            members.len()
        );

        let filter = request.filter;
        let supervision = Supervision {
            pool: self.pool.clone(),
            request,
            reconcile_interval: self.config.reconcile_interval,
            close_grace: self.config.close_grace,
        };
        tokio::spawn(supervise(supervision, sources, cancel.clone()));

        Ok(MergedStream::new(rx, filter, cancel, permit))
    }
}
