//! Client side of a merged subscription

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use firehose_envelope::{EncodedEnvelope, Filter};
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::StreamError;

/// One envelope in flight from a backend source
pub(crate) struct Delivery {
    /// Cancelled once the source node left the pool
    pub(crate) removed: CancellationToken,
    pub(crate) envelope: EncodedEnvelope,
}

/// Fan-in of every backend source opened for one subscription.
///
/// Envelopes are yielded in arrival order. Order is kept per backend; there
/// is no ordering across backends. Dropping the stream closes it.
pub struct MergedStream {
    rx: flume::Receiver<Delivery>,
    filter: Filter,
    cancel: CancellationToken,
    closed: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MergedStream {
    pub(crate) fn new(
        rx: flume::Receiver<Delivery>,
        filter: Filter,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            rx,
            filter,
            cancel,
            closed: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Wait for the next envelope that passes the filter
    ///
    /// Cancel safe: dropping the future loses nothing.
    ///
    /// # Errors
    ///
    /// [`StreamError::Closed`] once [`close`](Self::close) was called,
    /// [`StreamError::Terminated`] if every source is gone for good.
    pub async fn next(&self) -> Result<Bytes, StreamError> {
        loop {
            let delivery = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StreamError::Closed),
                delivery = self.rx.recv_async() => {
                    delivery.map_err(|_| StreamError::Terminated)?
                }
            };

            if delivery.removed.is_cancelled() {
                trace!("Discarding envelope from removed backend");
                continue;
            }
            if !self.filter.keeps(&delivery.envelope) {
                continue;
            }
            return Ok(delivery.envelope.into_bytes());
        }
    }

    /// Cancel every backend source and release the subscription slot
    ///
    /// Idempotent, and safe to call while a [`next`](Self::next) is pending.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        drop(self.permit.lock().take());
        debug!("Merged stream closed");
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Filter applied to this stream
    #[must_use]
    pub const fn filter(&self) -> Filter {
        self.filter
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MergedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedStream")
            .field("filter", &self.filter)
            .field("closed", &self.is_closed())
            .field("buffered", &self.rx.len())
            .finish_non_exhaustive()
    }
}
