//! Prometheus metrics for the gateway

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Client stream class
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Endpoint {
    /// `/firehose/{subscription_id}`
    Firehose,
    /// `/apps/{app_id}/stream`
    App,
}

impl Endpoint {
    /// Label value
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Firehose => "firehose",
            Self::App => "app",
        }
    }
}

/// Why a client was turned away
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// Subscription ceiling reached
    Capacity,
    /// No backend could serve the subscription
    Unavailable,
    /// Token missing or not permitted
    Unauthorized,
}

impl RejectReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Unavailable => "unavailable",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// Gateway metrics, registered in their own registry
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    /// Envelopes delivered to clients
    pub egress: IntCounterVec,
    /// Client streams currently open
    pub open_streams: IntGaugeVec,
    /// Clients rejected before streaming
    pub rejected: IntCounterVec,
}

impl GatewayMetrics {
    /// Create and register the metrics
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let egress = IntCounterVec::new(
            Opts::new(
                "firehose_gateway_egress_total",
                "Envelopes delivered to clients",
            ),
            &["endpoint", "filter"],
        )?;
        let open_streams = IntGaugeVec::new(
            Opts::new("firehose_gateway_open_streams", "Client streams currently open"),
            &["endpoint"],
        )?;
        let rejected = IntCounterVec::new(
            Opts::new(
                "firehose_gateway_rejected_total",
                "Client connections rejected before streaming",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(egress.clone()))?;
        registry.register(Box::new(open_streams.clone()))?;
        registry.register(Box::new(rejected.clone()))?;

        Ok(Self {
            registry,
            egress,
            open_streams,
            rejected,
        })
    }

    /// Current open stream count for `endpoint`
    #[must_use]
    pub fn open_stream_count(&self, endpoint: Endpoint) -> i64 {
        self.open_streams.with_label_values(&[endpoint.as_str()]).get()
    }

    /// Delivered envelope count for `endpoint` and `filter`
    #[must_use]
    pub fn egress_count(&self, endpoint: Endpoint, filter: &str) -> u64 {
        self.egress
            .with_label_values(&[endpoint.as_str(), filter])
            .get()
    }

    /// Record a rejected client
    pub fn reject(&self, reason: RejectReason) {
        self.rejected.with_label_values(&[reason.as_str()]).inc();
    }

    /// Rejections recorded for `reason`
    #[must_use]
    pub fn rejected_count(&self, reason: RejectReason) -> u64 {
        self.rejected.with_label_values(&[reason.as_str()]).get()
    }

    /// Prometheus text exposition of every metric
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
