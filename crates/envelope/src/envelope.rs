//! Telemetry envelope model and CBOR codec.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// One telemetry record emitted by a backend node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    /// Component that produced the record
    pub origin: String,
    /// Nanoseconds since the unix epoch
    pub timestamp: i64,
    /// Deployment the emitting job belongs to
    #[serde(default)]
    pub deployment: String,
    /// Job name of the emitter
    #[serde(default)]
    pub job: String,
    /// Instance index within the job
    #[serde(default)]
    pub index: String,
    /// Address of the emitting instance
    #[serde(default)]
    pub ip: String,
    /// Free-form labels
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// The record body
    pub payload: Payload,
}

/// Payload variants carried by an envelope.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// An application or component log line
    LogMessage(LogMessage),
    /// A named gauge sample
    ValueMetric(ValueMetric),
    /// A counter increment
    CounterEvent(CounterEvent),
    /// Resource usage of one app instance
    ContainerMetric(ContainerMetric),
    /// One completed HTTP request
    HttpStartStop(HttpStartStop),
    /// An error reported by a component
    Error(ErrorEvent),
}

/// Stream a log line was written to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Standard output
    Out,
    /// Standard error
    Err,
}

/// A log line.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogMessage {
    /// Raw line contents
    pub message: Bytes,
    /// Stream the line was written to
    pub message_type: MessageType,
    /// Nanoseconds since the unix epoch
    pub timestamp: i64,
    /// Owning application, if the line came from one
    pub app_id: Option<String>,
    /// Source label such as `APP/PROC/WEB`
    pub source_type: Option<String>,
    /// Instance of the source
    pub source_instance: Option<String>,
}

/// A gauge sample.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ValueMetric {
    /// Metric name
    pub name: String,
    /// Sampled value
    pub value: f64,
    /// Unit of `value`
    pub unit: String,
}

/// A counter increment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CounterEvent {
    /// Counter name
    pub name: String,
    /// Increment since the previous event
    pub delta: u64,
    /// Running total
    pub total: u64,
}

/// Resource usage of one application instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ContainerMetric {
    /// Owning application
    pub application_id: String,
    /// Instance index within the application
    pub instance_index: i32,
    /// CPU usage in percent
    pub cpu_percentage: f64,
    /// Resident memory
    pub memory_bytes: u64,
    /// Disk usage
    pub disk_bytes: u64,
}

/// A completed HTTP request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HttpStartStop {
    /// Request start, nanoseconds since the unix epoch
    pub start_timestamp: i64,
    /// Request end, nanoseconds since the unix epoch
    pub stop_timestamp: i64,
    /// HTTP method
    pub method: String,
    /// Request URI
    pub uri: String,
    /// Response status
    pub status_code: u16,
    /// Application that served the request, if any
    pub application_id: Option<String>,
}

/// An error reported by a component.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorEvent {
    /// Reporting component
    pub source: String,
    /// Component-specific error code
    pub code: i32,
    /// Human-readable description
    pub message: String,
}

/// Discriminant of an envelope's payload.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EnvelopeKind {
    /// [`Payload::LogMessage`]
    LogMessage,
    /// [`Payload::ValueMetric`]
    ValueMetric,
    /// [`Payload::CounterEvent`]
    CounterEvent,
    /// [`Payload::ContainerMetric`]
    ContainerMetric,
    /// [`Payload::HttpStartStop`]
    HttpStartStop,
    /// [`Payload::Error`]
    Error,
}

impl EnvelopeKind {
    /// Whether this kind is a log line
    #[must_use]
    pub const fn is_log(self) -> bool {
        matches!(self, Self::LogMessage)
    }

    /// Whether this kind is a numeric metric sample
    #[must_use]
    pub const fn is_metric(self) -> bool {
        matches!(
            self,
            Self::ValueMetric | Self::CounterEvent | Self::ContainerMetric
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Payload {
    /// The kind of this payload
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::LogMessage(_) => EnvelopeKind::LogMessage,
            Self::ValueMetric(_) => EnvelopeKind::ValueMetric,
            Self::CounterEvent(_) => EnvelopeKind::CounterEvent,
            Self::ContainerMetric(_) => EnvelopeKind::ContainerMetric,
            Self::HttpStartStop(_) => EnvelopeKind::HttpStartStop,
            Self::Error(_) => EnvelopeKind::Error,
        }
    }

    /// Application the payload belongs to, if any
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        match self {
            Self::LogMessage(log) => log.app_id.as_deref(),
            Self::ContainerMetric(metric) => Some(metric.application_id.as_str()),
            Self::HttpStartStop(http) => http.application_id.as_deref(),
            Self::ValueMetric(_) | Self::CounterEvent(_) | Self::Error(_) => None,
        }
    }
}

impl Envelope {
    /// Kind of the carried payload
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// Encode the envelope as CBOR
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode an envelope from CBOR bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::de::from_reader(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

/// An envelope as received from a backend: the exact bytes plus the kind
/// decoded from them.
///
/// The bytes are forwarded to clients untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedEnvelope {
    kind: EnvelopeKind,
    bytes: Bytes,
}

impl EncodedEnvelope {
    /// Inspect received bytes, keeping them as-is
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, EnvelopeError> {
        let kind = Envelope::decode(&bytes)?.kind();
        Ok(Self { kind, bytes })
    }

    /// Encode an envelope
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        Ok(Self {
            kind: envelope.kind(),
            bytes: envelope.encode()?,
        })
    }

    /// Kind of the carried payload
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    /// The encoded bytes
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Take the encoded bytes
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_envelope(app_id: &str) -> Envelope {
        Envelope {
            origin: "rep".to_string(),
            timestamp: 1_500_000_000_000_000_000,
            deployment: "cf".to_string(),
            job: "diego_cell".to_string(),
            index: "0".to_string(),
            ip: "10.0.0.1".to_string(),
            tags: BTreeMap::new(),
            payload: Payload::LogMessage(LogMessage {
                message: Bytes::from_static(b"hello"),
                message_type: MessageType::Out,
                timestamp: 1_500_000_000_000_000_000,
                app_id: Some(app_id.to_string()),
                source_type: Some("APP/PROC/WEB".to_string()),
                source_instance: Some("0".to_string()),
            }),
        }
    }

    #[test]
    fn test_decode_preserves_fields() {
        let envelope = log_envelope("app-1");
        let bytes = envelope.encode().unwrap();

        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload.app_id(), Some("app-1"));
    }

    #[test]
    fn test_encoded_envelope_keeps_exact_bytes() {
        let bytes = log_envelope("app-2").encode().unwrap();

        let encoded = EncodedEnvelope::from_bytes(bytes.clone()).unwrap();
        assert_eq!(encoded.kind(), EnvelopeKind::LogMessage);
        assert_eq!(encoded.into_bytes(), bytes);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = EncodedEnvelope::from_bytes(Bytes::from_static(b"\xff\x00not cbor"));
        assert!(matches!(result, Err(EnvelopeError::Decode(_))));
    }

    #[test]
    fn test_kind_classification() {
        assert!(EnvelopeKind::LogMessage.is_log());
        assert!(!EnvelopeKind::LogMessage.is_metric());
        assert!(EnvelopeKind::ValueMetric.is_metric());
        assert!(EnvelopeKind::CounterEvent.is_metric());
        assert!(EnvelopeKind::ContainerMetric.is_metric());
        assert!(!EnvelopeKind::HttpStartStop.is_metric());
        assert!(!EnvelopeKind::Error.is_log());
    }
}
