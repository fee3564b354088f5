//! Telemetry envelopes and the filters applied to them.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod envelope;
mod error;
mod filter;

pub use envelope::{
    ContainerMetric, CounterEvent, EncodedEnvelope, Envelope, EnvelopeKind, ErrorEvent,
    HttpStartStop, LogMessage, MessageType, Payload, ValueMetric,
};
pub use error::EnvelopeError;
pub use filter::Filter;
