//! Backend membership discovery for the firehose gateway
//!
//! This crate provides:
//! - Backend node identity (`BackendNode`)
//! - Membership change events
//! - Static, polling (DNS) and hand-driven discovery feeds
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod feed;
pub mod node;
pub mod polling;

pub use error::DiscoveryError;
pub use feed::{ChannelDiscovery, Discovery, DiscoveryHandle, StaticDiscovery};
pub use node::{BackendNode, MembershipEvent};
pub use polling::{DnsAdaptor, DiscoveryAdaptor, PollingDiscovery, PollingDiscoveryConfig};
