//! Simulated backends for load testing without real emitters

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use firehose_discovery::{BackendNode, StaticDiscovery};
use firehose_envelope::{Envelope, LogMessage, MessageType, Payload};
use firehose_transport_memory::MemoryNetwork;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STRUCTURED_LINE: &str = r#"{"@timestamp":"2017-07-18T22:48:59.763Z","class":"com.example.SubsystemListener","file":"SubsystemListener.java","level":"INFO","line_number":"101","method":"spawnHandler","source_host":"1ajkpfgpagq"}"#;

const ACCESS_LINE: &str = r#"127.0.0.1 - - [29/Apr/2017:17:52:57.962 -0700] "GET /static/js/i18n.js HTTP/1.1" 200 61117 "http://localhost:8000/account/login" "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_4)" "#;

/// Port of the first simulated node; the rest count up from here
pub const BASE_PORT: u16 = 8082;

/// Most nodes that fit above [`BASE_PORT`]
pub const MAX_NODES: usize = (u16::MAX - BASE_PORT) as usize + 1;

/// Port of the simulated node at `index`, if it fits
#[must_use]
pub fn node_port(index: usize) -> Option<u16> {
    u16::try_from(index).ok().and_then(|i| BASE_PORT.checked_add(i))
}

/// Shape and size of generated log lines
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSize {
    /// Structured JSON, about 256 bytes
    #[default]
    S256byte,
    /// Structured JSON, about 1 KiB
    S1kbyte,
    /// Plain access log, about 256 bytes
    Uns256byte,
    /// Plain access log, about 1 KiB
    Uns1kbyte,
}

impl MessageSize {
    const fn target_len(self) -> usize {
        match self {
            Self::S256byte | Self::Uns256byte => 256,
            Self::S1kbyte | Self::Uns1kbyte => 1024,
        }
    }

    /// A log line of this shape and size
    #[must_use]
    pub fn message(self) -> Bytes {
        let seed = match self {
            Self::S256byte | Self::S1kbyte => STRUCTURED_LINE,
            Self::Uns256byte | Self::Uns1kbyte => ACCESS_LINE,
        };
        let target = self.target_len();
        let line: String = seed.chars().cycle().take(target).collect();
        Bytes::from(line)
    }
}

/// Template envelope a simulated node emits
#[must_use]
pub fn template(size: MessageSize, node_index: usize) -> Envelope {
    Envelope {
        origin: "firehose".to_string(),
        timestamp: 0,
        deployment: "cf".to_string(),
        job: "diego_cell".to_string(),
        index: node_index.to_string(),
        ip: "127.0.0.1".to_string(),
        tags: BTreeMap::from([("firehose".to_string(), "data-gen-simulator".to_string())]),
        payload: Payload::LogMessage(LogMessage {
            message: size.message(),
            message_type: MessageType::Out,
            timestamp: 0,
            app_id: Some("simulated-app".to_string()),
            source_type: Some("APP/PROC/WEB".to_string()),
            source_instance: Some("0".to_string()),
        }),
    }
}

/// In-process backends with running generators
pub struct Simulation {
    /// Network the memory transport dials into
    pub network: MemoryNetwork,
    /// Discovery feed announcing the simulated nodes
    pub discovery: StaticDiscovery,
    /// Generator tasks, one per node
    pub generators: Vec<JoinHandle<()>>,
}

/// Start `nodes` simulated backends emitting every `interval` until
/// `shutdown` fires
#[must_use]
pub fn start(
    nodes: usize,
    size: MessageSize,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Simulation {
    let network = MemoryNetwork::new();
    let mut members = Vec::with_capacity(nodes);
    let mut generators = Vec::with_capacity(nodes);

    for index in 0..nodes {
        let Some(port) = node_port(index) else {
            warn!("Only {} simulated backends fit the port range", index);
            break;
        };
        let node = BackendNode::new("simulated", port);
        let backend = network.add_node(node.clone());
        generators.push(backend.spawn_generator(
            template(size, index),
            interval,
            shutdown.clone(),
        ));
        members.push(node);
    }

    info!(
        "Started {} simulated backends ({:?} every {:?})",
        nodes, size, interval
    );

    Simulation {
        network,
        discovery: StaticDiscovery::new(members),
        generators,
    }
}
