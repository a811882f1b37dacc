//! Broker connection and trust management.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──► BrokerLink (one per target) ──► BrokerTransport
//!        │                   │  LinkState machine            │
//!        │                   │  Backoff                      ├─ MqttTransport (rumqttc)
//!        │                   └─ BrokerIdentity (pin + id)    └─ MemoryTransport
//!        └─ NetworkWatch (trusted medium, identity invalidation)
//! ```
//!
//! Callers never hold a session across a reconnect: links hand out a cloned
//! session only for the duration of one publish.

mod backoff;
mod discovery;
mod error;
mod link;
mod manager;
mod memory;
mod mqtt;
mod network;
mod state;
mod topics;
mod transport;
mod trust;

pub use backoff::Backoff;
pub use discovery::{discover, ipv4_cidr_hosts};
pub use error::{ConnectionError, ErrorClass, TrustError};
pub use link::{BrokerLink, ProbeOutcome};
pub use manager::{ConnectionManager, PublishMode, PublishOutcome, TargetOutcome};
pub use memory::{MemoryBroker, MemorySession, MemoryTransport, PublishedMessage};
pub use mqtt::{MqttSession, MqttTransport};
pub use network::{
    Medium, NetworkAttachment, NetworkWatch, SysfsProbe, spawn_sysfs_monitor, static_network,
};
pub use state::{LinkEvent, LinkState, LinkStatus};
pub use topics::TopicBuilder;
pub use transport::{
    BrokerSession, BrokerTransport, DEFAULT_MQTT_PORT, DEFAULT_MQTTS_PORT, Endpoint, LastWill,
    SessionOptions,
};
pub use trust::{
    BrokerIdentity, CertDigest, PeerObservation, PinnedCertVerifier, build_client_config,
    check_pin, load_roots, parse_identity_announcement, verify_announcement,
};
