//! Telemetry Relay - Resilient Telemetry Delivery
//!
//! Produces one telemetry record per fixed tick and delivers it to one or
//! more MQTT brokers. Whatever cannot be delivered live is kept in a durable
//! offline queue and drained once a trusted network and a verified broker
//! are available again.
//!
//! # Architecture
//!
//! - **Scheduler**: drift-free ticks, catch-up with synthesized placeholders
//! - **Dispatch**: live publish or offline routing, drain loop, delivery metrics
//! - **Queue**: JSON-lines store with bounded size and stats reconciliation
//! - **Broker**: per-target links, backoff, TLS pinning, identity verification
//! - **Status**: last-value broadcast for local observers
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use telemetry_relay::{AppConfig, MqttTransport, RelayService, ServiceDeps, SimulatedSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("configs/relay.yaml")?;
//!     let deps = ServiceDeps::new(Arc::new(SimulatedSource::default()), Arc::new(MqttTransport::new()));
//!     let service = RelayService::start(config, deps).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod telemetry;

pub use broker::{ConnectionManager, MemoryTransport, MqttTransport};
pub use config::{AppConfig, ConfigError};
pub use dispatch::{DeliveryMetrics, Dispatcher, DrainLoop};
pub use queue::{OfflineQueue, QueueBuilder, QueueStats};
pub use scheduler::TickScheduler;
pub use service::{RelayService, ServiceDeps, ServiceError};
pub use status::{StatusSink, StatusSnapshot};
pub use telemetry::{SimulatedSource, SnapshotSource, TelemetryRecord};
