//! Configuration module for the telemetry relay.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Device identity and tick scheduling
//! - Offline queue location, capacity and drain batching
//! - Delivery timeouts and drain backoff
//! - Network attachment source and the trusted medium
//! - Broker targets, TLS/identity trust, reconnect backoff, keep-alive, discovery

mod app;
mod broker;
mod validation;

pub use app::{
    AppConfig, DeliveryConfig, DeviceConfig, NetworkConfig, NetworkSourceConfig, QueueConfig,
    SchedulerConfig,
};
pub use broker::{
    BackoffConfig, BrokerConfig, DiscoveryConfig, IdentityConfig, KeepaliveConfig, TargetConfig,
    TlsConfig,
};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{DEFAULT_CATCH_UP_CAP, DEFAULT_PERIOD};
