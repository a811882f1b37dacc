//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::Medium;
use crate::queue::{DEFAULT_MAX_BYTES, DEFAULT_RECONCILE_EVERY, DEFAULT_SPILL_CAPACITY};

use super::broker::BrokerConfig;
use super::validation::{ConfigError, ensure_min_duration, ensure_topic_level};

// =============================================================================
// Constants
// =============================================================================

/// Default tick period (1 second).
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Default number of ticks executed live after a stall.
pub const DEFAULT_CATCH_UP_CAP: u64 = 35;

/// Smallest tick period accepted.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Default drain batch size.
pub const DEFAULT_DRAIN_BATCH: usize = 50;

/// Default live publish timeout (5 seconds).
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default sysfs polling interval (2 seconds).
pub const DEFAULT_NETWORK_POLL: Duration = Duration::from_secs(2);

fn default_device_id() -> String {
    "relay-device".to_string()
}

fn default_period() -> Duration {
    DEFAULT_PERIOD
}

fn default_catch_up_cap() -> u64 {
    DEFAULT_CATCH_UP_CAP
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/offline_queue.jsonl")
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_spill_capacity() -> usize {
    DEFAULT_SPILL_CAPACITY
}

fn default_drain_batch() -> usize {
    DEFAULT_DRAIN_BATCH
}

fn default_reconcile_every() -> u32 {
    DEFAULT_RECONCILE_EVERY
}

fn default_publish_timeout() -> Duration {
    DEFAULT_PUBLISH_TIMEOUT
}

fn default_drain_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_drain_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_drain_idle() -> Duration {
    Duration::from_secs(30)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_trusted_media() -> Vec<Medium> {
    vec![Medium::Wifi]
}

fn default_network_poll() -> Duration {
    DEFAULT_NETWORK_POLL
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

// =============================================================================
// Device / Scheduler
// =============================================================================

/// Device identity used in records and topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier (default: "relay-device").
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
        }
    }
}

/// Tick scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Production period (default: "1s").
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,

    /// Ticks executed live after a stall; the rest are synthesized (default: 35).
    #[serde(default = "default_catch_up_cap")]
    pub catch_up_cap: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            catch_up_cap: DEFAULT_CATCH_UP_CAP,
        }
    }
}

// =============================================================================
// Queue / Delivery
// =============================================================================

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue file path (default: "data/offline_queue.jsonl").
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,

    /// Capacity of the durable file in bytes (default: 256 MiB).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Entries kept in memory while storage writes fail (default: 10000).
    #[serde(default = "default_spill_capacity")]
    pub spill_capacity: usize,

    /// Entries per drain batch (default: 50).
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    /// Drain cycles between periodic stats recalculations (default: 10).
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            max_bytes: DEFAULT_MAX_BYTES,
            spill_capacity: DEFAULT_SPILL_CAPACITY,
            drain_batch: DEFAULT_DRAIN_BATCH,
            reconcile_every: DEFAULT_RECONCILE_EVERY,
        }
    }
}

/// Live publish and drain loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bound on one live publish (default: "5s").
    #[serde(default = "default_publish_timeout", with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// First drain retry delay after an empty or blocked cycle (default: "1s").
    #[serde(default = "default_drain_backoff_initial", with = "humantime_serde")]
    pub drain_backoff_initial: Duration,

    /// Drain retry delay cap (default: "60s").
    #[serde(default = "default_drain_backoff_max", with = "humantime_serde")]
    pub drain_backoff_max: Duration,

    /// Drain poll interval while the queue is empty (default: "30s").
    #[serde(default = "default_drain_idle", with = "humantime_serde")]
    pub drain_idle_interval: Duration,

    /// Status snapshot refresh interval (default: "1s").
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,

    /// Time allowed for tasks to stop (default: "5s").
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            drain_backoff_initial: default_drain_backoff_initial(),
            drain_backoff_max: default_drain_backoff_max(),
            drain_idle_interval: default_drain_idle(),
            status_interval: default_status_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

// =============================================================================
// Network
// =============================================================================

/// Where the current network attachment comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkSourceConfig {
    /// Fixed attachment, for wired test rigs and simulation.
    Static {
        medium: Medium,
        #[serde(default)]
        network_id: Option<String>,
    },
    /// Poll Linux interface state under `root`.
    Sysfs {
        #[serde(default = "default_network_poll", with = "humantime_serde")]
        poll_interval: Duration,
        #[serde(default = "default_sysfs_root")]
        root: PathBuf,
    },
}

impl Default for NetworkSourceConfig {
    fn default() -> Self {
        Self::Static {
            medium: Medium::Wifi,
            network_id: None,
        }
    }
}

/// Network attachment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Media on which live publishing is allowed (default: [wifi]).
    #[serde(default = "default_trusted_media")]
    pub trusted_media: Vec<Medium>,

    #[serde(default)]
    pub source: NetworkSourceConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            trusted_media: default_trusted_media(),
            source: NetworkSourceConfig::default(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse, expand credentials and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.broker.expand_credentials();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_topic_level("device.id", &self.device.id)?;

        // Scheduler
        ensure_min_duration("scheduler.period", self.scheduler.period, MIN_PERIOD)?;
        if self.scheduler.catch_up_cap == 0 {
            return Err(ConfigError::invalid(
                "scheduler.catch_up_cap must be positive",
            ));
        }

        // Queue
        if self.queue.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("queue.path cannot be empty"));
        }
        if self.queue.max_bytes == 0 {
            return Err(ConfigError::invalid("queue.max_bytes must be positive"));
        }
        if self.queue.drain_batch == 0 {
            return Err(ConfigError::invalid("queue.drain_batch must be positive"));
        }
        if self.queue.reconcile_every == 0 {
            return Err(ConfigError::invalid(
                "queue.reconcile_every must be positive",
            ));
        }

        // Delivery
        ensure_min_duration(
            "delivery.publish_timeout",
            self.delivery.publish_timeout,
            Duration::from_millis(100),
        )?;
        ensure_min_duration(
            "delivery.drain_backoff_initial",
            self.delivery.drain_backoff_initial,
            Duration::from_millis(10),
        )?;
        if self.delivery.drain_backoff_max < self.delivery.drain_backoff_initial {
            return Err(ConfigError::invalid(
                "delivery.drain_backoff_max must not be below drain_backoff_initial",
            ));
        }
        ensure_min_duration(
            "delivery.status_interval",
            self.delivery.status_interval,
            Duration::from_millis(10),
        )?;

        // Network
        if self.network.trusted_media.is_empty() {
            return Err(ConfigError::invalid(
                "network.trusted_media cannot be empty",
            ));
        }
        if self.network.trusted_media.contains(&Medium::Offline) {
            return Err(ConfigError::invalid(
                "network.trusted_media cannot contain 'offline'",
            ));
        }
        if let NetworkSourceConfig::Sysfs { poll_interval, .. } = &self.network.source {
            ensure_min_duration(
                "network.source.poll_interval",
                *poll_interval,
                Duration::from_millis(100),
            )?;
        }

        self.broker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.period, DEFAULT_PERIOD);
        assert_eq!(config.scheduler.catch_up_cap, 35);
        assert_eq!(config.queue.drain_batch, DEFAULT_DRAIN_BATCH);
        assert_eq!(config.network.trusted_media, vec![Medium::Wifi]);
        assert!(config.broker.targets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
device:
  id: rig-07
scheduler:
  period: 500ms
  catch_up_cap: 20
queue:
  path: /tmp/relay/queue.jsonl
  drain_batch: 25
delivery:
  publish_timeout: 2s
network:
  trusted_media: [wifi, ethernet]
  source:
    kind: sysfs
    poll_interval: 1s
broker:
  topic_prefix: fleet
  targets:
    - name: primary
      addresses: ["10.0.0.5:1883"]
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.device.id, "rig-07");
        assert_eq!(config.scheduler.period, Duration::from_millis(500));
        assert_eq!(config.scheduler.catch_up_cap, 20);
        assert_eq!(config.queue.drain_batch, 25);
        assert_eq!(config.delivery.publish_timeout, Duration::from_secs(2));
        assert_eq!(config.network.trusted_media, vec![Medium::Wifi, Medium::Ethernet]);
        assert!(matches!(
            config.network.source,
            NetworkSourceConfig::Sysfs { poll_interval, .. } if poll_interval == Duration::from_secs(1)
        ));
        assert_eq!(config.broker.topic_prefix.as_deref(), Some("fleet"));
        assert_eq!(config.broker.targets[0].addresses, vec!["10.0.0.5:1883"]);
    }

    #[test]
    fn test_static_network_source() {
        let yaml = r#"
network:
  source:
    kind: static
    medium: cellular
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.network.source,
            NetworkSourceConfig::Static {
                medium: Medium::Cellular,
                network_id: None
            }
        );
    }

    #[test]
    fn test_validation_rejects_bad_device_id() {
        let mut config = AppConfig::default();
        config.device.id = "rig/07".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("device.id"));
    }

    #[test]
    fn test_validation_rejects_zero_cap() {
        let mut config = AppConfig::default();
        config.scheduler.catch_up_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_offline_as_trusted() {
        let mut config = AppConfig::default();
        config.network.trusted_media = vec![Medium::Offline];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_drain_backoff() {
        let mut config = AppConfig::default();
        config.delivery.drain_backoff_initial = Duration::from_secs(10);
        config.delivery.drain_backoff_max = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
