//! Broker target and connection configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{CertDigest, Endpoint, ipv4_cidr_hosts};

use super::validation::{ConfigError, ensure_min_duration, expand_env_vars};

/// MQTT keep-alive floor accepted by the client library.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

fn default_true() -> bool {
    true
}

fn default_client_id_prefix() -> String {
    "telemetry-relay".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_identity_topic() -> String {
    "broker/identity".to_string()
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_discovery_ports() -> Vec<u16> {
    vec![1883, 8883]
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_discovery_concurrency() -> usize {
    32
}

// =============================================================================
// Target
// =============================================================================

/// TLS settings for a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle with the CA certificates that anchor the broker chain.
    pub ca_file: PathBuf,

    /// SHA-256 digest of the broker leaf certificate (hex, colons allowed).
    #[serde(default)]
    pub cert_sha256: Option<String>,
}

/// Retained identity announcement the broker must present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Topic carrying the retained announcement (default: "broker/identity").
    #[serde(default = "default_identity_topic")]
    pub topic: String,

    /// Identifier the announcement must carry.
    pub expected_id: String,

    /// Wait bound for the retained message (default: "5s").
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// One logical broker that records are delivered to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Candidate `host:port` addresses, tried in order.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub identity: Option<IdentityConfig>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            addresses: vec![address.into()],
            username: None,
            password: None,
            tls: None,
            identity: None,
        }
    }

    /// Parsed endpoint list.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.addresses
            .iter()
            .map(|addr| {
                Endpoint::from_str(addr).map_err(|e| {
                    ConfigError::invalid(format!("broker target '{}': {e}", self.name))
                })
            })
            .collect()
    }

    /// Parsed certificate pin, if configured.
    pub fn cert_pin(&self) -> Result<Option<CertDigest>, ConfigError> {
        self.tls
            .as_ref()
            .and_then(|tls| tls.cert_sha256.as_deref())
            .map(|hex| {
                CertDigest::from_str(hex).map_err(|e| {
                    ConfigError::invalid(format!("broker target '{}': {e}", self.name))
                })
            })
            .transpose()
    }
}

// =============================================================================
// Backoff / Keep-alive / Discovery
// =============================================================================

/// Reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Relative jitter in `[0, 1]` (0.5 means ±50%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

/// Background connection probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive probe failures before a forced reconnect.
    pub failure_threshold: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Best-effort LAN scan for brokers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// IPv4 network to scan, e.g. "192.168.1.0/24".
    #[serde(default)]
    pub cidr: Option<String>,

    #[serde(default = "default_discovery_ports")]
    pub ports: Vec<u16>,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    #[serde(default = "default_discovery_concurrency")]
    pub concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cidr: None,
            ports: default_discovery_ports(),
            probe_timeout: default_probe_timeout(),
            concurrency: default_discovery_concurrency(),
        }
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Prepended to every topic (`<prefix>/telemetry/<device>`).
    #[serde(default)]
    pub topic_prefix: Option<String>,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// MQTT keep-alive (default: "30s", minimum "5s").
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            topic_prefix: None,
            client_id_prefix: default_client_id_prefix(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            backoff: BackoffConfig::default(),
            keepalive: KeepaliveConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Resolve `${VAR}` references in credentials.
    pub(crate) fn expand_credentials(&mut self) {
        for target in &mut self.targets {
            target.username = target.username.as_deref().map(expand_env_vars);
            target.password = target.password.as_deref().map(expand_env_vars);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_names = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(ConfigError::invalid("broker target name cannot be empty"));
            }
            if !seen_names.insert(&target.name) {
                return Err(ConfigError::invalid(format!(
                    "duplicate broker target name: '{}'",
                    target.name
                )));
            }
            if target.enabled && target.addresses.is_empty() && !self.discovery.enabled {
                return Err(ConfigError::invalid(format!(
                    "broker target '{}' has no addresses and discovery is disabled",
                    target.name
                )));
            }
            target.endpoints()?;
            target.cert_pin()?;
            if let Some(identity) = &target.identity {
                if identity.expected_id.trim().is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "broker target '{}': identity.expected_id cannot be empty",
                        target.name
                    )));
                }
                if identity.topic.is_empty() || identity.topic.contains(['+', '#']) {
                    return Err(ConfigError::invalid(format!(
                        "broker target '{}': identity.topic must be a concrete topic",
                        target.name
                    )));
                }
            }
        }

        if let Some(prefix) = &self.topic_prefix
            && (prefix.is_empty() || prefix.contains(['+', '#']))
        {
            return Err(ConfigError::invalid(
                "broker.topic_prefix must be non-empty and free of wildcards",
            ));
        }
        if self.client_id_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "broker.client_id_prefix cannot be empty",
            ));
        }
        ensure_min_duration("broker.keep_alive", self.keep_alive, MIN_KEEP_ALIVE)?;
        ensure_min_duration(
            "broker.connect_timeout",
            self.connect_timeout,
            Duration::from_millis(100),
        )?;

        ensure_min_duration(
            "broker.backoff.initial",
            self.backoff.initial,
            Duration::from_millis(10),
        )?;
        if self.backoff.max < self.backoff.initial {
            return Err(ConfigError::invalid(
                "broker.backoff.max must not be below broker.backoff.initial",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::invalid(
                "broker.backoff.jitter must be within [0, 1]",
            ));
        }

        ensure_min_duration(
            "broker.keepalive.interval",
            self.keepalive.interval,
            Duration::from_millis(100),
        )?;
        if self.keepalive.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "broker.keepalive.failure_threshold must be positive",
            ));
        }

        if self.discovery.enabled {
            let cidr = self.discovery.cidr.as_deref().ok_or_else(|| {
                ConfigError::invalid("broker.discovery.cidr is required when discovery is enabled")
            })?;
            ipv4_cidr_hosts(cidr)
                .map_err(|e| ConfigError::invalid(format!("broker.discovery.cidr: {e}")))?;
            if self.discovery.ports.is_empty() || self.discovery.concurrency == 0 {
                return Err(ConfigError::invalid(
                    "broker.discovery needs at least one port and positive concurrency",
                ));
            }
        }
        Ok(())
    }

    /// Targets that should receive records.
    pub fn enabled_targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.iter().filter(|target| target.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(targets: Vec<TargetConfig>) -> BrokerConfig {
        BrokerConfig {
            targets,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_valid_target() {
        let config = config_with(vec![TargetConfig::new("primary", "10.0.0.5:1883")]);
        assert!(config.validate().is_ok());
        let endpoints = config.targets[0].endpoints().unwrap();
        assert_eq!(endpoints[0].port, 1883);
    }

    #[test]
    fn test_duplicate_target_names() {
        let config = config_with(vec![
            TargetConfig::new("primary", "10.0.0.5:1883"),
            TargetConfig::new("primary", "10.0.0.6:1883"),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate broker target name"));
    }

    #[test]
    fn test_bad_address() {
        let config = config_with(vec![TargetConfig::new("primary", "10.0.0.5")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_without_address_needs_discovery() {
        let mut target = TargetConfig::new("primary", "unused:1");
        target.addresses.clear();
        let mut config = config_with(vec![target]);
        assert!(config.validate().is_err());

        config.discovery.enabled = true;
        config.discovery.cidr = Some("192.168.4.0/24".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_pin() {
        let mut target = TargetConfig::new("primary", "10.0.0.5:8883");
        target.tls = Some(TlsConfig {
            ca_file: PathBuf::from("ca.pem"),
            cert_sha256: Some("abc".to_string()),
        });
        assert!(config_with(vec![target]).validate().is_err());
    }

    #[test]
    fn test_keep_alive_floor() {
        let mut config = BrokerConfig::default();
        config.keep_alive = Duration::from_secs(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        let mut config = BrokerConfig::default();
        config.backoff.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_expanded() {
        let mut target = TargetConfig::new("primary", "10.0.0.5:1883");
        target.password = Some("${RELAY_NONEXISTENT_PW_987:-fallback}".to_string());
        let mut config = config_with(vec![target]);
        config.expand_credentials();
        assert_eq!(config.targets[0].password.as_deref(), Some("fallback"));
    }
}
