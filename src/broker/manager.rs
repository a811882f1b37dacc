//! Connection & trust manager over all broker targets.
//!
//! The manager owns one [`BrokerLink`] per configured target and the view of
//! the current network attachment. Publishing is refused outright unless the
//! device is attached through a trusted medium; each target then gets its
//! own bounded publish so one slow broker cannot hold back another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::discovery::discover;
use super::link::{BrokerLink, ProbeOutcome};
use super::network::{Medium, NetworkAttachment, NetworkWatch};
use super::state::LinkStatus;
use super::topics::TopicBuilder;
use super::transport::{BrokerTransport, Endpoint};
use super::{ConnectionError, ErrorClass};
use crate::config::{BrokerConfig, ConfigError, DiscoveryConfig, KeepaliveConfig};
use crate::queue::TargetSet;
use crate::telemetry::TelemetryRecord;

/// Why a record is being published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Freshly produced; also refreshes the retained `last/` topic.
    Live,
    /// Drained from the offline queue.
    Backlog,
}

/// Result of publishing to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Delivered,
    TimedOut,
    /// The device is not on a trusted medium; nothing was attempted.
    OffNetwork,
    /// Identity or certificate pin check failed.
    Untrusted(String),
    /// No session could be opened (backoff, refused, no endpoints).
    NotConnected(String),
    /// The broker did not acknowledge the publish.
    Failed(String),
}

impl TargetOutcome {
    fn from_error(err: &ConnectionError) -> Self {
        match err.class() {
            ErrorClass::Trust => Self::Untrusted(err.to_string()),
            ErrorClass::Configuration => Self::NotConnected(err.to_string()),
            ErrorClass::Transient | ErrorClass::Durability => match err {
                ConnectionError::PublishTimeout(_) | ConnectionError::ConnectTimeout(_) => {
                    Self::TimedOut
                }
                ConnectionError::UntrustedNetwork(_) => Self::OffNetwork,
                ConnectionError::BackingOff(_) | ConnectionError::Refused(_) => {
                    Self::NotConnected(err.to_string())
                }
                _ => Self::Failed(err.to_string()),
            },
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Per-target outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub targets: BTreeMap<String, TargetOutcome>,
}

impl PublishOutcome {
    fn uniform(targets: &TargetSet, outcome: TargetOutcome) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|t| (t.clone(), outcome.clone()))
                .collect(),
        }
    }

    pub fn delivered(&self) -> TargetSet {
        self.targets
            .iter()
            .filter(|(_, outcome)| outcome.is_delivered())
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn failed(&self) -> TargetSet {
        self.targets
            .iter()
            .filter(|(_, outcome)| !outcome.is_delivered())
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn all_delivered(&self) -> bool {
        self.targets.values().all(TargetOutcome::is_delivered)
    }
}

/// Owns every broker link.
pub struct ConnectionManager {
    links: BTreeMap<String, Arc<BrokerLink>>,
    network: NetworkWatch,
    trusted_media: Vec<Medium>,
    topics: TopicBuilder,
    keepalive: KeepaliveConfig,
    discovery: DiscoveryConfig,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("targets", &self.links.keys().collect::<Vec<_>>())
            .field("network", &*self.network.borrow())
            .field("trusted_media", &self.trusted_media)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        device_id: &str,
        config: &BrokerConfig,
        trusted_media: Vec<Medium>,
        network: NetworkWatch,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, ConfigError> {
        let topics = TopicBuilder::new(config.topic_prefix.as_deref(), device_id);
        let mut links = BTreeMap::new();
        for target in &config.targets {
            let link = BrokerLink::new(target, config, topics.clone(), Arc::clone(&transport))?;
            links.insert(target.name.clone(), Arc::new(link));
        }
        tracing::info!(
            targets = links.len(),
            enabled = config.enabled_targets().count(),
            "Connection manager created"
        );
        Ok(Self {
            links,
            network,
            trusted_media,
            topics,
            keepalive: config.keepalive.clone(),
            discovery: config.discovery.clone(),
        })
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Targets currently enabled.
    pub fn enabled_targets(&self) -> TargetSet {
        self.links
            .iter()
            .filter(|(_, link)| link.is_enabled())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether `target` is configured at all, enabled or not.
    pub fn has_target(&self, target: &str) -> bool {
        self.links.contains_key(target)
    }

    pub fn network(&self) -> NetworkAttachment {
        self.network.borrow().clone()
    }

    pub fn watch_network(&self) -> NetworkWatch {
        self.network.clone()
    }

    pub fn is_trusted(&self, network: &NetworkAttachment) -> bool {
        self.trusted_media.contains(&network.medium)
    }

    /// Whether live publishing is currently allowed.
    pub fn is_on_trusted_transport(&self) -> bool {
        self.is_trusted(&self.network.borrow())
    }

    fn link(&self, target: &str) -> Result<&Arc<BrokerLink>, ConnectionError> {
        self.links
            .get(target)
            .ok_or_else(|| ConnectionError::UnknownTarget(target.to_string()))
    }

    /// Live, verified connection for `target`.
    pub async fn ensure_connected(&self, target: &str) -> Result<(), ConnectionError> {
        let network = self.network();
        if !self.is_trusted(&network) {
            return Err(ConnectionError::UntrustedNetwork(network.medium));
        }
        self.link(target)?.ensure_connected(&network).await.map(|_| ())
    }

    pub async fn reconnect(&self, target: &str, reset_backoff: bool) -> Result<(), ConnectionError> {
        self.link(target)?.reconnect(reset_backoff).await;
        Ok(())
    }

    pub async fn set_enabled(&self, target: &str, enabled: bool) -> Result<(), ConnectionError> {
        self.link(target)?.set_enabled(enabled).await;
        Ok(())
    }

    /// Publish `record` to each target in `targets` within `timeout`.
    pub async fn publish(
        &self,
        record: &TelemetryRecord,
        targets: &TargetSet,
        timeout: Duration,
        mode: PublishMode,
    ) -> PublishOutcome {
        let network = self.network();
        if !self.is_trusted(&network) {
            return PublishOutcome::uniform(targets, TargetOutcome::OffNetwork);
        }
        let payload = match record.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(sequence = record.sequence(), error = %e, "Record serialization failed");
                return PublishOutcome::uniform(targets, TargetOutcome::Failed(e.to_string()));
            }
        };

        let mut outcome = PublishOutcome::default();
        let mut tasks = JoinSet::new();
        for target in targets {
            let link = match self.link(target) {
                Ok(link) => Arc::clone(link),
                Err(e) => {
                    outcome
                        .targets
                        .insert(target.clone(), TargetOutcome::NotConnected(e.to_string()));
                    continue;
                }
            };
            let network = network.clone();
            let topic = self.topics.telemetry();
            let last_topic = self.topics.last();
            let payload = payload.clone();
            tasks.spawn(async move {
                let result = tokio::time::timeout(
                    timeout,
                    link.deliver(&network, &topic, payload.clone(), false),
                )
                .await;
                let target_outcome = match result {
                    Ok(Ok(())) => TargetOutcome::Delivered,
                    Ok(Err(e)) => TargetOutcome::from_error(&e),
                    Err(_) => TargetOutcome::TimedOut,
                };
                let name = link.name().to_string();
                if mode == PublishMode::Live && target_outcome.is_delivered() {
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            timeout,
                            link.publish_if_connected(&last_topic, payload, true),
                        )
                        .await;
                    });
                }
                (name, target_outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, target_outcome)) => {
                    outcome.targets.insert(target, target_outcome);
                }
                Err(e) => tracing::error!(error = %e, "Publish task failed"),
            }
        }
        // A panicked task leaves its target unreported; treat it as failed.
        for target in targets {
            outcome
                .targets
                .entry(target.clone())
                .or_insert_with(|| TargetOutcome::Failed("publish task aborted".to_string()));
        }
        outcome
    }

    /// Drop cached identity verification on every link.
    pub async fn on_network_changed(&self) {
        let network = self.network();
        tracing::info!(network = %network.key(), trusted = self.is_trusted(&network), "Invalidating broker identity");
        for link in self.links.values() {
            link.invalidate_identity().await;
        }
    }

    /// Append endpoints to every enabled link that has none of its own.
    pub async fn add_discovered(&self, endpoints: &[Endpoint]) -> usize {
        let mut added = 0;
        for link in self.links.values().filter(|link| link.is_enabled()) {
            if link.endpoint_count().await == 0 {
                added += link.add_endpoints(endpoints).await;
            }
        }
        added
    }

    /// Run a discovery scan when enabled and some target has no endpoints.
    pub async fn run_discovery(&self) -> usize {
        if !self.discovery.enabled {
            return 0;
        }
        let mut needed = false;
        for link in self.links.values().filter(|link| link.is_enabled()) {
            needed |= link.endpoint_count().await == 0;
        }
        if !needed {
            return 0;
        }
        let endpoints = discover(&self.discovery).await;
        self.add_discovered(&endpoints).await
    }

    pub fn link_statuses(&self) -> Vec<LinkStatus> {
        self.links.values().map(|link| link.status()).collect()
    }

    pub fn watch_link(&self, target: &str) -> Option<watch::Receiver<LinkStatus>> {
        self.links.get(target).map(|link| link.watch())
    }

    /// One keep-alive round over every enabled link.
    pub async fn probe_links(&self) {
        let network = self.network();
        if !self.is_trusted(&network) {
            return;
        }
        for link in self.links.values().filter(|link| link.is_enabled()) {
            match link.probe(self.keepalive.timeout).await {
                ProbeOutcome::Healthy => {}
                ProbeOutcome::Failed(failures) if failures >= self.keepalive.failure_threshold => {
                    tracing::warn!(broker = %link.name(), failures, "Keep-alive threshold reached, reconnecting");
                    link.reconnect(true).await;
                    if let Err(e) = link.ensure_connected(&network).await {
                        tracing::debug!(broker = %link.name(), error = %e, "Reconnect after keep-alive failed");
                    }
                }
                ProbeOutcome::Failed(failures) => {
                    tracing::debug!(broker = %link.name(), failures, "Keep-alive probe failed");
                }
                ProbeOutcome::NoSession => {
                    if let Err(e) = link.ensure_connected(&network).await
                        && !matches!(e, ConnectionError::BackingOff(_))
                    {
                        tracing::debug!(broker = %link.name(), error = %e, "Keep-alive connect failed");
                    }
                }
            }
        }
    }

    /// Probe every `keepalive.interval` until `shutdown`.
    pub fn spawn_keepalive(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.keepalive.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.probe_links().await,
                }
            }
            tracing::debug!("Keep-alive stopped");
        })
    }

    /// Announce "offline" and disconnect every link.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut tasks = JoinSet::new();
        for link in self.links.values() {
            let link = Arc::clone(link);
            tasks.spawn(async move { link.shutdown(timeout).await });
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("Broker links closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CertDigest, LinkState, MemoryBroker, MemoryTransport, static_network};
    use crate::config::{IdentityConfig, TargetConfig, TlsConfig};
    use crate::telemetry::SensorSnapshot;
    use chrono::Utc;

    fn record(seq: u64) -> TelemetryRecord {
        TelemetryRecord::live("rig", seq, Utc::now(), SensorSnapshot::default().with_value("t", 1.0))
    }

    fn targets(names: &[&str]) -> TargetSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn manager_with(
        config: BrokerConfig,
        transport: MemoryTransport,
        medium: Medium,
    ) -> (ConnectionManager, watch::Sender<NetworkAttachment>) {
        let (tx, rx) = static_network(NetworkAttachment::new(medium, Some("net-1".to_string())));
        let manager = ConnectionManager::new(
            "rig",
            &config,
            vec![Medium::Wifi],
            rx,
            Arc::new(transport),
        )
        .unwrap();
        (manager, tx)
    }

    fn two_targets() -> (BrokerConfig, MemoryBroker, MemoryBroker, MemoryTransport) {
        let a = MemoryBroker::new();
        let b = MemoryBroker::new();
        let transport = MemoryTransport::new()
            .with_broker(Endpoint::new("a", 1883), a.clone())
            .with_broker(Endpoint::new("b", 1883), b.clone());
        let config = BrokerConfig {
            targets: vec![
                TargetConfig::new("primary", "a:1883"),
                TargetConfig::new("backup", "b:1883"),
            ],
            ..BrokerConfig::default()
        };
        (config, a, b, transport)
    }

    #[tokio::test]
    async fn test_publish_live_to_all_targets() {
        let (config, a, b, transport) = two_targets();
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);

        let outcome = manager
            .publish(&record(1), &targets(&["primary", "backup"]), Duration::from_secs(1), PublishMode::Live)
            .await;
        assert!(outcome.all_delivered());
        assert_eq!(a.payloads_on("telemetry/rig").len(), 1);
        assert_eq!(b.payloads_on("telemetry/rig").len(), 1);
        assert_eq!(manager.enabled_targets(), targets(&["backup", "primary"]));
    }

    #[tokio::test]
    async fn test_live_publish_refreshes_last_value_per_target() {
        let (config, a, b, transport) = two_targets();
        b.set_online(false);
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);

        let outcome = manager
            .publish(&record(7), &targets(&["primary", "backup"]), Duration::from_secs(1), PublishMode::Live)
            .await;
        assert_eq!(outcome.delivered(), targets(&["primary"]));
        assert_eq!(outcome.failed(), targets(&["backup"]));

        for _ in 0..50 {
            if a.retained("last/rig").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let last: serde_json::Value = serde_json::from_slice(&a.retained("last/rig").unwrap()).unwrap();
        assert_eq!(last["sequence"], 7);
        assert!(b.retained("last/rig").is_none());

        manager
            .publish(&record(8), &targets(&["primary"]), Duration::from_secs(1), PublishMode::Backlog)
            .await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let last: serde_json::Value = serde_json::from_slice(&a.retained("last/rig").unwrap()).unwrap();
        assert_eq!(last["sequence"], 7);
    }

    #[tokio::test]
    async fn test_untrusted_medium_not_attempted() {
        let (config, a, _b, transport) = two_targets();
        let (manager, _tx) = manager_with(config, transport, Medium::Cellular);

        let outcome = manager
            .publish(&record(1), &targets(&["primary"]), Duration::from_secs(1), PublishMode::Live)
            .await;
        assert_eq!(outcome.targets["primary"], TargetOutcome::OffNetwork);
        assert_eq!(a.connects(), 0);
        assert!(matches!(
            manager.ensure_connected("primary").await,
            Err(ConnectionError::UntrustedNetwork(Medium::Cellular))
        ));
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let (config, _a, b, transport) = two_targets();
        b.set_online(false);
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);

        let outcome = manager
            .publish(&record(1), &targets(&["primary", "backup"]), Duration::from_secs(1), PublishMode::Backlog)
            .await;
        assert_eq!(outcome.delivered(), targets(&["primary"]));
        assert_eq!(outcome.failed(), targets(&["backup"]));
        assert!(!outcome.all_delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ack_times_out() {
        let (config, a, _b, transport) = two_targets();
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);
        manager.ensure_connected("primary").await.unwrap();
        a.set_publish_delay(Duration::from_secs(10));

        let outcome = manager
            .publish(&record(1), &targets(&["primary"]), Duration::from_secs(1), PublishMode::Backlog)
            .await;
        assert_eq!(outcome.targets["primary"], TargetOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (config, _a, _b, transport) = two_targets();
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);
        let outcome = manager
            .publish(&record(1), &targets(&["nowhere"]), Duration::from_secs(1), PublishMode::Live)
            .await;
        assert!(matches!(outcome.targets["nowhere"], TargetOutcome::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_pin_mismatch_is_untrusted() {
        let broker = MemoryBroker::with_identity("broker/identity", "hub-1");
        broker.set_peer_digest(Some(CertDigest::of(b"impostor")));
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let mut target = TargetConfig::new("primary", "a:1883");
        target.tls = Some(TlsConfig {
            ca_file: "/etc/relay/ca.pem".into(),
            cert_sha256: Some(CertDigest::of(b"genuine").to_string()),
        });
        let config = BrokerConfig {
            targets: vec![target],
            ..BrokerConfig::default()
        };
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);

        let outcome = manager
            .publish(&record(1), &targets(&["primary"]), Duration::from_secs(1), PublishMode::Live)
            .await;
        assert!(matches!(outcome.targets["primary"], TargetOutcome::Untrusted(_)));
        assert!(broker.payloads_on("telemetry/rig").is_empty());
        assert!(!manager.link_statuses()[0].verified);
    }

    #[tokio::test]
    async fn test_network_change_invalidates_identity() {
        let broker = MemoryBroker::with_identity("broker/identity", "hub-1");
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker);
        let mut target = TargetConfig::new("primary", "a:1883");
        target.identity = Some(IdentityConfig {
            topic: "broker/identity".to_string(),
            expected_id: "hub-1".to_string(),
            timeout: Duration::from_secs(1),
        });
        let config = BrokerConfig {
            targets: vec![target],
            ..BrokerConfig::default()
        };
        let (manager, tx) = manager_with(config, transport, Medium::Wifi);
        manager.ensure_connected("primary").await.unwrap();
        let mut status = manager.watch_link("primary").unwrap();
        assert!(status.borrow_and_update().verified);

        tx.send_replace(NetworkAttachment::new(Medium::Wifi, Some("net-2".to_string())));
        manager.on_network_changed().await;
        assert!(!status.borrow_and_update().verified);
        assert_eq!(status.borrow().state, LinkState::Connected);

        manager.ensure_connected("primary").await.unwrap();
        assert!(status.borrow().verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_forces_reconnect() {
        let (mut config, a, _b, transport) = two_targets();
        config.targets.truncate(1);
        config.keepalive = KeepaliveConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            failure_threshold: 2,
        };
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);
        manager.ensure_connected("primary").await.unwrap();

        a.set_fail_publish(true);
        manager.probe_links().await;
        assert_eq!(a.connects(), 1);
        a.set_fail_publish(false);
        a.set_publish_delay(Duration::from_secs(5));
        manager.probe_links().await;
        // Threshold reached: session replaced with a fresh one.
        assert_eq!(a.connects(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_announces_offline() {
        let (config, a, _b, transport) = two_targets();
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);
        manager.ensure_connected("primary").await.unwrap();
        assert_eq!(a.retained("status/rig").as_deref(), Some(&b"online"[..]));

        manager.shutdown(Duration::from_secs(1)).await;
        assert_eq!(a.retained("status/rig").as_deref(), Some(&b"offline"[..]));
        assert_eq!(manager.link_statuses()[1].state, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_add_discovered_only_fills_empty_targets() {
        let (mut config, _a, _b, transport) = two_targets();
        config.targets[1].addresses.clear();
        let (manager, _tx) = manager_with(config, transport, Medium::Wifi);
        let added = manager
            .add_discovered(&[Endpoint::new("10.0.0.7", 1883)])
            .await;
        assert_eq!(added, 1);
    }
}
