//! One broker target: endpoints, session, trust and backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::Instant;

use super::backoff::Backoff;
use super::network::NetworkAttachment;
use super::state::{LinkEvent, LinkState, LinkStatus};
use super::topics::TopicBuilder;
use super::transport::{BrokerSession, BrokerTransport, Endpoint, LastWill, SessionOptions};
use super::trust::{BrokerIdentity, PeerObservation};
use super::ConnectionError;
use crate::config::{BrokerConfig, ConfigError, TargetConfig, TlsConfig};

const STATUS_ONLINE: &[u8] = b"online";
const STATUS_OFFLINE: &[u8] = b"offline";

/// Result of one keep-alive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Probe failed; carries the consecutive failure count.
    Failed(u32),
    NoSession,
}

#[derive(Debug, Clone)]
struct ConnectSettings {
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    tls: Option<TlsConfig>,
    last_will: LastWill,
}

struct LinkInner {
    state: LinkState,
    enabled: bool,
    backoff: Backoff,
    next_attempt_at: Option<Instant>,
    attempt_in_flight: bool,
    endpoints: Vec<Endpoint>,
    endpoint_index: usize,
    active: Option<Endpoint>,
    session: Option<Arc<dyn BrokerSession>>,
    identity: BrokerIdentity,
    consecutive_failures: u32,
    probe_failures: u32,
    last_error: Option<String>,
}

impl LinkInner {
    fn apply(&mut self, event: LinkEvent) {
        self.state = self.state.on(event);
    }

    fn drop_session(&mut self) -> Option<Arc<dyn BrokerSession>> {
        self.active = None;
        self.identity.invalidate();
        self.session.take()
    }
}

/// Connection to one logical broker target.
///
/// The session handle never leaves the link except as a cloned `Arc` used
/// for a single publish. All state changes go through [`LinkState::on`].
pub struct BrokerLink {
    name: String,
    transport: Arc<dyn BrokerTransport>,
    settings: ConnectSettings,
    topics: TopicBuilder,
    inner: Mutex<LinkInner>,
    status: watch::Sender<LinkStatus>,
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl BrokerLink {
    pub fn new(
        target: &TargetConfig,
        broker: &BrokerConfig,
        topics: TopicBuilder,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, ConfigError> {
        let endpoints = target.endpoints()?;
        let identity = BrokerIdentity::new(target.identity.clone(), target.cert_pin()?);
        let settings = ConnectSettings {
            client_id: format!(
                "{}-{}-{}",
                broker.client_id_prefix,
                topics.device_id(),
                target.name
            ),
            keep_alive: broker.keep_alive,
            connect_timeout: broker.connect_timeout,
            username: target.username.clone(),
            password: target.password.clone(),
            tls: target.tls.clone(),
            last_will: LastWill {
                topic: topics.status(),
                payload: STATUS_OFFLINE.to_vec(),
                retain: true,
            },
        };
        let state = if target.enabled {
            LinkState::Disconnected
        } else {
            LinkState::Disabled
        };
        let (status, _) = watch::channel(LinkStatus::new(&target.name, target.enabled));

        Ok(Self {
            name: target.name.clone(),
            transport,
            settings,
            topics,
            inner: Mutex::new(LinkInner {
                state,
                enabled: target.enabled,
                backoff: Backoff::from_config(&broker.backoff),
                next_attempt_at: None,
                attempt_in_flight: false,
                endpoints,
                endpoint_index: 0,
                active: None,
                session: None,
                identity,
                consecutive_failures: 0,
                probe_failures: 0,
                last_error: None,
            }),
            status,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.status.borrow().enabled
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    fn publish_status(&self, inner: &LinkInner) {
        let next = LinkStatus {
            target: self.name.clone(),
            enabled: inner.enabled,
            state: inner.state,
            active_endpoint: inner.active.as_ref().map(ToString::to_string),
            verified: inner.identity.is_verified(),
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.state != next.state {
                tracing::info!(broker = %self.name, from = %current.state, to = %next.state, "Broker link state changed");
            }
            *current = next;
            true
        });
    }

    /// Options for one attempt; each attempt observes its own handshake.
    fn session_options(&self, inner: &LinkInner) -> SessionOptions {
        SessionOptions {
            client_id: self.settings.client_id.clone(),
            keep_alive: self.settings.keep_alive,
            connect_timeout: self.settings.connect_timeout,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            tls: self.settings.tls.clone(),
            pin: inner.identity.pin(),
            peer: PeerObservation::default(),
            last_will: Some(self.settings.last_will.clone()),
        }
    }

    fn record_failure(&self, inner: &mut LinkInner, err: &ConnectionError) {
        inner.consecutive_failures += 1;
        inner.last_error = Some(err.to_string());
        inner.apply(LinkEvent::ConnectFailed {
            fatal: err.is_fatal(),
        });
        tracing::warn!(
            broker = %self.name,
            error = %err,
            class = %err.class(),
            failures = inner.consecutive_failures,
            "Broker connection failed"
        );
        self.publish_status(inner);
    }

    /// Return a live, verified session for the current attachment.
    ///
    /// Reuses the open session when possible and re-runs identity
    /// verification on it after a network change. Otherwise connects to the
    /// current endpoint, unless the backoff window is still open.
    pub async fn ensure_connected(
        &self,
        network: &NetworkAttachment,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        let mut inner = self.inner.lock().await;
        if !inner.enabled {
            return Err(ConnectionError::Disabled(self.name.clone()));
        }
        if inner.attempt_in_flight {
            // The previous caller was cancelled mid-attempt.
            inner.attempt_in_flight = false;
            if let Some(session) = inner.drop_session() {
                session.disconnect().await;
            }
            inner.apply(LinkEvent::SessionLost);
            self.publish_status(&inner);
        }

        let key = network.key();
        if let Some(session) = inner.session.clone() {
            if session.is_alive() {
                if inner.identity.is_verified_for(&key) {
                    return Ok(session);
                }
                tracing::info!(broker = %self.name, network = %key, "Re-verifying broker identity");
                return self.verify(&mut inner, session, &key).await;
            }
            tracing::info!(broker = %self.name, "Broker session lost");
            inner.drop_session();
            inner.apply(LinkEvent::SessionLost);
            self.publish_status(&inner);
        }

        self.connect(&mut inner, &key).await
    }

    async fn connect(
        &self,
        inner: &mut MutexGuard<'_, LinkInner>,
        network_key: &str,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        if inner.endpoints.is_empty() {
            return Err(ConnectionError::NoEndpoints(self.name.clone()));
        }
        let now = Instant::now();
        if let Some(at) = inner.next_attempt_at
            && at > now
        {
            return Err(ConnectionError::BackingOff(at - now));
        }
        // Reserve the next window up front so an abandoned attempt still counts.
        let delay = inner.backoff.next_delay();
        inner.next_attempt_at = Some(now + delay);

        let endpoint = inner.endpoints[inner.endpoint_index % inner.endpoints.len()].clone();
        inner.apply(LinkEvent::ConnectStarted);
        inner.active = Some(endpoint.clone());
        self.publish_status(inner);

        let options = self.session_options(inner);

        tracing::debug!(broker = %self.name, endpoint = %endpoint, attempt = inner.backoff.attempt(), "Connecting to broker");
        inner.attempt_in_flight = true;
        let result = self.transport.connect(&endpoint, &options).await;
        inner.attempt_in_flight = false;

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                inner.active = None;
                inner.endpoint_index = (inner.endpoint_index + 1) % inner.endpoints.len();
                self.record_failure(inner, &e);
                return Err(e);
            }
        };

        inner.session = Some(Arc::clone(&session));
        let session = self.verify(inner, session, network_key).await?;

        inner.backoff.reset();
        inner.next_attempt_at = None;
        inner.consecutive_failures = 0;
        inner.probe_failures = 0;
        inner.last_error = None;
        inner.apply(LinkEvent::Connected);
        self.publish_status(inner);
        tracing::info!(broker = %self.name, endpoint = %endpoint, "Connected to broker");

        let online = tokio::time::timeout(
            self.settings.connect_timeout,
            session.publish(&self.topics.status(), STATUS_ONLINE.to_vec(), true),
        )
        .await;
        if !matches!(online, Ok(Ok(()))) {
            tracing::debug!(broker = %self.name, "Online announcement not acknowledged");
        }
        Ok(session)
    }

    /// Trust checks on `session`. A failure tears the session down.
    async fn verify(
        &self,
        inner: &mut MutexGuard<'_, LinkInner>,
        session: Arc<dyn BrokerSession>,
        network_key: &str,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        match inner.identity.verify(session.as_ref(), network_key).await {
            Ok(()) => {
                self.publish_status(inner);
                Ok(session)
            }
            Err(e) => {
                if let Some(session) = inner.drop_session() {
                    session.disconnect().await;
                }
                if inner.next_attempt_at.is_none() {
                    let delay = inner.backoff.next_delay();
                    inner.next_attempt_at = Some(Instant::now() + delay);
                }
                self.record_failure(inner, &e);
                Err(e)
            }
        }
    }

    /// Connect if needed and publish one telemetry payload.
    pub async fn deliver(
        &self,
        network: &NetworkAttachment,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        let session = self.ensure_connected(network).await?;
        let result = session.publish(topic, payload, retain).await;
        if let Err(e) = &result {
            self.on_publish_error(&session, e).await;
        }
        result
    }

    /// Publish on the open session only; never connects.
    pub async fn publish_if_connected(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ConnectionError> {
        let session = {
            let inner = self.inner.lock().await;
            inner.session.clone()
        };
        let Some(session) = session.filter(|s| s.is_alive()) else {
            return Err(ConnectionError::SessionClosed);
        };
        session.publish(topic, payload, retain).await
    }

    async fn on_publish_error(&self, session: &Arc<dyn BrokerSession>, err: &ConnectionError) {
        tracing::debug!(broker = %self.name, error = %err, "Publish failed");
        let mut inner = self.inner.lock().await;
        let current = inner
            .session
            .as_ref()
            .is_some_and(|s| std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(session)));
        if current && !session.is_alive() {
            inner.drop_session();
            inner.last_error = Some(err.to_string());
            inner.apply(LinkEvent::SessionLost);
            self.publish_status(&inner);
        }
    }

    /// Keep-alive probe: a retained "online" publish within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> ProbeOutcome {
        let session = {
            let inner = self.inner.lock().await;
            inner.session.clone()
        };
        let Some(session) = session else {
            return ProbeOutcome::NoSession;
        };

        let result = tokio::time::timeout(
            timeout,
            session.publish(&self.topics.status(), STATUS_ONLINE.to_vec(), true),
        )
        .await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(Ok(())) => {
                inner.probe_failures = 0;
                inner.backoff.reset();
                inner.next_attempt_at = None;
                ProbeOutcome::Healthy
            }
            Ok(Err(e)) => {
                inner.probe_failures += 1;
                inner.last_error = Some(e.to_string());
                self.publish_status(&inner);
                ProbeOutcome::Failed(inner.probe_failures)
            }
            Err(_) => {
                inner.probe_failures += 1;
                inner.last_error = Some(ConnectionError::PublishTimeout(timeout).to_string());
                self.publish_status(&inner);
                ProbeOutcome::Failed(inner.probe_failures)
            }
        }
    }

    /// Tear down the session; the next `ensure_connected` opens a new one.
    pub async fn reconnect(&self, reset_backoff: bool) {
        let mut inner = self.inner.lock().await;
        if !inner.enabled {
            return;
        }
        if let Some(session) = inner.drop_session() {
            session.disconnect().await;
        }
        inner.probe_failures = 0;
        if reset_backoff {
            inner.backoff.reset();
            inner.next_attempt_at = None;
        }
        inner.apply(LinkEvent::ReconnectRequested);
        self.publish_status(&inner);
    }

    pub async fn invalidate_identity(&self) {
        let mut inner = self.inner.lock().await;
        if inner.identity.is_verified() {
            inner.identity.invalidate();
            tracing::debug!(broker = %self.name, "Broker identity invalidated");
            self.publish_status(&inner);
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if enabled {
            inner.apply(LinkEvent::Enable);
            inner.backoff.reset();
            inner.next_attempt_at = None;
        } else {
            if let Some(session) = inner.drop_session() {
                let _ = tokio::time::timeout(
                    self.settings.connect_timeout,
                    session.publish(&self.topics.status(), STATUS_OFFLINE.to_vec(), true),
                )
                .await;
                session.disconnect().await;
            }
            inner.apply(LinkEvent::Disable);
        }
        self.publish_status(&inner);
    }

    /// Append endpoints not already known.
    pub async fn add_endpoints(&self, endpoints: &[Endpoint]) -> usize {
        let mut inner = self.inner.lock().await;
        let mut added = 0;
        for endpoint in endpoints {
            if !inner.endpoints.contains(endpoint) {
                inner.endpoints.push(endpoint.clone());
                added += 1;
            }
        }
        added
    }

    pub async fn endpoint_count(&self) -> usize {
        self.inner.lock().await.endpoints.len()
    }

    /// Best-effort "offline" announcement, then a clean disconnect.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.drop_session() {
            if session.is_alive() {
                let announced = tokio::time::timeout(
                    timeout,
                    session.publish(&self.topics.status(), STATUS_OFFLINE.to_vec(), true),
                )
                .await;
                if !matches!(announced, Ok(Ok(()))) {
                    tracing::debug!(broker = %self.name, "Offline announcement not acknowledged");
                }
            }
            session.disconnect().await;
            inner.apply(LinkEvent::SessionLost);
            self.publish_status(&inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CertDigest, MemoryBroker, MemoryTransport, Medium, TrustError};
    use crate::config::{BackoffConfig, IdentityConfig};

    fn wifi(id: &str) -> NetworkAttachment {
        NetworkAttachment::new(Medium::Wifi, Some(id.to_string()))
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(8),
                jitter: 0.0,
            },
            ..BrokerConfig::default()
        }
    }

    fn link(target: TargetConfig, transport: MemoryTransport) -> BrokerLink {
        BrokerLink::new(
            &target,
            &broker_config(),
            TopicBuilder::new(None, "rig"),
            Arc::new(transport),
        )
        .unwrap()
    }

    fn with_identity(mut target: TargetConfig) -> TargetConfig {
        target.identity = Some(IdentityConfig {
            topic: "broker/identity".to_string(),
            expected_id: "hub-1".to_string(),
            timeout: Duration::from_secs(1),
        });
        target
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_verify_and_announce() {
        let broker = MemoryBroker::with_identity("broker/identity", "hub-1");
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(with_identity(TargetConfig::new("primary", "a:1883")), transport);

        link.deliver(&wifi("wlan0#1"), "telemetry/rig", b"{}".to_vec(), false)
            .await
            .unwrap();
        let status = link.status();
        assert_eq!(status.state, LinkState::Connected);
        assert!(status.verified);
        assert_eq!(status.active_endpoint.as_deref(), Some("a:1883"));
        assert_eq!(broker.retained("status/rig").as_deref(), Some(STATUS_ONLINE));

        // Same session reused while the attachment is unchanged.
        link.deliver(&wifi("wlan0#1"), "telemetry/rig", b"{}".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_mismatch_refuses() {
        let broker = MemoryBroker::with_identity("broker/identity", "evil-twin");
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(with_identity(TargetConfig::new("primary", "a:1883")), transport);

        let err = link
            .deliver(&wifi("wlan0#1"), "telemetry/rig", b"{}".to_vec(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Trust(TrustError::IdentityMismatch { .. })));
        assert_eq!(link.status().state, LinkState::Failed);
        assert!(broker.payloads_on("telemetry/rig").is_empty());

        // Operator fixes the broker; the next attempt after backoff succeeds.
        broker.set_retained("broker/identity", b"hub-1");
        tokio::time::advance(Duration::from_secs(2)).await;
        link.deliver(&wifi("wlan0#1"), "telemetry/rig", b"{}".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(link.status().state, LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_mismatch_refuses() {
        let broker = MemoryBroker::new();
        broker.set_peer_digest(Some(CertDigest::of(b"impostor")));
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker);
        let mut link = link(TargetConfig::new("primary", "a:1883"), transport);
        link.inner.get_mut().identity = BrokerIdentity::new(None, Some(CertDigest::of(b"genuine")));

        let err = link
            .deliver(&wifi("wlan0#1"), "telemetry/rig", vec![], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Trust(TrustError::PinMismatch { .. })));
        assert!(!link.status().verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_reverifies_same_session() {
        let broker = MemoryBroker::with_identity("broker/identity", "hub-1");
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(with_identity(TargetConfig::new("primary", "a:1883")), transport);

        link.ensure_connected(&wifi("wlan0#1")).await.unwrap();
        broker.set_retained("broker/identity", b"evil-twin");
        assert!(link.ensure_connected(&wifi("wlan0#1")).await.is_ok());

        let err = link.ensure_connected(&wifi("wlan0#2")).await.err().unwrap();
        assert_eq!(err.class(), crate::broker::ErrorClass::Trust);
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_and_endpoint_rotation() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(Endpoint::new("b", 1883), broker.clone());
        let mut target = TargetConfig::new("primary", "a:1883");
        target.addresses.push("b:1883".to_string());
        let link = link(target, transport);

        let err = link.ensure_connected(&wifi("w")).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Transport(_)));
        assert_eq!(link.status().state, LinkState::Disconnected);
        assert_eq!(link.status().consecutive_failures, 1);

        let err = link.ensure_connected(&wifi("w")).await.err().unwrap();
        assert!(matches!(err, ConnectionError::BackingOff(_)));

        tokio::time::advance(Duration::from_millis(1001)).await;
        link.ensure_connected(&wifi("w")).await.unwrap();
        assert_eq!(link.status().active_endpoint.as_deref(), Some("b:1883"));
        assert_eq!(link.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_detected() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(TargetConfig::new("primary", "a:1883"), transport);

        link.ensure_connected(&wifi("w")).await.unwrap();
        broker.drop_sessions();
        assert_eq!(broker.retained("status/rig").as_deref(), Some(STATUS_OFFLINE));

        // The dead session is noticed and replaced before publishing.
        link.deliver(&wifi("w"), "telemetry/rig", vec![], false)
            .await
            .unwrap();
        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.retained("status/rig").as_deref(), Some(STATUS_ONLINE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_and_reconnect() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(TargetConfig::new("primary", "a:1883"), transport);

        assert_eq!(link.probe(Duration::from_secs(1)).await, ProbeOutcome::NoSession);
        link.ensure_connected(&wifi("w")).await.unwrap();
        assert_eq!(link.probe(Duration::from_secs(1)).await, ProbeOutcome::Healthy);

        broker.set_fail_publish(true);
        assert_eq!(link.probe(Duration::from_secs(1)).await, ProbeOutcome::Failed(1));
        assert_eq!(link.probe(Duration::from_secs(1)).await, ProbeOutcome::Failed(2));

        link.reconnect(true).await;
        assert_eq!(link.status().state, LinkState::Reconnecting);
        broker.set_fail_publish(false);
        link.ensure_connected(&wifi("w")).await.unwrap();
        assert_eq!(broker.connects(), 2);
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let link = link(TargetConfig::new("primary", "a:1883"), transport);

        link.ensure_connected(&wifi("w")).await.unwrap();
        link.set_enabled(false).await;
        assert_eq!(link.status().state, LinkState::Disabled);
        assert_eq!(broker.retained("status/rig").as_deref(), Some(STATUS_OFFLINE));
        assert!(matches!(
            link.ensure_connected(&wifi("w")).await.err().unwrap(),
            ConnectionError::Disabled(_)
        ));

        link.set_enabled(true).await;
        assert_eq!(link.status().state, LinkState::Disconnected);
        link.ensure_connected(&wifi("w")).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_endpoints_is_configuration_error() {
        let mut target = TargetConfig::new("primary", "a:1883");
        target.addresses.clear();
        let link = link(target, MemoryTransport::new());
        let err = link.ensure_connected(&wifi("w")).await.err().unwrap();
        assert_eq!(err.class(), crate::broker::ErrorClass::Configuration);

        assert_eq!(link.add_endpoints(&[Endpoint::new("a", 1883), Endpoint::new("a", 1883)]).await, 1);
        assert_eq!(link.endpoint_count().await, 1);
    }
}
