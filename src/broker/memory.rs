//! In-process broker used by tests and `--dry-run`.
//!
//! A [`MemoryBroker`] records every acknowledged publish and keeps retained
//! messages per topic. Outages, slow acknowledgements, publish failures and a
//! presented certificate digest can be switched on at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::transport::{BrokerSession, BrokerTransport, Endpoint, LastWill, SessionOptions};
use super::trust::CertDigest;
use super::{ConnectionError, TrustError};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One acknowledged publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug)]
struct SessionHandle {
    alive: Arc<AtomicBool>,
    last_will: Option<LastWill>,
}

#[derive(Debug)]
struct BrokerShared {
    online: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Duration>,
    peer_digest: Mutex<Option<CertDigest>>,
    connects: AtomicU64,
    messages: Mutex<Vec<PublishedMessage>>,
    retained: watch::Sender<HashMap<String, Vec<u8>>>,
    sessions: Mutex<Vec<SessionHandle>>,
}

/// Shared handle to an in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (retained, _) = watch::channel(HashMap::new());
        Self {
            shared: Arc::new(BrokerShared {
                online: AtomicBool::new(true),
                fail_publish: AtomicBool::new(false),
                publish_delay: Mutex::new(Duration::ZERO),
                peer_digest: Mutex::new(None),
                connects: AtomicU64::new(0),
                messages: Mutex::new(Vec::new()),
                retained,
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Broker that announces `id` on `topic`.
    pub fn with_identity(topic: &str, id: &str) -> Self {
        let broker = Self::new();
        broker.set_retained(topic, id.as_bytes());
        broker
    }

    /// Going offline kills every open session (publishing their last wills)
    /// and refuses new connections.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
        if !online {
            self.drop_sessions();
        }
    }

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    /// Drop every open session without a clean disconnect.
    pub fn drop_sessions(&self) {
        let sessions = std::mem::take(&mut *locked(&self.shared.sessions));
        for session in sessions {
            if session.alive.swap(false, Ordering::AcqRel)
                && let Some(will) = session.last_will
            {
                self.store(will.topic, will.payload, will.retain);
            }
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::Release);
    }

    /// Delay before each acknowledgement.
    pub fn set_publish_delay(&self, delay: Duration) {
        *locked(&self.shared.publish_delay) = delay;
    }

    /// Leaf certificate digest presented to clients.
    pub fn set_peer_digest(&self, digest: Option<CertDigest>) {
        *locked(&self.shared.peer_digest) = digest;
    }

    pub fn set_retained(&self, topic: &str, payload: &[u8]) {
        let (topic, payload) = (topic.to_string(), payload.to_vec());
        self.shared.retained.send_modify(|retained| {
            retained.insert(topic, payload);
        });
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.shared.retained.borrow().get(topic).cloned()
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Acquire)
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        locked(&self.shared.messages).clone()
    }

    /// Payloads acknowledged on `topic`, in order.
    pub fn payloads_on(&self, topic: &str) -> Vec<Vec<u8>> {
        locked(&self.shared.messages)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    fn store(&self, topic: String, payload: Vec<u8>, retain: bool) {
        if retain {
            self.set_retained(&topic, &payload);
        }
        locked(&self.shared.messages).push(PublishedMessage {
            topic,
            payload,
            retain,
        });
    }
}

/// Routes endpoints to registered [`MemoryBroker`]s.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    brokers: Mutex<HashMap<Endpoint, MemoryBroker>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(self, endpoint: Endpoint, broker: MemoryBroker) -> Self {
        self.register(endpoint, broker);
        self
    }

    pub fn register(&self, endpoint: Endpoint, broker: MemoryBroker) {
        locked(&self.brokers).insert(endpoint, broker);
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        let broker = locked(&self.brokers).get(endpoint).cloned().ok_or_else(|| {
            ConnectionError::Transport(format!("connection refused by {endpoint}"))
        })?;
        if !broker.is_online() {
            return Err(ConnectionError::Transport(format!("{endpoint} unreachable")));
        }
        broker.shared.connects.fetch_add(1, Ordering::AcqRel);

        let peer = *locked(&broker.shared.peer_digest);
        if let Some(digest) = peer {
            options.peer.record(digest);
        }
        let alive = Arc::new(AtomicBool::new(true));
        locked(&broker.shared.sessions).push(SessionHandle {
            alive: Arc::clone(&alive),
            last_will: options.last_will.clone(),
        });
        Ok(Arc::new(MemorySession {
            broker,
            alive,
            peer,
        }))
    }
}

/// Session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
    peer: Option<CertDigest>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::SessionClosed);
        }
        let delay = *locked(&self.broker.shared.publish_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_alive() {
            return Err(ConnectionError::SessionClosed);
        }
        if self.broker.shared.fail_publish.load(Ordering::Acquire) {
            return Err(ConnectionError::Transport("publish rejected".to_string()));
        }
        self.broker.store(topic.to_string(), payload, retain);
        Ok(())
    }

    async fn await_retained(&self, topic: &str, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        let mut rx = self.broker.shared.retained.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|retained| retained.contains_key(topic))).await {
            Ok(Ok(retained)) => Ok(retained.get(topic).cloned().unwrap_or_default()),
            Ok(Err(_)) => Err(ConnectionError::SessionClosed),
            Err(_) => Err(TrustError::IdentityTimeout {
                topic: topic.to_string(),
                timeout,
            }
            .into()),
        }
    }

    fn peer_certificate(&self) -> Option<CertDigest> {
        self.peer
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.broker.is_online()
    }

    async fn disconnect(&self) {
        // Clean disconnect: the broker forgets the will.
        self.alive.store(false, Ordering::Release);
        locked(&self.broker.shared.sessions).retain(|s| !Arc::ptr_eq(&s.alive, &self.alive));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PeerObservation;

    fn options(last_will: Option<LastWill>) -> SessionOptions {
        SessionOptions {
            client_id: "relay-test".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
            username: None,
            password: None,
            tls: None,
            pin: None,
            peer: PeerObservation::default(),
            last_will,
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("broker.local", 1883)
    }

    #[tokio::test]
    async fn test_publish_recorded() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(endpoint(), broker.clone());
        let session = transport.connect(&endpoint(), &options(None)).await.unwrap();

        session.publish("telemetry/rig", b"{}".to_vec(), false).await.unwrap();
        session.publish("status/rig", b"online".to_vec(), true).await.unwrap();
        assert_eq!(broker.payloads_on("telemetry/rig").len(), 1);
        assert_eq!(broker.retained("status/rig").as_deref(), Some(&b"online"[..]));
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_refused() {
        let transport = MemoryTransport::new();
        let err = transport.connect(&endpoint(), &options(None)).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_outage_publishes_last_will() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(endpoint(), broker.clone());
        let will = LastWill {
            topic: "status/rig".to_string(),
            payload: b"offline".to_vec(),
            retain: true,
        };
        let session = transport.connect(&endpoint(), &options(Some(will))).await.unwrap();

        broker.set_online(false);
        assert!(!session.is_alive());
        assert!(matches!(
            session.publish("telemetry/rig", vec![], false).await,
            Err(ConnectionError::SessionClosed)
        ));
        assert_eq!(broker.retained("status/rig").as_deref(), Some(&b"offline"[..]));
        assert!(transport.connect(&endpoint(), &options(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_disconnect_suppresses_will() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(endpoint(), broker.clone());
        let will = LastWill {
            topic: "status/rig".to_string(),
            payload: b"offline".to_vec(),
            retain: true,
        };
        let session = transport.connect(&endpoint(), &options(Some(will))).await.unwrap();
        session.disconnect().await;
        broker.drop_sessions();
        assert_eq!(broker.retained("status/rig"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_retained_times_out() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(endpoint(), broker);
        let session = transport.connect(&endpoint(), &options(None)).await.unwrap();
        let err = session
            .await_retained("broker/identity", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Trust(TrustError::IdentityTimeout { .. })));
    }

    #[tokio::test]
    async fn test_peer_digest_observed() {
        let broker = MemoryBroker::new();
        broker.set_peer_digest(Some(CertDigest::of(b"leaf")));
        let transport = MemoryTransport::new().with_broker(endpoint(), broker);
        let opts = options(None);
        let session = transport.connect(&endpoint(), &opts).await.unwrap();
        assert_eq!(session.peer_certificate(), Some(CertDigest::of(b"leaf")));
        assert_eq!(opts.peer.last(), Some(CertDigest::of(b"leaf")));
    }
}
