//! MQTT transport over `rumqttc`.
//!
//! Each session owns a driver task that polls the event loop. Outgoing QoS 1
//! publishes are matched to their PUBACKs by packet id; retained messages are
//! kept per topic for identity checks. When the event loop fails the session
//! is marked dead and every pending acknowledgement fails; reconnecting is
//! the connection manager's job, not the driver's.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill as MqttLastWill, MqttOptions,
    Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::transport::{BrokerSession, BrokerTransport, Endpoint, SessionOptions};
use super::trust::{CertDigest, PeerObservation, build_client_config, check_pin};
use super::{ConnectionError, TrustError};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Grace period for the driver to flush a DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type AckSender = oneshot::Sender<Result<(), ConnectionError>>;

// =============================================================================
// Acknowledgement tracking
// =============================================================================

/// Maps QoS 1 publishes to PUBACKs.
///
/// `rumqttc` assigns packet ids inside the event loop, so a publish is first
/// queued in request order and bound to its id when the loop reports
/// `Outgoing::Publish(pkid)`.
#[derive(Debug, Default)]
struct AckTracker {
    awaiting: VecDeque<AckSender>,
    inflight: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn expect(&mut self, tx: AckSender) {
        self.awaiting.push_back(tx);
    }

    fn withdraw_last(&mut self) {
        self.awaiting.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if let Some(tx) = self.awaiting.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            // The publisher may have timed out already.
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self) {
        for tx in self.awaiting.drain(..).chain(self.inflight.drain().map(|(_, tx)| tx)) {
            let _ = tx.send(Err(ConnectionError::SessionClosed));
        }
    }

    fn pending(&self) -> usize {
        self.awaiting.len() + self.inflight.len()
    }
}

struct SessionShared {
    alive: AtomicBool,
    acks: Mutex<AckTracker>,
    retained: watch::Sender<HashMap<String, Vec<u8>>>,
}

impl SessionShared {
    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Opens MQTT 3.1.1 sessions, plain TCP or TLS.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }

    fn mqtt_options(
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<MqttOptions, ConnectionError> {
        let mut mqtt = MqttOptions::new(&options.client_id, &endpoint.host, endpoint.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        if let Some(username) = &options.username {
            mqtt.set_credentials(username, options.password.as_deref().unwrap_or_default());
        }
        if let Some(will) = &options.last_will {
            mqtt.set_last_will(MqttLastWill::new(
                &will.topic,
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }
        if let Some(tls) = &options.tls {
            let client = build_client_config(tls, options.pin, options.peer.clone())?;
            mqtt.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(client)));
        }
        Ok(mqtt)
    }

    /// Poll until CONNACK, translating failures.
    async fn handshake(
        eventloop: &mut EventLoop,
        options: &SessionOptions,
    ) -> Result<(), ConnectionError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(ConnectionError::Refused(format!("{:?}", ack.code)))
                    };
                }
                Ok(_) => continue,
                Err(e) => {
                    // A pin rejection surfaces as a generic TLS error.
                    if options.pin.is_some()
                        && let Some(seen) = options.peer.last()
                    {
                        check_pin(options.pin.as_ref(), Some(seen))?;
                    }
                    return Err(ConnectionError::Transport(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        let (client, mut eventloop) =
            AsyncClient::new(Self::mqtt_options(endpoint, options)?, REQUEST_CAPACITY);

        match tokio::time::timeout(options.connect_timeout, Self::handshake(&mut eventloop, options)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectionError::ConnectTimeout(options.connect_timeout)),
        }

        let (retained, _) = watch::channel(HashMap::new());
        let shared = Arc::new(SessionShared {
            alive: AtomicBool::new(true),
            acks: Mutex::new(AckTracker::default()),
            retained,
        });
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&shared), endpoint.to_string()));

        tracing::debug!(endpoint = %endpoint, client_id = %options.client_id, "MQTT session established");
        Ok(Arc::new(MqttSession {
            client,
            shared,
            tls: options.tls.is_some(),
            peer: options.peer.clone(),
            driver: Mutex::new(Some(driver)),
        }))
    }
}

async fn drive(mut eventloop: EventLoop, shared: Arc<SessionShared>, endpoint: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.acks().on_outgoing(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.acks().on_puback(ack.pkid),
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.retain => {
                let topic = String::from_utf8_lossy(publish.topic.as_ref()).into_owned();
                let payload = publish.payload.to_vec();
                shared.retained.send_modify(|retained| {
                    retained.insert(topic, payload);
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "MQTT session lost");
                break;
            }
        }
    }

    shared.alive.store(false, Ordering::Release);
    let mut acks = shared.acks();
    if acks.pending() > 0 {
        tracing::debug!(endpoint = %endpoint, pending = acks.pending(), "Failing unacknowledged publishes");
    }
    acks.fail_all();
}

// =============================================================================
// Session
// =============================================================================

/// One MQTT connection and its driver task.
pub struct MqttSession {
    client: AsyncClient,
    shared: Arc<SessionShared>,
    tls: bool,
    peer: PeerObservation,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("alive", &self.shared.alive.load(Ordering::Acquire))
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        {
            // Queue and submit under one lock so request order matches packet order.
            let mut acks = self.shared.acks();
            acks.expect(tx);
            if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, retain, payload) {
                acks.withdraw_last();
                return Err(ConnectionError::Transport(e.to_string()));
            }
        }
        rx.await.unwrap_or(Err(ConnectionError::SessionClosed))
    }

    async fn await_retained(&self, topic: &str, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        // Forget any earlier copy so the answer comes from this subscription.
        self.shared.retained.send_modify(|retained| {
            retained.remove(topic);
        });
        let mut rx = self.shared.retained.subscribe();
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

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
        if self.tls { self.peer.last() } else { None }
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        if self.is_alive() {
            let _ = self.client.try_disconnect();
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver
            && tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err()
        {
            driver.abort();
        }
        self.shared.alive.store(false, Ordering::Release);
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acks_follow_packet_ids() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.expect(tx1);
        tracker.expect(tx2);
        tracker.on_outgoing(7);
        tracker.on_outgoing(8);

        tracker.on_puback(8);
        tracker.on_puback(7);
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_releases_waiters() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.expect(tx1);
        tracker.on_outgoing(1);
        tracker.expect(tx2);

        tracker.fail_all();
        assert!(matches!(rx1.await.unwrap(), Err(ConnectionError::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(ConnectionError::SessionClosed)));
    }

    #[test]
    fn test_withdraw_keeps_order() {
        let mut tracker = AckTracker::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        tracker.expect(tx1);
        tracker.expect(tx2);
        tracker.withdraw_last();
        tracker.on_outgoing(3);
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.inflight.contains_key(&3));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                eprintln!("Skipping test: cannot bind local socket");
                return;
            }
            Err(e) => panic!("bind failed: {e}"),
        };
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = SessionOptions {
            client_id: "relay-test".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            username: None,
            password: None,
            tls: None,
            pin: None,
            peer: PeerObservation::default(),
            last_will: None,
        };
        let result = MqttTransport::new()
            .connect(&Endpoint::new("127.0.0.1", port), &options)
            .await;
        let err = result.err().expect("connect should fail");
        assert_eq!(err.class(), crate::broker::ErrorClass::Transient);
    }
}
