//! Transport seam between the connection manager and a concrete client.
//!
//! The manager only sees [`BrokerTransport`] and [`BrokerSession`]; client
//! library callbacks stay behind these traits.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::trust::{CertDigest, PeerObservation};
use super::ConnectionError;
use crate::config::TlsConfig;

/// Default MQTT port used when an address omits one in URL form.
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Default MQTT-over-TLS port.
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// One broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConnectionError;

    /// `host:port`, `[v6]:port`, or `mqtt://` / `mqtts://` URLs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectionError::InvalidEndpoint(s.to_string());
        let s = s.trim();

        if s.contains("://") {
            let url = url::Url::parse(s).map_err(|_| invalid())?;
            let default_port = match url.scheme() {
                "mqtt" | "tcp" => DEFAULT_MQTT_PORT,
                "mqtts" | "ssl" => DEFAULT_MQTTS_PORT,
                _ => return Err(invalid()),
            };
            let host = url.host_str().ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(Self::new(host, url.port().unwrap_or(default_port)));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

/// Message the broker publishes on our behalf if the session dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Everything needed to open one session.
#[derive(Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle and pin; the transport builds its TLS client from it.
    pub tls: Option<TlsConfig>,
    /// Leaf digest the TLS verifier must see, if pinned.
    pub pin: Option<CertDigest>,
    /// Filled in by the TLS verifier during the handshake.
    pub peer: PeerObservation,
    pub last_will: Option<LastWill>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("username", &self.username)
            .field("tls", &self.tls.is_some())
            .field("pin", &self.pin)
            .field("last_will", &self.last_will)
            .finish_non_exhaustive()
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Connect and wait for the broker to accept the session.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError>;
}

/// One live broker session. All publishes use QoS 1.
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Publish and wait for the broker acknowledgement.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ConnectionError>;

    /// Subscribe to `topic` and wait for its retained message.
    async fn await_retained(&self, topic: &str, timeout: Duration) -> Result<Vec<u8>, ConnectionError>;

    /// Digest of the leaf certificate presented during the handshake.
    fn peer_certificate(&self) -> Option<CertDigest>;

    fn is_alive(&self) -> bool;

    /// Clean disconnect (suppresses the last will).
    async fn disconnect(&self);
}
