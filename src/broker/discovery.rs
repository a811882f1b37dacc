//! Best-effort LAN scan for brokers.
//!
//! Every host of a small IPv4 network is probed with a plain TCP connect on
//! the configured MQTT ports. Hosts that accept become candidate endpoints;
//! trust is established later by the normal identity checks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::transport::Endpoint;
use crate::config::DiscoveryConfig;

/// Smallest prefix accepted; larger networks take too long to sweep.
const MIN_PREFIX: u8 = 24;

/// Host addresses of an IPv4 CIDR such as `192.168.1.0/24`.
///
/// Network and broadcast addresses are excluded below `/31`.
pub fn ipv4_cidr_hosts(cidr: &str) -> Result<Vec<Ipv4Addr>, String> {
    let (addr, prefix) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| format!("'{cidr}' is not in address/prefix form"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("'{addr}' is not an IPv4 address"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("'{prefix}' is not a prefix length"))?;
    if !(MIN_PREFIX..=32).contains(&prefix) {
        return Err(format!("prefix /{prefix} outside /{MIN_PREFIX}../32"));
    }

    let mask = u32::MAX << (32 - u32::from(prefix));
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    let hosts = if prefix >= 31 {
        (network..=broadcast).map(Ipv4Addr::from).collect()
    } else {
        (network + 1..broadcast).map(Ipv4Addr::from).collect()
    };
    Ok(hosts)
}

/// Probe every host/port pair and return the ones that accepted.
///
/// Results are sorted so repeated scans give a stable endpoint order.
pub async fn discover(config: &DiscoveryConfig) -> Vec<Endpoint> {
    let Some(cidr) = config.cidr.as_deref() else {
        return Vec::new();
    };
    let hosts = match ipv4_cidr_hosts(cidr) {
        Ok(hosts) => hosts,
        Err(e) => {
            tracing::warn!(cidr = %cidr, error = %e, "Discovery skipped");
            return Vec::new();
        }
    };

    let started = Instant::now();
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut probes = JoinSet::new();
    for host in &hosts {
        for &port in &config.ports {
            let addr = SocketAddr::from((*host, port));
            let permits = Arc::clone(&permits);
            let probe_timeout = config.probe_timeout;
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                match timeout(probe_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => Some(addr),
                    _ => None,
                }
            });
        }
    }

    let mut found = Vec::new();
    while let Some(result) = probes.join_next().await {
        if let Ok(Some(addr)) = result {
            found.push(addr);
        }
    }
    found.sort();

    let endpoints: Vec<Endpoint> = found
        .into_iter()
        .map(|addr| Endpoint::new(addr.ip().to_string(), addr.port()))
        .collect();
    tracing::info!(
        cidr = %cidr,
        hosts = hosts.len(),
        found = endpoints.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Broker discovery finished"
    );
    endpoints
}
