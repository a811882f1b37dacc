//! Network attachment tracking.
//!
//! The current attachment is published on a `watch` channel. Identity
//! verification is keyed on [`NetworkAttachment::key`], so any change of
//! medium or association invalidates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Link-layer technology the device is attached through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Medium {
    Wifi,
    Ethernet,
    Cellular,
    Offline,
}

/// Current network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAttachment {
    pub medium: Medium,
    /// Interface or association identifier; changes on re-association.
    pub network_id: Option<String>,
}

impl NetworkAttachment {
    pub fn new(medium: Medium, network_id: Option<String>) -> Self {
        Self { medium, network_id }
    }

    pub fn offline() -> Self {
        Self::new(Medium::Offline, None)
    }

    /// Identity-cache key for this attachment.
    pub fn key(&self) -> String {
        match &self.network_id {
            Some(id) => format!("{}/{}", self.medium, id),
            None => self.medium.to_string(),
        }
    }
}

/// Receiver side of the attachment channel.
pub type NetworkWatch = watch::Receiver<NetworkAttachment>;

/// Channel with a fixed attachment that never changes.
pub fn static_network(attachment: NetworkAttachment) -> (watch::Sender<NetworkAttachment>, NetworkWatch) {
    watch::channel(attachment)
}

// =============================================================================
// sysfs probe
// =============================================================================

/// Classifies interfaces under `/sys/class/net`.
///
/// An interface counts when its `operstate` is `up`. Wireless interfaces are
/// recognised by a `wireless` or `phy80211` entry; `wwan*`/`rmnet*` names are
/// cellular; everything else is ethernet. The network id combines the
/// interface name with its `carrier_changes` counter so a re-association is
/// visible as a new attachment.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
}

impl SysfsProbe {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn probe(&self) -> NetworkAttachment {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return NetworkAttachment::offline();
        };

        let mut best: Option<(u8, NetworkAttachment)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" {
                continue;
            }
            let dir = entry.path();
            let operstate = read_trimmed(&dir.join("operstate")).unwrap_or_default();
            if operstate != "up" {
                continue;
            }

            let medium = if dir.join("wireless").exists() || dir.join("phy80211").exists() {
                Medium::Wifi
            } else if name.starts_with("wwan") || name.starts_with("rmnet") {
                Medium::Cellular
            } else {
                Medium::Ethernet
            };
            let rank = match medium {
                Medium::Wifi => 0,
                Medium::Ethernet => 1,
                Medium::Cellular => 2,
                Medium::Offline => 3,
            };

            let changes = read_trimmed(&dir.join("carrier_changes")).unwrap_or_default();
            let network_id = if changes.is_empty() {
                name.clone()
            } else {
                format!("{name}#{changes}")
            };
            let candidate = NetworkAttachment::new(medium, Some(network_id));
            // Lowest rank wins, ties broken by interface name.
            let better = match &best {
                None => true,
                Some((best_rank, best_att)) => {
                    rank < *best_rank || (rank == *best_rank && candidate.network_id < best_att.network_id)
                }
            };
            if better {
                best = Some((rank, candidate));
            }
        }

        best.map(|(_, att)| att).unwrap_or_else(NetworkAttachment::offline)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Poll `probe` every `interval` and publish changes until `shutdown`.
pub fn spawn_sysfs_monitor(
    probe: SysfsProbe,
    interval: Duration,
    shutdown: CancellationToken,
) -> (NetworkWatch, JoinHandle<()>) {
    let (tx, rx) = watch::channel(probe.probe());
    tracing::info!(attachment = %rx.borrow().key(), "Network attachment detected");

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = probe.probe();
            tx.send_if_modified(|previous| {
                if *previous == current {
                    return false;
                }
                tracing::info!(
                    from = %previous.key(),
                    to = %current.key(),
                    "Network attachment changed"
                );
                *previous = current;
                true
            });
        }
    });
    (rx, handle)
}
