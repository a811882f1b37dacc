//! Queue data types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::telemetry::TelemetryRecord;

/// Names of broker targets that still need a record.
pub type TargetSet = BTreeSet<String>;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why a record ended up in the offline queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueReason {
    /// Device is not attached to the trusted medium; no publish was attempted.
    NotOnWifi,
    /// Live publish did not complete within the publish timeout.
    PublishTimeout,
    /// Live publish failed (transport error, broker refused).
    PublishFailed,
    /// Some targets succeeded, the remaining ones are queued.
    PartialFailure,
    /// Broker identity or certificate pin could not be verified.
    BrokerUnverified,
    /// No live connection (disconnected or backing off).
    NotConnected,
    /// Placeholder for a tick that was not executed live.
    MissedTick,
}

/// One undelivered record and the targets still waiting for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub record: TelemetryRecord,
    pub targets: TargetSet,
    pub reason: QueueReason,
    pub enqueued_at: DateTime<Utc>,
    /// Drain attempts that did not fully deliver this entry.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueEntry {
    pub fn new(record: TelemetryRecord, targets: TargetSet, reason: QueueReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            record,
            targets,
            reason,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Encode as one newline-terminated log line.
    pub(crate) fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Cached approximation of the durable queue contents.
///
/// `count == 0` must eventually coincide with `size_bytes == 0`; a non-empty
/// count with a zero size is an anomaly that forces a recalculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub count: u64,
    pub size_bytes: u64,
}

impl QueueStats {
    pub fn new(count: u64, size_bytes: u64) -> Self {
        Self { count, size_bytes }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_MB
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Entries are counted but no bytes are accounted for them.
    pub fn is_anomalous(&self) -> bool {
        self.count > 0 && self.size_bytes == 0
    }
}

/// Result of one `drain_once` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries handed to the publish function.
    pub attempted: usize,
    /// Entries delivered to every target and removed.
    pub processed: usize,
    /// Entries delivered to some but not all targets (kept with fewer targets).
    pub partial: usize,
    /// Entries left untouched because every target they need failed earlier in the batch.
    pub skipped: usize,
    /// Entries left after the commit.
    pub remaining: u64,
    /// At least one target could not be reached during the batch.
    pub blocked: bool,
    /// Highest sequence among the entries removed by the batch.
    pub max_delivered_sequence: Option<u64>,
}
