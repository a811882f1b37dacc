//! Core telemetry data types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Outcome tag of a tick.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    /// Tick executed on schedule with a fresh sensor snapshot.
    Ok,
    /// Placeholder for a tick that was not executed live.
    MissedTick,
}

/// Where the record's values came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordOrigin {
    /// Values read from the sensor collaborator during the tick.
    Live,
    /// Values carried over from the last known snapshot.
    Synthesized,
}

/// Geographic fix attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

/// Sensor and position values delivered by the sensor collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Named numeric channels (e.g. `accel_x`, `temperature_c`).
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    /// Last position fix, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl SensorSnapshot {
    /// Add a numeric channel.
    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Attach a position fix.
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// Immutable telemetry snapshot produced once per scheduler tick.
///
/// Fields are private so that a record cannot change after the scheduler
/// assigned its sequence number. Ownership passes from the scheduler to the
/// dispatcher and, on failed delivery, into the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    device_id: String,
    sequence: u64,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    snapshot: SensorSnapshot,
    status: RecordStatus,
    origin: RecordOrigin,
}

impl TelemetryRecord {
    /// Record for a tick executed live.
    pub fn live(
        device_id: impl Into<String>,
        sequence: u64,
        ts: DateTime<Utc>,
        snapshot: SensorSnapshot,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sequence,
            ts,
            snapshot,
            status: RecordStatus::Ok,
            origin: RecordOrigin::Live,
        }
    }

    /// Placeholder for a missed tick, carrying the last known values.
    pub fn synthesized(
        device_id: impl Into<String>,
        sequence: u64,
        ts: DateTime<Utc>,
        last_known: SensorSnapshot,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sequence,
            ts,
            snapshot: last_known,
            status: RecordStatus::MissedTick,
            origin: RecordOrigin::Synthesized,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn origin(&self) -> RecordOrigin {
        self.origin
    }

    pub fn is_synthesized(&self) -> bool {
        self.origin == RecordOrigin::Synthesized
    }

    /// Wire payload (JSON) published on the telemetry topic.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn snapshot() -> SensorSnapshot {
        SensorSnapshot::default()
            .with_value("temperature_c", 21.5)
            .with_position(Position {
                latitude: 47.37,
                longitude: 8.54,
                altitude_m: None,
                accuracy_m: Some(4.0),
            })
    }

    #[test]
    fn test_live_record_tags() {
        let record = TelemetryRecord::live("rig-01", 7, Utc::now(), snapshot());
        assert_eq!(record.sequence(), 7);
        assert_eq!(record.status(), RecordStatus::Ok);
        assert_eq!(record.origin(), RecordOrigin::Live);
        assert!(!record.is_synthesized());
    }

    #[test]
    fn test_synthesized_record_tags() {
        let record = TelemetryRecord::synthesized("rig-01", 8, Utc::now(), snapshot());
        assert_eq!(record.status(), RecordStatus::MissedTick);
        assert_eq!(record.origin(), RecordOrigin::Synthesized);
        assert_eq!(record.snapshot().values["temperature_c"], 21.5);
    }

    #[test]
    fn test_payload_uses_wire_tags() {
        let record = TelemetryRecord::synthesized("rig-01", 3, Utc::now(), snapshot());
        let json: serde_json::Value = serde_json::from_slice(&record.to_payload().unwrap()).unwrap();
        assert_eq!(json["status"], "missed_tick");
        assert_eq!(json["origin"], "synthesized");
        assert_eq!(json["device_id"], "rig-01");
        assert_eq!(json["values"]["temperature_c"], 21.5);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(RecordStatus::from_str("ok").unwrap(), RecordStatus::Ok);
        assert_eq!(
            RecordStatus::from_str("missed_tick").unwrap(),
            RecordStatus::MissedTick
        );
        assert!(RecordStatus::from_str("late").is_err());
    }
}
