//! Sensor/position collaborator.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{Position, SensorSnapshot};

/// Errors reported by a snapshot source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The sensor could not be read for this tick.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    /// No usable position fix.
    #[error("position unavailable")]
    NoFix,
}

/// Pull-based sensor collaborator, called once per tick.
///
/// Acquisition and statistical aggregation happen behind this trait; the
/// scheduler only asks for the values valid at `ts`.
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot(&self, ts: DateTime<Utc>) -> Result<SensorSnapshot, SourceError>;
}

impl<F> SnapshotSource for F
where
    F: Fn(DateTime<Utc>) -> Result<SensorSnapshot, SourceError> + Send + Sync + 'static,
{
    fn snapshot(&self, ts: DateTime<Utc>) -> Result<SensorSnapshot, SourceError> {
        self(ts)
    }
}

/// Synthetic source producing plausible, slowly drifting readings.
#[derive(Debug)]
pub struct SimulatedSource {
    origin: Position,
    walk: Mutex<(f64, f64)>,
}

impl SimulatedSource {
    pub fn new(origin: Position) -> Self {
        Self {
            origin,
            walk: Mutex::new((0.0, 0.0)),
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(Position {
            latitude: 52.52,
            longitude: 13.405,
            altitude_m: Some(34.0),
            accuracy_m: Some(5.0),
        })
    }
}

impl SnapshotSource for SimulatedSource {
    fn snapshot(&self, _ts: DateTime<Utc>) -> Result<SensorSnapshot, SourceError> {
        let (dlat, dlon) = {
            let mut walk = self
                .walk
                .lock()
                .map_err(|_| SourceError::Unavailable("position walk poisoned".to_string()))?;
            walk.0 += (rand::random::<f64>() - 0.5) * 1e-4;
            walk.1 += (rand::random::<f64>() - 0.5) * 1e-4;
            *walk
        };

        Ok(SensorSnapshot::default()
            .with_value("accel_x", (rand::random::<f64>() - 0.5) * 0.2)
            .with_value("accel_y", (rand::random::<f64>() - 0.5) * 0.2)
            .with_value("accel_z", 9.81 + (rand::random::<f64>() - 0.5) * 0.2)
            .with_value("temperature_c", 18.0 + rand::random::<f64>() * 15.0)
            .with_value("rssi_dbm", -70.0 + rand::random::<f64>() * 30.0)
            .with_position(Position {
                latitude: self.origin.latitude + dlat,
                longitude: self.origin.longitude + dlon,
                ..self.origin
            }))
    }
}
