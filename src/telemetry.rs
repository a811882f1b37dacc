//! Telemetry Records
//!
//! Immutable per-tick snapshots and the pull-based sensor collaborator that
//! feeds them.
//!
//! - [`TelemetryRecord`]: one record per scheduler tick, never mutated after creation
//! - [`SnapshotSource`]: sensor/position collaborator called once per tick
//! - [`SimulatedSource`]: synthetic source used by the binary and in dry runs

mod source;
mod types;

pub use source::{SimulatedSource, SnapshotSource, SourceError};
pub use types::{Position, RecordOrigin, RecordStatus, SensorSnapshot, TelemetryRecord};
