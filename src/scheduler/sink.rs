//! Seam between the scheduler and whatever consumes its records.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::telemetry::TelemetryRecord;

/// Consumer of produced records.
///
/// Implementations must not fail the tick: delivery and queueing errors are
/// handled (and counted) on the consumer side.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn accept(&self, record: TelemetryRecord);
}

/// Forward records into a channel. A closed receiver drops the record.
#[async_trait]
impl RecordSink for mpsc::UnboundedSender<TelemetryRecord> {
    async fn accept(&self, record: TelemetryRecord) {
        if let Err(e) = self.send(record) {
            tracing::warn!(sequence = e.0.sequence(), "Record channel closed");
        }
    }
}
