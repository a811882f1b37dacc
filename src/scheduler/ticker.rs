//! Fixed-period tick loop with bounded catch-up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::dispatch::DeliveryMetrics;
use crate::scheduler::RecordSink;
use crate::telemetry::{SensorSnapshot, SnapshotSource, TelemetryRecord};

/// Split of the ticks due at one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpPlan {
    /// Oldest ticks, emitted as placeholders.
    pub synthesized: u64,
    /// Newest ticks, executed live back-to-back.
    pub live: u64,
}

impl CatchUpPlan {
    pub fn for_ticks_due(due: u64, cap: u64) -> Self {
        let live = due.min(cap);
        Self {
            synthesized: due - live,
            live,
        }
    }

    pub fn total(&self) -> u64 {
        self.synthesized + self.live
    }
}

/// What one wake-up produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub live: u64,
    pub synthesized: u64,
    /// Live ticks whose source read failed (emitted as placeholders, included in `synthesized`).
    pub source_failures: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
}

/// Offset of tick `n` from the loop origin.
fn nth_tick(period: Duration, n: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(u128::from(n));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Telemetry production loop.
pub struct TickScheduler {
    device_id: String,
    period: Duration,
    catch_up_cap: u64,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn RecordSink>,
    next_sequence: u64,
    last_snapshot: SensorSnapshot,
    metrics: Option<Arc<DeliveryMetrics>>,
}

impl std::fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickScheduler")
            .field("device_id", &self.device_id)
            .field("period", &self.period)
            .field("catch_up_cap", &self.catch_up_cap)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl TickScheduler {
    pub fn new(
        device_id: impl Into<String>,
        config: &SchedulerConfig,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            period: config.period,
            catch_up_cap: config.catch_up_cap.max(1),
            source,
            sink,
            next_sequence: 0,
            last_snapshot: SensorSnapshot::default(),
            metrics: None,
        }
    }

    /// Start numbering at `sequence`: the next emitted record carries it.
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self
    }

    /// Count source failures in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Target times are derived from a fixed monotonic origin, never from the
    /// previous wake-up, so lateness does not accumulate.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let origin = Instant::now();
        let period_nanos = self.period.as_nanos().max(1);
        let mut executed: u64 = 0;

        tracing::info!(
            device_id = %self.device_id,
            period = %humantime::format_duration(self.period),
            catch_up_cap = self.catch_up_cap,
            first_sequence = self.next_sequence,
            "Tick scheduler started"
        );

        loop {
            let target = origin + nth_tick(self.period, executed + 1);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(target) => {}
            }

            let elapsed = Instant::now().duration_since(origin).as_nanos();
            let total = u64::try_from(elapsed / period_nanos).unwrap_or(u64::MAX);
            let due = total.saturating_sub(executed).max(1);
            if due > 1 {
                tracing::warn!(ticks_behind = due, "Scheduler woke late");
            }

            self.process_wake(due, Utc::now(), &shutdown).await;
            executed += due;
        }

        tracing::info!(next_sequence = self.next_sequence, "Tick scheduler stopped");
    }

    /// Emit the records for `due` ticks ending at `wake_utc`.
    ///
    /// Placeholders come first so sequence order matches nominal tick time.
    /// Cancellation is honoured between live ticks.
    pub async fn process_wake(
        &mut self,
        due: u64,
        wake_utc: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> TickReport {
        let plan = CatchUpPlan::for_ticks_due(due, self.catch_up_cap);
        let mut report = TickReport::default();
        if plan.synthesized > 0 {
            tracing::warn!(
                synthesized = plan.synthesized,
                live = plan.live,
                "Catch-up cap exceeded, synthesizing missed ticks"
            );
        }

        for index in 0..plan.total() {
            if index >= plan.synthesized && shutdown.is_cancelled() {
                break;
            }
            let behind = plan.total() - 1 - index;
            let ts = wake_utc
                - chrono::Duration::from_std(nth_tick(self.period, behind))
                    .unwrap_or(chrono::Duration::zero());
            let sequence = self.next_sequence;
            self.next_sequence += 1;

            let record = if index < plan.synthesized {
                report.synthesized += 1;
                TelemetryRecord::synthesized(&self.device_id, sequence, ts, self.last_snapshot.clone())
            } else {
                match self.source.snapshot(ts) {
                    Ok(snapshot) => {
                        report.live += 1;
                        self.last_snapshot = snapshot.clone();
                        TelemetryRecord::live(&self.device_id, sequence, ts, snapshot)
                    }
                    Err(e) => {
                        tracing::warn!(sequence, error = %e, "Sensor snapshot failed, synthesizing tick");
                        report.synthesized += 1;
                        report.source_failures += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.record_source_failures(1);
                        }
                        TelemetryRecord::synthesized(
                            &self.device_id,
                            sequence,
                            ts,
                            self.last_snapshot.clone(),
                        )
                    }
                }
            };

            report.first_sequence.get_or_insert(sequence);
            report.last_sequence = Some(sequence);
            self.sink.accept(record).await;
        }

        report
    }
}
