//! Hybrid drift correction for cached queue stats.
//!
//! Three independent triggers call [`OfflineQueue::recalculate_stats`]:
//!
//! 1. after any drain batch that removed entries,
//! 2. whenever the cached stats are anomalous (`count > 0`, zero bytes),
//! 3. every `every` monitoring cycles regardless of the other two.

use strum_macros::{AsRefStr, Display};

use super::{DrainReport, OfflineQueue, QueueError, QueueStats};

pub const DEFAULT_RECONCILE_EVERY: u32 = 10;

/// Which trigger caused a recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileTrigger {
    AfterBatch,
    Anomaly,
    Periodic,
}

/// Result of one [`StatsReconciler::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub trigger: Option<ReconcileTrigger>,
    /// Stats after the cycle (recalculated if a trigger fired, cached otherwise).
    pub stats: QueueStats,
    /// `|cached.count - recalculated.count|` observed when a trigger fired.
    pub drift: u64,
}

/// Per-cycle monitor owned by the drain loop.
#[derive(Debug, Clone)]
pub struct StatsReconciler {
    every: u32,
    cycles: u32,
}

impl StatsReconciler {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            cycles: 0,
        }
    }

    /// Decide whether this cycle needs a full scan, and run it if so.
    pub fn observe(
        &mut self,
        queue: &OfflineQueue,
        batch: Option<&DrainReport>,
    ) -> Result<Reconciliation, QueueError> {
        self.cycles += 1;
        let cached = queue.current_stats();

        let trigger = if batch.is_some_and(|report| report.processed > 0) {
            Some(ReconcileTrigger::AfterBatch)
        } else if cached.is_anomalous() {
            Some(ReconcileTrigger::Anomaly)
        } else if self.cycles >= self.every {
            Some(ReconcileTrigger::Periodic)
        } else {
            None
        };

        let Some(trigger) = trigger else {
            return Ok(Reconciliation {
                trigger: None,
                stats: cached,
                drift: 0,
            });
        };

        // Any full scan restarts the periodic interval.
        self.cycles = 0;
        let stats = queue.recalculate_stats()?;
        let drift = cached.count.abs_diff(stats.count);
        if drift > 0 || cached.size_bytes != stats.size_bytes {
            tracing::info!(
                trigger = %trigger,
                cached_count = cached.count,
                cached_bytes = cached.size_bytes,
                count = stats.count,
                size_bytes = stats.size_bytes,
                "Queue stats reconciled"
            );
        } else {
            tracing::debug!(trigger = %trigger, count = stats.count, "Queue stats verified");
        }

        Ok(Reconciliation {
            trigger: Some(trigger),
            stats,
            drift,
        })
    }
}

impl Default for StatsReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECONCILE_EVERY)
    }
}
