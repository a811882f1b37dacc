//! Durable offline queue with read–process–write draining.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::log::RecordLog;
use super::types::{DrainReport, QueueEntry, QueueReason, QueueStats, TargetSet};
use super::QueueError;
use crate::telemetry::TelemetryRecord;

/// An entry whose append failed, kept in memory until the next successful write.
#[derive(Debug)]
struct Spilled {
    entry: QueueEntry,
    line: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    cached: QueueStats,
    spill: VecDeque<Spilled>,
}

impl QueueState {
    fn spill_bytes(&self) -> u64 {
        self.spill.iter().map(|s| s.line.len() as u64).sum()
    }
}

/// What a drain batch decided for one entry.
#[derive(Debug)]
enum Outcome {
    Delivered,
    Remaining(TargetSet),
}

/// Clears the drain flag when a drain finishes or its future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Persistent offline queue.
///
/// The mutex protects the log file and the cached stats together and is
/// never held across an `.await`.
pub struct OfflineQueue {
    log: RecordLog,
    max_bytes: u64,
    spill_capacity: usize,
    state: Mutex<QueueState>,
    draining: AtomicBool,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("path", &self.log.path())
            .field("max_bytes", &self.max_bytes)
            .field("spill_capacity", &self.spill_capacity)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    pub(crate) fn new(
        log: RecordLog,
        max_bytes: u64,
        spill_capacity: usize,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            log,
            max_bytes,
            spill_capacity,
            state: Mutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
        };
        let stats = queue.recalculate_stats()?;
        tracing::info!(
            path = %queue.log.path().display(),
            count = stats.count,
            size_bytes = stats.size_bytes,
            "Offline queue opened"
        );
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record for later delivery to `targets`.
    ///
    /// Returns `true` once the entry is durable. Returns `false` when the
    /// queue is full, the entry has no targets, or the append failed; in the
    /// last case the entry is held in the in-memory spill and written by the
    /// next successful write.
    pub fn enqueue(&self, record: TelemetryRecord, targets: TargetSet, reason: QueueReason) -> bool {
        match self.try_enqueue(record, targets, reason) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, reason = %reason, "Enqueue failed");
                false
            }
        }
    }

    fn try_enqueue(
        &self,
        record: TelemetryRecord,
        targets: TargetSet,
        reason: QueueReason,
    ) -> Result<(), QueueError> {
        if targets.is_empty() {
            return Err(QueueError::NoTargets);
        }
        let sequence = record.sequence();
        let entry = QueueEntry::new(record, targets, reason);
        let line = entry.to_line()?;
        let line_len = line.len() as u64;

        let mut state = self.lock();
        let file_len = self.log.len().unwrap_or(state.cached.size_bytes);
        let used = file_len + state.spill_bytes();
        if used + line_len > self.max_bytes {
            return Err(QueueError::Full {
                size_bytes: used,
                max_bytes: self.max_bytes,
            });
        }

        let mut lines: Vec<Vec<u8>> = state.spill.iter().map(|s| s.line.clone()).collect();
        lines.push(line);

        match self.log.append(&lines) {
            Ok(()) => {
                if !state.spill.is_empty() {
                    tracing::info!(count = state.spill.len(), "Flushed spilled queue entries");
                    state.spill.clear();
                }
                state.cached.count += 1;
                state.cached.size_bytes += line_len;
                tracing::debug!(sequence, reason = %reason, "Record enqueued");
                Ok(())
            }
            Err(e) => {
                if state.spill.len() < self.spill_capacity {
                    let line = lines.pop().unwrap_or_default();
                    state.spill.push_back(Spilled { entry, line });
                    state.cached.count += 1;
                    state.cached.size_bytes += line_len;
                    tracing::warn!(
                        sequence,
                        spilled = state.spill.len(),
                        "Queue append failed, record held in memory"
                    );
                } else {
                    tracing::error!(
                        sequence,
                        capacity = self.spill_capacity,
                        "Queue append failed and spill is full, record dropped"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drain up to `max_batch` entries through `publish`.
    ///
    /// `publish` receives each entry, narrowed to the targets still worth
    /// trying, and returns the targets it was delivered to. Entries delivered
    /// everywhere are removed, partially delivered ones keep their remaining
    /// targets. A target that fails once is skipped for the rest of the batch,
    /// and entries waiting only on such targets are left untouched without
    /// using a batch slot. If the commit fails nothing is removed and the
    /// whole batch is retried on the next call.
    pub async fn drain_once<F, Fut>(
        &self,
        max_batch: usize,
        mut publish: F,
    ) -> Result<DrainReport, QueueError>
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = TargetSet>,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return Ok(DrainReport {
                remaining: self.current_stats().count,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let (pending, corrupt) = self.copy_out()?;
        let mut report = DrainReport::default();
        if pending.is_empty() && corrupt == 0 {
            report.remaining = self.current_stats().count;
            return Ok(report);
        }

        let mut outcomes = HashMap::new();
        let mut unreachable = TargetSet::new();
        for mut entry in pending {
            if report.attempted >= max_batch {
                break;
            }
            let live: TargetSet = entry.targets.difference(&unreachable).cloned().collect();
            if live.is_empty() {
                report.skipped += 1;
                continue;
            }

            let id = entry.id;
            let sequence = entry.record.sequence();
            let wanted = std::mem::replace(&mut entry.targets, live.clone());
            report.attempted += 1;

            let delivered = publish(entry).await;
            unreachable.extend(live.difference(&delivered).cloned());
            let remaining: TargetSet = wanted.difference(&delivered).cloned().collect();

            if remaining.is_empty() {
                report.processed += 1;
                report.max_delivered_sequence = report.max_delivered_sequence.max(Some(sequence));
                outcomes.insert(id, Outcome::Delivered);
            } else {
                if remaining.len() < wanted.len() {
                    report.partial += 1;
                }
                outcomes.insert(id, Outcome::Remaining(remaining));
            }
        }
        report.blocked = !unreachable.is_empty();

        report.remaining = self.commit(&outcomes)?;
        tracing::debug!(
            attempted = report.attempted,
            processed = report.processed,
            partial = report.partial,
            skipped = report.skipped,
            remaining = report.remaining,
            unreachable = ?unreachable,
            "Drain batch committed"
        );
        Ok(report)
    }

    /// Step 1: copy out every readable entry, durable ones first, and count
    /// the unreadable lines.
    fn copy_out(&self) -> Result<(Vec<QueueEntry>, usize), QueueError> {
        let state = self.lock();
        let mut pending = Vec::new();
        let mut corrupt = 0;
        for line in self.log.read_lines()? {
            match serde_json::from_str::<QueueEntry>(&line) {
                Ok(entry) => pending.push(entry),
                Err(_) => corrupt += 1,
            }
        }
        pending.extend(state.spill.iter().map(|spilled| spilled.entry.clone()));
        Ok((pending, corrupt))
    }

    /// Step 3: apply outcomes against the current file contents and rewrite.
    ///
    /// Entries appended while the batch was in flight are kept untouched.
    fn commit(&self, outcomes: &HashMap<Uuid, Outcome>) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let mut kept: Vec<Vec<u8>> = Vec::new();
        let mut corrupt = Vec::new();

        for line in self.log.read_lines()? {
            match serde_json::from_str::<QueueEntry>(&line) {
                Ok(entry) => {
                    if let Some(line) = Self::apply(entry, line, outcomes)? {
                        kept.push(line);
                    }
                }
                Err(_) => corrupt.push(line),
            }
        }
        for spilled in &state.spill {
            let raw = String::from_utf8_lossy(&spilled.line).trim_end().to_string();
            if let Some(line) = Self::apply(spilled.entry.clone(), raw, outcomes)? {
                kept.push(line);
            }
        }

        self.log.quarantine(&corrupt)?;
        let size_bytes = self.log.rewrite(&kept)?;

        state.spill.clear();
        state.cached = QueueStats::new(kept.len() as u64, size_bytes);
        Ok(state.cached.count)
    }

    fn apply(
        mut entry: QueueEntry,
        mut raw: String,
        outcomes: &HashMap<Uuid, Outcome>,
    ) -> Result<Option<Vec<u8>>, QueueError> {
        match outcomes.get(&entry.id) {
            Some(Outcome::Delivered) => Ok(None),
            Some(Outcome::Remaining(targets)) => {
                entry.targets = targets.clone();
                entry.attempts += 1;
                Ok(Some(entry.to_line()?))
            }
            None => {
                raw.push('\n');
                Ok(Some(raw.into_bytes()))
            }
        }
    }

    /// Cached stats. Cheap, may lag the durable contents.
    pub fn current_stats(&self) -> QueueStats {
        self.lock().cached
    }

    /// Scan durable storage and the spill, refresh the cache, return the truth.
    pub fn recalculate_stats(&self) -> Result<QueueStats, QueueError> {
        let mut state = self.lock();
        let (mut count, mut size_bytes) = (state.spill.len() as u64, state.spill_bytes());
        for line in self.log.read_lines()? {
            // Unreadable lines are not pending entries; the next drain
            // moves them to the sidecar.
            if serde_json::from_str::<QueueEntry>(&line).is_ok() {
                count += 1;
                size_bytes += line.len() as u64 + 1;
            }
        }
        let stats = QueueStats::new(count, size_bytes);
        state.cached = stats;
        Ok(stats)
    }

    /// Every pending entry, durable ones first.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.lock();
        let mut entries: Vec<QueueEntry> = self
            .log
            .read_lines()?
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.extend(state.spill.iter().map(|s| s.entry.clone()));
        Ok(entries)
    }

    /// Highest sequence number held in the queue, if any.
    pub fn max_sequence(&self) -> Result<Option<u64>, QueueError> {
        Ok(self
            .entries()?
            .iter()
            .map(|entry| entry.record.sequence())
            .max())
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Test hook: overwrite the cached stats to simulate drift.
    #[cfg(test)]
    pub(crate) fn set_cached_stats(&self, stats: QueueStats) {
        self.lock().cached = stats;
    }
}
