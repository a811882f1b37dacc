//! Builder for the offline queue.

use std::path::{Path, PathBuf};

use super::{OfflineQueue, QueueError, RecordLog};

/// 256 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_SPILL_CAPACITY: usize = 10_000;

/// Builder for [`OfflineQueue`].
///
/// # Example
///
/// ```ignore
/// let queue = QueueBuilder::new("data/offline_queue.jsonl")
///     .max_bytes(64 * 1024 * 1024)
///     .spill_capacity(1_000)
///     .open()?;
/// ```
#[derive(Debug, Clone)]
pub struct QueueBuilder {
    path: PathBuf,
    max_bytes: u64,
    spill_capacity: usize,
}

impl QueueBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: DEFAULT_MAX_BYTES,
            spill_capacity: DEFAULT_SPILL_CAPACITY,
        }
    }

    /// Upper bound for the durable file plus spilled entries.
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Entries held in memory while storage writes fail.
    pub fn spill_capacity(mut self, capacity: usize) -> Self {
        self.spill_capacity = capacity;
        self
    }

    /// Open (or create) the queue file and compute initial stats.
    pub fn open(self) -> Result<OfflineQueue, QueueError> {
        let log = RecordLog::open(&self.path)?;
        OfflineQueue::new(log, self.max_bytes, self.spill_capacity)
    }
}
