//! Persistent Offline Queue
//!
//! Durable, append-only store of records that could not be delivered live.
//! One JSON line per pending record; drains rewrite the file atomically.
//!
//! # Components
//!
//! - [`OfflineQueue`]: enqueue / drain_once / current_stats / recalculate_stats
//! - [`StatsReconciler`]: hybrid drift correction for the cached stats
//! - [`QueueBuilder`]: construction with capacity and spill limits
//!
//! # Concurrency
//!
//! A single mutex guards the durable file and the cached [`QueueStats`]. It is
//! held only around local reads and writes. `drain_once` copies a batch out,
//! releases the lock, publishes, then re-locks to commit, so `enqueue` never
//! waits on network I/O.

mod builder;
mod error;
mod log;
mod reconcile;
mod store;
mod types;

pub use builder::{DEFAULT_MAX_BYTES, DEFAULT_SPILL_CAPACITY, QueueBuilder};
pub use error::QueueError;
pub use log::RecordLog;
pub use reconcile::{DEFAULT_RECONCILE_EVERY, ReconcileTrigger, Reconciliation, StatsReconciler};
pub use store::OfflineQueue;
pub use types::{DrainReport, QueueEntry, QueueReason, QueueStats, TargetSet};
