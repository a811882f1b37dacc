//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free delivery counters shared by the dispatcher and the drain loop.
///
/// Records are counted once: `produced` equals `delivered_live + queued +
/// enqueue_failures + config_failures` once every dispatch has returned.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    produced: AtomicU64,
    synthesized: AtomicU64,
    delivered_live: AtomicU64,
    delivered_from_queue: AtomicU64,
    queued: AtomicU64,
    enqueue_failures: AtomicU64,
    config_failures: AtomicU64,
    trust_failures: AtomicU64,
    source_failures: AtomicU64,
    /// Last delivered sequence plus one; zero means none yet.
    last_delivered: AtomicU64,
}

/// Point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub produced: u64,
    pub synthesized: u64,
    pub delivered_live: u64,
    pub delivered_from_queue: u64,
    pub queued: u64,
    pub enqueue_failures: u64,
    pub config_failures: u64,
    pub trust_failures: u64,
    pub source_failures: u64,
    pub last_delivered_sequence: Option<u64>,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_produced(&self, synthesized: bool) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        if synthesized {
            self.synthesized.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delivered_live(&self, sequence: u64) {
        self.delivered_live.fetch_add(1, Ordering::Relaxed);
        self.last_delivered
            .fetch_max(sequence.saturating_add(1), Ordering::Relaxed);
    }

    pub fn record_delivered_from_queue(&self, entries: u64, max_sequence: Option<u64>) {
        self.delivered_from_queue.fetch_add(entries, Ordering::Relaxed);
        if let Some(sequence) = max_sequence {
            self.last_delivered
                .fetch_max(sequence.saturating_add(1), Ordering::Relaxed);
        }
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_failure(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_failure(&self) {
        self.config_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trust_failures(&self, count: u64) {
        self.trust_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_source_failures(&self, count: u64) {
        self.source_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_delivered.load(Ordering::Relaxed);
        MetricsSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
            delivered_live: self.delivered_live.load(Ordering::Relaxed),
            delivered_from_queue: self.delivered_from_queue.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            config_failures: self.config_failures.load(Ordering::Relaxed),
            trust_failures: self.trust_failures.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            last_delivered_sequence: last.checked_sub(1),
        }
    }
}

impl MetricsSnapshot {
    /// Records accounted for by a terminal outcome.
    pub fn accounted(&self) -> u64 {
        self.delivered_live + self.queued + self.enqueue_failures + self.config_failures
    }
}
