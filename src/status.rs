//! Process-wide delivery status.
//!
//! A last-value broadcast: writers replace fields of one [`StatusSnapshot`],
//! readers (UI, diagnostics) either poll [`StatusSink::current`] or await
//! changes on a receiver. Nothing in the pipeline reads it back.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::{LinkStatus, NetworkAttachment};
use crate::dispatch::MetricsSnapshot;
use crate::queue::QueueStats;

/// Everything an observer can see about the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub running: bool,
    pub network: Option<NetworkAttachment>,
    pub trusted_network: bool,
    pub queue: QueueStats,
    pub queue_size_mb: f64,
    pub links: Vec<LinkStatus>,
    pub last_delivered_sequence: Option<u64>,
    pub metrics: MetricsSnapshot,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared handle to the status broadcast.
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

static GLOBAL: OnceLock<StatusSink> = OnceLock::new();

impl Default for StatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink {
    /// Independent sink, e.g. for tests or embedding several pipelines.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// The process-wide sink, created on first use.
    pub fn global() -> &'static StatusSink {
        GLOBAL.get_or_init(StatusSink::new)
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Apply `f` and stamp the update time. Receivers are woken only if
    /// something other than the timestamp changed.
    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            let changed = *snapshot != before;
            snapshot.updated_at = Some(Utc::now());
            changed
        });
    }
}
