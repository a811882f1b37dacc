//! Background drain of the offline queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::metrics::DeliveryMetrics;
use super::trigger::DrainTrigger;
use crate::broker::{Backoff, ConnectionManager, PublishMode};
use crate::config::{DeliveryConfig, QueueConfig};
use crate::queue::{DrainReport, OfflineQueue, QueueEntry, Reconciliation, StatsReconciler, TargetSet};

/// What one drain cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not on a trusted medium; nothing attempted.
    Offline,
    /// Queue reported empty.
    Empty,
    Drained(DrainReport),
    /// The queue could not be read or committed.
    Failed(String),
}

/// Result of [`DrainLoop::run_cycle`].
#[derive(Debug, Clone)]
pub struct DrainCycle {
    pub outcome: CycleOutcome,
    pub reconciliation: Option<Reconciliation>,
    /// Wait before the next cycle unless triggered earlier.
    pub delay: Duration,
}

/// Drains the queue toward the brokers.
///
/// Full progressing batches run back to back. Offline, blocked or failing
/// cycles back off exponentially; an empty queue waits for the idle interval. Any
/// trigger cuts the wait short and resets the backoff.
pub struct DrainLoop {
    queue: Arc<OfflineQueue>,
    manager: Arc<ConnectionManager>,
    metrics: Arc<DeliveryMetrics>,
    trigger: DrainTrigger,
    reconciler: StatsReconciler,
    backoff: Backoff,
    batch: usize,
    publish_timeout: Duration,
    idle_interval: Duration,
}

impl std::fmt::Debug for DrainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainLoop")
            .field("batch", &self.batch)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl DrainLoop {
    pub fn new(
        queue: Arc<OfflineQueue>,
        manager: Arc<ConnectionManager>,
        metrics: Arc<DeliveryMetrics>,
        trigger: DrainTrigger,
        queue_config: &QueueConfig,
        delivery: &DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            manager,
            metrics,
            trigger,
            reconciler: StatsReconciler::new(queue_config.reconcile_every),
            backoff: Backoff::new(
                delivery.drain_backoff_initial,
                delivery.drain_backoff_max,
                0.2,
            ),
            batch: queue_config.drain_batch.max(1),
            publish_timeout: delivery.publish_timeout,
            idle_interval: delivery.drain_idle_interval,
        }
    }

    /// Publish one entry to the targets it still needs.
    ///
    /// Targets no longer configured at all cannot ever be reached and count
    /// as delivered so the entry does not block the queue forever.
    async fn publish_entry(
        manager: &ConnectionManager,
        entry: QueueEntry,
        timeout: Duration,
    ) -> TargetSet {
        let (mut delivered, pending): (TargetSet, TargetSet) = entry
            .targets
            .iter()
            .cloned()
            .partition(|target| !manager.has_target(target));
        if !delivered.is_empty() {
            tracing::warn!(
                sequence = entry.record.sequence(),
                targets = ?delivered,
                "Dropping queued targets that are no longer configured"
            );
        }
        if !pending.is_empty() {
            let outcome = manager
                .publish(&entry.record, &pending, timeout, PublishMode::Backlog)
                .await;
            delivered.extend(outcome.delivered());
        }
        delivered
    }

    /// One drain attempt followed by stats reconciliation.
    pub async fn run_cycle(&mut self) -> DrainCycle {
        let outcome = if !self.manager.is_on_trusted_transport() {
            CycleOutcome::Offline
        } else if self.queue.current_stats().is_empty() {
            CycleOutcome::Empty
        } else {
            let manager = Arc::clone(&self.manager);
            let timeout = self.publish_timeout;
            let result = self
                .queue
                .drain_once(self.batch, |entry| {
                    let manager = Arc::clone(&manager);
                    async move { Self::publish_entry(&manager, entry, timeout).await }
                })
                .await;
            match result {
                Ok(report) => CycleOutcome::Drained(report),
                Err(e) => {
                    tracing::error!(error = %e, "Drain cycle failed, batch kept for retry");
                    CycleOutcome::Failed(e.to_string())
                }
            }
        };

        let report = match &outcome {
            CycleOutcome::Drained(report) => Some(*report),
            _ => None,
        };
        if let Some(report) = &report
            && report.processed > 0
        {
            self.metrics.record_delivered_from_queue(
                report.processed as u64,
                report.max_delivered_sequence,
            );
            tracing::info!(
                processed = report.processed,
                partial = report.partial,
                skipped = report.skipped,
                remaining = report.remaining,
                "Drained offline queue batch"
            );
        }

        let reconciliation = match self.reconciler.observe(&self.queue, report.as_ref()) {
            Ok(reconciliation) => Some(reconciliation),
            Err(e) => {
                tracing::error!(error = %e, "Queue stats recalculation failed");
                None
            }
        };

        let delay = match &outcome {
            CycleOutcome::Drained(report) if report.processed + report.partial > 0 => {
                self.backoff.reset();
                if report.remaining == 0 {
                    self.idle_interval
                } else if !report.blocked || report.attempted >= self.batch {
                    // Batch was full; reachable entries may still be waiting.
                    Duration::ZERO
                } else {
                    self.backoff.next_delay()
                }
            }
            CycleOutcome::Empty => {
                self.backoff.reset();
                self.idle_interval
            }
            CycleOutcome::Offline | CycleOutcome::Drained(_) | CycleOutcome::Failed(_) => {
                self.backoff.next_delay()
            }
        };

        DrainCycle {
            outcome,
            reconciliation,
            delay,
        }
    }

    /// Run cycles until `shutdown`. Cancellation is checked between cycles.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(batch = self.batch, "Drain loop started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let cycle = self.run_cycle().await;
            if cycle.delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.trigger.fired() => {
                    self.backoff.reset();
                }
                _ = tokio::time::sleep(cycle.delay) => {}
            }
        }
        tracing::info!("Drain loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        Endpoint, Medium, MemoryBroker, MemoryTransport, NetworkAttachment, static_network,
    };
    use crate::config::{BrokerConfig, TargetConfig};
    use crate::queue::{QueueBuilder, QueueReason, QueueStats, ReconcileTrigger};
    use crate::telemetry::{SensorSnapshot, TelemetryRecord};
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::sync::watch;

    struct Fixture {
        drain: DrainLoop,
        queue: Arc<OfflineQueue>,
        broker: MemoryBroker,
        network: watch::Sender<NetworkAttachment>,
        trigger: DrainTrigger,
        metrics: Arc<DeliveryMetrics>,
        _dir: tempfile::TempDir,
    }

    fn fixture(batch: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let queue = Arc::new(QueueBuilder::new(dir.path().join("queue.jsonl")).open().unwrap());
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new().with_broker(Endpoint::new("a", 1883), broker.clone());
        let config = BrokerConfig {
            targets: vec![TargetConfig::new("primary", "a:1883")],
            ..BrokerConfig::default()
        };
        let (network, rx) = static_network(NetworkAttachment::new(Medium::Wifi, None));
        let manager = Arc::new(
            ConnectionManager::new("rig", &config, vec![Medium::Wifi], rx, Arc::new(transport))
                .unwrap(),
        );
        let metrics = Arc::new(DeliveryMetrics::new());
        let trigger = DrainTrigger::new();
        let queue_config = QueueConfig {
            drain_batch: batch,
            reconcile_every: 3,
            ..QueueConfig::default()
        };
        let drain = DrainLoop::new(
            Arc::clone(&queue),
            manager,
            Arc::clone(&metrics),
            trigger.clone(),
            &queue_config,
            &DeliveryConfig::default(),
        );
        Fixture {
            drain,
            queue,
            broker,
            network,
            trigger,
            metrics,
            _dir: dir,
        }
    }

    fn fill(queue: &OfflineQueue, count: u64, targets: &[&str]) {
        fill_from(queue, 0, count, targets);
    }

    fn fill_from(queue: &OfflineQueue, first: u64, count: u64, targets: &[&str]) {
        let targets: TargetSet = targets.iter().map(|t| t.to_string()).collect();
        for seq in first..first + count {
            let record = TelemetryRecord::live("rig", seq, Utc::now(), SensorSnapshot::default());
            assert!(queue.enqueue(record, targets.clone(), QueueReason::NotConnected));
        }
    }

    #[tokio::test]
    async fn test_drains_in_batches_then_idles() {
        let mut f = fixture(4);
        fill(&f.queue, 10, &["primary"]);

        let cycle = f.drain.run_cycle().await;
        assert!(matches!(cycle.outcome, CycleOutcome::Drained(DrainReport { processed: 4, remaining: 6, .. })));
        assert_eq!(cycle.delay, Duration::ZERO);
        assert_eq!(
            cycle.reconciliation.unwrap().trigger,
            Some(ReconcileTrigger::AfterBatch)
        );

        f.drain.run_cycle().await;
        let last = f.drain.run_cycle().await;
        assert!(matches!(last.outcome, CycleOutcome::Drained(DrainReport { processed: 2, remaining: 0, .. })));
        assert_eq!(f.queue.recalculate_stats().unwrap(), QueueStats::new(0, 0));
        assert_eq!(f.broker.payloads_on("telemetry/rig").len(), 10);
        assert_eq!(f.metrics.snapshot().delivered_from_queue, 10);
        assert_eq!(f.metrics.snapshot().last_delivered_sequence, Some(9));

        let idle = f.drain.run_cycle().await;
        assert_eq!(idle.outcome, CycleOutcome::Empty);
        assert_eq!(idle.delay, DeliveryConfig::default().drain_idle_interval);
    }

    #[tokio::test]
    async fn test_offline_backs_off() {
        let mut f = fixture(4);
        fill(&f.queue, 2, &["primary"]);
        f.network.send_replace(NetworkAttachment::offline());

        let first = f.drain.run_cycle().await;
        let second = f.drain.run_cycle().await;
        assert_eq!(first.outcome, CycleOutcome::Offline);
        assert!(second.delay >= first.delay);
        assert_eq!(f.queue.current_stats().count, 2);
        assert_eq!(f.broker.connects(), 0);
    }

    #[tokio::test]
    async fn test_blocked_when_broker_down() {
        let mut f = fixture(4);
        fill(&f.queue, 3, &["primary"]);
        f.broker.set_online(false);

        let cycle = f.drain.run_cycle().await;
        assert!(matches!(cycle.outcome, CycleOutcome::Drained(DrainReport { blocked: true, processed: 0, .. })));
        assert!(cycle.delay > Duration::ZERO);
        assert_eq!(f.queue.current_stats().count, 3);
    }

    #[tokio::test]
    async fn test_dead_backup_does_not_hold_back_primary() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(QueueBuilder::new(dir.path().join("queue.jsonl")).open().unwrap());
        let primary = MemoryBroker::new();
        let backup = MemoryBroker::new();
        backup.set_online(false);
        let transport = MemoryTransport::new()
            .with_broker(Endpoint::new("a", 1883), primary.clone())
            .with_broker(Endpoint::new("b", 1883), backup.clone());
        let config = BrokerConfig {
            targets: vec![
                TargetConfig::new("primary", "a:1883"),
                TargetConfig::new("backup", "b:1883"),
            ],
            ..BrokerConfig::default()
        };
        let (_network, rx) = static_network(NetworkAttachment::new(Medium::Wifi, None));
        let manager = Arc::new(
            ConnectionManager::new("rig", &config, vec![Medium::Wifi], rx, Arc::new(transport))
                .unwrap(),
        );
        let metrics = Arc::new(DeliveryMetrics::new());
        let mut drain = DrainLoop::new(
            Arc::clone(&queue),
            manager,
            Arc::clone(&metrics),
            DrainTrigger::new(),
            &QueueConfig {
                drain_batch: 4,
                ..QueueConfig::default()
            },
            &DeliveryConfig::default(),
        );

        // Head of the file only waits for the backup broker.
        let record = TelemetryRecord::live("rig", 0, Utc::now(), SensorSnapshot::default());
        queue.enqueue(record, ["backup".to_string()].into(), QueueReason::PartialFailure);
        fill_from(&queue, 1, 5, &["primary"]);

        let cycle = drain.run_cycle().await;
        match cycle.outcome {
            CycleOutcome::Drained(report) => {
                assert!(report.blocked);
                assert_eq!(report.attempted, 4);
                assert_eq!(report.processed, 3);
                assert_eq!(report.max_delivered_sequence, Some(3));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(cycle.delay, Duration::ZERO);

        let cycle = drain.run_cycle().await;
        assert!(cycle.delay > Duration::ZERO);
        assert_eq!(primary.payloads_on("telemetry/rig").len(), 5);
        let left = queue.entries().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record.sequence(), 0);
        assert_eq!(metrics.snapshot().delivered_from_queue, 5);
        assert_eq!(metrics.snapshot().last_delivered_sequence, Some(5));
    }

    #[tokio::test]
    async fn test_removed_target_does_not_block() {
        let mut f = fixture(4);
        fill(&f.queue, 2, &["decommissioned"]);
        let cycle = f.drain.run_cycle().await;
        assert!(matches!(cycle.outcome, CycleOutcome::Drained(DrainReport { processed: 2, .. })));
        assert!(f.broker.payloads_on("telemetry/rig").is_empty());
    }

    #[tokio::test]
    async fn test_anomaly_corrected_while_offline() {
        let mut f = fixture(4);
        fill(&f.queue, 2, &["primary"]);
        f.network.send_replace(NetworkAttachment::offline());
        f.queue.set_cached_stats(QueueStats::new(5, 0));

        let cycle = f.drain.run_cycle().await;
        let reconciliation = cycle.reconciliation.unwrap();
        assert_eq!(reconciliation.trigger, Some(ReconcileTrigger::Anomaly));
        assert_eq!(f.queue.current_stats().count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_loop() {
        let f = fixture(4);
        let queue = Arc::clone(&f.queue);
        let broker = f.broker.clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.drain.run(shutdown.clone()));

        // Let the first (empty) cycle settle into its idle wait.
        tokio::time::sleep(Duration::from_millis(10)).await;
        fill(&queue, 3, &["primary"]);
        f.trigger.fire();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(broker.payloads_on("telemetry/rig").len(), 3);
        assert!(queue.current_stats().is_empty());
        shutdown.cancel();
        handle.await.unwrap();
    }
}
