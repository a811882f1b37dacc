//! Live publish or offline routing for every produced record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::metrics::DeliveryMetrics;
use super::trigger::DrainTrigger;
use crate::broker::{ConnectionManager, PublishMode, PublishOutcome, TargetOutcome};
use crate::queue::{OfflineQueue, QueueReason, TargetSet};
use crate::scheduler::RecordSink;
use crate::telemetry::TelemetryRecord;

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Acknowledged by every enabled target.
    Delivered,
    /// Handed to the offline queue for `targets`.
    Queued {
        targets: TargetSet,
        reason: QueueReason,
    },
    /// The queue refused the record; it is counted as an enqueue failure.
    NotStored {
        targets: TargetSet,
        reason: QueueReason,
    },
    /// No enabled targets; nothing to deliver to.
    NoTargets,
}

/// Reason recorded for targets that did not acknowledge.
fn queue_reason(outcome: &PublishOutcome) -> QueueReason {
    if !outcome.delivered().is_empty() {
        return QueueReason::PartialFailure;
    }
    let first_failure = outcome.targets.values().find(|o| !o.is_delivered());
    match first_failure {
        Some(TargetOutcome::TimedOut) => QueueReason::PublishTimeout,
        Some(TargetOutcome::OffNetwork) => QueueReason::NotOnWifi,
        Some(TargetOutcome::Untrusted(_)) => QueueReason::BrokerUnverified,
        Some(TargetOutcome::NotConnected(_)) => QueueReason::NotConnected,
        Some(TargetOutcome::Failed(_) | TargetOutcome::Delivered) | None => {
            QueueReason::PublishFailed
        }
    }
}

/// Routes records between the broker and the offline queue.
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    queue: Arc<OfflineQueue>,
    metrics: Arc<DeliveryMetrics>,
    trigger: DrainTrigger,
    publish_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        queue: Arc<OfflineQueue>,
        metrics: Arc<DeliveryMetrics>,
        trigger: DrainTrigger,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            queue,
            metrics,
            trigger,
            publish_timeout,
        }
    }

    /// Deliver `record` live, or queue whatever could not be delivered.
    pub async fn dispatch(&self, record: TelemetryRecord) -> Dispatch {
        self.metrics.record_produced(record.is_synthesized());

        let targets = self.manager.enabled_targets();
        if targets.is_empty() {
            self.metrics.record_config_failure();
            tracing::warn!(sequence = record.sequence(), "No enabled broker targets, record not queued");
            return Dispatch::NoTargets;
        }

        if record.is_synthesized() {
            return self.enqueue(record, targets, QueueReason::MissedTick);
        }
        if !self.manager.is_on_trusted_transport() {
            return self.enqueue(record, targets, QueueReason::NotOnWifi);
        }

        let outcome = self
            .manager
            .publish(&record, &targets, self.publish_timeout, PublishMode::Live)
            .await;

        let untrusted = outcome
            .targets
            .values()
            .filter(|o| matches!(o, TargetOutcome::Untrusted(_)))
            .count();
        if untrusted > 0 {
            self.metrics.record_trust_failures(untrusted as u64);
        }

        let failed = outcome.failed();
        if failed.is_empty() {
            self.metrics.record_delivered_live(record.sequence());
            tracing::debug!(sequence = record.sequence(), "Record delivered live");
            if !self.queue.current_stats().is_empty() {
                self.trigger.fire();
            }
            return Dispatch::Delivered;
        }

        let reason = queue_reason(&outcome);
        tracing::debug!(
            sequence = record.sequence(),
            failed = ?failed,
            reason = %reason,
            "Live publish incomplete"
        );
        self.enqueue(record, failed, reason)
    }

    fn enqueue(&self, record: TelemetryRecord, targets: TargetSet, reason: QueueReason) -> Dispatch {
        let sequence = record.sequence();
        if self.queue.enqueue(record, targets.clone(), reason) {
            self.metrics.record_queued();
            self.trigger.fire();
            Dispatch::Queued { targets, reason }
        } else {
            self.metrics.record_enqueue_failure();
            tracing::error!(sequence, reason = %reason, "Record could not be stored offline");
            Dispatch::NotStored { targets, reason }
        }
    }
}

#[async_trait]
impl RecordSink for Dispatcher {
    async fn accept(&self, record: TelemetryRecord) {
        self.dispatch(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        Endpoint, Medium, MemoryBroker, MemoryTransport, NetworkAttachment, static_network,
    };
    use crate::config::{BrokerConfig, TargetConfig};
    use crate::queue::QueueBuilder;
    use crate::telemetry::SensorSnapshot;
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::sync::watch;

    struct Fixture {
        dispatcher: Dispatcher,
        queue: Arc<OfflineQueue>,
        metrics: Arc<DeliveryMetrics>,
        primary: MemoryBroker,
        backup: MemoryBroker,
        network: watch::Sender<NetworkAttachment>,
        _dir: tempfile::TempDir,
    }

    fn fixture(target_names: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let queue = Arc::new(QueueBuilder::new(dir.path().join("queue.jsonl")).open().unwrap());
        let primary = MemoryBroker::new();
        let backup = MemoryBroker::new();
        let transport = MemoryTransport::new()
            .with_broker(Endpoint::new("a", 1883), primary.clone())
            .with_broker(Endpoint::new("b", 1883), backup.clone());
        let all = [
            TargetConfig::new("primary", "a:1883"),
            TargetConfig::new("backup", "b:1883"),
        ];
        let config = BrokerConfig {
            targets: all
                .into_iter()
                .filter(|t| target_names.contains(&t.name.as_str()))
                .collect(),
            ..BrokerConfig::default()
        };
        let (network, rx) = static_network(NetworkAttachment::new(Medium::Wifi, None));
        let manager = Arc::new(
            ConnectionManager::new("rig", &config, vec![Medium::Wifi], rx, Arc::new(transport))
                .unwrap(),
        );
        let metrics = Arc::new(DeliveryMetrics::new());
        let dispatcher = Dispatcher::new(
            manager,
            Arc::clone(&queue),
            Arc::clone(&metrics),
            DrainTrigger::new(),
            Duration::from_secs(1),
        );
        Fixture {
            dispatcher,
            queue,
            metrics,
            primary,
            backup,
            network,
            _dir: dir,
        }
    }

    fn live(seq: u64) -> TelemetryRecord {
        TelemetryRecord::live("rig", seq, Utc::now(), SensorSnapshot::default().with_value("t", 20.5))
    }

    fn names(list: &[&str]) -> TargetSet {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_live_delivery() {
        let f = fixture(&["primary"]);
        assert_eq!(f.dispatcher.dispatch(live(1)).await, Dispatch::Delivered);
        assert_eq!(f.primary.payloads_on("telemetry/rig").len(), 1);
        assert!(f.queue.current_stats().is_empty());
        assert_eq!(f.metrics.snapshot().last_delivered_sequence, Some(1));
    }

    #[tokio::test]
    async fn test_off_network_goes_to_queue_without_attempt() {
        let f = fixture(&["primary"]);
        f.network
            .send_replace(NetworkAttachment::new(Medium::Cellular, Some("wwan0".into())));

        let result = f.dispatcher.dispatch(live(1)).await;
        assert_eq!(
            result,
            Dispatch::Queued {
                targets: names(&["primary"]),
                reason: QueueReason::NotOnWifi
            }
        );
        assert_eq!(f.primary.connects(), 0);
        assert_eq!(f.queue.current_stats().count, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_queues_only_failed_target() {
        let f = fixture(&["primary", "backup"]);
        f.backup.set_online(false);

        let result = f.dispatcher.dispatch(live(4)).await;
        assert_eq!(
            result,
            Dispatch::Queued {
                targets: names(&["backup"]),
                reason: QueueReason::PartialFailure
            }
        );
        let entries = f.queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].targets, names(&["backup"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reason() {
        let f = fixture(&["primary"]);
        f.primary.set_publish_delay(Duration::from_secs(30));
        let result = f.dispatcher.dispatch(live(1)).await;
        assert!(matches!(
            result,
            Dispatch::Queued {
                reason: QueueReason::PublishTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_synthesized_goes_straight_to_queue() {
        let f = fixture(&["primary"]);
        let record = TelemetryRecord::synthesized("rig", 9, Utc::now(), SensorSnapshot::default());
        let result = f.dispatcher.dispatch(record).await;
        assert!(matches!(
            result,
            Dispatch::Queued {
                reason: QueueReason::MissedTick,
                ..
            }
        ));
        assert_eq!(f.primary.connects(), 0);
        assert_eq!(f.metrics.snapshot().synthesized, 1);
    }

    #[tokio::test]
    async fn test_no_targets_is_config_failure() {
        let f = fixture(&[]);
        assert_eq!(f.dispatcher.dispatch(live(1)).await, Dispatch::NoTargets);
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.config_failures, 1);
        assert_eq!(snapshot.queued, 0);
        assert!(f.queue.current_stats().is_empty());
    }

    #[tokio::test]
    async fn test_accounting_holds_across_outcomes() {
        let f = fixture(&["primary"]);
        f.dispatcher.dispatch(live(1)).await;
        f.primary.set_online(false);
        f.dispatcher.dispatch(live(2)).await;
        f.dispatcher.dispatch(live(3)).await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.produced, 3);
        assert_eq!(snapshot.accounted(), snapshot.produced);
        assert_eq!(f.queue.current_stats().count, snapshot.queued);
    }

    #[test]
    fn test_queue_reason_priority() {
        let mut outcome = PublishOutcome::default();
        outcome
            .targets
            .insert("a".into(), TargetOutcome::Untrusted("pin".into()));
        assert_eq!(queue_reason(&outcome), QueueReason::BrokerUnverified);
        outcome.targets.insert("b".into(), TargetOutcome::Delivered);
        assert_eq!(queue_reason(&outcome), QueueReason::PartialFailure);
    }
}
