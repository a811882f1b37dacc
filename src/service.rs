//! Relay service lifecycle.
//!
//! [`RelayService::start`] opens the offline queue, builds the connection
//! manager and spawns the long-running tasks:
//!
//! | Task | Stops on |
//! |---|---|
//! | tick scheduler → dispatcher | cancellation, checked between ticks |
//! | drain loop | cancellation, checked between cycles |
//! | keep-alive | cancellation |
//! | network watcher | cancellation or closed attachment channel |
//! | status refresh | cancellation |
//!
//! [`RelayService::stop`] cancels them cooperatively, announces "offline" to
//! every broker and reconciles the queue stats one last time.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    BrokerTransport, ConnectionManager, NetworkAttachment, NetworkWatch, SysfsProbe,
    spawn_sysfs_monitor, static_network,
};
use crate::config::{AppConfig, ConfigError, NetworkSourceConfig};
use crate::dispatch::{DeliveryMetrics, Dispatcher, DrainLoop, DrainTrigger};
use crate::queue::{OfflineQueue, QueueBuilder, QueueError, QueueStats};
use crate::scheduler::TickScheduler;
use crate::status::StatusSink;
use crate::telemetry::SnapshotSource;

/// Errors that prevent the service from starting.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("offline queue error: {0}")]
    Queue(#[from] QueueError),
}

/// External collaborators injected into the service.
pub struct ServiceDeps {
    pub source: Arc<dyn SnapshotSource>,
    pub transport: Arc<dyn BrokerTransport>,
    /// Replaces the configured network source when set.
    pub network: Option<NetworkWatch>,
    /// Defaults to [`StatusSink::global`].
    pub status: Option<StatusSink>,
}

impl ServiceDeps {
    pub fn new(source: Arc<dyn SnapshotSource>, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            source,
            transport,
            network: None,
            status: None,
        }
    }

    pub fn with_network(mut self, network: NetworkWatch) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_status(mut self, status: StatusSink) -> Self {
        self.status = Some(status);
        self
    }
}

/// A running relay.
pub struct RelayService {
    config: AppConfig,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    queue: Arc<OfflineQueue>,
    manager: Arc<ConnectionManager>,
    metrics: Arc<DeliveryMetrics>,
    trigger: DrainTrigger,
    status: StatusSink,
    // Keeps a fixed attachment channel open for the watcher.
    _static_network: Option<watch::Sender<NetworkAttachment>>,
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("device_id", &self.config.device.id)
            .field("tasks", &self.tasks.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

fn refresh_status(
    status: &StatusSink,
    device_id: &str,
    queue: &OfflineQueue,
    manager: &ConnectionManager,
    metrics: &DeliveryMetrics,
    running: bool,
) {
    let stats = queue.current_stats();
    let network = manager.network();
    let trusted = manager.is_trusted(&network);
    let links = manager.link_statuses();
    let metrics = metrics.snapshot();
    status.update(|s| {
        s.device_id = device_id.to_string();
        s.running = running;
        s.network = Some(network);
        s.trusted_network = trusted;
        s.queue = stats;
        s.queue_size_mb = stats.size_mb();
        s.links = links;
        s.last_delivered_sequence = metrics.last_delivered_sequence;
        s.metrics = metrics;
    });
}

impl RelayService {
    /// Open the queue, wire the pipeline and spawn every task.
    pub async fn start(config: AppConfig, deps: ServiceDeps) -> Result<Self, ServiceError> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        let status = deps.status.unwrap_or_else(|| StatusSink::global().clone());
        let device_id = config.device.id.clone();

        let queue = Arc::new(
            QueueBuilder::new(&config.queue.path)
                .max_bytes(config.queue.max_bytes)
                .spill_capacity(config.queue.spill_capacity)
                .open()?,
        );
        let backlog = queue.current_stats();
        let first_sequence = queue.max_sequence()?.map_or(0, |max| max + 1);
        tracing::info!(
            path = %config.queue.path.display(),
            count = backlog.count,
            size_mb = backlog.size_mb(),
            first_sequence,
            "Offline queue opened"
        );

        let mut static_sender = None;
        let network = match (deps.network, &config.network.source) {
            (Some(network), _) => network,
            (None, NetworkSourceConfig::Static { medium, network_id }) => {
                let (tx, rx) = static_network(NetworkAttachment::new(*medium, network_id.clone()));
                static_sender = Some(tx);
                rx
            }
            (None, NetworkSourceConfig::Sysfs { poll_interval, root }) => {
                let (rx, handle) =
                    spawn_sysfs_monitor(SysfsProbe::new(root), *poll_interval, shutdown.clone());
                tasks.push(("network-monitor", handle));
                rx
            }
        };

        let manager = Arc::new(ConnectionManager::new(
            &device_id,
            &config.broker,
            config.network.trusted_media.clone(),
            network.clone(),
            deps.transport,
        )?);
        let metrics = Arc::new(DeliveryMetrics::new());
        let trigger = DrainTrigger::new();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&manager),
            Arc::clone(&queue),
            Arc::clone(&metrics),
            trigger.clone(),
            config.delivery.publish_timeout,
        ));
        let scheduler = TickScheduler::new(&device_id, &config.scheduler, deps.source, dispatcher)
            .starting_at(first_sequence)
            .with_metrics(Arc::clone(&metrics));
        tasks.push(("scheduler", tokio::spawn(scheduler.run(shutdown.clone()))));

        let drain = DrainLoop::new(
            Arc::clone(&queue),
            Arc::clone(&manager),
            Arc::clone(&metrics),
            trigger.clone(),
            &config.queue,
            &config.delivery,
        );
        tasks.push(("drain", tokio::spawn(drain.run(shutdown.clone()))));
        tasks.push(("keepalive", manager.spawn_keepalive(shutdown.clone())));
        tasks.push((
            "network-watcher",
            tokio::spawn(watch_network(
                network,
                Arc::clone(&manager),
                trigger.clone(),
                shutdown.clone(),
            )),
        ));

        if config.broker.discovery.enabled {
            let manager = Arc::clone(&manager);
            let trigger = trigger.clone();
            let token = shutdown.clone();
            tasks.push((
                "discovery",
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        added = manager.run_discovery() => {
                            if added > 0 {
                                tracing::info!(added, "Discovered broker endpoints");
                                trigger.fire();
                            }
                        }
                    }
                }),
            ));
        }

        {
            let status = status.clone();
            let queue = Arc::clone(&queue);
            let manager = Arc::clone(&manager);
            let metrics = Arc::clone(&metrics);
            let device_id = device_id.clone();
            let interval = config.delivery.status_interval;
            let token = shutdown.clone();
            tasks.push((
                "status",
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                refresh_status(&status, &device_id, &queue, &manager, &metrics, true);
                            }
                        }
                    }
                }),
            ));
        }

        if !backlog.is_empty() {
            trigger.fire();
        }
        tracing::info!(
            device_id = %device_id,
            targets = manager.enabled_targets().len(),
            "Relay service started"
        );

        Ok(Self {
            config,
            shutdown,
            tasks,
            queue,
            manager,
            metrics,
            trigger,
            status,
            _static_network: static_sender,
        })
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    /// Wake the drain loop now.
    pub fn trigger_drain(&self) {
        self.trigger.fire();
    }

    /// Stop all tasks, announce "offline" and return the final queue stats.
    pub async fn stop(self) -> QueueStats {
        tracing::info!("Stopping relay service");
        self.shutdown.cancel();

        let deadline = Instant::now() + self.config.delivery.shutdown_timeout;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.manager
            .shutdown(self.config.delivery.publish_timeout)
            .await;

        let stats = match self.queue.recalculate_stats() {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Final queue recalculation failed");
                self.queue.current_stats()
            }
        };
        refresh_status(
            &self.status,
            &self.config.device.id,
            &self.queue,
            &self.manager,
            &self.metrics,
            false,
        );
        tracing::info!(count = stats.count, size_bytes = stats.size_bytes, "Relay service stopped");
        stats
    }
}

/// Invalidate broker identity on every attachment change and wake the drain
/// loop when the new attachment is trusted.
async fn watch_network(
    mut network: NetworkWatch,
    manager: Arc<ConnectionManager>,
    trigger: DrainTrigger,
    shutdown: CancellationToken,
) {
    network.borrow_and_update();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let attachment = network.borrow_and_update().clone();
        tracing::info!(network = %attachment.key(), "Network attachment changed");
        manager.on_network_changed().await;
        if manager.is_trusted(&attachment) {
            trigger.fire();
        }
    }
}
