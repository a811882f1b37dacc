//! Telemetry Relay Binary Entry Point
//!
//! Runs the complete delivery pipeline until Ctrl+C or SIGTERM.
//! Core functionality is provided by the `telemetry_relay` library crate.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use telemetry_relay::{
    AppConfig, MemoryTransport, MqttTransport, RelayService, ServiceDeps, SimulatedSource,
    broker::{BrokerTransport, MemoryBroker},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Telemetry Relay - Resilient Telemetry Delivery
#[derive(Parser, Debug)]
#[command(name = "telemetry-relay", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/relay.yaml",
        env = "RELAY_CONFIG"
    )]
    config: String,

    /// Device identifier (overrides config file)
    #[arg(long, env = "RELAY_DEVICE_ID")]
    device_id: Option<String>,

    /// Offline queue file (overrides config file)
    #[arg(long, env = "RELAY_QUEUE_PATH")]
    queue_path: Option<PathBuf>,

    /// Publish to in-process brokers instead of the network
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telemetry_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Telemetry Relay - Resilient Telemetry Delivery");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(device_id) = cli.device_id {
        config.device.id = device_id;
    }
    if let Some(path) = cli.queue_path {
        config.queue.path = path;
    }
    config.validate()?;

    tracing::info!(
        "Device: {}, period: {}, queue: {} (max {} bytes), targets: {}",
        config.device.id,
        humantime::format_duration(config.scheduler.period),
        config.queue.path.display(),
        config.queue.max_bytes,
        config.broker.enabled_targets().count(),
    );

    let transport: Arc<dyn BrokerTransport> = if cli.dry_run {
        tracing::warn!("Dry run: publishing to in-process brokers");
        Arc::new(dry_run_transport(&config)?)
    } else {
        Arc::new(MqttTransport::new())
    };

    let deps = ServiceDeps::new(Arc::new(SimulatedSource::default()), transport);
    let service = RelayService::start(config, deps).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    let stats = service.stop().await;
    tracing::info!(
        "Shutdown complete, {} records ({:.2} MB) left in the offline queue",
        stats.count,
        stats.size_mb()
    );
    Ok(())
}

/// One in-process broker per configured endpoint, announcing the expected
/// identity where one is configured.
fn dry_run_transport(config: &AppConfig) -> Result<MemoryTransport, Box<dyn std::error::Error>> {
    let transport = MemoryTransport::new();
    for target in config.broker.enabled_targets() {
        for endpoint in target.endpoints()? {
            let broker = match &target.identity {
                Some(identity) => MemoryBroker::with_identity(&identity.topic, &identity.expected_id),
                None => MemoryBroker::new(),
            };
            transport.register(endpoint, broker);
        }
    }
    Ok(transport)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
