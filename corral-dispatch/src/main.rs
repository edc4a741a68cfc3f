use anyhow::{Context, Result};
use corral_client::StoreClient;
use corral_dispatch::{Config, Dispatcher, QueueMonitor, SlurmCli, shutdown};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Corral Dispatch...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let settings = config
        .load_file_config()
        .context("Failed to load dispatch settings")?;

    info!("Configuration loaded:");
    info!("  Identity: {}", config.identity);
    info!("  Store URL: {}", config.store_url);
    info!("  Runner command: {}", settings.runner_command);

    let store = Arc::new(StoreClient::new(&config.store_url));
    let scheduler = Arc::new(SlurmCli::new(
        settings.sbatch_arguments,
        settings.runner_command,
    ));
    let monitor = QueueMonitor::new(scheduler, config.queue_poll_interval);

    let shutdown = shutdown::install_shutdown_handler()
        .context("Failed to install signal handlers")?;
    shutdown::install_poll_handler(monitor.clone(), shutdown.clone())
        .context("Failed to install SIGHUP handler")?;

    let monitor_handle = monitor.start();
    let dispatcher = Dispatcher::new(store, monitor.clone(), config.identity, config.poll_interval);
    dispatcher.run(shutdown).await;

    monitor.stop();
    if let Err(e) = monitor_handle.await {
        tracing::warn!("Queue monitor task ended abnormally: {}", e);
    }

    info!("Corral Dispatch stopped");
    Ok(())
}
