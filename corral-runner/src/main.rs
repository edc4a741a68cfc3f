//! Corral Runner
//!
//! Runs one Locked Work Item in a Podman sandbox and reports the result
//! to the Work-Item Store. Started by the batch scheduler as
//! `corral-runner <work-item-id>`.

use anyhow::{Context, Result};
use clap::Parser;
use corral_client::{HttpBlobStore, StoreClient};
use corral_core::{BlobStore, WorkItemApi};
use corral_runner::{
    BrokenNodeDetector, Config, FinalState, JobLogs, KeepMountResolver, ManifestCache,
    PodmanRuntime, Runner, podman, shutdown,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "corral-runner")]
#[command(about = "Run a Work Item in a sandbox", long_about = None)]
struct Cli {
    /// Work Item to run; it must already be Locked
    work_item_id: Uuid,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting Corral Runner for work item {}", cli.work_item_id);

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: store_url={}, blob_url={}, keep_mount_root={}",
        config.store_url,
        config.blob_url,
        config.keep_mount_root.display()
    );

    let broken_node =
        BrokenNodeDetector::new(&config.broken_node_patterns, config.broken_node_hook.clone())
            .context("Invalid broken-node patterns")?;

    if let Err(e) = podman::check_podman_available().await {
        error!("Sandbox runtime unavailable: {:#}", e);
        let logs = JobLogs::new(config.throttle);
        broken_node.check(&e, &logs.logger("crunch-run")).await;
        return Err(e);
    }

    let store: Arc<dyn WorkItemApi> = Arc::new(StoreClient::new(&config.store_url));
    let blobs: Arc<dyn BlobStore> = Arc::new(HttpBlobStore::new(&config.blob_url));
    let cache = Arc::new(ManifestCache::default());
    let resolver = Arc::new(KeepMountResolver::new(
        &config.keep_mount_root,
        config.keep_mount_command.clone(),
        blobs.clone(),
        cache.clone(),
    ));

    let runner = Runner::new(
        store,
        blobs,
        Arc::new(PodmanRuntime::new()),
        resolver,
        cache,
    )
    .with_identity(config.identity.clone())
    .with_broken_node(broken_node)
    .with_limits(config.throttle)
    .with_network_mode(config.network_mode.clone());

    let cancel = shutdown::install_cancel_handler().context("Failed to install signal handlers")?;

    let outcome = runner
        .run(cli.work_item_id, cancel)
        .await
        .with_context(|| format!("Run of work item {} failed", cli.work_item_id))?;

    match outcome.state {
        FinalState::Complete => info!(
            "Work item {} complete: exit_code={:?}, output={:?}, log={:?}",
            cli.work_item_id, outcome.exit_code, outcome.output, outcome.log
        ),
        FinalState::Cancelled => info!("Work item {} cancelled", cli.work_item_id),
        FinalState::Requeue => info!("Work item {} returned to the queue", cli.work_item_id),
    }

    Ok(())
}
