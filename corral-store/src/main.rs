use anyhow::Context;
use corral_store::repository::{MemoryRepository, PgRepository, Repository};
use corral_store::sweep::{SweepLock, Sweeper};
use corral_store::{Config, Store, create_router, db, shutdown};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral_store=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Corral Store...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let repo: Arc<dyn Repository> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, keeping state in memory");
            Arc::new(MemoryRepository::new())
        }
    };

    let store = Store::new(repo);
    let shutdown = shutdown::install_shutdown_handler()
        .context("Failed to install signal handlers")?;

    let sweeper = Sweeper::new(
        store.clone(),
        SweepLock::new(config.sweep_lock_path()),
        config.sweep_interval,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // Build router with all API endpoints
    let app = create_router(store);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        tracing::warn!("Sweeper task ended abnormally: {}", e);
    }

    tracing::info!("Corral Store stopped");
    Ok(())
}
