//! Store configuration
//!
//! Bind address, persistence backend and reconciliation sweep settings.

use std::path::PathBuf;
use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// PostgreSQL URL. When unset the store keeps everything in memory.
    pub database_url: Option<String>,

    /// Fixed period of the priority reconciliation sweep
    pub sweep_interval: Duration,

    /// Directory holding the sweep's advisory lock file
    pub sweep_lock_dir: PathBuf,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(bind_addr: String) -> Self {
        Self {
            bind_addr,
            database_url: None,
            sweep_interval: Duration::from_secs(60),
            sweep_lock_dir: std::env::temp_dir(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - CORRAL_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DATABASE_URL (optional, enables PostgreSQL persistence)
    /// - SWEEP_INTERVAL (optional, seconds, default: 60)
    /// - SWEEP_LOCK_DIR (optional, default: system temp dir)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("CORRAL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let mut config = Self::new(bind_addr);

        config.database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        if let Ok(raw) = std::env::var("SWEEP_INTERVAL") {
            let secs = raw
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("SWEEP_INTERVAL must be a number of seconds"))?;
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Ok(dir) = std::env::var("SWEEP_LOCK_DIR") {
            config.sweep_lock_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Path of the sweep's advisory lock file
    pub fn sweep_lock_path(&self) -> PathBuf {
        self.sweep_lock_dir.join(crate::sweep::SWEEP_LOCK_FILE)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than 0");
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("database_url must be a postgres:// URL");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("0.0.0.0:8080".to_string())
    }
}
