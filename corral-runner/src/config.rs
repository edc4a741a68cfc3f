//! Runner configuration
//!
//! Defines the store and blob service endpoints, the collection mount
//! settings, broken-node handling and the job log throttle.

use std::path::PathBuf;
use std::time::Duration;

use crate::broken_node::DEFAULT_PATTERNS;
use crate::logging::ThrottleLimits;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Work-Item Store base URL (e.g., "http://localhost:8080")
    pub store_url: String,

    /// Blob service base URL
    pub blob_url: String,

    /// Identity the Work Item must be locked by. When unset the runner
    /// adopts the identity that locked the item (the submitting dispatcher).
    pub identity: Option<String>,

    /// Where collections appear on the host (`<root>/by_id/<pdh>`)
    pub keep_mount_root: PathBuf,

    /// Command that mounts collections at `keep_mount_root`; the mount is
    /// assumed to be managed externally when unset
    pub keep_mount_command: Option<String>,

    /// Program run when the node looks unable to run sandboxes
    pub broken_node_hook: Option<String>,

    /// Error patterns that mark the node as broken
    pub broken_node_patterns: Vec<String>,

    /// Job log limits
    pub throttle: ThrottleLimits,

    /// Sandbox network mode; `None` disables networking
    pub network_mode: Option<String>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(store_url: String, blob_url: String) -> Self {
        Self {
            store_url,
            blob_url,
            identity: None,
            keep_mount_root: PathBuf::from("/var/lib/corral/keep"),
            keep_mount_command: None,
            broken_node_hook: None,
            broken_node_patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            throttle: ThrottleLimits::default(),
            network_mode: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - STORE_URL (required)
    /// - BLOB_URL (required)
    /// - RUNNER_IDENTITY (optional, default: the Work Item's lock holder)
    /// - KEEP_MOUNT_ROOT (optional, default: /var/lib/corral/keep)
    /// - KEEP_MOUNT_COMMAND (optional)
    /// - BROKEN_NODE_HOOK (optional)
    /// - LOG_THROTTLE_BYTES (optional, default: 65536)
    /// - LOG_THROTTLE_LINES (optional, default: 1024)
    /// - LOG_THROTTLE_PERIOD (optional, seconds, default: 60)
    /// - LOG_BYTES_PER_JOB (optional, default: 67108864)
    /// - NETWORK_MODE (optional, default: networking disabled)
    pub fn from_env() -> anyhow::Result<Self> {
        let store_url = std::env::var("STORE_URL")
            .map_err(|_| anyhow::anyhow!("STORE_URL environment variable not set"))?;

        let blob_url = std::env::var("BLOB_URL")
            .map_err(|_| anyhow::anyhow!("BLOB_URL environment variable not set"))?;

        let mut config = Self::new(store_url, blob_url);

        config.identity = non_empty_var("RUNNER_IDENTITY");
        if let Some(root) = non_empty_var("KEEP_MOUNT_ROOT") {
            config.keep_mount_root = PathBuf::from(root);
        }
        config.keep_mount_command = non_empty_var("KEEP_MOUNT_COMMAND");
        config.broken_node_hook = non_empty_var("BROKEN_NODE_HOOK");
        config.network_mode = non_empty_var("NETWORK_MODE");

        if let Some(n) = env_number("LOG_THROTTLE_BYTES")? {
            config.throttle.bytes_per_period = n;
        }
        if let Some(n) = env_number("LOG_THROTTLE_LINES")? {
            config.throttle.lines_per_period = n;
        }
        if let Some(n) = env_number("LOG_THROTTLE_PERIOD")? {
            config.throttle.period = Duration::from_secs(n);
        }
        if let Some(n) = env_number("LOG_BYTES_PER_JOB")? {
            config.throttle.bytes_per_job = n;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [("store_url", &self.store_url), ("blob_url", &self.blob_url)] {
            if url.is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
        }

        if let Some(identity) = &self.identity {
            if identity.trim().is_empty() {
                anyhow::bail!("identity cannot be blank");
            }
        }

        if !self.keep_mount_root.is_absolute() {
            anyhow::bail!("keep_mount_root must be an absolute path");
        }

        if self.throttle.period.is_zero() {
            anyhow::bail!("log throttle period must be greater than 0");
        }

        if self.throttle.bytes_per_period == 0
            || self.throttle.lines_per_period == 0
            || self.throttle.bytes_per_job == 0
        {
            anyhow::bail!("log throttle limits must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "http://localhost:8080".to_string(),
            "http://localhost:8081".to_string(),
        )
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_number(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", name)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.throttle.bytes_per_period, 65536);
        assert_eq!(config.throttle.lines_per_period, 1024);
        assert_eq!(config.throttle.period, Duration::from_secs(60));
        assert_eq!(config.throttle.bytes_per_job, 64 << 20);
        assert!(config.identity.is_none());
        assert!(config.network_mode.is_none());
        assert_eq!(config.broken_node_patterns.len(), DEFAULT_PATTERNS.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.blob_url = "blobs:8081".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identity = Some("  ".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.keep_mount_root = PathBuf::from("keep");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.throttle.lines_per_period = 0;
        assert!(config.validate().is_err());
    }
}
