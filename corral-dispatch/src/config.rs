//! Dispatcher configuration
//!
//! Connection and timing settings come from the environment. Slurm
//! specifics live in an optional JSON file so site admins can pass extra
//! `sbatch` flags without touching the service definition.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Work-Item Store base URL (e.g., "http://localhost:8080")
    pub store_url: String,

    /// Identity this dispatcher locks Work Items under
    pub identity: String,

    /// How often the dispatch loop runs
    pub poll_interval: Duration,

    /// How often the scheduler queue is listed
    pub queue_poll_interval: Duration,

    /// Optional JSON file with Slurm settings
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(store_url: String, identity: String) -> Self {
        Self {
            store_url,
            identity,
            poll_interval: Duration::from_secs(10),
            queue_poll_interval: Duration::from_secs(10),
            config_file: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - STORE_URL (required)
    /// - DISPATCH_IDENTITY (optional, default: dispatch@<hostname>)
    /// - POLL_INTERVAL (optional, seconds, default: 10)
    /// - QUEUE_POLL_INTERVAL (optional, seconds, default: 10)
    /// - DISPATCH_CONFIG (optional, path to the JSON settings file)
    pub fn from_env() -> anyhow::Result<Self> {
        let store_url = std::env::var("STORE_URL")
            .map_err(|_| anyhow::anyhow!("STORE_URL environment variable not set"))?;

        let identity = std::env::var("DISPATCH_IDENTITY").unwrap_or_else(|_| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("dispatch@{}", host)
        });

        let mut config = Self::new(store_url, identity);

        if let Some(secs) = env_secs("POLL_INTERVAL")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("QUEUE_POLL_INTERVAL")? {
            config.queue_poll_interval = Duration::from_secs(secs);
        }

        config.config_file = std::env::var("DISPATCH_CONFIG").ok().map(PathBuf::from);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store_url.is_empty() {
            anyhow::bail!("store_url cannot be empty");
        }

        if !self.store_url.starts_with("http://") && !self.store_url.starts_with("https://") {
            anyhow::bail!("store_url must start with http:// or https://");
        }

        if self.identity.trim().is_empty() {
            anyhow::bail!("identity cannot be empty");
        }

        if self.poll_interval.is_zero() || self.queue_poll_interval.is_zero() {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        Ok(())
    }

    /// Loads the Slurm settings file, or defaults when none is configured
    pub fn load_file_config(&self) -> anyhow::Result<DispatchFileConfig> {
        match &self.config_file {
            Some(path) => DispatchFileConfig::load(path),
            None => Ok(DispatchFileConfig::default()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "http://localhost:8080".to_string(),
            "dispatch@localhost".to_string(),
        )
    }
}

fn env_secs(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a number of seconds", name)),
        Err(_) => Ok(None),
    }
}

/// Contents of the optional JSON settings file.
///
/// Unknown keys are ignored; known keys with the wrong type are an error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DispatchFileConfig {
    /// Extra arguments placed before the per-job `sbatch` flags
    pub sbatch_arguments: Vec<String>,

    /// Program each batch job execs with the Work Item id
    pub runner_command: String,
}

impl DispatchFileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl Default for DispatchFileConfig {
    fn default() -> Self {
        Self {
            sbatch_arguments: Vec::new(),
            runner_command: "corral-runner".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(config.config_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.store_url = "localhost:8080".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identity = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue_poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_config_ignores_unknown_keys() {
        let parsed = DispatchFileConfig::parse(
            r#"{"SbatchArguments": ["--export=ALL"], "Frobnicate": true}"#,
        )
        .unwrap();
        assert_eq!(parsed.sbatch_arguments, vec!["--export=ALL".to_string()]);
        assert_eq!(parsed.runner_command, "corral-runner");
    }

    #[test]
    fn test_file_config_rejects_wrong_types() {
        assert!(DispatchFileConfig::parse(r#"{"SbatchArguments": "--export=ALL"}"#).is_err());
        assert!(DispatchFileConfig::parse(r#"{"RunnerCommand": 7}"#).is_err());
    }

    #[test]
    fn test_file_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(&path, r#"{"RunnerCommand": "/opt/corral/runner"}"#).unwrap();

        let mut config = Config::default();
        config.config_file = Some(path);
        let file = config.load_file_config().unwrap();
        assert_eq!(file.runner_command, "/opt/corral/runner");
        assert!(file.sbatch_arguments.is_empty());
    }
}
