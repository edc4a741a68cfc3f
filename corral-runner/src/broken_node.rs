//! Broken-node detection
//!
//! Some sandbox errors say nothing about the job and everything about the
//! host: the container daemon is down, its socket is gone, the OCI runtime
//! cannot mount into a rootfs. When an error matches one of these patterns
//! the configured hook runs (typically to drain the node) and the caller
//! requeues the Work Item instead of failing it.

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;

use crate::logging::ThrottledLogger;

/// Default patterns, matched anywhere in the error text
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"(?s)[Cc]annot connect to the Docker daemon",
    r"(?s)oci runtime error.*starting container process.*container init.*mounting.*to rootfs.*no such file or directory",
    r"(?s)[Cc]annot connect to Podman",
    r"(?s)podman\.sock.*(connection refused|no such file or directory)",
];

#[derive(Debug, Clone)]
pub struct BrokenNodeDetector {
    patterns: Vec<Regex>,
    hook: Option<String>,
}

impl BrokenNodeDetector {
    pub fn new(patterns: &[String], hook: Option<String>) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid broken-node pattern {:?}", p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns, hook })
    }

    pub fn with_defaults(hook: Option<String>) -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns, hook }
    }

    /// Whether `error` suggests the node cannot run sandboxes
    pub fn matches(&self, error: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(error))
    }

    /// Checks `error`; on a match, logs it and runs the hook.
    ///
    /// # Returns
    /// true when the node looks broken
    pub async fn check(&self, error: &anyhow::Error, log: &ThrottledLogger) -> bool {
        let text = format!("{:#}", error);
        if !self.matches(&text) {
            return false;
        }

        log.log(format!("Error suggests node is unable to run containers: {}", text));
        match &self.hook {
            None => log.log("No broken node hook provided, cannot mark node as broken."),
            Some(hook) => {
                log.log(format!("Running broken node hook {:?}", hook));
                if let Err(e) = run_hook(hook, log).await {
                    log.log(format!("Error running broken node hook: {:#}", e));
                }
            }
        }
        true
    }
}

async fn run_hook(hook: &str, log: &ThrottledLogger) -> Result<()> {
    let output = Command::new(hook)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", hook))?;
    log.write(&output.stdout);
    log.write(&output.stderr);
    log.close();
    if !output.status.success() {
        anyhow::bail!("{} exited with {}", hook, output.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{JobLogs, ThrottleLimits};

    #[test]
    fn test_default_patterns() {
        let detector = BrokenNodeDetector::with_defaults(None);
        assert!(detector.matches(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        ));
        assert!(detector.matches(
            "Error response from daemon: oci runtime error: container_linux.go:247: \
             starting container process caused \"process_linux.go:359: container init caused \
             rootfs_linux.go:54: mounting /tmp/keep453790790/by_id/9999+99/myGenome \
             to rootfs /tmp/docker/overlay2/merged caused no such file or directory\""
        ));
        assert!(detector.matches(
            "dial unix /run/podman/podman.sock: connect: connection refused"
        ));
        assert!(!detector.matches("exec: \"frobnicate\": executable file not found in $PATH"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(BrokenNodeDetector::new(&["(unclosed".to_string()], None).is_err());
    }

    #[tokio::test]
    async fn test_check_logs_without_hook() {
        let logs = JobLogs::new(ThrottleLimits::default());
        let crunch = logs.logger("crunch-run");
        let detector = BrokenNodeDetector::new(&["daemon is down".to_string()], None).unwrap();

        assert!(!detector.check(&anyhow::anyhow!("bad mount"), &crunch).await);
        assert!(crunch.text().is_empty());

        let err = anyhow::anyhow!("daemon is down").context("While loading container image");
        assert!(detector.check(&err, &crunch).await);
        let text = crunch.text();
        assert!(text.contains("Error suggests node is unable to run containers"));
        assert!(text.contains("No broken node hook provided"));
    }

    #[tokio::test]
    async fn test_check_runs_hook() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let hook = dir.path().join("hook.sh");
        std::fs::write(
            &hook,
            format!("#!/bin/sh\necho draining\ntouch {}\n", marker.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let logs = JobLogs::new(ThrottleLimits::default());
        let crunch = logs.logger("crunch-run");
        let detector = BrokenNodeDetector::with_defaults(Some(hook.display().to_string()));

        let err = anyhow::anyhow!("Cannot connect to the Docker daemon");
        assert!(detector.check(&err, &crunch).await);
        assert!(marker.exists());
        assert!(crunch.text().contains("draining"));
    }
}
