//! Podman sandbox runtime
//!
//! Drives the `podman` CLI:
//! - `podman image exists` / `podman load` for image staging
//! - `podman create` with binds, environment and network mode
//! - `podman start`, then `podman logs --follow` for the output streams
//! - `podman wait` for the exit code
//! - `podman rm -f` for cleanup

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sandbox::{ContainerSpec, OutputChunk, SandboxRuntime};

const OUTPUT_CHANNEL_DEPTH: usize = 64;

/// Checks if podman is installed and answering
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Podman is not working correctly: {}", stderr.trim());
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

pub struct PodmanRuntime {
    program: String,
    /// Output channels registered by `attach`, consumed by `start`
    attachments: Mutex<HashMap<String, mpsc::Sender<OutputChunk>>>,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self::with_program("podman")
    }

    /// Uses a different executable (e.g. a wrapper script)
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// Arguments for `podman create`
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network_mode.clone().unwrap_or_else(|| "none".to_string()),
        ];

        if let Some(cwd) = &spec.cwd {
            args.push("--workdir".to_string());
            args.push(cwd.clone());
        }

        for (key, value) in &spec.environment {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        for bind in &spec.binds {
            args.push("--volume".to_string());
            args.push(bind.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Runs podman to completion, failing on non-zero exit with its stderr
    async fn podman(&self, args: &[String]) -> Result<String> {
        debug!("Running {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute {} {}", self.program, args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", self.program, stderr.trim());
        }

        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: exit_code={}, stderr='{}'",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(stdout.trim().to_string())
    }

    fn take_attachment(&self, handle: &str) -> Option<mpsc::Sender<OutputChunk>> {
        self.attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle)
    }

    /// Follows the container's logs into `tx` until the container exits
    fn follow_logs(&self, handle: &str, tx: mpsc::Sender<OutputChunk>) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["logs", "--follow", handle])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to follow logs of {}", handle))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = handle.to_string();

        tokio::spawn(async move {
            let out = async {
                if let Some(stdout) = stdout {
                    pump(stdout, tx.clone(), OutputChunk::Stdout).await;
                }
            };
            let err = async {
                if let Some(stderr) = stderr {
                    pump(stderr, tx.clone(), OutputChunk::Stderr).await;
                }
            };
            tokio::join!(out, err);
            drop(tx);

            if let Err(e) = child.wait().await {
                warn!("Log follower for {} ended abnormally: {}", handle, e);
            }
        });

        Ok(())
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<OutputChunk>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading sandbox output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl SandboxRuntime for PodmanRuntime {
    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        let status = Command::new(&self.program)
            .args(["image", "exists", image_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to execute {} image exists", self.program))?;

        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => anyhow::bail!("{} image exists {} failed: {}", self.program, image_id, status),
        }
    }

    async fn load_image(&self, tarball: &Path) -> Result<()> {
        let args = vec![
            "load".to_string(),
            "--input".to_string(),
            tarball.display().to_string(),
        ];
        let loaded = self.podman(&args).await?;
        info!("Loaded image: {}", loaded);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.podman(&Self::create_args(spec)).await?;
        info!("Created container {} ({})", spec.name, id);
        Ok(id)
    }

    async fn attach(&self, handle: &str) -> Result<mpsc::Receiver<OutputChunk>> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        self.attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.to_string(), tx);
        Ok(rx)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        let attachment = self.take_attachment(handle);
        self.podman(&["start".to_string(), handle.to_string()])
            .await?;
        if let Some(tx) = attachment {
            self.follow_logs(handle, tx)?;
        }
        Ok(())
    }

    async fn wait(&self, handle: &str) -> Result<i32> {
        let out = self.podman(&["wait".to_string(), handle.to_string()]).await?;
        out.lines()
            .last()
            .and_then(|line| line.trim().parse::<i32>().ok())
            .ok_or_else(|| anyhow::anyhow!("Unexpected output from podman wait: {:?}", out))
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.take_attachment(handle);
        self.podman(&["rm".to_string(), "-f".to_string(), handle.to_string()])
            .await?;
        debug!("Container {} removed", handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "corral-1234".to_string(),
            image: "sha256abc".to_string(),
            command: vec!["echo".to_string(), "hi there".to_string()],
            cwd: Some("/work".to_string()),
            environment: BTreeMap::from([("A".to_string(), "1".to_string())]),
            binds: vec!["/tmp/out:/out".to_string(), "/tmp/in:/in:ro".to_string()],
            network_mode: None,
        }
    }

    #[test]
    fn test_create_args() {
        assert_eq!(
            PodmanRuntime::create_args(&spec()),
            vec![
                "create", "--name", "corral-1234", "--network", "none", "--workdir", "/work",
                "--env", "A=1", "--volume", "/tmp/out:/out", "--volume", "/tmp/in:/in:ro",
                "sha256abc", "echo", "hi there",
            ]
        );
    }

    #[test]
    fn test_create_args_with_network() {
        let mut spec = spec();
        spec.network_mode = Some("host".to_string());
        spec.cwd = None;
        let args = PodmanRuntime::create_args(&spec);
        assert_eq!(args[3..5], ["--network".to_string(), "host".to_string()]);
        assert!(!args.contains(&"--workdir".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let runtime = PodmanRuntime::with_program("/nonexistent/podman");
        let err = runtime.image_exists("abc").await.unwrap_err();
        assert!(err.to_string().contains("Failed to execute"));
    }
}
