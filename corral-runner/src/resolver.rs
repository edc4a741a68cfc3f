//! Collection resolver
//!
//! Input collections named by portable data hash are exposed to the
//! sandbox through a FUSE-style mount of the blob service. The mount
//! presents each collection under `<root>/by_id/<pdh>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use corral_core::BlobStore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::ManifestCache;

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNT_POLL: Duration = Duration::from_millis(100);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait CollectionResolver: Send + Sync {
    /// Makes collections available on the host. Called once, before any
    /// `host_path` is used.
    async fn prepare(&self) -> Result<()>;

    /// Host path of `subpath` inside collection `pdh`
    fn host_path(&self, pdh: &str, subpath: &str) -> PathBuf;

    /// Manifest text of `path` inside collection `pdh`, relocated to `target`
    async fn manifest_text(&self, pdh: &str, path: &str, target: &str) -> Result<String>;

    /// Tears down whatever `prepare` set up
    async fn release(&self);
}

pub struct KeepMountResolver {
    root: PathBuf,
    command: Option<String>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<ManifestCache>,
    child: Mutex<Option<Child>>,
}

impl KeepMountResolver {
    /// # Arguments
    /// * `root` - mount point; collections appear under `root/by_id`
    /// * `command` - mount helper, run with `root` as its last argument.
    ///   When `None` the mount is expected to exist already.
    pub fn new(
        root: impl Into<PathBuf>,
        command: Option<String>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<ManifestCache>,
    ) -> Self {
        Self {
            root: root.into(),
            command,
            blobs,
            cache,
            child: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn by_id(&self) -> PathBuf {
        self.root.join("by_id")
    }

    async fn spawn_mount(&self, command: &str) -> Result<()> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty collection mount command"))?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("While creating mount point {}", self.root.display()))?;

        info!("Starting collection mount: {} {}", command, self.root.display());
        let mut child = Command::new(program)
            .args(parts)
            .arg(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("While starting collection mount {:?}", command))?;

        let deadline = tokio::time::Instant::now() + MOUNT_TIMEOUT;
        loop {
            if tokio::fs::metadata(self.by_id()).await.is_ok() {
                break;
            }
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("Collection mount exited before becoming ready: {}", status);
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                anyhow::bail!(
                    "Timed out waiting for collection mount at {}",
                    self.root.display()
                );
            }
            tokio::time::sleep(MOUNT_POLL).await;
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }
}

#[async_trait]
impl CollectionResolver for KeepMountResolver {
    async fn prepare(&self) -> Result<()> {
        match &self.command {
            Some(command) => self.spawn_mount(command).await,
            None => {
                tokio::fs::metadata(self.by_id()).await.with_context(|| {
                    format!("Collection mount not found at {}", self.by_id().display())
                })?;
                Ok(())
            }
        }
    }

    fn host_path(&self, pdh: &str, subpath: &str) -> PathBuf {
        let mut path = self.by_id().join(pdh);
        for part in subpath.split('/').filter(|p| !p.is_empty() && *p != ".") {
            path.push(part);
        }
        path
    }

    async fn manifest_text(&self, pdh: &str, path: &str, target: &str) -> Result<String> {
        let manifest = self.cache.load(self.blobs.as_ref(), pdh).await?;
        let fragment = manifest
            .extract(path, target)
            .with_context(|| format!("While extracting {:?} from {}", path, pdh))?;
        Ok(fragment.text())
    }

    async fn release(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            warn!("Error stopping collection mount: {}", e);
            return;
        }
        match tokio::time::timeout(RELEASE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!("Collection mount exited: {}", status),
            Ok(Err(e)) => warn!("Error waiting for collection mount: {}", e),
            Err(_) => warn!("Collection mount did not exit within {:?}", RELEASE_TIMEOUT),
        }
    }
}
