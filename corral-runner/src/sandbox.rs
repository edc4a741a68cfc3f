//! Sandbox runtime interface
//!
//! The runner drives the container runtime through [`SandboxRuntime`]. A
//! handle is whatever the runtime uses to name a created sandbox.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::mpsc;

/// Everything needed to create one sandboxed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    /// Image id as known to the runtime
    pub image: String,
    pub command: Vec<String>,
    /// Working directory; the image default when `None`
    pub cwd: Option<String>,
    pub environment: BTreeMap<String, String>,
    /// `host:container[:ro]` bind specifications
    pub binds: Vec<String>,
    /// Runtime network mode; networking is disabled when `None`
    pub network_mode: Option<String>,
}

/// A piece of sandbox output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn image_exists(&self, image_id: &str) -> Result<bool>;

    /// Loads an image tarball into the runtime's image store
    async fn load_image(&self, tarball: &Path) -> Result<()>;

    /// Creates the sandbox without starting it and returns its handle
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Output of the sandbox once started. The channel closes when the
    /// process exits or the sandbox is removed.
    async fn attach(&self, handle: &str) -> Result<mpsc::Receiver<OutputChunk>>;

    async fn start(&self, handle: &str) -> Result<()>;

    /// Waits for the process to exit and returns its exit code
    async fn wait(&self, handle: &str) -> Result<i32>;

    /// Force-removes the sandbox, killing the process if still running
    async fn remove(&self, handle: &str) -> Result<()>;
}
