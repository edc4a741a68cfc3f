//! Runner lifecycle
//!
//! Executes one Locked Work Item from start to finish:
//! 1. Fetch the item and check the lock
//! 2. Stage the image
//! 3. Plan mounts
//! 4. Create and attach the sandbox, report Running, start it
//! 5. Wait for exit or cancellation
//! 6. Capture output, commit logs, report the final state
//!
//! Cleanup (sandbox removal, collection mount release, scratch removal)
//! happens whatever the outcome.

use anyhow::{Context, Result};
use corral_core::dto::work_item::{RecordEvent, StateReport};
use corral_core::{BlobStore, WorkItemApi};
use corral_core::domain::{WorkItem, WorkItemState};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broken_node::BrokenNodeDetector;
use crate::cache::ManifestCache;
use crate::collection::CollectionWriter;
use crate::image::stage_image;
use crate::logging::{JobLogs, ThrottleLimits, ThrottledLogger, spawn_event_forwarder};
use crate::mounts::{MountPlan, build_mounts};
use crate::output::capture_output;
use crate::resolver::CollectionResolver;
use crate::sandbox::{ContainerSpec, OutputChunk, SandboxRuntime};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

static MISSING_EXECUTABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(exec|System error).*(no such file or directory|file not found)")
        .expect("start error pattern is valid")
});

/// How the run ends for the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    /// Unlock so the item can be dispatched again
    Requeue,
    Cancelled,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: FinalState,
    pub exit_code: Option<i32>,
    /// Output manifest portable data hash
    pub output: Option<String>,
    /// Log manifest portable data hash
    pub log: Option<String>,
}

pub struct Runner {
    store: Arc<dyn WorkItemApi>,
    blobs: Arc<dyn BlobStore>,
    runtime: Arc<dyn SandboxRuntime>,
    resolver: Arc<dyn CollectionResolver>,
    cache: Arc<ManifestCache>,
    broken_node: BrokenNodeDetector,
    identity: Option<String>,
    limits: ThrottleLimits,
    network_mode: Option<String>,
    scratch_root: PathBuf,
}

impl Runner {
    pub fn new(
        store: Arc<dyn WorkItemApi>,
        blobs: Arc<dyn BlobStore>,
        runtime: Arc<dyn SandboxRuntime>,
        resolver: Arc<dyn CollectionResolver>,
        cache: Arc<ManifestCache>,
    ) -> Self {
        Self {
            store,
            blobs,
            runtime,
            resolver,
            cache,
            broken_node: BrokenNodeDetector::with_defaults(None),
            identity: None,
            limits: ThrottleLimits::default(),
            network_mode: None,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Requires the item to be locked by `identity` instead of adopting
    /// the current lock holder
    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_broken_node(mut self, detector: BrokenNodeDetector) -> Self {
        self.broken_node = detector;
        self
    }

    pub fn with_limits(mut self, limits: ThrottleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network_mode(mut self, network_mode: Option<String>) -> Self {
        self.network_mode = network_mode;
        self
    }

    /// Directory under which the per-run scratch directory is created
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Runs Work Item `id` to completion.
    ///
    /// # Returns
    /// The final state reported to the store. An error means the item was
    /// not ours to run, or the final report itself failed.
    pub async fn run(&self, id: Uuid, cancel: CancellationToken) -> Result<RunOutcome> {
        let item = self
            .store
            .get_work_item(id)
            .await
            .with_context(|| format!("While fetching work item {}", id))?;

        let identity = match (&self.identity, &item.locked_by) {
            (Some(identity), _) => identity.clone(),
            (None, Some(holder)) => holder.clone(),
            (None, None) => anyhow::bail!("Work item {} is not locked", id),
        };
        if item.state != WorkItemState::Locked || !item.is_held_by(&identity) {
            anyhow::bail!(
                "Work item {} is {} (locked by {:?}), expected Locked by {}",
                id,
                item.state.as_str(),
                item.locked_by,
                identity
            );
        }

        let scratch = tempfile::Builder::new()
            .prefix("corral-run.")
            .tempdir_in(&self.scratch_root)
            .with_context(|| format!("While creating scratch dir in {}", self.scratch_root.display()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = spawn_event_forwarder(self.store.clone(), id, events_rx);
        let logs = JobLogs::new(self.limits).with_events(events_tx);
        let crunch = logs.logger("crunch-run");

        info!("Running work item {} as {}", id, identity);
        let mut job = Job {
            runner: self,
            item,
            identity,
            cancel,
            logs,
            crunch,
            scratch,
            state: FinalState::Requeue,
            exit_code: None,
            plan: None,
            handle: None,
            pump: None,
            started: false,
            removed: false,
        };

        let result = job.execute().await;
        let outcome = job.finish(result).await;

        if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, forwarder).await.is_err() {
            warn!("Timed out forwarding log events for {}", id);
        }
        outcome
    }
}

/// State of one run
struct Job<'a> {
    runner: &'a Runner,
    item: WorkItem,
    identity: String,
    cancel: CancellationToken,
    logs: JobLogs,
    crunch: Arc<ThrottledLogger>,
    scratch: tempfile::TempDir,
    state: FinalState,
    exit_code: Option<i32>,
    plan: Option<MountPlan>,
    handle: Option<String>,
    pump: Option<JoinHandle<()>>,
    started: bool,
    removed: bool,
}

impl Job<'_> {
    async fn execute(&mut self) -> Result<()> {
        let runner = self.runner;
        let id = self.item.id;
        self.crunch.log(format!(
            "corral-runner {} started",
            env!("CARGO_PKG_VERSION")
        ));
        self.crunch.log(format!("Executing work item {}", id));

        let node_info = host_info(self.scratch.path()).await;
        self.logs.add_file("node-info.txt", node_info);
        match serde_json::to_vec_pretty(&self.item) {
            Ok(record) => self.logs.add_file("container.json", record),
            Err(e) => self.crunch.log(format!("Error encoding container record: {}", e)),
        }

        if self.cancel_requested() {
            return Ok(());
        }

        self.crunch.log(format!(
            "Fetching container image {}",
            self.item.spec.container_image
        ));
        let image = match stage_image(
            runner.runtime.as_ref(),
            runner.blobs.as_ref(),
            &runner.cache,
            &self.item.spec.container_image,
            self.scratch.path(),
        )
        .await
        {
            Ok(image) => image,
            Err(e) => {
                let e = e.context("While loading container image");
                if !runner.broken_node.check(&e, &self.crunch).await {
                    self.state = FinalState::Cancelled;
                }
                return Err(e);
            }
        };
        self.crunch.log(format!("Using container image {}", image));

        if self.cancel_requested() {
            return Ok(());
        }

        let mounts_dir = self.scratch.path().join("mounts");
        tokio::fs::create_dir_all(&mounts_dir).await?;
        let plan = match build_mounts(&self.item.spec, runner.resolver.as_ref(), &mounts_dir)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                self.state = FinalState::Cancelled;
                return Err(e.context("While setting up mounts"));
            }
        };
        for bind in &plan.binds {
            self.crunch.log(format!("Bind mount {}", bind));
        }
        let stdout = plan.stdout.clone();
        let stderr = plan.stderr.clone();
        let binds = plan.binds.clone();
        self.plan = Some(plan);

        if self.cancel_requested() {
            return Ok(());
        }

        let spec = ContainerSpec {
            name: format!("corral-{}", id),
            image,
            command: self.item.spec.command.clone(),
            cwd: Some(self.item.spec.cwd.clone()),
            environment: self.item.spec.environment.clone(),
            binds,
            network_mode: runner.network_mode.clone(),
        };
        self.crunch.log(format!("Creating container {:?}", spec.command));
        let handle = match runner.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.pre_start_failure(e.context("While creating container")).await),
        };
        self.handle = Some(handle.clone());

        let rx = match runner.runtime.attach(&handle).await {
            Ok(rx) => rx,
            Err(e) => return Err(self.pre_start_failure(e.context("While attaching container")).await),
        };
        let stdout = OutputSink::open("stdout", stdout, &self.logs).await;
        let stderr = OutputSink::open("stderr", stderr, &self.logs).await;
        self.pump = Some(spawn_output_pump(rx, stdout, stderr, self.crunch.clone()));

        if self.cancel_requested() {
            return Ok(());
        }

        self.runner
            .store
            .report_state(id, StateReport::running(self.identity.clone()))
            .await
            .context("While reporting Running")?;
        self.state = FinalState::Cancelled;

        self.crunch.log("Starting container");
        if let Err(e) = runner.runtime.start(&handle).await {
            let e = e.context("While starting container");
            let text = format!("{:#}", e);
            if MISSING_EXECUTABLE_RE.is_match(&text) {
                self.crunch.log(format!(
                    "Possible causes: command {:?} is missing, the interpreter given in #! is missing, or script has Windows line endings.",
                    self.item.spec.command.first().map(String::as_str).unwrap_or_default()
                ));
            }
            runner.broken_node.check(&e, &self.crunch).await;
            return Err(e);
        }
        self.started = true;

        let waited = tokio::select! {
            result = runner.runtime.wait(&handle) => Some(result),
            _ = self.cancel.cancelled() => None,
        };
        match waited {
            None => {
                self.crunch.log("Cancelling container");
                self.remove_container().await;
            }
            Some(Ok(code)) => {
                self.crunch.log(format!("Container exited with status code {}", code));
                self.exit_code = Some(code);
                if !self.cancel.is_cancelled() {
                    self.state = FinalState::Complete;
                }
            }
            Some(Err(e)) => return Err(e.context("While waiting for container to finish")),
        }

        self.drain_output().await;
        Ok(())
    }

    /// Logs a cancellation request seen before the sandbox started
    fn cancel_requested(&self) -> bool {
        if self.cancel.is_cancelled() {
            self.crunch.log("Cancelled before the container started");
            true
        } else {
            false
        }
    }

    /// A failure after mounts but before Running: the item is cancelled
    /// unless the node looks broken, in which case it is requeued
    async fn pre_start_failure(&mut self, e: anyhow::Error) -> anyhow::Error {
        if !self.runner.broken_node.check(&e, &self.crunch).await {
            self.state = FinalState::Cancelled;
        }
        e
    }

    async fn remove_container(&mut self) {
        if self.removed {
            return;
        }
        if let Some(handle) = &self.handle {
            if let Err(e) = self.runner.runtime.remove(handle).await {
                self.crunch.log(format!("Error removing container: {:#}", e));
            }
            self.removed = true;
        }
    }

    async fn drain_output(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
            self.crunch
                .log("Timed out waiting for container output to drain");
        }
    }

    async fn finish(mut self, result: Result<()>) -> Result<RunOutcome> {
        let id = self.item.id;
        if let Err(e) = &result {
            self.crunch.log(format!("Error: {:#}", e));
        }
        if self.cancel.is_cancelled() && self.state == FinalState::Complete {
            self.state = FinalState::Cancelled;
        }

        if self.state == FinalState::Requeue {
            self.crunch.log("Returning work item to the queue");
            self.cleanup().await;
            self.logs.close();
            self.runner
                .store
                .unlock(id, &self.identity)
                .await
                .with_context(|| format!("While unlocking work item {}", id))?;
            return Ok(RunOutcome {
                state: FinalState::Requeue,
                exit_code: None,
                output: None,
                log: None,
            });
        }

        self.remove_container().await;
        self.drain_output().await;

        let mut output = None;
        if self.started {
            match self.commit_output().await {
                Ok(pdh) => {
                    self.crunch.log(format!("Output collection {}", pdh));
                    output = Some(pdh);
                }
                Err(e) => {
                    self.crunch.log(format!("Error capturing output: {:#}", e));
                    if self.state == FinalState::Complete {
                        self.state = FinalState::Cancelled;
                    }
                }
            }
        }

        self.cleanup().await;

        let log = match self.commit_logs().await {
            Ok(pdh) => Some(pdh),
            Err(e) => {
                warn!("Error committing logs for {}: {:#}", id, e);
                if self.state == FinalState::Complete {
                    self.state = FinalState::Cancelled;
                }
                None
            }
        };

        let outcome = match (self.state, self.exit_code) {
            (FinalState::Complete, Some(exit_code)) => {
                self.runner
                    .store
                    .report_state(
                        id,
                        StateReport::complete(self.identity.clone(), exit_code, output.clone(), log.clone()),
                    )
                    .await
                    .context("While reporting Complete")?;
                RunOutcome {
                    state: FinalState::Complete,
                    exit_code: Some(exit_code),
                    output,
                    log,
                }
            }
            _ => {
                if output.is_some() || log.is_some() {
                    let text = format!(
                        "output={} log={}",
                        output.as_deref().unwrap_or("none"),
                        log.as_deref().unwrap_or("none")
                    );
                    if let Err(e) = self
                        .runner
                        .store
                        .record_event(id, RecordEvent::new("partial_output", text))
                        .await
                    {
                        warn!("Failed to record partial output of {}: {}", id, e);
                    }
                }
                self.runner
                    .store
                    .report_state(id, StateReport::cancelled(Some(self.identity.clone())))
                    .await
                    .context("While reporting Cancelled")?;
                RunOutcome {
                    state: FinalState::Cancelled,
                    exit_code: self.exit_code,
                    output,
                    log,
                }
            }
        };

        info!("Work item {} finished: {:?}", id, outcome.state);
        Ok(outcome)
    }

    async fn commit_output(&self) -> Result<String> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No output directory"))?;
        let manifest = capture_output(
            plan,
            &self.item.spec.output_path,
            self.runner.resolver.as_ref(),
            self.runner.blobs.clone(),
        )
        .await?;
        self.runner
            .blobs
            .put(manifest.text().as_bytes())
            .await
            .context("While saving output manifest")?;
        Ok(manifest.portable_data_hash().to_string())
    }

    async fn commit_logs(&self) -> Result<String> {
        self.logs.close();
        let mut writer = CollectionWriter::new(self.runner.blobs.clone());
        for (name, data) in self.logs.files() {
            writer.write_file(&name, &data).await?;
        }
        let manifest = writer.finish().await?;
        self.runner
            .blobs
            .put(manifest.text().as_bytes())
            .await
            .context("While saving log manifest")?;
        Ok(manifest.portable_data_hash().to_string())
    }

    async fn cleanup(&mut self) {
        self.remove_container().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.runner.resolver.release().await;
    }
}

// =============================================================================
// Output streams
// =============================================================================

/// Where one sandbox stream goes
enum OutputSink {
    Log(Arc<ThrottledLogger>),
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
}

impl OutputSink {
    async fn open(stream: &str, redirect: Option<PathBuf>, logs: &JobLogs) -> Self {
        let Some(path) = redirect else {
            return OutputSink::Log(logs.logger(stream));
        };
        let file = match create_file(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                logs.logger("crunch-run")
                    .log(format!("Error opening {} for {}: {:#}", path.display(), stream, e));
                None
            }
        };
        OutputSink::File { path, file }
    }

    async fn write(&mut self, data: &[u8], crunch: &ThrottledLogger) {
        match self {
            OutputSink::Log(logger) => logger.write(data),
            OutputSink::File { path, file } => {
                let Some(f) = file.as_mut() else {
                    return;
                };
                if let Err(e) = f.write_all(data).await {
                    crunch.log(format!("Error writing {}: {}", path.display(), e));
                    *file = None;
                }
            }
        }
    }

    async fn close(&mut self, crunch: &ThrottledLogger) {
        match self {
            OutputSink::Log(logger) => logger.close(),
            OutputSink::File { path, file } => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.flush().await {
                        crunch.log(format!("Error flushing {}: {}", path.display(), e));
                    }
                }
            }
        }
    }
}

async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::File::create(path).await?)
}

fn spawn_output_pump(
    mut rx: mpsc::Receiver<OutputChunk>,
    mut stdout: OutputSink,
    mut stderr: OutputSink,
    crunch: Arc<ThrottledLogger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk {
                OutputChunk::Stdout(data) => stdout.write(&data, &crunch).await,
                OutputChunk::Stderr(data) => stderr.write(&data, &crunch).await,
            }
        }
        stdout.close(&crunch).await;
        stderr.close(&crunch).await;
    })
}

// =============================================================================
// Host information
// =============================================================================

/// Diagnostic snapshot of the host for `node-info.txt`; commands that fail
/// are noted and skipped
async fn host_info(scratch: &Path) -> Vec<u8> {
    let scratch = scratch.display().to_string();
    let commands: [(&str, &str, Vec<&str>); 5] = [
        ("Host Information", "uname", vec!["-a"]),
        ("CPU Information", "cat", vec!["/proc/cpuinfo"]),
        ("Memory Information", "cat", vec!["/proc/meminfo"]),
        ("Disk Space", "df", vec!["-m", "/", &scratch]),
        ("Disk INodes", "df", vec!["-i", "/", &scratch]),
    ];

    let mut out = Vec::new();
    for (label, program, args) in commands {
        out.extend_from_slice(label.as_bytes());
        out.push(b'\n');
        match Command::new(program).args(&args).output().await {
            Ok(result) => out.extend_from_slice(&result.stdout),
            Err(e) => out.extend_from_slice(format!("Error running {}: {}\n", program, e).as_bytes()),
        }
        out.push(b'\n');
    }
    out
}
