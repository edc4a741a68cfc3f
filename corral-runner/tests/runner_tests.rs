use anyhow::Result;
use async_trait::async_trait;
use corral_core::domain::{
    ExecutionSpec, Mount, ResourceConstraints, SchedulingHints, WorkItemState,
};
use corral_core::dto::request::CreateRequest;
use corral_core::manifest::{Locator, Manifest};
use corral_core::{BlobStore, MemoryBlobStore, WorkItemApi};
use corral_runner::{
    CollectionWriter, ContainerSpec, FinalState, KeepMountResolver, ManifestCache, OutputChunk,
    Runner, SandboxRuntime,
};
use corral_store::Store;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const IDENTITY: &str = "dispatch-test";
const FOO_BLOCK: &str = "acbd18db4cc2f85cedef654fccc4a4d8+3";

/// Sandbox that writes canned files into the output bind instead of
/// running anything
#[derive(Default)]
struct FakeSandbox {
    exit_code: i32,
    stdout: Vec<u8>,
    files: Vec<(String, Vec<u8>)>,
    create_error: Option<String>,
    /// Never exits on its own
    hang: bool,
    sender: Mutex<Option<mpsc::Sender<OutputChunk>>>,
    created: Mutex<Vec<ContainerSpec>>,
    removed: AtomicBool,
    started: Notify,
}

#[async_trait]
impl SandboxRuntime for FakeSandbox {
    async fn image_exists(&self, _image_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn load_image(&self, _tarball: &Path) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if let Some(error) = &self.create_error {
            anyhow::bail!("{}", error);
        }
        self.created.lock().unwrap().push(spec.clone());
        Ok("sandbox-1".to_string())
    }

    async fn attach(&self, _handle: &str) -> Result<mpsc::Receiver<OutputChunk>> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn start(&self, _handle: &str) -> Result<()> {
        let spec = self.created.lock().unwrap().last().cloned().unwrap();
        let out = spec
            .binds
            .iter()
            .find_map(|b| b.strip_suffix(":/out"))
            .map(PathBuf::from)
            .unwrap();
        for (name, data) in &self.files {
            let path = out.join(name);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, data)?;
        }

        let tx = self.sender.lock().unwrap().clone();
        if let Some(tx) = tx {
            if !self.stdout.is_empty() {
                tx.send(OutputChunk::Stdout(self.stdout.clone())).await?;
            }
        }
        if !self.hang {
            self.sender.lock().unwrap().take();
        }
        self.started.notify_one();
        Ok(())
    }

    async fn wait(&self, _handle: &str) -> Result<i32> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn remove(&self, _handle: &str) -> Result<()> {
        self.removed.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

struct Harness {
    store: Store,
    blobs: Arc<MemoryBlobStore>,
    cache: Arc<ManifestCache>,
    sandbox: Arc<FakeSandbox>,
    keep: tempfile::TempDir,
    scratch: tempfile::TempDir,
}

impl Harness {
    fn new(sandbox: FakeSandbox) -> Self {
        Self {
            store: Store::in_memory(),
            blobs: Arc::new(MemoryBlobStore::new()),
            cache: Arc::new(ManifestCache::default()),
            sandbox: Arc::new(sandbox),
            keep: tempfile::tempdir().unwrap(),
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    async fn image(&self) -> String {
        let mut writer = CollectionWriter::new(self.blobs.clone());
        writer.write_file("sha256abc.tar", b"image").await.unwrap();
        let manifest = writer.finish().await.unwrap();
        self.blobs
            .put(manifest.text().as_bytes())
            .await
            .unwrap()
            .to_string()
    }

    /// Creates a Work Item with `mounts` and locks it as the dispatcher would
    async fn locked_item(&self, mounts: serde_json::Value) -> Uuid {
        let mounts: BTreeMap<String, Mount> = serde_json::from_value(mounts).unwrap();
        let request = self
            .store
            .create_request(CreateRequest {
                name: None,
                priority: Some(1),
                runtime_constraints: ResourceConstraints {
                    vcpus: 1,
                    ram_bytes: 250_000_000,
                    scratch_bytes: 0,
                    gpus: None,
                },
                scheduling: SchedulingHints::default(),
                spec: ExecutionSpec {
                    command: vec!["echo".to_string(), "hello".to_string()],
                    container_image: self.image().await,
                    cwd: "/".to_string(),
                    environment: BTreeMap::new(),
                    mounts,
                    output_path: "/out".to_string(),
                },
                requesting_work_item_id: None,
                use_existing: false,
                commit: true,
            })
            .await
            .unwrap();
        let id = request.work_item_id.unwrap();
        self.store.lock(id, IDENTITY).await.unwrap();
        id
    }

    fn runner(&self) -> Runner {
        let resolver = KeepMountResolver::new(
            self.keep.path(),
            None,
            self.blobs.clone(),
            self.cache.clone(),
        );
        Runner::new(
            Arc::new(self.store.clone()),
            self.blobs.clone(),
            self.sandbox.clone(),
            Arc::new(resolver),
            self.cache.clone(),
        )
        .with_scratch_root(self.scratch.path())
    }

    async fn manifest(&self, pdh: &str) -> Manifest {
        let locator: Locator = pdh.parse().unwrap();
        let text = String::from_utf8(self.blobs.get(&locator).await.unwrap()).unwrap();
        Manifest::parse(&text).unwrap()
    }

    /// Contents of `name` in the root stream of collection `pdh`
    async fn read_file(&self, pdh: &str, name: &str) -> String {
        let manifest = self.manifest(pdh).await;
        let stream = manifest.streams.iter().find(|s| s.name == ".").unwrap();
        let mut data = Vec::new();
        for range in stream.file_ranges(name) {
            let block = self.blobs.get(&range.locator).await.unwrap();
            data.extend_from_slice(&block[range.start as usize..range.end as usize]);
        }
        String::from_utf8(data).unwrap()
    }
}

fn output_mount() -> serde_json::Value {
    serde_json::json!({"/out": {"kind": "collection", "writable": true}})
}

#[tokio::test]
async fn test_complete_run_commits_output_and_logs() {
    let h = Harness::new(FakeSandbox {
        stdout: b"hello\n".to_vec(),
        files: vec![("file1.txt".to_string(), b"foo".to_vec())],
        ..Default::default()
    });
    let id = h.locked_item(output_mount()).await;

    let outcome = h.runner().run(id, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, FinalState::Complete);
    assert_eq!(outcome.exit_code, Some(0));

    let expected = Locator::for_bytes(format!(". {} 0:3:file1.txt\n", FOO_BLOCK).as_bytes());
    assert_eq!(outcome.output.as_deref(), Some(expected.to_string().as_str()));

    let item = h.store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Complete);
    assert_eq!(item.exit_code, Some(0));
    assert_eq!(item.output, outcome.output);
    assert_eq!(item.log, outcome.log);

    let log = outcome.log.unwrap();
    let names = h.manifest(&log).await.streams[0].file_names().join(",");
    assert_eq!(names, "container.json,crunch-run.txt,node-info.txt,stderr.txt,stdout.txt");
    assert!(h.read_file(&log, "stdout.txt").await.ends_with(" hello\n"));
    assert!(h.read_file(&log, "crunch-run.txt").await.contains("Container exited with status code 0"));

    let spec = h.sandbox.created.lock().unwrap()[0].clone();
    assert_eq!(spec.name, format!("corral-{}", id));
    assert_eq!(spec.image, "sha256abc");
    assert_eq!(spec.network_mode, None);
    assert!(h.sandbox.removed.load(Ordering::SeqCst));

    let events = h.store.events(id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == "stdout" && e.text.contains("hello"))
    );
}

#[tokio::test]
async fn test_stdout_redirected_into_output() {
    let h = Harness::new(FakeSandbox {
        stdout: b"to a file\n".to_vec(),
        exit_code: 3,
        ..Default::default()
    });
    let mut mounts = output_mount();
    mounts["stdout"] = serde_json::json!({"kind": "file", "path": "/out/logs/stdout.txt"});
    let id = h.locked_item(mounts).await;

    let outcome = h.runner().run(id, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, FinalState::Complete);
    assert_eq!(outcome.exit_code, Some(3));

    let output = h.manifest(outcome.output.as_deref().unwrap()).await;
    assert_eq!(output.streams.len(), 1);
    assert_eq!(output.streams[0].name, "./logs");
    assert_eq!(output.streams[0].file_names(), vec!["stdout.txt"]);
    assert_eq!(output.streams[0].total_size(), 10);

    let log = outcome.log.unwrap();
    let names = h.manifest(&log).await.streams[0].file_names().join(",");
    assert!(!names.contains("stdout.txt"));
}

#[tokio::test]
async fn test_mount_error_cancels() {
    let h = Harness::new(FakeSandbox::default());
    let id = h
        .locked_item(serde_json::json!({"/tmp": {"kind": "tmp"}}))
        .await;

    let outcome = h.runner().run(id, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, FinalState::Cancelled);
    assert_eq!(outcome.output, None);
    assert!(h.sandbox.created.lock().unwrap().is_empty());

    let item = h.store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Cancelled);

    let log = outcome.log.unwrap();
    assert!(
        h.read_file(&log, "crunch-run.txt")
            .await
            .contains("Output path does not correspond to a writable mount point")
    );
}

#[tokio::test]
async fn test_broken_node_requeues() {
    let h = Harness::new(FakeSandbox {
        create_error: Some("Cannot connect to Podman: connection refused".to_string()),
        ..Default::default()
    });
    let id = h.locked_item(output_mount()).await;

    let outcome = h.runner().run(id, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, FinalState::Requeue);

    let item = h.store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.locked_by, None);
}

#[tokio::test]
async fn test_cancel_before_start_requeues() {
    let h = Harness::new(FakeSandbox::default());
    let id = h.locked_item(output_mount()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = h.runner().run(id, cancel).await.unwrap();
    assert_eq!(outcome.state, FinalState::Requeue);
    assert!(h.sandbox.created.lock().unwrap().is_empty());
    assert_eq!(
        h.store.get_work_item(id).await.unwrap().state,
        WorkItemState::Queued
    );
}

#[tokio::test]
async fn test_cancel_while_running_captures_partial_output() {
    let h = Harness::new(FakeSandbox {
        files: vec![("partial.txt".to_string(), b"foo".to_vec())],
        hang: true,
        ..Default::default()
    });
    let id = h.locked_item(output_mount()).await;

    let runner = h.runner();
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { runner.run(id, cancel).await }
    });

    h.sandbox.started.notified().await;
    cancel.cancel();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.state, FinalState::Cancelled);
    assert!(h.sandbox.removed.load(Ordering::SeqCst));
    let expected = Locator::for_bytes(format!(". {} 0:3:partial.txt\n", FOO_BLOCK).as_bytes());
    assert_eq!(outcome.output, Some(expected.to_string()));

    let item = h.store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Cancelled);
    assert_eq!(item.output, None);

    let events = h.store.events(id).await.unwrap();
    let partial = events
        .iter()
        .find(|e| e.event_type == "partial_output")
        .unwrap();
    assert!(partial.text.contains(&expected.to_string()));
}

#[tokio::test]
async fn test_refuses_item_locked_by_someone_else() {
    let h = Harness::new(FakeSandbox::default());
    let id = h.locked_item(output_mount()).await;

    let runner = h.runner().with_identity(Some("other-dispatcher".to_string()));
    assert!(runner.run(id, CancellationToken::new()).await.is_err());

    let item = h.store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Locked);
    assert_eq!(item.locked_by.as_deref(), Some(IDENTITY));
}
