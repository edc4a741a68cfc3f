//! Periodic priority sweep
//!
//! Concurrent Request writes can leave a Work Item's stored priority stale
//! (two recomputations interleaving across processes). The sweep re-derives
//! priorities for every mismatched item. An exclusive lock file makes sure
//! only one store process sweeps at a time; a pass that cannot take the
//! lock is skipped, never blocked on.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::store::Store;

/// File name of the sweep lock inside the configured directory
pub const SWEEP_LOCK_FILE: &str = "corral-priority-sweep.lock";

/// Result of one sweep attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The pass ran and examined this many mismatched Work Items
    Swept(usize),
    /// The pass was skipped, e.g. another process holds the lock
    Skipped(String),
}

/// Exclusive advisory lock guarding a sweep pass
pub struct SweepLock {
    path: PathBuf,
}

impl SweepLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tries to take the lock without blocking.
    ///
    /// # Returns
    /// * `Ok(Some(file))` - lock held until `file` is dropped
    /// * `Ok(None)` - another holder has it
    pub fn try_acquire(&self) -> Result<Option<File>, String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                format!("failed to create lock dir {}: {err}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| format!("failed to open sweep lock {}: {err}", self.path.display()))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(format!(
                "failed to acquire sweep lock {}: {err}",
                self.path.display()
            )),
        }
    }
}

/// Runs one sweep pass under the lock
pub async fn sweep_once(store: &Store, lock: &SweepLock) -> SweepOutcome {
    let guard = match lock.try_acquire() {
        Ok(Some(file)) => file,
        Ok(None) => {
            tracing::debug!("Sweep lock held elsewhere, skipping pass");
            return SweepOutcome::Skipped("lock held by another process".to_string());
        }
        Err(reason) => {
            tracing::warn!("Skipping priority sweep: {}", reason);
            return SweepOutcome::Skipped(reason);
        }
    };

    let outcome = match store.sweep_unlocked().await {
        Ok(count) => SweepOutcome::Swept(count),
        Err(err) => {
            tracing::warn!("Priority sweep failed: {:?}", err);
            SweepOutcome::Skipped(format!("{:?}", err))
        }
    };

    if let Err(err) = FileExt::unlock(&guard) {
        tracing::warn!("Failed to release sweep lock {}: {}", lock.path().display(), err);
    }
    outcome
}

/// Background task sweeping on a timer and after Request writes
pub struct Sweeper {
    store: Store,
    lock: SweepLock,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Store, lock: SweepLock, interval: Duration) -> Self {
        Self {
            store,
            lock,
            interval,
        }
    }

    /// Sweeps until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let changes = self.store.changes();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Priority sweeper started (interval: {:?}, lock: {})",
            self.interval,
            self.lock.path().display()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = changes.notified() => {}
            }

            if let SweepOutcome::Swept(count) = sweep_once(&self.store, &self.lock).await {
                if count > 0 {
                    tracing::debug!("Sweep repaired {} work item(s)", count);
                }
            }
        }

        tracing::info!("Priority sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, Repository};
    use corral_core::domain::{
        ExecutionSpec, RequestState, ResourceConstraints, SchedulingHints, WorkItemState,
    };
    use corral_core::dto::request::CreateRequest;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn create(priority: i64) -> CreateRequest {
        CreateRequest {
            name: None,
            priority: Some(priority),
            runtime_constraints: ResourceConstraints {
                vcpus: 1,
                ram_bytes: 1 << 20,
                scratch_bytes: 0,
                gpus: None,
            },
            scheduling: SchedulingHints::default(),
            spec: ExecutionSpec {
                command: vec!["echo".to_string(), priority.to_string()],
                container_image: "busybox".to_string(),
                cwd: "/".to_string(),
                environment: BTreeMap::new(),
                mounts: BTreeMap::new(),
                output_path: "/out".to_string(),
            },
            requesting_work_item_id: None,
            use_existing: true,
            commit: true,
        }
    }

    #[tokio::test]
    async fn test_sweep_repairs_stale_priority() {
        let repo = Arc::new(MemoryRepository::new());
        let store = Store::new(repo.clone());
        let request = store.create_request(create(7)).await.unwrap();
        let item_id = request.work_item_id.unwrap();

        repo.force_priority(item_id, 2);

        let dir = tempfile::tempdir().unwrap();
        let lock = SweepLock::new(dir.path().join(SWEEP_LOCK_FILE));
        assert_eq!(sweep_once(&store, &lock).await, SweepOutcome::Swept(1));

        let item = store.find_work_item(item_id).await.unwrap();
        assert_eq!(item.priority, 7);
    }

    #[tokio::test]
    async fn test_sweep_zeroes_item_without_committed_requests() {
        let repo = Arc::new(MemoryRepository::new());
        let store = Store::new(repo.clone());
        let request = store.create_request(create(4)).await.unwrap();
        let item_id = request.work_item_id.unwrap();

        // The Request is finalized but its Work Item was never recomputed
        let mut stale = store.get_request(request.id).await.unwrap();
        stale.state = RequestState::Final;
        repo.update_request(&stale).await.unwrap();
        assert_eq!(store.find_work_item(item_id).await.unwrap().priority, 4);

        let dir = tempfile::tempdir().unwrap();
        let lock = SweepLock::new(dir.path().join(SWEEP_LOCK_FILE));
        assert_eq!(sweep_once(&store, &lock).await, SweepOutcome::Swept(1));

        let item = store.find_work_item(item_id).await.unwrap();
        assert_eq!(item.priority, 0);
        assert_eq!(item.state, WorkItemState::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_skips_when_lock_held() {
        let store = Store::in_memory();
        let dir = tempfile::tempdir().unwrap();
        let lock = SweepLock::new(dir.path().join(SWEEP_LOCK_FILE));

        let _held = lock.try_acquire().unwrap().unwrap();
        let other = SweepLock::new(dir.path().join(SWEEP_LOCK_FILE));
        assert!(matches!(
            sweep_once(&store, &other).await,
            SweepOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_sweep_skips_when_lock_dir_unusable() {
        let store = Store::in_memory();
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let lock = SweepLock::new(blocker.join(SWEEP_LOCK_FILE));
        assert!(matches!(
            sweep_once(&store, &lock).await,
            SweepOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Store::in_memory();
        let dir = tempfile::tempdir().unwrap();
        let sweeper = Sweeper::new(
            store,
            SweepLock::new(dir.path().join(SWEEP_LOCK_FILE)),
            Duration::from_millis(10),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
