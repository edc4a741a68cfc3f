//! Dispatch loop
//!
//! Each cycle claims Queued Work Items and submits them to the batch
//! scheduler, then reconciles the Work Items this dispatcher holds against
//! a fresh queue snapshot. Scheduler failures are logged and retried on a
//! later cycle; they never stop the loop.

use anyhow::{Context, Result};
use corral_core::WorkItemApi;
use corral_core::domain::{WorkItem, WorkItemState};
use corral_core::dto::work_item::{RecordEvent, StateReport};
use corral_core::priority::niceness;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueMonitor, QueueSnapshot};
use crate::slurm::JobSubmission;

/// Queue poll periods to wait for a fresh snapshot before skipping the
/// reconciliation of held items for this cycle
const SNAPSHOT_WAIT_PERIODS: u32 = 3;

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub submitted: usize,
    pub submit_failures: usize,
    pub cancelled: usize,
    pub vanished: usize,
    pub reniced: usize,
}

pub struct Dispatcher {
    store: Arc<dyn WorkItemApi>,
    monitor: Arc<QueueMonitor>,
    identity: String,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn WorkItemApi>,
        monitor: Arc<QueueMonitor>,
        identity: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            monitor,
            identity: identity.into(),
            poll_interval,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Runs cycles until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Dispatcher {} started (interval: {:?})",
            self.identity, self.poll_interval
        );
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.cycle(&shutdown).await {
                Ok(report) => {
                    if report != CycleReport::default() {
                        info!("Dispatch cycle: {:?}", report);
                    }
                }
                Err(e) => error!("Error during dispatch cycle: {:#}", e),
            }
        }

        info!("Dispatcher {} stopped", self.identity);
    }

    /// Performs one dispatch cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.cycle(&CancellationToken::new()).await
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.submit_queued(&mut report).await?;

        let held = self.held_work_items().await?;
        if held.is_empty() {
            return Ok(report);
        }

        let Some(snapshot) = self.fresh_snapshot(shutdown).await else {
            return Ok(report);
        };
        for item in held {
            self.reconcile_held(&item, &snapshot, &mut report).await;
        }

        Ok(report)
    }

    /// Waits for the next successful queue poll, bounded by a few poll
    /// periods and by `shutdown`. Returns `None` when the wait ends without
    /// one, or the snapshot was never polled or comes from a stopped
    /// monitor; held items are then left alone this cycle.
    async fn fresh_snapshot(&self, shutdown: &CancellationToken) -> Option<Arc<QueueSnapshot>> {
        let wait = self.monitor.period() * SNAPSHOT_WAIT_PERIODS;
        let snapshot = tokio::select! {
            _ = shutdown.cancelled() => return None,
            waited = tokio::time::timeout(wait, self.monitor.snapshot()) => match waited {
                Ok(snapshot) => snapshot,
                Err(_) => {
                    warn!("No queue snapshot within {:?}, skipping held work items this cycle", wait);
                    return None;
                }
            },
        };

        if snapshot.generation() == 0 || self.monitor.is_stopped() {
            warn!("Queue snapshot is not current, skipping held work items this cycle");
            return None;
        }
        Some(snapshot)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    async fn submit_queued(&self, report: &mut CycleReport) -> Result<()> {
        let queued = self
            .store
            .list_work_items(&[WorkItemState::Queued])
            .await
            .context("Failed to list queued work items")?;

        for item in queued.into_iter().filter(|item| item.priority > 0) {
            let locked = match self.store.lock(item.id, &self.identity).await {
                Ok(locked) => locked,
                Err(e) if e.is_conflict() => {
                    debug!("Work item {} claimed elsewhere: {}", item.id, e);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to lock work item {}: {}", item.id, e);
                    continue;
                }
            };

            let job = JobSubmission::for_work_item(&locked);
            match self.monitor.submit(&job).await {
                Ok(()) => report.submitted += 1,
                Err(e) => {
                    report.submit_failures += 1;
                    warn!("Submission of work item {} failed: {:#}", item.id, e);
                    self.release_after_failed_submit(&locked, &e).await;
                }
            }
        }

        Ok(())
    }

    async fn release_after_failed_submit(&self, item: &WorkItem, cause: &anyhow::Error) {
        if let Err(e) = self.store.unlock(item.id, &self.identity).await {
            warn!("Failed to unlock work item {}: {}", item.id, e);
        }
        let event = RecordEvent::new("dispatch", format!("batch submission failed: {:#}", cause));
        if let Err(e) = self.store.record_event(item.id, event).await {
            warn!("Failed to record dispatch event for {}: {}", item.id, e);
        }
    }

    // =========================================================================
    // Reconciliation of held items
    // =========================================================================

    async fn held_work_items(&self) -> Result<Vec<WorkItem>> {
        let items = self
            .store
            .list_work_items(&[WorkItemState::Locked, WorkItemState::Running])
            .await
            .context("Failed to list held work items")?;
        Ok(items
            .into_iter()
            .filter(|item| item.is_held_by(&self.identity))
            .collect())
    }

    async fn reconcile_held(&self, item: &WorkItem, snapshot: &QueueSnapshot, report: &mut CycleReport) {
        let name = item.id.to_string();

        let Some(entry) = snapshot.get(&name) else {
            self.handle_vanished(item).await;
            report.vanished += 1;
            return;
        };

        if item.priority == 0 {
            info!("Work item {} dropped to priority 0, cancelling batch job", item.id);
            match self.monitor.cancel(&name).await {
                Ok(()) => report.cancelled += 1,
                Err(e) => warn!("Failed to cancel batch job {}: {:#}", name, e),
            }
            return;
        }

        let desired = niceness(item.priority);
        if entry.niceness != desired {
            match self.monitor.renice(&name, desired).await {
                Ok(()) => report.reniced += 1,
                Err(e) => warn!("Failed to renice batch job {}: {:#}", name, e),
            }
        }
    }

    /// The batch job is gone but the store still shows us holding the item
    async fn handle_vanished(&self, item: &WorkItem) {
        let result = match item.state {
            WorkItemState::Running => {
                info!(
                    "Batch job for running work item {} vanished, marking Cancelled",
                    item.id
                );
                self.store
                    .report_state(item.id, StateReport::cancelled(Some(self.identity.clone())))
                    .await
            }
            _ => {
                info!(
                    "Batch job for locked work item {} vanished before start, unlocking",
                    item.id
                );
                self.store.unlock(item.id, &self.identity).await
            }
        };

        if let Err(e) = result {
            // The runner may have finished the item since we listed it
            debug!("Cleanup of vanished work item {} skipped: {}", item.id, e);
        }
    }
}
