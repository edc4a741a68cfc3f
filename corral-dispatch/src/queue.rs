//! Queue monitor
//!
//! Polls the batch scheduler's queue on a fixed period and publishes each
//! successful listing as an immutable [`QueueSnapshot`]. Readers that need
//! fresh data wait for the next poll that *starts* after their call; a
//! poll failure leaves the previous snapshot in place.
//!
//! Submissions, cancellations and renices run under the same lock as the
//! poll, so a snapshot never races a scheduler command issued by this
//! process.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::slurm::{BatchScheduler, JobSubmission};

/// One job in the scheduler queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub niceness: i64,
    pub priority: i64,
}

/// Queue contents as of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    jobs: HashMap<String, QueueEntry>,
    /// Number of successful polls published so far; 0 means never polled
    generation: u64,
}

impl QueueSnapshot {
    /// Parses `name niceness priority` lines.
    ///
    /// Missing or unparsable numbers default to 0. Blank lines are skipped.
    pub fn parse(listing: &str) -> Self {
        let mut jobs = HashMap::new();
        for line in listing.lines() {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else {
                continue;
            };
            let mut number = |what: &str| match fields.next().map(str::parse::<i64>) {
                Some(Ok(n)) => n,
                other => {
                    debug!("Queue line {:?}: {} {:?}, using 0", line, what, other);
                    0
                }
            };
            let niceness = number("niceness");
            let priority = number("priority");
            jobs.insert(name.to_string(), QueueEntry { niceness, priority });
        }
        Self { jobs, generation: 0 }
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn niceness(&self, name: &str) -> Option<i64> {
        self.jobs.get(name).map(|entry| entry.niceness)
    }

    pub fn get(&self, name: &str) -> Option<&QueueEntry> {
        self.jobs.get(name)
    }

    /// Job names, sorted
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct QueueMonitor {
    scheduler: Arc<dyn BatchScheduler>,
    period: Duration,
    /// Serialises polls with submit/cancel/renice
    lock: Mutex<()>,
    latest: watch::Sender<Arc<QueueSnapshot>>,
    wake: Notify,
    stopped: CancellationToken,
}

impl QueueMonitor {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, period: Duration) -> Arc<Self> {
        let (latest, _) = watch::channel(Arc::new(QueueSnapshot::default()));
        Arc::new(Self {
            scheduler,
            period,
            lock: Mutex::new(()),
            latest,
            wake: Notify::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Spawns the polling task
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Time between scheduled polls
    pub fn period(&self) -> Duration {
        self.period
    }

    async fn run(&self) {
        info!("Queue monitor started (period: {:?})", self.period);
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => debug!("Out-of-band queue poll requested"),
            }
            self.poll().await;
        }

        info!("Queue monitor stopped");
    }

    /// Runs one poll and publishes the result. Failures keep the stale
    /// snapshot.
    pub async fn poll(&self) {
        let _guard = self.lock.lock().await;

        match self.scheduler.list_queue().await {
            Ok(listing) => {
                let mut snapshot = QueueSnapshot::parse(&listing);
                snapshot.generation = self.latest.borrow().generation + 1;
                debug!(
                    "Queue poll {} found {} job(s)",
                    snapshot.generation,
                    snapshot.len()
                );
                self.latest.send_replace(Arc::new(snapshot));
            }
            Err(e) => {
                warn!("Queue poll failed, keeping previous snapshot: {:#}", e);
            }
        }
    }

    // =========================================================================
    // Readers
    // =========================================================================

    /// Current snapshot without waiting; may be stale or never polled
    pub fn peek(&self) -> Arc<QueueSnapshot> {
        self.latest.borrow().clone()
    }

    /// Waits for the next poll that starts after this call and returns its
    /// snapshot. After [`stop`](Self::stop) the stale snapshot is returned
    /// immediately.
    pub async fn snapshot(&self) -> Arc<QueueSnapshot> {
        // Taking the poll lock first means no poll is in flight when we
        // subscribe, so the next publication comes from a later poll.
        let mut rx = {
            let _guard = self.lock.lock().await;
            self.latest.subscribe()
        };

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!("Queue monitor dropped while waiting for a poll");
                }
            }
            _ = self.stopped.cancelled() => {}
        }

        let snapshot = rx.borrow().clone();
        snapshot
    }

    pub async fn has_job(&self, name: &str) -> bool {
        self.snapshot().await.has_job(name)
    }

    pub async fn niceness(&self, name: &str) -> Option<i64> {
        self.snapshot().await.niceness(name)
    }

    pub async fn all_job_names(&self) -> Vec<String> {
        self.snapshot().await.job_names()
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Triggers a poll without waiting for the period
    pub fn request_poll(&self) {
        self.wake.notify_one();
    }

    /// Ends polling; waiters wake with whatever snapshot is current
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    // =========================================================================
    // Scheduler commands
    // =========================================================================

    pub async fn submit(&self, job: &JobSubmission) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.scheduler.submit(job).await
    }

    pub async fn cancel(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.scheduler.cancel(name).await
    }

    pub async fn renice(&self, name: &str, niceness: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.scheduler.renice(name, niceness).await
    }
}
