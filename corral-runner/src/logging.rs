//! Job logs
//!
//! Everything a job says ends up in two places: the log manifest committed
//! when the job finishes, and live `Event`s on the Work Item. Each stream
//! (`crunch-run`, `stdout`, `stderr`) goes through a [`ThrottledLogger`]
//! that timestamps every line and enforces three independent caps:
//! lines per window, bytes per window and bytes per job. Crossing a cap
//! writes one explanatory line, then output is discarded until the window
//! rolls over (or, for the per-job cap, for the rest of the job).

use chrono::{DateTime, SecondsFormat, Utc};
use corral_core::WorkItemApi;
use corral_core::dto::work_item::RecordEvent;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Largest event text the store accepts
const MAX_EVENT_TEXT: usize = 64 * 1024;

/// Longest unterminated run of output held back waiting for a newline
const MAX_LINE_BYTES: usize = 16 * 1024;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Caps applied to job log output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLimits {
    pub bytes_per_period: u64,
    pub lines_per_period: u64,
    pub period: Duration,
    pub bytes_per_job: u64,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            bytes_per_period: 65536,
            lines_per_period: 1024,
            period: Duration::from_secs(60),
            bytes_per_job: 64 << 20,
        }
    }
}

/// One accepted log line on its way to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: String,
    pub text: String,
}

// =============================================================================
// ThrottledLogger
// =============================================================================

struct Window {
    started: DateTime<Utc>,
    bytes: u64,
    lines: u64,
    bytes_silenced: bool,
    lines_silenced: bool,
}

struct LoggerState {
    window: Window,
    job_silenced: bool,
    /// Bytes after the last newline, waiting for the rest of their line
    partial: Vec<u8>,
    text: String,
}

/// Timestamping, rate-limited writer for one log stream
pub struct ThrottledLogger {
    stream: String,
    limits: ThrottleLimits,
    /// Bytes accepted across every stream of the job
    job_bytes: Arc<AtomicU64>,
    clock: Clock,
    events: Option<mpsc::UnboundedSender<LogLine>>,
    state: Mutex<LoggerState>,
}

impl ThrottledLogger {
    fn new(
        stream: &str,
        limits: ThrottleLimits,
        job_bytes: Arc<AtomicU64>,
        clock: Clock,
        events: Option<mpsc::UnboundedSender<LogLine>>,
    ) -> Self {
        let now = clock();
        Self {
            stream: stream.to_string(),
            limits,
            job_bytes,
            clock,
            events,
            state: Mutex::new(LoggerState {
                window: Window {
                    started: now,
                    bytes: 0,
                    lines: 0,
                    bytes_silenced: false,
                    lines_silenced: false,
                },
                job_silenced: false,
                partial: Vec::new(),
                text: String::new(),
            }),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Logs a message, one timestamped line per line of `message`
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("[{}] {}", self.stream, message);
        let mut state = self.lock();
        for line in message.trim_end_matches('\n').split('\n') {
            self.accept_line(&mut state, line);
        }
    }

    /// Appends raw output; complete lines are logged, the rest is held
    /// until more data or [`close`](Self::close) arrives. A run without a
    /// newline is logged in pieces of at most one maximum line length.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.job_silenced {
            return;
        }
        state.partial.extend_from_slice(data);
        while let Some(pos) = state.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = state.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.accept_line(&mut state, &line);
        }

        let max_line = self.max_line_bytes();
        while state.partial.len() >= max_line {
            let piece: Vec<u8> = state.partial.drain(..max_line).collect();
            let piece = String::from_utf8_lossy(&piece).into_owned();
            self.accept_line(&mut state, &piece);
        }
        if state.job_silenced {
            state.partial.clear();
        }
    }

    fn max_line_bytes(&self) -> usize {
        (self.limits.bytes_per_period / 2).clamp(1, MAX_LINE_BYTES as u64) as usize
    }

    /// Flushes a trailing unterminated line
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.partial.is_empty() {
            let line = String::from_utf8_lossy(&state.partial).into_owned();
            state.partial.clear();
            self.accept_line(&mut state, &line);
        }
    }

    /// Everything accepted so far
    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept_line(&self, state: &mut LoggerState, line: &str) {
        let now = (self.clock)();
        let formatted = format!(
            "{} {}\n",
            now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            line
        );
        let len = formatted.len() as u64;

        let elapsed = |started: DateTime<Utc>| (now - started).to_std().unwrap_or_default();
        if elapsed(state.window.started) >= self.limits.period {
            state.window = Window {
                started: now,
                bytes: 0,
                lines: 0,
                bytes_silenced: false,
                lines_silenced: false,
            };
        }
        let remaining = self
            .limits
            .period
            .saturating_sub(elapsed(state.window.started))
            .as_secs();

        if state.job_silenced {
            return;
        }

        if self.job_bytes.load(Ordering::SeqCst) + len > self.limits.bytes_per_job {
            state.job_silenced = true;
            let notice = format!(
                "Exceeded log limit {} bytes (LOG_BYTES_PER_JOB). Logging will be silenced for the rest of the job.",
                self.limits.bytes_per_job
            );
            self.emit(state, now, &notice);
            return;
        }

        if state.window.lines + 1 > self.limits.lines_per_period {
            if !state.window.lines_silenced {
                state.window.lines_silenced = true;
                let notice = format!(
                    "Exceeded rate {} lines per {} seconds (LOG_THROTTLE_LINES). Logging will be silenced for the next {} seconds.",
                    self.limits.lines_per_period,
                    self.limits.period.as_secs(),
                    remaining
                );
                self.emit(state, now, &notice);
            }
            return;
        }

        if state.window.bytes + len > self.limits.bytes_per_period {
            if !state.window.bytes_silenced {
                state.window.bytes_silenced = true;
                let notice = format!(
                    "Exceeded rate {} bytes per {} seconds (LOG_THROTTLE_BYTES). Logging will be silenced for the next {} seconds.",
                    self.limits.bytes_per_period,
                    self.limits.period.as_secs(),
                    remaining
                );
                self.emit(state, now, &notice);
            }
            return;
        }

        state.window.lines += 1;
        state.window.bytes += len;
        self.job_bytes.fetch_add(len, Ordering::SeqCst);
        self.append(state, formatted);
    }

    /// Writes a throttle notice, which is not itself counted
    fn emit(&self, state: &mut LoggerState, now: DateTime<Utc>, notice: &str) {
        tracing::warn!("[{}] {}", self.stream, notice);
        let formatted = format!(
            "{} {}\n",
            now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            notice
        );
        self.append(state, formatted);
    }

    fn append(&self, state: &mut LoggerState, formatted: String) {
        if let Some(events) = &self.events {
            // The receiver only goes away after the job has finished
            let _ = events.send(LogLine {
                stream: self.stream.clone(),
                text: formatted.clone(),
            });
        }
        state.text.push_str(&formatted);
    }
}

// =============================================================================
// JobLogs
// =============================================================================

/// All log streams and log files of one job
pub struct JobLogs {
    limits: ThrottleLimits,
    job_bytes: Arc<AtomicU64>,
    clock: Clock,
    events: Option<mpsc::UnboundedSender<LogLine>>,
    loggers: Mutex<BTreeMap<String, Arc<ThrottledLogger>>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl JobLogs {
    pub fn new(limits: ThrottleLimits) -> Self {
        Self {
            limits,
            job_bytes: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(Utc::now),
            events: None,
            loggers: Mutex::new(BTreeMap::new()),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mirrors every accepted line to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LogLine>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replaces the wall clock used for timestamps and windows
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The logger for `stream`, created on first use
    pub fn logger(&self, stream: &str) -> Arc<ThrottledLogger> {
        let mut loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
        loggers
            .entry(stream.to_string())
            .or_insert_with(|| {
                Arc::new(ThrottledLogger::new(
                    stream,
                    self.limits,
                    self.job_bytes.clone(),
                    self.clock.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Adds an unthrottled file to the log manifest
    pub fn add_file(&self, name: &str, data: Vec<u8>) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), data);
    }

    /// Closes every stream
    pub fn close(&self) {
        let loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
        for logger in loggers.values() {
            logger.close();
        }
    }

    /// Contents of the log manifest, sorted by file name. Streams become
    /// `<stream>.txt`.
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        let mut files: BTreeMap<String, Vec<u8>> = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
        for (stream, logger) in loggers.iter() {
            files.insert(format!("{}.txt", stream), logger.text().into_bytes());
        }
        files.into_iter().collect()
    }
}

// =============================================================================
// Live events
// =============================================================================

/// Forwards accepted lines to the store as events until every sender is
/// dropped. Consecutive lines of one stream are batched into one event.
pub fn spawn_event_forwarder(
    store: Arc<dyn WorkItemApi>,
    work_item_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<LogLine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failed = false;
        let mut held: Option<LogLine> = None;

        loop {
            let first = match held.take() {
                Some(line) => line,
                None => match rx.recv().await {
                    Some(line) => line,
                    None => break,
                },
            };

            let mut batch = first;
            while let Ok(next) = rx.try_recv() {
                if next.stream != batch.stream
                    || batch.text.len() + next.text.len() > MAX_EVENT_TEXT
                {
                    held = Some(next);
                    break;
                }
                batch.text.push_str(&next.text);
            }
            if batch.text.len() > MAX_EVENT_TEXT {
                let mut cut = MAX_EVENT_TEXT;
                while !batch.text.is_char_boundary(cut) {
                    cut -= 1;
                }
                batch.text.truncate(cut);
            }

            let event = RecordEvent::new(batch.stream, batch.text);
            if let Err(e) = store.record_event(work_item_id, event).await {
                if !failed {
                    tracing::warn!("Failed to record log event for {}: {}", work_item_id, e);
                    failed = true;
                }
            }
        }
    })
}
