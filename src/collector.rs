//! # Metric Collector
//!
//! Buffers [`MetricEvent`]s at the point of measurement and appends them in
//! batches to a CSV log.
//!
//! ## Concurrency Model
//!
//! - `record_metric` is synchronous and never waits on I/O. Crossing the
//!   flush threshold spawns a flush on the current tokio runtime.
//! - At most one persist is in flight per collector. The pending persist is
//!   held in a single slot; later `flush()` callers wait on the same outcome
//!   instead of starting a second write.
//! - The buffer is swapped for an empty one before the write begins, so
//!   records arriving during a write go to the next batch. No record is
//!   written twice or skipped.
//! - The buffer lock is never held across an await.
//!
//! ## Lifecycle
//!
//! The owner calls [`MetricCollector::dispose`] once it is done recording.
//! Shutdown handling is opt-in through [`MetricCollector::flush_on_shutdown`];
//! the library never installs process-wide hooks on its own.

use crate::error::CollectorError;
use crate::record::{CsvSchema, MetricEvent, PersistedRecord};
use crate::utils::{self, sanitize_text, MAX_SAFE_INTEGER};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Invoked with the number of records after every successful persist.
pub type FlushCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Invoked for every rejected metric and every failed persist.
pub type ErrorCallback = Arc<dyn Fn(&CollectorError) + Send + Sync>;

/// Integrity hash before any record has been accepted.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

type FlushOutcome = Result<usize, CollectorError>;

/// Collector configuration
#[derive(Clone)]
pub struct CollectorConfig {
    /// CSV log to append to; must stay inside `base_dir`
    pub output_path: PathBuf,
    /// Written to the `Filename` column when an event has no test name
    pub test_name: String,
    /// Flush threshold, clamped to `1..=MAX_BUFFER_SIZE`
    pub buffer_size: usize,
    /// Periodic flush interval; 0 disables the timer
    pub flush_interval_ms: u64,
    /// Suppress informational logging and per-record warnings
    pub silent: bool,
    /// JMeter 10-column rows when true, compact rows otherwise
    pub schema_compatible: bool,
    /// Hard cap on buffered records
    pub max_buffered_records: usize,
    /// Directory the output must stay within; defaults to the working directory
    pub base_dir: Option<PathBuf>,
    pub on_flush: Option<FlushCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl CollectorConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            test_name: crate::defaults::TEST_NAME.to_string(),
            buffer_size: crate::defaults::BUFFER_SIZE,
            flush_interval_ms: crate::defaults::FLUSH_INTERVAL_MS,
            silent: false,
            schema_compatible: true,
            max_buffered_records: crate::defaults::MAX_BUFFERED_RECORDS,
            base_dir: None,
            on_flush: None,
            on_error: None,
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn with_on_flush(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_flush = Some(Arc::new(callback));
        self
    }

    pub fn with_on_error(
        mut self,
        callback: impl Fn(&CollectorError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for CollectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorConfig")
            .field("output_path", &self.output_path)
            .field("test_name", &self.test_name)
            .field("buffer_size", &self.buffer_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("silent", &self.silent)
            .field("schema_compatible", &self.schema_compatible)
            .field("max_buffered_records", &self.max_buffered_records)
            .field("base_dir", &self.base_dir)
            .field("on_flush", &self.on_flush.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The flat option shape older adapters pass
#[derive(Debug, Clone)]
pub struct LegacyCollectorConfig {
    pub output_file: PathBuf,
    pub buffer_size: Option<usize>,
    pub flush_interval: Option<u64>,
    pub test_name: Option<String>,
}

/// Either configuration shape, named explicitly by the caller
#[derive(Debug, Clone)]
pub enum CollectorOptions {
    Legacy(LegacyCollectorConfig),
    Enhanced(CollectorConfig),
}

/// Map the legacy option shape onto [`CollectorConfig`].
pub fn migrate_legacy(legacy: LegacyCollectorConfig) -> CollectorConfig {
    let mut config = CollectorConfig::new(legacy.output_file);
    if let Some(buffer_size) = legacy.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(interval) = legacy.flush_interval {
        config.flush_interval_ms = interval;
    }
    if let Some(test_name) = legacy.test_name {
        config.test_name = test_name;
    }
    config
}

impl From<CollectorOptions> for CollectorConfig {
    fn from(options: CollectorOptions) -> Self {
        match options {
            CollectorOptions::Legacy(legacy) => migrate_legacy(legacy),
            CollectorOptions::Enhanced(config) => config,
        }
    }
}

/// Point-in-time view of a collector's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStats {
    pub total_collected: u64,
    pub total_flushed: u64,
    pub buffered: usize,
    pub flush_count: u64,
    pub error_count: u64,
    pub flush_in_progress: bool,
    pub is_alive: bool,
    pub integrity_hash: String,
}

/// The single in-flight persist
struct PendingFlush {
    records: usize,
    started: Instant,
    outcome: watch::Receiver<Option<FlushOutcome>>,
}

/// Clears the pending slot if the flush task unwinds before completing,
/// so later flushes are not stuck joining a write that will never finish.
struct FlushSlotGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl FlushSlotGuard {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) -> Arc<Inner> {
        self.armed = false;
        Arc::clone(&self.inner)
    }
}

impl Drop for FlushSlotGuard {
    fn drop(&mut self) {
        if self.armed {
            let abandoned = self.inner.state.lock().pending.take();
            if let Some(pending) = abandoned {
                warn!(
                    "Flush of {} records to {:?} aborted before completing",
                    pending.records, self.inner.output_path
                );
            }
        }
    }
}

struct CollectorState {
    buffer: Vec<PersistedRecord>,
    pending: Option<PendingFlush>,
    flush_scheduled: bool,
    integrity_hash: String,
    timer: Option<JoinHandle<()>>,
    shutdown_hook: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    collected: AtomicU64,
    flushed: AtomicU64,
    flushes: AtomicU64,
    errors: AtomicU64,
}

struct Inner {
    output_path: PathBuf,
    test_name: String,
    schema: CsvSchema,
    buffer_size: usize,
    hard_cap: usize,
    silent: bool,
    on_flush: Option<FlushCallback>,
    on_error: Option<ErrorCallback>,
    state: Mutex<CollectorState>,
    counters: Counters,
    disposed: AtomicBool,
}

/// Buffered, append-only CSV metric writer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetricCollector {
    inner: Arc<Inner>,
}

enum Admission {
    Accepted { flush_due: bool },
    Full,
}

impl MetricCollector {
    /// Validate the configuration and create a collector.
    ///
    /// No I/O happens here; the output directory is created on first flush.
    /// When called inside a tokio runtime with a non-zero interval, the
    /// periodic flush task is started.
    pub fn new(options: impl Into<CollectorConfig>) -> Result<Self, CollectorError> {
        let config: CollectorConfig = options.into();

        if config.output_path.as_os_str().is_empty() {
            return Err(CollectorError::Configuration(
                "output path is required".to_string(),
            ));
        }
        let base_dir = match config.base_dir {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| {
                CollectorError::Configuration(format!("cannot resolve working directory: {}", e))
            })?,
        };
        let output_path = resolve_output_path(&base_dir, &config.output_path)?;

        let inner = Arc::new(Inner {
            output_path,
            test_name: sanitize_text(&config.test_name),
            schema: CsvSchema::from_compatibility(config.schema_compatible),
            buffer_size: utils::clamp_buffer_size(config.buffer_size),
            hard_cap: config.max_buffered_records.max(1),
            silent: config.silent,
            on_flush: config.on_flush,
            on_error: config.on_error,
            state: Mutex::new(CollectorState {
                buffer: Vec::new(),
                pending: None,
                flush_scheduled: false,
                integrity_hash: GENESIS_HASH.to_string(),
                timer: None,
                shutdown_hook: None,
            }),
            counters: Counters::default(),
            disposed: AtomicBool::new(false),
        });

        if config.flush_interval_ms > 0 {
            let timer = start_flush_timer(&inner, Duration::from_millis(config.flush_interval_ms));
            inner.state.lock().timer = timer;
        }

        if !inner.silent {
            info!(
                "Metric collector writing to {:?} (flush at {} records)",
                inner.output_path, inner.buffer_size
            );
        }
        Ok(Self { inner })
    }

    /// Resolved path of the CSV log.
    pub fn output_path(&self) -> &Path {
        &self.inner.output_path
    }

    /// Accept one measurement.
    ///
    /// Invalid events are counted and reported to the error callback; this
    /// method never fails and never waits on I/O.
    pub fn record_metric(&self, event: MetricEvent) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            warn!("record_metric called on a disposed collector; metric ignored");
            return;
        }

        if let Err(error) = validate_event(&event) {
            inner.report_error(error);
            return;
        }

        if !event.custom.is_empty() {
            trace!(
                endpoint = %event.endpoint,
                method = %event.method,
                custom_fields = event.custom.len(),
                "custom fields are not persisted"
            );
        }
        let record = inner.normalize(event);

        let admission = {
            let mut state = inner.state.lock();
            if state.buffer.len() >= inner.hard_cap {
                Admission::Full
            } else {
                state.integrity_hash = chain_digest(&state.integrity_hash, &record);
                state.buffer.push(record);
                inner.counters.collected.fetch_add(1, Ordering::Relaxed);

                let len = state.buffer.len();
                let due = len >= inner.buffer_size || len >= inner.hard_cap;
                let flush_due = due && state.pending.is_none() && !state.flush_scheduled;
                if flush_due {
                    state.flush_scheduled = true;
                }
                Admission::Accepted { flush_due }
            }
        };

        match admission {
            Admission::Accepted { flush_due: true } => inner.spawn_flush(),
            Admission::Accepted { flush_due: false } => {}
            Admission::Full => inner.report_error(CollectorError::ResourceLimit {
                limit: inner.hard_cap,
            }),
        }
    }

    /// Persist everything buffered so far.
    ///
    /// Returns the number of records written by the persist this call
    /// observed. If a persist was already in flight, this returns that
    /// persist's outcome; records buffered since then go out with the next
    /// flush.
    pub async fn flush(&self) -> Result<usize, CollectorError> {
        self.inner.flush().await
    }

    /// Drain the buffer and stop background work. Idempotent.
    pub async fn dispose(&self) -> Result<(), CollectorError> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());
        loop {
            if let Err(e) = inner.flush().await {
                result = Err(e);
                break;
            }
            let drained = {
                let state = inner.state.lock();
                state.buffer.is_empty() && state.pending.is_none()
            };
            if drained {
                break;
            }
        }

        let (timer, hook) = {
            let mut state = inner.state.lock();
            (state.timer.take(), state.shutdown_hook.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(hook) = hook {
            hook.abort();
        }

        if !inner.silent {
            info!(
                "Metric collector disposed: {} collected, {} flushed, {} errors",
                inner.counters.collected.load(Ordering::Relaxed),
                inner.counters.flushed.load(Ordering::Relaxed),
                inner.counters.errors.load(Ordering::Relaxed)
            );
        }
        result
    }

    /// Dispose the collector when the process receives Ctrl-C.
    ///
    /// Registers at most once per collector; returns whether this call
    /// registered. Requires a tokio runtime. `dispose` detaches it.
    pub fn flush_on_shutdown(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown_hook.is_some() || self.inner.disposed.load(Ordering::Acquire) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("flush_on_shutdown requires a tokio runtime; not registered");
            return false;
        };

        let weak = Arc::downgrade(&self.inner);
        state.shutdown_hook = Some(runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                debug!("Shutdown signal received, disposing metric collector");
                if let Err(e) = (MetricCollector { inner }).dispose().await {
                    warn!("Final flush on shutdown failed: {}", e);
                }
            }
        }));
        true
    }

    pub fn stats(&self) -> CollectorStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        CollectorStats {
            total_collected: inner.counters.collected.load(Ordering::Relaxed),
            total_flushed: inner.counters.flushed.load(Ordering::Relaxed),
            buffered: state.buffer.len(),
            flush_count: inner.counters.flushes.load(Ordering::Relaxed),
            error_count: inner.counters.errors.load(Ordering::Relaxed),
            flush_in_progress: state.pending.is_some(),
            is_alive: !inner.disposed.load(Ordering::Acquire),
            integrity_hash: state.integrity_hash.clone(),
        }
    }
}

impl Inner {
    fn normalize(&self, event: MetricEvent) -> PersistedRecord {
        let threads = event.threads.unwrap_or(1);
        let timestamp = event
            .timestamp
            .filter(|ts| *ts > 0)
            .unwrap_or_else(utils::current_timestamp_ms)
            .min(MAX_SAFE_INTEGER);
        let filename = match event.test_name.as_deref() {
            Some(name) => sanitize_text(name),
            None => self.test_name.clone(),
        };

        PersistedRecord {
            timestamp,
            elapsed: event.response_time.min(MAX_SAFE_INTEGER as f64),
            label: sanitize_text(&event.endpoint),
            response_code: event.status_code,
            success: event.success.unwrap_or(event.status_code < 400),
            bytes: event.bytes_received.min(MAX_SAFE_INTEGER),
            sent_bytes: event.bytes_sent.min(MAX_SAFE_INTEGER),
            grp_threads: threads,
            all_threads: threads,
            filename,
        }
    }

    fn report_error(&self, error: CollectorError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if !self.silent {
            warn!("{}", error);
        }
        if let Some(callback) = &self.on_error {
            callback(&error);
        }
    }

    /// Run a flush in the background; used by threshold and timer triggers.
    fn spawn_flush(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn(async move {
                    // Failures already went to the error callback.
                    let _ = inner.flush().await;
                });
            }
            Err(_) => {
                self.state.lock().flush_scheduled = false;
                debug!("No tokio runtime; automatic flush deferred to the next explicit flush");
            }
        }
    }

    async fn flush(self: &Arc<Self>) -> FlushOutcome {
        let mut outcome = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;

            if let Some(pending) = &state.pending {
                trace!(
                    "Joining in-flight flush of {} records started {:?} ago",
                    pending.records,
                    pending.started.elapsed()
                );
                pending.outcome.clone()
            } else if state.buffer.is_empty() {
                return Ok(0);
            } else {
                let batch = std::mem::take(&mut state.buffer);
                let (tx, rx) = watch::channel(None);
                state.pending = Some(PendingFlush {
                    records: batch.len(),
                    started: Instant::now(),
                    outcome: rx.clone(),
                });

                let guard = FlushSlotGuard::new(Arc::clone(self));
                tokio::spawn(async move {
                    let result = guard.inner.persist(batch).await;
                    let inner = guard.disarm();
                    inner.complete_flush(&result);
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        wait_for_outcome(&mut outcome).await
    }

    async fn persist(&self, batch: Vec<PersistedRecord>) -> FlushOutcome {
        let count = batch.len();
        let path = &self.output_path;
        let write_err = |e| CollectorError::write(path, count, e);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        // Probe the filesystem rather than remembering: another collector or
        // an earlier process may already have written the header.
        let needs_header = !tokio::fs::try_exists(path).await.map_err(write_err)?;

        let mut payload = String::with_capacity((count + 1) * 112);
        if needs_header {
            payload.push_str(self.schema.header());
            payload.push('\n');
        }
        for record in &batch {
            self.schema.write_row(&mut payload, record);
            payload.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(write_err)?;
        file.write_all(payload.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        Ok(count)
    }

    fn complete_flush(self: &Arc<Self>, result: &FlushOutcome) {
        let (elapsed, reschedule) = {
            let mut state = self.state.lock();
            let elapsed = state.pending.take().map(|p| p.started.elapsed());
            let reschedule = state.buffer.len() >= self.buffer_size
                && !state.flush_scheduled
                && !self.disposed.load(Ordering::Acquire);
            if reschedule {
                state.flush_scheduled = true;
            }
            (elapsed, reschedule)
        };

        match result {
            Ok(count) => {
                self.counters.flushed.fetch_add(*count as u64, Ordering::Relaxed);
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                if !self.silent {
                    debug!(
                        "Flushed {} metrics to {:?} in {:?}",
                        count,
                        self.output_path,
                        elapsed.unwrap_or_default()
                    );
                }
                if let Some(callback) = &self.on_flush {
                    callback(*count);
                }
            }
            Err(error) => self.report_error(error.clone()),
        }

        if reschedule {
            self.spawn_flush();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(hook) = state.shutdown_hook.take() {
            hook.abort();
        }
        if !state.buffer.is_empty() {
            warn!(
                "Metric collector dropped with {} unflushed records; call dispose() first",
                state.buffer.len()
            );
        }
    }
}

async fn wait_for_outcome(rx: &mut watch::Receiver<Option<FlushOutcome>>) -> FlushOutcome {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or(Err(CollectorError::FlushAbandoned));
        }
    }
}

/// Start the periodic flush. The task only holds a weak reference, so it
/// never keeps the collector alive.
fn start_flush_timer(inner: &Arc<Inner>, period: Duration) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let weak = Arc::downgrade(inner);

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.disposed.load(Ordering::Acquire) {
                break;
            }
            let has_records = !inner.state.lock().buffer.is_empty();
            if has_records {
                if let Err(e) = inner.flush().await {
                    debug!("Periodic flush failed: {}", e);
                }
            }
        }
    }))
}

fn validate_event(event: &MetricEvent) -> Result<(), CollectorError> {
    if !event.response_time.is_finite() || event.response_time < 0.0 {
        return Err(CollectorError::Validation(format!(
            "response time must be a finite, non-negative number of milliseconds (got {})",
            event.response_time
        )));
    }
    if !(100..=599).contains(&event.status_code) {
        return Err(CollectorError::Validation(format!(
            "status code must be between 100 and 599 (got {})",
            event.status_code
        )));
    }
    Ok(())
}

/// Chain the previous digest with the identifying fields of `record`.
fn chain_digest(previous: &str, record: &PersistedRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(record.timestamp.to_le_bytes());
    hasher.update(record.elapsed.to_bits().to_le_bytes());
    hasher.update(record.response_code.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Join `requested` onto `base_dir` and reject results outside it.
///
/// Resolution is lexical: `.` and `..` are folded, symlinks are not followed.
fn resolve_output_path(base_dir: &Path, requested: &Path) -> Result<PathBuf, CollectorError> {
    let base = if base_dir.is_absolute() {
        normalize_lexically(base_dir)
    } else {
        let cwd = std::env::current_dir().map_err(|e| {
            CollectorError::Configuration(format!("cannot resolve working directory: {}", e))
        })?;
        normalize_lexically(&cwd.join(base_dir))
    };

    let resolved = normalize_lexically(&base.join(requested));
    if resolved == base || !resolved.starts_with(&base) {
        return Err(CollectorError::Configuration(format!(
            "output path {:?} resolves outside the permitted directory {:?}",
            requested, base
        )));
    }
    Ok(resolved)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn config(dir: &TempDir, file: &str) -> CollectorConfig {
        let mut config = CollectorConfig::new(file).with_base_dir(dir.path());
        config.flush_interval_ms = 0;
        config.silent = true;
        config
    }

    fn event(endpoint: &str, response_time: f64, status: u16) -> MetricEvent {
        MetricEvent::new(endpoint, "GET", response_time, status).with_timestamp(1_691_234_567_890)
    }

    fn data_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_flush_writes_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "out/metrics.csv")).unwrap();

        collector.record_metric(event("/api/users", 245.0, 200).with_bytes(1024, 256));
        collector.record_metric(event("/api/orders", 80.0, 503));
        assert_eq!(collector.flush().await.unwrap(), 2);

        let text = std::fs::read_to_string(collector.output_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], crate::record::JMETER_HEADER);
        assert_eq!(
            lines[1],
            "1691234567890,245,\"/api/users\",200,true,1024,256,1,1,\"perf-test\""
        );
        assert!(lines[2].contains(",503,false,"));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_flush_with_empty_buffer_is_noop() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();
        assert_eq!(collector.flush().await.unwrap(), 0);
        assert!(!collector.output_path().exists());
    }

    #[tokio::test]
    async fn test_invalid_metrics_are_counted_not_raised() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let collector = MetricCollector::new(
            config(&dir, "metrics.csv").with_on_error(move |e| {
                assert!(matches!(e, CollectorError::Validation(_)));
                seen_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        collector.record_metric(event("/a", -1.0, 200));
        collector.record_metric(event("/a", f64::NAN, 200));
        collector.record_metric(event("/a", 10.0, 99));
        collector.record_metric(event("/a", 10.0, 600));
        collector.record_metric(event("/a", 10.0, 200));

        let stats = collector.stats();
        assert_eq!(stats.error_count, 4);
        assert_eq!(stats.total_collected, 1);
        assert_eq!(stats.buffered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_defaults_and_sanitization() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();

        let mut ev = MetricEvent::new("/search?q=<b>", "GET", 12.0, 404);
        ev.test_name = Some("suite \"A\"".to_string());
        collector.record_metric(ev);
        collector.flush().await.unwrap();

        let row = &data_lines(collector.output_path())[0];
        assert!(row.contains("\"/search?q=&lt;b&gt;\""));
        assert!(row.contains(",404,false,"));
        assert!(row.ends_with("\"suite &quot;A&quot;\""));

        let ts: u64 = row.split(',').next().unwrap().parse().unwrap();
        assert!(ts > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn test_success_override() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();
        let mut ev = event("/a", 10.0, 200);
        ev.success = Some(false);
        collector.record_metric(ev);
        collector.flush().await.unwrap();
        assert!(data_lines(collector.output_path())[0].contains(",200,false,"));
    }

    #[tokio::test]
    async fn test_threshold_triggers_background_flush() {
        let dir = TempDir::new().unwrap();
        let flushed = Arc::new(AtomicUsize::new(0));
        let flushed_cb = Arc::clone(&flushed);
        let mut cfg = config(&dir, "metrics.csv").with_on_flush(move |n| {
            flushed_cb.fetch_add(n, Ordering::SeqCst);
        });
        cfg.buffer_size = 5;
        let collector = MetricCollector::new(cfg).unwrap();

        for i in 0..5 {
            collector.record_metric(event(&format!("/e{}", i), 10.0, 200));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.stats().total_flushed < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("threshold flush did not complete");

        assert_eq!(flushed.load(Ordering::SeqCst), 5);
        assert_eq!(collector.stats().buffered, 0);
        assert_eq!(data_lines(collector.output_path()).len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_share_one_persist() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();

        for i in 0..250 {
            collector.record_metric(event(&format!("/e{}", i), i as f64, 200));
        }
        let (a, b) = tokio::join!(collector.flush(), collector.flush());
        assert_eq!(a.unwrap(), 250);
        assert_eq!(b.unwrap(), 250);

        let stats = collector.stats();
        assert_eq!(stats.flush_count, 1);
        assert_eq!(stats.total_flushed, 250);
        assert_eq!(data_lines(collector.output_path()).len(), 250);
    }

    #[tokio::test]
    async fn test_panicked_flush_task_frees_the_slot() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();

        let (tx, rx) = watch::channel(None);
        collector.inner.state.lock().pending = Some(PendingFlush {
            records: 1,
            started: Instant::now(),
            outcome: rx.clone(),
        });
        let guard = FlushSlotGuard::new(Arc::clone(&collector.inner));
        let task = tokio::spawn(async move {
            let _guard = guard;
            let _tx = tx;
            panic!("write task crashed");
        });
        assert!(task.await.unwrap_err().is_panic());

        let mut abandoned = rx;
        assert!(matches!(
            wait_for_outcome(&mut abandoned).await,
            Err(CollectorError::FlushAbandoned)
        ));
        assert!(!collector.stats().flush_in_progress);

        collector.record_metric(event("/a", 1.0, 200));
        assert_eq!(collector.flush().await.unwrap(), 1);
        assert_eq!(data_lines(collector.output_path()).len(), 1);
    }

    #[tokio::test]
    async fn test_records_during_flush_go_to_next_batch() {
        let dir = TempDir::new().unwrap();
        let collector = MetricCollector::new(config(&dir, "metrics.csv")).unwrap();

        for i in 0..100 {
            collector.record_metric(event(&format!("/first{}", i), 1.0, 200));
        }
        let background = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.flush().await })
        };
        tokio::task::yield_now().await;
        for i in 0..10 {
            collector.record_metric(event(&format!("/second{}", i), 1.0, 200));
        }

        let first = background.await.unwrap().unwrap();
        let second = collector.flush().await.unwrap();
        assert_eq!(first + second, 110);

        let mut lines = data_lines(collector.output_path());
        assert_eq!(lines.len(), 110);
        lines.sort();
        lines.dedup();
        assert_eq!(lines.len(), 110);
    }

    #[tokio::test]
    async fn test_hard_cap_refuses_explicitly() {
        let dir = TempDir::new().unwrap();
        let limits = Arc::new(AtomicUsize::new(0));
        let limits_cb = Arc::clone(&limits);
        let mut cfg = config(&dir, "metrics.csv").with_on_error(move |e| {
            if matches!(e, CollectorError::ResourceLimit { .. }) {
                limits_cb.fetch_add(1, Ordering::SeqCst);
            }
        });
        cfg.max_buffered_records = 3;
        let collector = MetricCollector::new(cfg).unwrap();

        // No await between records, so the scheduled flush cannot run yet.
        for i in 0..4 {
            collector.record_metric(event(&format!("/e{}", i), 1.0, 200));
        }
        assert_eq!(collector.stats().buffered, 3);
        assert_eq!(limits.load(Ordering::SeqCst), 1);
        assert_eq!(collector.stats().error_count, 1);

        collector.dispose().await.unwrap();
        assert_eq!(data_lines(collector.output_path()).len(), 3);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_drains() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "metrics.csv");
        cfg.flush_interval_ms = 50;
        let collector = MetricCollector::new(cfg).unwrap();
        assert!(collector.flush_on_shutdown());
        assert!(!collector.flush_on_shutdown());

        collector.record_metric(event("/a", 1.0, 200));
        collector.dispose().await.unwrap();
        collector.dispose().await.unwrap();

        let stats = collector.stats();
        assert!(!stats.is_alive);
        assert_eq!(stats.total_flushed, 1);

        collector.record_metric(event("/b", 1.0, 200));
        assert_eq!(collector.stats().total_collected, 1);
        assert_eq!(collector.stats().buffered, 0);
        assert!(!collector.flush_on_shutdown());
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "metrics.csv");
        cfg.flush_interval_ms = 20;
        let collector = MetricCollector::new(cfg).unwrap();

        collector.record_metric(event("/a", 1.0, 200));
        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.stats().total_flushed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("periodic flush did not run");
    }

    #[tokio::test]
    async fn test_header_written_once_across_instances() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            let collector = MetricCollector::new(config(&dir, "shared.csv")).unwrap();
            collector.record_metric(event("/a", 1.0, 200));
            collector.dispose().await.unwrap();
        }
        let text = std::fs::read_to_string(dir.path().join("shared.csv")).unwrap();
        assert_eq!(text.matches("timestamp,elapsed").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_and_not_rebuffered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), "not a directory").unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_cb = Arc::clone(&errors);
        let collector = MetricCollector::new(
            config(&dir, "blocker/metrics.csv").with_on_error(move |e| {
                assert!(matches!(e, CollectorError::Write { records: 2, .. }));
                errors_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        collector.record_metric(event("/a", 1.0, 200));
        collector.record_metric(event("/b", 1.0, 200));
        let err = collector.flush().await.unwrap_err();
        assert!(matches!(err, CollectorError::Write { .. }));

        let stats = collector.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.total_flushed, 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compact_schema() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "compact.csv");
        cfg.schema_compatible = false;
        let collector = MetricCollector::new(cfg).unwrap();
        collector.record_metric(event("/a", 5.0, 201));
        collector.dispose().await.unwrap();

        let text = std::fs::read_to_string(collector.output_path()).unwrap();
        assert_eq!(
            text,
            format!("{}\n1691234567890,5,\"/a\",201,true\n", crate::record::COMPACT_HEADER)
        );
    }

    #[test]
    fn test_integrity_hash_is_chained_and_deterministic() {
        let dir = TempDir::new().unwrap();
        let a = MetricCollector::new(config(&dir, "a.csv")).unwrap();
        let b = MetricCollector::new(config(&dir, "b.csv")).unwrap();
        assert_eq!(a.stats().integrity_hash, GENESIS_HASH);

        a.record_metric(event("/x", 10.0, 200));
        let after_one = a.stats().integrity_hash;
        assert_ne!(after_one, GENESIS_HASH);
        assert_eq!(after_one.len(), 64);

        a.record_metric(event("/y", 20.0, 500));
        b.record_metric(event("/x", 10.0, 200));
        b.record_metric(event("/y", 20.0, 500));
        assert_eq!(a.stats().integrity_hash, b.stats().integrity_hash);
        assert_ne!(a.stats().integrity_hash, after_one);
    }

    #[test]
    fn test_output_path_must_stay_in_base_dir() {
        let dir = TempDir::new().unwrap();
        for bad in ["../escape.csv", "a/../../escape.csv", "/etc/metrics.csv", "."] {
            let err = MetricCollector::new(config(&dir, bad)).err().unwrap();
            assert!(matches!(err, CollectorError::Configuration(_)), "{bad}");
        }
        assert!(MetricCollector::new(config(&dir, "a/../ok.csv")).is_ok());
        assert!(MetricCollector::new(config(&dir, "")).is_err());
    }

    #[test]
    fn test_legacy_options_migrate() {
        let options = CollectorOptions::Legacy(LegacyCollectorConfig {
            output_file: PathBuf::from("legacy.csv"),
            buffer_size: Some(50),
            flush_interval: None,
            test_name: Some("legacy-suite".to_string()),
        });
        let config: CollectorConfig = options.into();
        assert_eq!(config.output_path, PathBuf::from("legacy.csv"));
        assert_eq!(config.buffer_size, 50);
        assert_eq!(config.flush_interval_ms, crate::defaults::FLUSH_INTERVAL_MS);
        assert_eq!(config.test_name, "legacy-suite");
        assert!(config.schema_compatible);
    }

    #[test]
    fn test_buffer_size_is_clamped() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "metrics.csv");
        cfg.buffer_size = 1_000_000;
        let collector = MetricCollector::new(cfg).unwrap();
        assert_eq!(collector.inner.buffer_size, crate::defaults::MAX_BUFFER_SIZE);
    }
}
