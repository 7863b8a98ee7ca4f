//! Per-service log tailing, independent of the session event log.
//!
//! Live tails run a producer task that pushes runner output into a bounded
//! [`LogBuffer`]; the consumer drains it at its own pace and loses the oldest
//! lines when it falls behind. Recorders follow a service in the background
//! and persist every line to a [`ServiceLogStore`] for range reads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::errors::{OrchestratorError, StoreError};

use super::db::DbHandle;
use super::lifecycle::Lifecycle;
use super::models::LogEntry;
use super::registry::SessionRegistry;
use super::runner::{LogRequest, LogSource, WorkloadRunner};

pub const DEFAULT_MAX_LINES: usize = 100;
pub const MAX_LINES_CAP: usize = 10_000;

// ── Buffer ───────────────────────────────────────────────────────────

/// Circular line buffer. Pushing onto a full buffer evicts the oldest line.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
        self.lines.push_back(line);
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

// ── Durable store ────────────────────────────────────────────────────

/// Resolve an inclusive `[start, end]` range over `len` items. Negative
/// indexes count from the end (`-1` is the newest). `None` when empty.
pub fn resolve_range(len: u64, start: i64, end: i64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let end = if end < 0 { len_i + end } else { end.min(len_i - 1) };
    if start > end || start >= len_i || end < 0 {
        return None;
    }
    Some((start as u64, end as u64))
}

#[async_trait]
pub trait ServiceLogStore: Send + Sync {
    /// Append a line and return its index.
    async fn append(&self, deployment: &str, service: &str, line: &str)
    -> Result<u64, StoreError>;

    /// Inclusive range read, see [`resolve_range`].
    async fn range(
        &self,
        deployment: &str,
        service: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// The newest `n` lines, oldest first.
    async fn last(
        &self,
        deployment: &str,
        service: &str,
        n: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = i64::try_from(n).map(|n| -n).unwrap_or(-i64::MAX);
        self.range(deployment, service, start, -1).await
    }

    async fn delete_deployment(&self, deployment: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryServiceLogStore {
    streams: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl MemoryServiceLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceLogStore for MemoryServiceLogStore {
    async fn append(
        &self,
        deployment: &str,
        service: &str,
        line: &str,
    ) -> Result<u64, StoreError> {
        let mut streams = self.streams.lock().map_err(|_| StoreError::LockPoisoned)?;
        let stream = streams
            .entry((deployment.to_string(), service.to_string()))
            .or_default();
        stream.push(line.to_string());
        Ok(stream.len() as u64 - 1)
    }

    async fn range(
        &self,
        deployment: &str,
        service: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let streams = self.streams.lock().map_err(|_| StoreError::LockPoisoned)?;
        let Some(stream) = streams.get(&(deployment.to_string(), service.to_string())) else {
            return Ok(Vec::new());
        };
        let Some((first, last)) = resolve_range(stream.len() as u64, start, end) else {
            return Ok(Vec::new());
        };
        Ok((first..=last)
            .map(|index| LogEntry {
                index,
                line: stream[index as usize].clone(),
            })
            .collect())
    }

    async fn delete_deployment(&self, deployment: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.lock().map_err(|_| StoreError::LockPoisoned)?;
        streams.retain(|(d, _), _| d != deployment);
        Ok(())
    }
}

/// Service logs in the `service_logs` table.
pub struct SqliteServiceLogStore {
    db: DbHandle,
}

impl SqliteServiceLogStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ServiceLogStore for SqliteServiceLogStore {
    async fn append(
        &self,
        deployment: &str,
        service: &str,
        line: &str,
    ) -> Result<u64, StoreError> {
        let (deployment, service, line) =
            (deployment.to_string(), service.to_string(), line.to_string());
        self.db
            .call(move |db| db.append_log_line(&deployment, &service, &line))
            .await
            .map_err(StoreError::Database)
    }

    async fn range(
        &self,
        deployment: &str,
        service: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let (deployment, service) = (deployment.to_string(), service.to_string());
        self.db
            .call(move |db| {
                let len = db.count_log_lines(&deployment, &service)?;
                match resolve_range(len, start, end) {
                    Some((first, last)) => db.read_log_lines(&deployment, &service, first, last),
                    None => Ok(Vec::new()),
                }
            })
            .await
            .map_err(StoreError::Database)
    }

    async fn delete_deployment(&self, deployment: &str) -> Result<(), StoreError> {
        let deployment = deployment.to_string();
        self.db
            .call(move |db| db.delete_log_lines(&deployment))
            .await
            .map(|_| ())
            .map_err(StoreError::Database)
    }
}

// ── Live tails ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TailOptions {
    pub follow: bool,
    /// Ask the runner for the current container's output only.
    pub most_recent_only: bool,
    /// `None` uses the configured default.
    pub max_lines: Option<usize>,
    pub filter: Option<String>,
}

struct TailShared {
    buffer: Mutex<LogBuffer>,
    notify: Notify,
    done: AtomicBool,
    not_found: AtomicBool,
}

/// Consumer side of a live tail. Dropping it stops the producer.
pub struct LogTail {
    shared: Arc<TailShared>,
    follow: bool,
    token: CancellationToken,
    _guard: DropGuard,
}

impl LogTail {
    /// Next chunk of lines, oldest first. `None` once the tail is over.
    ///
    /// Without `follow`, lines are held back until the source is exhausted
    /// so the result is the newest `max_lines`.
    pub async fn next_batch(&mut self) -> Option<Vec<String>> {
        loop {
            {
                let mut buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
                let done = self.shared.done.load(Ordering::Acquire);
                if (self.follow || done) && !buffer.is_empty() {
                    return Some(buffer.drain());
                }
                if done {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// The runner reported the service does not exist.
    pub fn not_found(&self) -> bool {
        self.shared.not_found.load(Ordering::Acquire)
    }

    /// Lines lost because the consumer fell behind.
    pub fn evicted(&self) -> u64 {
        self.shared
            .buffer
            .lock()
            .map(|buffer| buffer.evicted())
            .unwrap_or(0)
    }

    /// Token that ends this tail when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Clone)]
pub struct LogTailer {
    runner: Arc<dyn WorkloadRunner>,
    store: Arc<dyn ServiceLogStore>,
    registry: Arc<SessionRegistry>,
    lifecycle: Lifecycle,
    recorders: Arc<Mutex<HashSet<(String, String)>>>,
    tracker: TaskTracker,
    default_max_lines: usize,
    max_lines_cap: usize,
}

impl LogTailer {
    pub fn new(
        runner: Arc<dyn WorkloadRunner>,
        store: Arc<dyn ServiceLogStore>,
        registry: Arc<SessionRegistry>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            runner,
            store,
            registry,
            lifecycle,
            recorders: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            default_max_lines: DEFAULT_MAX_LINES,
            max_lines_cap: MAX_LINES_CAP,
        }
    }

    pub fn with_limits(mut self, default_max_lines: usize, max_lines_cap: usize) -> Self {
        self.max_lines_cap = max_lines_cap.max(1);
        self.default_max_lines = default_max_lines.clamp(1, self.max_lines_cap);
        self
    }

    pub fn store(&self) -> &Arc<dyn ServiceLogStore> {
        &self.store
    }

    /// Requested line count capped at `max_lines_cap`. Zero is rejected.
    pub fn effective_max_lines(
        &self,
        requested: Option<usize>,
    ) -> Result<usize, OrchestratorError> {
        match requested {
            Some(0) => Err(OrchestratorError::BadRequest(
                "max_lines must be at least 1".to_string(),
            )),
            Some(n) => Ok(n.min(self.max_lines_cap)),
            None => Ok(self.default_max_lines),
        }
    }

    pub async fn tail(
        &self,
        deployment: &str,
        service: &str,
        options: TailOptions,
    ) -> Result<LogTail, OrchestratorError> {
        let max_lines = self.effective_max_lines(options.max_lines)?;
        self.lifecycle.require_live(deployment).await?;
        let request = LogRequest {
            service: service.to_string(),
            follow: options.follow,
            most_recent_only: options.most_recent_only,
            max_lines,
            filter: options.filter,
        };
        let source = self.runner.service_logs(deployment, &request).await?;

        let shared = Arc::new(TailShared {
            buffer: Mutex::new(LogBuffer::new(max_lines)),
            notify: Notify::new(),
            done: AtomicBool::new(false),
            not_found: AtomicBool::new(false),
        });
        let token = self.registry.child_token(deployment);
        self.tracker.spawn(produce(
            deployment.to_string(),
            service.to_string(),
            source,
            Arc::clone(&shared),
            token.clone(),
        ));
        tracing::debug!(deployment = %deployment, service = %service, follow = options.follow, max_lines, "log tail started");

        Ok(LogTail {
            shared,
            follow: options.follow,
            _guard: token.clone().drop_guard(),
            token,
        })
    }

    /// Follow a service in the background and persist every line.
    /// Returns false if a recorder for the service is already running.
    pub async fn record(&self, deployment: &str, service: &str) -> Result<bool, OrchestratorError> {
        self.lifecycle.require_live(deployment).await?;
        let key = (deployment.to_string(), service.to_string());
        {
            let mut recorders = self
                .recorders
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?;
            if !recorders.insert(key.clone()) {
                return Ok(false);
            }
        }

        let request = LogRequest {
            service: service.to_string(),
            follow: true,
            most_recent_only: false,
            max_lines: self.max_lines_cap,
            filter: None,
        };
        let source = match self.runner.service_logs(deployment, &request).await {
            Ok(source) => source,
            Err(e) => {
                if let Ok(mut recorders) = self.recorders.lock() {
                    recorders.remove(&key);
                }
                return Err(e.into());
            }
        };

        let token = self.registry.child_token(deployment);
        let store = Arc::clone(&self.store);
        let recorders = Arc::clone(&self.recorders);
        self.tracker.spawn(async move {
            persist(&key.0, &key.1, source, store, token).await;
            if let Ok(mut recorders) = recorders.lock() {
                recorders.remove(&key);
            }
        });
        tracing::info!(deployment = %deployment, service = %service, "log recorder started");
        Ok(true)
    }

    pub fn is_recording(&self, deployment: &str, service: &str) -> bool {
        self.recorders
            .lock()
            .map(|r| r.contains(&(deployment.to_string(), service.to_string())))
            .unwrap_or(false)
    }

    /// Wait for every tail and recorder task. Callers cancel them first.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn produce(
    deployment: String,
    service: String,
    mut source: LogSource,
    shared: Arc<TailShared>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            batch = source.next() => batch,
        };
        match batch {
            Some(Ok(batch)) if batch.not_found => {
                tracing::debug!(deployment = %deployment, service = %service, "service not found");
                shared.not_found.store(true, Ordering::Release);
                break;
            }
            Some(Ok(batch)) => {
                if batch.lines.is_empty() {
                    continue;
                }
                {
                    let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
                    for line in batch.lines {
                        buffer.push(line);
                    }
                }
                shared.notify.notify_one();
            }
            Some(Err(e)) => {
                tracing::warn!(deployment = %deployment, service = %service, error = %e, "log stream failed");
                break;
            }
            None => break,
        }
    }
    shared.done.store(true, Ordering::Release);
    shared.notify.notify_one();
}

async fn persist(
    deployment: &str,
    service: &str,
    mut source: LogSource,
    store: Arc<dyn ServiceLogStore>,
    token: CancellationToken,
) {
    let mut written = 0u64;
    loop {
        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            batch = source.next() => batch,
        };
        match batch {
            Some(Ok(batch)) if batch.not_found => {
                tracing::warn!(deployment = %deployment, service = %service, "cannot record logs, service not found");
                break;
            }
            Some(Ok(batch)) => {
                for line in &batch.lines {
                    match store.append(deployment, service, line).await {
                        Ok(_) => written += 1,
                        Err(e) => {
                            tracing::error!(deployment = %deployment, service = %service, error = %e, "failed to store log line");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(deployment = %deployment, service = %service, error = %e, "log stream failed");
                break;
            }
            None => break,
        }
    }
    tracing::info!(deployment = %deployment, service = %service, lines = written, "log recorder stopped");
}
