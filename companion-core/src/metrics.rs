//! Request metrics: a bounded window of served requests plus lifetime counters.
//!
//! Every completed request is recorded exactly once, degraded and error
//! responses included. Writers are serialized behind a lock so FIFO eviction
//! order and the alert count stay exact; snapshots may observe a slightly
//! stale window. Audit lines are handed to a background writer thread, so
//! recording never touches the filesystem on the caller's thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::MetricsConfig;
use crate::error::MetricsError;

/// One served request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response_time: f64,
    pub search_time: f64,
    pub llm_time: f64,
    pub safety_flag: bool,
}

/// Audit log line. The query text itself is not written to disk.
#[derive(Debug, Serialize)]
struct AuditRecord {
    timestamp: DateTime<Utc>,
    query_length: usize,
    response_time: f64,
    search_time: f64,
    llm_time: f64,
    safety_flag: bool,
}

impl From<&QueryLogEntry> for AuditRecord {
    fn from(entry: &QueryLogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            query_length: entry.query.chars().count(),
            response_time: entry.response_time,
            search_time: entry.search_time,
            llm_time: entry.llm_time,
            safety_flag: entry.safety_flag,
        }
    }
}

/// Append-only JSONL audit file fed through a non-blocking writer.
struct AuditLog {
    path: PathBuf,
    writer: NonBlocking,
    guard: Mutex<Option<WorkerGuard>>,
}

impl AuditLog {
    fn open(path: &Path) -> Result<Self, MetricsError> {
        let open_error = |message: String| MetricsError::AuditOpen {
            path: path.to_path_buf(),
            message,
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| open_error("path has no file name".into()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name.to_string_lossy())
            .build(dir)
            .map_err(|e| open_error(e.to_string()))?;
        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("companion-audit")
            .finish(appender);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            guard: Mutex::new(Some(guard)),
        })
    }

    fn write(&self, record: &AuditRecord) -> Result<(), MetricsError> {
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        line.push(b'\n');
        // One message per line keeps records whole.
        self.writer.clone().write_all(&line)?;
        Ok(())
    }

    /// Flush queued lines and stop the writer thread.
    fn close(&self) {
        let guard = match self.guard.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(guard);
    }
}

/// FIFO ring of recent entries and the lifetime alert counter.
#[derive(Debug)]
pub struct MetricsWindow {
    entries: VecDeque<QueryLogEntry>,
    capacity: usize,
    safety_alerts: u64,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            safety_alerts: 0,
        }
    }

    /// Append an entry, evicting the oldest once over capacity.
    pub fn push(&mut self, entry: QueryLogEntry) {
        if entry.safety_flag {
            self.safety_alerts += 1;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn safety_alerts(&self) -> u64 {
        self.safety_alerts
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueryLogEntry> {
        self.entries.iter()
    }

    fn mean(&self, field: impl Fn(&QueryLogEntry) -> f64) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(field).sum::<f64>() / self.entries.len() as f64
    }
}

/// Aggregates exposed by `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: usize,
    pub avg_response_time: f64,
    pub avg_search_time: f64,
    pub avg_llm_time: f64,
    pub safety_alerts_triggered: u64,
    /// Configured constant, not measured from live traffic.
    pub precision_at_5: f64,
}

impl MetricsSnapshot {
    fn empty() -> Self {
        Self {
            total_queries: 0,
            avg_response_time: 0.0,
            avg_search_time: 0.0,
            avg_llm_time: 0.0,
            safety_alerts_triggered: 0,
            precision_at_5: 0.0,
        }
    }
}

/// Shared metrics sink for the request path.
pub struct MetricsAggregator {
    window: RwLock<MetricsWindow>,
    audit_log: Option<AuditLog>,
    placeholder_precision: f64,
    started: Instant,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("audit_log", &self.audit_log.as_ref().map(|log| &log.path))
            .finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    /// An audit log that cannot be opened is reported and left disabled.
    pub fn new(config: &MetricsConfig) -> Self {
        let audit_log = config
            .audit_log_path
            .as_deref()
            .and_then(|path| match AuditLog::open(path) {
                Ok(log) => Some(log),
                Err(e) => {
                    tracing::warn!(error = %e, "Audit log disabled");
                    None
                }
            });
        Self {
            window: RwLock::new(MetricsWindow::new(config.window_size)),
            audit_log,
            placeholder_precision: config.placeholder_precision_at_5,
            started: Instant::now(),
        }
    }

    /// An aggregator with no audit log, for tests and in-process evaluation.
    pub fn in_memory(window_size: usize) -> Self {
        Self::new(&MetricsConfig {
            window_size,
            audit_log_path: None,
            ..MetricsConfig::default()
        })
    }

    /// Record one request. Never fails: audit log problems are logged and
    /// the in-memory window is still updated.
    pub fn record(&self, entry: QueryLogEntry) {
        let audit = AuditRecord::from(&entry);
        tracing::info!(
            target: "request_metrics",
            query_length = audit.query_length,
            response_time = audit.response_time,
            search_time = audit.search_time,
            llm_time = audit.llm_time,
            safety_flag = audit.safety_flag,
            "request served"
        );

        match self.window.write() {
            Ok(mut window) => window.push(entry),
            Err(poisoned) => {
                tracing::error!("Metrics window lock poisoned, recovering");
                poisoned.into_inner().push(entry);
            }
        }

        if let Some(log) = &self.audit_log {
            if let Err(e) = log.write(&audit) {
                tracing::warn!(path = %log.path.display(), error = %e, "Failed to append audit log");
            }
        }
    }

    pub fn has_audit_log(&self) -> bool {
        self.audit_log.is_some()
    }

    /// Flush pending audit lines to disk. Later records are no longer audited.
    pub fn close_audit(&self) {
        if let Some(log) = &self.audit_log {
            log.close();
        }
    }

    /// Means over the current window. An empty window reports zeros.
    pub fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError> {
        let window = self.window.read().map_err(|_| MetricsError::Poisoned)?;
        if window.is_empty() {
            return Ok(MetricsSnapshot {
                safety_alerts_triggered: window.safety_alerts(),
                ..MetricsSnapshot::empty()
            });
        }

        let snapshot = MetricsSnapshot {
            total_queries: window.len(),
            avg_response_time: window.mean(|e| e.response_time),
            avg_search_time: window.mean(|e| e.search_time),
            avg_llm_time: window.mean(|e| e.llm_time),
            safety_alerts_triggered: window.safety_alerts(),
            precision_at_5: self.placeholder_precision,
        };
        for (field, value) in [
            ("avg_response_time", snapshot.avg_response_time),
            ("avg_search_time", snapshot.avg_search_time),
            ("avg_llm_time", snapshot.avg_llm_time),
        ] {
            if !value.is_finite() {
                return Err(MetricsError::NonFinite { field });
            }
        }
        Ok(snapshot)
    }

    /// Lifetime alert count.
    pub fn safety_alerts(&self) -> u64 {
        match self.window.read() {
            Ok(window) => window.safety_alerts(),
            Err(poisoned) => poisoned.into_inner().safety_alerts(),
        }
    }

    /// Copy of the current window, oldest first.
    pub fn recent(&self) -> Vec<QueryLogEntry> {
        match self.window.read() {
            Ok(window) => window.entries().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().entries().cloned().collect(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
