//! User feedback log: thumbs up/down on answers, appended as JSONL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::CompanionError;
use crate::persistence::{append_jsonl, load_jsonl};

/// Number of entries returned in a summary.
const RECENT_LIMIT: usize = 5;

/// One piece of feedback on an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response: String,
    pub helpful: bool,
}

impl FeedbackEntry {
    pub fn new(query: impl Into<String>, response: impl Into<String>, helpful: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            query: query.into(),
            response: response.into(),
            helpful,
        }
    }
}

/// Aggregate view of the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub total: usize,
    pub helpful: usize,
    /// Helpful fraction in `[0, 1]`; zero when there is no feedback.
    pub satisfaction_rate: f64,
    /// Most recent entries, newest first.
    pub recent: Vec<FeedbackEntry>,
}

/// Append-only feedback store.
pub struct FeedbackLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FeedbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &FeedbackEntry) -> Result<(), CompanionError> {
        let _guard = self.write_lock.lock().await;
        append_jsonl(&self.path, entry)?;
        tracing::debug!(helpful = entry.helpful, "Feedback recorded");
        Ok(())
    }

    pub async fn summary(&self) -> Result<FeedbackSummary, CompanionError> {
        let entries: Vec<FeedbackEntry> = {
            let _guard = self.write_lock.lock().await;
            load_jsonl(&self.path)?
        };
        let total = entries.len();
        let helpful = entries.iter().filter(|e| e.helpful).count();
        let satisfaction_rate = if total == 0 {
            0.0
        } else {
            helpful as f64 / total as f64
        };
        let recent = entries.into_iter().rev().take(RECENT_LIMIT).collect();
        Ok(FeedbackSummary {
            total,
            helpful,
            satisfaction_rate,
            recent,
        })
    }
}
