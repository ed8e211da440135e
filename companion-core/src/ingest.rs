//! Manual ingestion queue: stage uploaded PDFs and hand them to the indexer.
//!
//! Uploads are written to a staging directory and queued on a bounded
//! channel. A single worker drains the queue, calls the configured
//! [`DocumentIngestor`], and records the outcome on the job so callers can
//! poll it. Staged files are removed once processed, whatever the outcome.
//! Only the newest `max_retained_jobs` finished jobs stay pollable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::IngestError;

/// Lifecycle of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestStatus::Pending => write!(f, "pending"),
            IngestStatus::Running => write!(f, "running"),
            IngestStatus::Completed => write!(f, "completed"),
            IngestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One queued upload and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub job_id: Uuid,
    pub filename: String,
    pub status: IngestStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub chunks_processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestJob {
    fn new(filename: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            filename: filename.into(),
            status: IngestStatus::Pending,
            submitted_at: Utc::now(),
            completed_at: None,
            chunks_processed: 0,
            error: None,
        }
    }

    fn start(&mut self) {
        self.status = IngestStatus::Running;
    }

    fn complete(&mut self, chunks: usize) {
        self.status = IngestStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.chunks_processed = chunks;
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = IngestStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, IngestStatus::Completed | IngestStatus::Failed)
    }
}

/// Indexes a staged document and reports how many chunks it produced.
#[async_trait]
pub trait DocumentIngestor: Send + Sync {
    async fn ingest(&self, path: &Path, filename: &str) -> Result<usize, IngestError>;
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    #[serde(default)]
    chunks_processed: usize,
}

/// Uploads staged files to a remote indexer as `multipart/form-data`.
pub struct HttpIngestor {
    client: reqwest::Client,
    url: String,
}

impl HttpIngestor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::BackendFailed {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DocumentIngestor for HttpIngestor {
    async fn ingest(&self, path: &Path, filename: &str) -> Result<usize, IngestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| IngestError::StagingFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .map_err(|e| IngestError::BackendFailed {
                message: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| IngestError::BackendFailed {
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::BackendFailed {
                message: format!("indexer returned HTTP {status}"),
            });
        }
        let body: IngestResponse = response.json().await.map_err(|e| IngestError::BackendFailed {
            message: format!("bad indexer body: {e}"),
        })?;
        Ok(body.chunks_processed)
    }
}

/// Only names ending in `.pdf` are accepted.
pub fn is_pdf(filename: &str) -> bool {
    filename.ends_with(".pdf")
}

/// Strip any directory components a client may have sent.
fn sanitize_filename(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim()
        .to_string()
}

struct QueuedUpload {
    job_id: Uuid,
    path: PathBuf,
    filename: String,
}

type JobTable = Arc<RwLock<HashMap<Uuid, IngestJob>>>;

/// Handle for submitting uploads and polling their status.
#[derive(Clone)]
pub struct IngestQueue {
    jobs: JobTable,
    sender: mpsc::Sender<QueuedUpload>,
    staging_dir: PathBuf,
}

impl IngestQueue {
    /// Start the worker and return the queue handle.
    ///
    /// Without an ingestor every job still runs to a terminal state and is
    /// marked failed.
    pub fn spawn(
        config: &IngestConfig,
        ingestor: Option<Arc<dyn DocumentIngestor>>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let jobs: JobTable = Arc::new(RwLock::new(HashMap::new()));
        let worker = tokio::spawn(run_worker(
            receiver,
            Arc::clone(&jobs),
            ingestor,
            config.max_retained_jobs.max(1),
        ));
        let queue = Self {
            jobs,
            sender,
            staging_dir: config.staging_dir.clone(),
        };
        (queue, worker)
    }

    /// Validate, stage and enqueue an upload.
    pub async fn submit(&self, filename: &str, bytes: &[u8]) -> Result<IngestJob, IngestError> {
        let filename = sanitize_filename(filename);
        if !is_pdf(&filename) {
            return Err(IngestError::UnsupportedFileType { filename });
        }

        let job = IngestJob::new(&filename);
        let path = self.staging_dir.join(format!("{}_{}", job.job_id, filename));
        let staging_error = |e: std::io::Error| IngestError::StagingFailed {
            path: path.clone(),
            message: e.to_string(),
        };
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(staging_error)?;
        tokio::fs::write(&path, bytes).await.map_err(staging_error)?;

        self.jobs.write().await.insert(job.job_id, job.clone());
        let queued = QueuedUpload {
            job_id: job.job_id,
            path: path.clone(),
            filename,
        };
        if self.sender.send(queued).await.is_err() {
            self.jobs.write().await.remove(&job.job_id);
            remove_staged(&path).await;
            return Err(IngestError::QueueClosed);
        }

        tracing::info!(
            job_id = %job.job_id,
            filename = %job.filename,
            bytes = bytes.len(),
            "Upload queued"
        );
        Ok(job)
    }

    /// Current state of a job, if it exists.
    pub async fn status(&self, job_id: &Uuid) -> Option<IngestJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// All known jobs, oldest first.
    pub async fn list(&self) -> Vec<IngestJob> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<QueuedUpload>,
    jobs: JobTable,
    ingestor: Option<Arc<dyn DocumentIngestor>>,
    max_retained: usize,
) {
    while let Some(upload) = receiver.recv().await {
        if let Some(job) = jobs.write().await.get_mut(&upload.job_id) {
            job.start();
        }

        let outcome = match &ingestor {
            Some(ingestor) => ingestor.ingest(&upload.path, &upload.filename).await,
            None => Err(IngestError::NoBackend),
        };
        remove_staged(&upload.path).await;

        let mut table = jobs.write().await;
        if let Some(job) = table.get_mut(&upload.job_id) {
            match outcome {
                Ok(chunks) => {
                    tracing::info!(job_id = %upload.job_id, chunks, "Ingestion completed");
                    job.complete(chunks);
                }
                Err(e) => {
                    tracing::error!(job_id = %upload.job_id, error = %e, "Ingestion failed");
                    job.fail(e.to_string());
                }
            }
        }
        evict_finished(&mut table, max_retained);
    }
    tracing::debug!("Ingestion queue closed");
}

/// Drop the oldest finished jobs until at most `max_retained` remain.
/// Pending and running jobs are never evicted.
fn evict_finished(jobs: &mut HashMap<Uuid, IngestJob>, max_retained: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|j| j.is_finished())
        .map(|j| (j.completed_at.unwrap_or(j.submitted_at), j.job_id))
        .collect();
    if finished.len() <= max_retained {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - max_retained;
    for (_, job_id) in finished.into_iter().take(excess) {
        jobs.remove(&job_id);
    }
    tracing::debug!(evicted = excess, "Evicted finished ingestion jobs");
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged upload");
    }
}
