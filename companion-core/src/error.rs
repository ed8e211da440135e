//! Error types for the CompanionAI core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering pipeline stages, validation, ingestion, metrics, evaluation,
//! and configuration.

use std::path::PathBuf;

/// Top-level error type for the CompanionAI core library.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pipeline stage whose failure is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Safety,
    Retrieval,
    Generation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Safety => write!(f, "safety"),
            Stage::Retrieval => write!(f, "retrieval"),
            Stage::Generation => write!(f, "generation"),
        }
    }
}

/// Failure of a retrieval or generation stage.
///
/// `Unavailable` means the backing service could not be reached at all.
/// From retrieval it steers the orchestrator onto the degraded path; from
/// generation it is treated like `Failed`. `Failed` means the service answered
/// but the stage could not complete, which yields the error fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("{stage} service unavailable: {message}")]
    Unavailable { stage: Stage, message: String },

    #[error("{stage} stage failed: {message}")]
    Failed { stage: Stage, message: String },
}

impl StageError {
    pub fn unavailable(stage: Stage, message: impl Into<String>) -> Self {
        Self::Unavailable {
            stage,
            message: message.into(),
        }
    }

    pub fn failed(stage: Stage, message: impl Into<String>) -> Self {
        Self::Failed {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageError::Unavailable { stage, .. } | StageError::Failed { stage, .. } => *stage,
        }
    }

    /// Classify a `reqwest` error: transport problems are `Unavailable`,
    /// everything else is `Failed`.
    pub fn from_http(stage: Stage, err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::unavailable(stage, err.to_string())
        } else {
            Self::failed(stage, err.to_string())
        }
    }
}

/// Errors raised by a safety classifier. The safety gate absorbs these.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("Classifier failed: {message}")]
    ClassifierFailed { message: String },

    #[error("Invalid safety rule '{pattern}': {message}")]
    InvalidRule { pattern: String, message: String },
}

/// Malformed answer requests, rejected before orchestration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("k must be between {min} and {max}, got {value}")]
    KOutOfRange { value: i64, min: usize, max: usize },
}

/// Errors from the upload and ingestion path.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Only PDF files are supported, got '{filename}'")]
    UnsupportedFileType { filename: String },

    #[error("Upload is missing a file field")]
    MissingFile,

    #[error("Failed to stage upload at {path}: {message}")]
    StagingFailed { path: PathBuf, message: String },

    #[error("Ingestion queue is closed")]
    QueueClosed,

    #[error("No ingestion backend is configured")]
    NoBackend,

    #[error("Ingestion backend failed: {message}")]
    BackendFailed { message: String },
}

/// Errors from metrics aggregation and the audit log.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics window lock poisoned")]
    Poisoned,

    #[error("Aggregate '{field}' is not finite")]
    NonFinite { field: &'static str },

    #[error("Failed to open audit log {path}: {message}")]
    AuditOpen { path: PathBuf, message: String },

    #[error("Audit log write failed: {0}")]
    AuditWrite(#[from] std::io::Error),
}

/// Errors from an evaluation run.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Pipeline unreachable: {message}")]
    PipelineUnreachable { message: String },

    #[error("Answer request failed: {message}")]
    RequestFailed { message: String },

    #[error("No queries could be scored")]
    NoScoredQueries,

    #[error("Failed to persist report to {path}: {message}")]
    ReportWrite { path: PathBuf, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Corpus file not found: {path}")]
    CorpusNotFound { path: PathBuf },

    #[error("Failed to load corpus {path}: {message}")]
    CorpusLoad { path: PathBuf, message: String },
}

/// Convenience type alias for results using `CompanionError`.
pub type Result<T> = std::result::Result<T, CompanionError>;
