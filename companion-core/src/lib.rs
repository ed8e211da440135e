//! # CompanionAI Core
//!
//! Safety-first appliance troubleshooting pipeline.
//! Provides the safety gate, retrieval and generation clients, the request
//! orchestrator, live metrics, the evaluation harness, manual ingestion,
//! configuration, and the HTTP gateway.

mod blocking;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod feedback;
pub mod gateway;
pub mod generation;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod retrieval;
pub mod safety;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{CompanionConfig, SafetyPrecedence, load_config};
pub use context::{AppContext, build_orchestrator};
pub use error::{CompanionError, Result, Stage, StageError};
pub use evaluation::{
    AnswerBackend, EvaluationHarness, EvaluationMetrics, EvaluationQuery, EvaluationRun,
    HttpAnswerBackend, InProcessBackend, standard_queries,
};
pub use generation::{ExtractiveGenerator, GenerationClient, HttpGenerationClient};
pub use metrics::{MetricsAggregator, MetricsSnapshot, QueryLogEntry};
pub use orchestrator::{DEGRADED_ANSWER, ERROR_ANSWER, Pipeline, RequestOrchestrator};
pub use retrieval::{CorpusRetriever, HttpRetrievalClient, RetrievalClient};
pub use safety::{KeywordSafetyClassifier, SafetyClassifier, SafetyGate};
pub use types::{
    AnswerRecord, AnswerRequest, GenerationResult, RetrievedChunk, SafetyAssessment,
    SeverityLevel, SourceCitation,
};
