//! Request orchestration: safety gate, retrieval, generation, assembly, metrics.
//!
//! Retrieval and generation are blocking calls and run on the blocking pool,
//! strictly one after the other. Every stage outcome is an explicit
//! [`StageOutcome`]; the orchestrator folds them into a single
//! [`AnswerRecord`] and never surfaces a failure to the caller.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SafetyPrecedence;
use crate::error::{Stage, StageError};
use crate::generation::GenerationClient;
use crate::metrics::{MetricsAggregator, QueryLogEntry};
use crate::retrieval::RetrievalClient;
use crate::safety::SafetyGate;
use crate::types::{AnswerRecord, GenerationResult, RetrievedChunk, StageTimings};

/// Answer returned when the pipeline is not configured or retrieval is unreachable.
pub const DEGRADED_ANSWER: &str = "System is initializing. Please try again in a moment.";
/// Answer returned when a stage failed after being reached.
pub const ERROR_ANSWER: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";

/// Result of one offloaded stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    Unavailable(String),
    Failed(String),
}

impl<T> StageOutcome<T> {
    fn from_join(
        stage: Stage,
        joined: Result<Result<T, StageError>, tokio::task::JoinError>,
    ) -> Self {
        match joined {
            Ok(Ok(value)) => StageOutcome::Ok(value),
            Ok(Err(StageError::Unavailable { message, .. })) => StageOutcome::Unavailable(message),
            Ok(Err(StageError::Failed { message, .. })) => StageOutcome::Failed(message),
            Err(e) if e.is_panic() => StageOutcome::Failed(format!("{stage} stage panicked")),
            Err(e) => StageOutcome::Failed(format!("{stage} stage was cancelled: {e}")),
        }
    }
}

/// The retrieval and generation backends, present only together.
#[derive(Clone)]
pub struct Pipeline {
    pub retrieval: Arc<dyn RetrievalClient>,
    pub generation: Arc<dyn GenerationClient>,
}

impl Pipeline {
    pub fn new(retrieval: Arc<dyn RetrievalClient>, generation: Arc<dyn GenerationClient>) -> Self {
        Self {
            retrieval,
            generation,
        }
    }
}

/// Which branch produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Generated,
    Degraded,
    Errored,
}

impl Branch {
    fn as_str(self) -> &'static str {
        match self {
            Branch::Generated => "generated",
            Branch::Degraded => "degraded",
            Branch::Errored => "errored",
        }
    }
}

/// Sequences the answer pipeline for one query at a time.
#[derive(Clone)]
pub struct RequestOrchestrator {
    safety: SafetyGate,
    pipeline: Option<Pipeline>,
    metrics: Arc<MetricsAggregator>,
    precedence: SafetyPrecedence,
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("safety", &self.safety)
            .field("pipeline", &self.pipeline.is_some())
            .field("precedence", &self.precedence)
            .finish()
    }
}

impl RequestOrchestrator {
    pub fn new(
        safety: SafetyGate,
        pipeline: Option<Pipeline>,
        metrics: Arc<MetricsAggregator>,
        precedence: SafetyPrecedence,
    ) -> Self {
        Self {
            safety,
            pipeline,
            metrics,
            precedence,
        }
    }

    /// True when retrieval and generation backends are installed.
    pub fn is_available(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn safety_loaded(&self) -> bool {
        self.safety.is_loaded()
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Answer a validated query. `k` must already be in range.
    ///
    /// Always returns a record and always records it in the metrics sink.
    pub async fn answer(
        &self,
        query: &str,
        brand: Option<&str>,
        model: Option<&str>,
        k: usize,
    ) -> AnswerRecord {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        let safety_started = Instant::now();
        let gate = self.safety.assess(query);
        timings.safety = safety_started.elapsed().as_secs_f64();

        let (branch, answer, safety, sources, confidence) = match &self.pipeline {
            None => {
                tracing::debug!("Pipeline not configured, returning degraded answer");
                (Branch::Degraded, DEGRADED_ANSWER.to_string(), gate, Vec::new(), 0.0)
            }
            Some(pipeline) => {
                match self
                    .run_pipeline(pipeline, query, brand, model, k, &mut timings)
                    .await
                {
                    StageOutcome::Ok(generated) => (
                        Branch::Generated,
                        generated.answer,
                        self.precedence.resolve(gate, generated.safety),
                        generated.sources,
                        generated.confidence_score,
                    ),
                    StageOutcome::Unavailable(reason) => {
                        tracing::warn!(
                            reason = %reason,
                            "Retrieval unavailable, returning degraded answer"
                        );
                        (Branch::Degraded, DEGRADED_ANSWER.to_string(), gate, Vec::new(), 0.0)
                    }
                    StageOutcome::Failed(reason) => {
                        tracing::error!(reason = %reason, "Pipeline stage failed");
                        (
                            Branch::Errored,
                            ERROR_ANSWER.to_string(),
                            self.precedence.on_error(gate),
                            Vec::new(),
                            0.0,
                        )
                    }
                }
            }
        };

        let record = AnswerRecord::assemble(
            answer,
            safety,
            sources,
            k,
            confidence,
            started.elapsed().as_secs_f64(),
            timings,
        );

        tracing::debug!(
            branch = branch.as_str(),
            safety_level = %record.safety_level,
            chunks_used = record.chunks_used,
            processing_time = record.processing_time,
            "Answer assembled"
        );

        self.metrics.record(QueryLogEntry {
            timestamp: Utc::now(),
            query: query.to_string(),
            response_time: record.processing_time,
            search_time: record.search_time,
            llm_time: record.llm_time,
            safety_flag: record.safety_flag,
        });
        record
    }

    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        query: &str,
        brand: Option<&str>,
        model: Option<&str>,
        k: usize,
        timings: &mut StageTimings,
    ) -> StageOutcome<GenerationResult> {
        let search_started = Instant::now();
        let retrieval = Arc::clone(&pipeline.retrieval);
        let owned_query = query.to_string();
        let joined =
            tokio::task::spawn_blocking(move || retrieval.search(&owned_query, k)).await;
        timings.search = search_started.elapsed().as_secs_f64();

        let chunks: Vec<RetrievedChunk> = match StageOutcome::from_join(Stage::Retrieval, joined) {
            StageOutcome::Ok(chunks) => chunks,
            StageOutcome::Unavailable(reason) => return StageOutcome::Unavailable(reason),
            StageOutcome::Failed(reason) => return StageOutcome::Failed(reason),
        };

        let generation_started = Instant::now();
        let generation = Arc::clone(&pipeline.generation);
        let owned_query = query.to_string();
        let owned_brand = brand.map(String::from);
        let owned_model = model.map(String::from);
        let joined = tokio::task::spawn_blocking(move || {
            generation.generate(
                &owned_query,
                &chunks,
                owned_brand.as_deref(),
                owned_model.as_deref(),
            )
        })
        .await;
        timings.generation = generation_started.elapsed().as_secs_f64();

        // Once retrieval has answered the stack is up; any generation error
        // takes the error fallback.
        match StageOutcome::from_join(Stage::Generation, joined) {
            StageOutcome::Unavailable(reason) => StageOutcome::Failed(reason),
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SafetyAssessment, SeverityLevel, SourceCitation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRetrieval {
        chunks: Vec<RetrievedChunk>,
        calls: AtomicUsize,
    }

    impl RetrievalClient for FixedRetrieval {
        fn search(&self, _query: &str, k: usize) -> Result<Vec<RetrievedChunk>, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.chunks.iter().take(k).cloned().collect())
        }
    }

    struct DownRetrieval;

    impl RetrievalClient for DownRetrieval {
        fn search(&self, _query: &str, _k: usize) -> Result<Vec<RetrievedChunk>, StageError> {
            Err(StageError::unavailable(Stage::Retrieval, "connection refused"))
        }
    }

    struct EchoGeneration {
        level: SeverityLevel,
    }

    impl GenerationClient for EchoGeneration {
        fn generate(
            &self,
            query: &str,
            chunks: &[RetrievedChunk],
            _brand: Option<&str>,
            _model: Option<&str>,
        ) -> Result<GenerationResult, StageError> {
            Ok(GenerationResult {
                answer: format!("About '{query}'"),
                confidence_score: 0.9,
                sources: chunks.iter().map(SourceCitation::from).collect(),
                safety: SafetyAssessment::new(self.level, None),
            })
        }
    }

    struct BrokenGeneration;

    impl GenerationClient for BrokenGeneration {
        fn generate(
            &self,
            _query: &str,
            _chunks: &[RetrievedChunk],
            _brand: Option<&str>,
            _model: Option<&str>,
        ) -> Result<GenerationResult, StageError> {
            Err(StageError::failed(Stage::Generation, "model crashed"))
        }
    }

    struct OverloadedGeneration;

    impl GenerationClient for OverloadedGeneration {
        fn generate(
            &self,
            _query: &str,
            _chunks: &[RetrievedChunk],
            _brand: Option<&str>,
            _model: Option<&str>,
        ) -> Result<GenerationResult, StageError> {
            Err(StageError::unavailable(Stage::Generation, "model is not loaded"))
        }
    }

    struct PanickingGeneration;

    impl GenerationClient for PanickingGeneration {
        fn generate(
            &self,
            _query: &str,
            _chunks: &[RetrievedChunk],
            _brand: Option<&str>,
            _model: Option<&str>,
        ) -> Result<GenerationResult, StageError> {
            panic!("tokenizer exploded")
        }
    }

    fn chunks(n: usize) -> Vec<RetrievedChunk> {
        (0..n)
            .map(|i| RetrievedChunk {
                text: format!("passage {i}"),
                filename: format!("manual{i}.pdf"),
                page: Some(i as u32 + 1),
                brand: None,
                model: None,
                relevance_score: 0.9 - i as f64 * 0.01,
            })
            .collect()
    }

    fn orchestrator(
        retrieval: Arc<dyn RetrievalClient>,
        generation: Arc<dyn GenerationClient>,
        precedence: SafetyPrecedence,
    ) -> RequestOrchestrator {
        RequestOrchestrator::new(
            SafetyGate::keyword(),
            Some(Pipeline::new(retrieval, generation)),
            Arc::new(MetricsAggregator::in_memory(1000)),
            precedence,
        )
    }

    #[tokio::test]
    async fn test_generated_answer() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(12),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoGeneration {
                level: SeverityLevel::Safe,
            }),
            SafetyPrecedence::Generation,
        );
        let record = orch.answer("How to clean lint filter?", None, None, 5).await;
        assert_eq!(record.answer, "About 'How to clean lint filter?'");
        assert_eq!(record.chunks_used, 5);
        assert_eq!(record.sources.len(), 5);
        assert!(!record.safety_flag);
        assert_eq!(record.confidence_score, 0.9);
        assert!(record.processing_time >= record.search_time);
        assert_eq!(orch.metrics().snapshot().unwrap().total_queries, 1);
    }

    #[tokio::test]
    async fn test_generation_safety_is_authoritative() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(3),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoGeneration {
                level: SeverityLevel::Caution,
            }),
            SafetyPrecedence::Generation,
        );
        let record = orch.answer("I smell gas from the oven", None, None, 10).await;
        assert_eq!(record.safety_level, SeverityLevel::Caution);
        assert!(record.safety_flag);
    }

    #[tokio::test]
    async fn test_most_severe_precedence() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(3),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoGeneration {
                level: SeverityLevel::Safe,
            }),
            SafetyPrecedence::MostSevere,
        );
        let record = orch.answer("I smell gas from the oven", None, None, 10).await;
        assert_eq!(record.safety_level, SeverityLevel::Emergency);
        assert!(record.safety_message.is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_pipeline_is_degraded() {
        let orch = RequestOrchestrator::new(
            SafetyGate::keyword(),
            None,
            Arc::new(MetricsAggregator::in_memory(1000)),
            SafetyPrecedence::Generation,
        );
        assert!(!orch.is_available());
        let record = orch.answer("My microwave is sparking", None, None, 10).await;
        assert_eq!(record.answer, DEGRADED_ANSWER);
        assert_eq!(record.safety_level, SeverityLevel::Danger);
        assert!(record.safety_flag);
        assert!(record.sources.is_empty());
        assert_eq!(record.confidence_score, 0.0);
        assert_eq!(orch.metrics().safety_alerts(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_retrieval_is_degraded() {
        let orch = orchestrator(
            Arc::new(DownRetrieval),
            Arc::new(EchoGeneration {
                level: SeverityLevel::Safe,
            }),
            SafetyPrecedence::Generation,
        );
        let record = orch.answer("Refrigerator making loud noise", None, None, 10).await;
        assert_eq!(record.answer, DEGRADED_ANSWER);
        assert_eq!(record.llm_time, 0.0);
        assert_eq!(orch.metrics().snapshot().unwrap().total_queries, 1);
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(3),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(BrokenGeneration),
            SafetyPrecedence::Generation,
        );
        let record = orch.answer("I smell gas from the oven", None, None, 10).await;
        assert_eq!(record.answer, ERROR_ANSWER);
        assert_eq!(record.confidence_score, 0.0);
        assert!(!record.safety_flag);
        assert_eq!(record.safety_level, SeverityLevel::Safe);
        assert_eq!(orch.metrics().snapshot().unwrap().total_queries, 1);
    }

    #[tokio::test]
    async fn test_unavailable_generation_after_retrieval_is_error() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(1),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(OverloadedGeneration),
            SafetyPrecedence::Generation,
        );
        let record = orch.answer("I smell gas from the oven", None, None, 10).await;
        assert_eq!(record.answer, ERROR_ANSWER);
        assert_eq!(record.confidence_score, 0.0);
        assert!(!record.safety_flag);
        assert!(record.sources.is_empty());
    }

    #[tokio::test]
    async fn test_generation_panic_falls_back() {
        let orch = orchestrator(
            Arc::new(FixedRetrieval {
                chunks: chunks(3),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(PanickingGeneration),
            SafetyPrecedence::MostSevere,
        );
        let record = orch.answer("My microwave is sparking", None, None, 10).await;
        assert_eq!(record.answer, ERROR_ANSWER);
        assert_eq!(record.safety_level, SeverityLevel::Danger);
    }

    #[tokio::test]
    async fn test_retrieval_runs_once_per_request() {
        let retrieval = Arc::new(FixedRetrieval {
            chunks: chunks(2),
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator(
            retrieval.clone(),
            Arc::new(EchoGeneration {
                level: SeverityLevel::Safe,
            }),
            SafetyPrecedence::Generation,
        );
        orch.answer("a", None, None, 10).await;
        orch.answer("b", None, None, 10).await;
        assert_eq!(retrieval.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.metrics().recent().len(), 2);
    }
}
