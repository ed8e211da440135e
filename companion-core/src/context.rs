//! Application context: every shared handle, built once at startup.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CompanionConfig;
use crate::error::{CompanionError, ConfigError};
use crate::feedback::FeedbackLog;
use crate::generation::{ExtractiveGenerator, GenerationClient, HttpGenerationClient};
use crate::ingest::{DocumentIngestor, HttpIngestor, IngestQueue};
use crate::metrics::MetricsAggregator;
use crate::orchestrator::{Pipeline, RequestOrchestrator};
use crate::retrieval::{CorpusRetriever, HttpRetrievalClient, RetrievalClient};
use crate::safety::SafetyGate;

/// Shared state handed to the HTTP gateway and the CLI.
pub struct AppContext {
    pub config: CompanionConfig,
    pub orchestrator: RequestOrchestrator,
    pub metrics: Arc<MetricsAggregator>,
    pub ingest: IngestQueue,
    pub feedback: FeedbackLog,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("orchestrator", &self.orchestrator)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Build the context and start the ingestion worker.
    pub async fn build(config: CompanionConfig) -> Result<Self, CompanionError> {
        config.validate()?;
        let metrics = Arc::new(MetricsAggregator::new(&config.metrics));
        let orchestrator = build_orchestrator(&config, Arc::clone(&metrics))?;

        let ingestor: Option<Arc<dyn DocumentIngestor>> = match config.ingest_url() {
            Some(url) => Some(Arc::new(HttpIngestor::new(
                url,
                Duration::from_secs(config.ingest.timeout_secs),
            )?)),
            None => None,
        };
        let (ingest, _worker) = IngestQueue::spawn(&config.ingest, ingestor);
        let feedback = FeedbackLog::new(config.feedback.log_path.clone());

        tracing::info!(
            pipeline = orchestrator.is_available(),
            safety = orchestrator.safety_loaded(),
            audit_log = metrics.has_audit_log(),
            "Application context ready"
        );
        Ok(Self {
            config,
            orchestrator,
            metrics,
            ingest,
            feedback,
        })
    }

    /// Assemble a context from prebuilt parts.
    pub fn from_parts(
        config: CompanionConfig,
        orchestrator: RequestOrchestrator,
        ingest: IngestQueue,
    ) -> Self {
        let metrics = Arc::clone(orchestrator.metrics());
        let feedback = FeedbackLog::new(config.feedback.log_path.clone());
        Self {
            config,
            orchestrator,
            metrics,
            ingest,
            feedback,
        }
    }
}

/// Build the safety gate configured in `config`.
pub fn build_safety_gate(config: &CompanionConfig) -> SafetyGate {
    if config.safety.enabled {
        SafetyGate::keyword()
    } else {
        SafetyGate::disabled()
    }
}

/// Build the orchestrator from configuration.
///
/// The pipeline is only installed when both a retrieval and a generation
/// backend can be constructed; otherwise every answer is degraded.
pub fn build_orchestrator(
    config: &CompanionConfig,
    metrics: Arc<MetricsAggregator>,
) -> Result<RequestOrchestrator, ConfigError> {
    let safety = build_safety_gate(config);

    let retrieval: Option<Arc<dyn RetrievalClient>> = match (
        &config.retrieval.url,
        &config.retrieval.corpus_path,
    ) {
        (Some(url), _) => Some(Arc::new(HttpRetrievalClient::new(
            url,
            Duration::from_secs(config.retrieval.timeout_secs),
        )?)),
        (None, Some(path)) => Some(Arc::new(CorpusRetriever::from_jsonl(path)?)),
        (None, None) => None,
    };

    let generation: Option<Arc<dyn GenerationClient>> = match &config.generation.url {
        Some(url) => Some(Arc::new(HttpGenerationClient::new(
            url,
            Duration::from_secs(config.generation.timeout_secs),
        )?)),
        None if config.generation.extractive_fallback && retrieval.is_some() => {
            Some(Arc::new(ExtractiveGenerator::new(safety.clone())))
        }
        None => None,
    };

    let pipeline = match (retrieval, generation) {
        (Some(retrieval), Some(generation)) => Some(Pipeline::new(retrieval, generation)),
        (retrieval, generation) => {
            tracing::warn!(
                retrieval = retrieval.is_some(),
                generation = generation.is_some(),
                "Answer pipeline incomplete, serving degraded answers"
            );
            None
        }
    };

    Ok(RequestOrchestrator::new(
        safety,
        pipeline,
        metrics,
        config.safety.precedence,
    ))
}
