//! Generation clients: answers, citations, confidence, and a safety verdict.
//!
//! Like retrieval, calls are blocking and run on the blocking worker pool.
//! The safety assessment a generator returns is authoritative for the final
//! response on the success path.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::blocking::run_on_runtime;
use crate::error::{ConfigError, Stage, StageError};
use crate::safety::SafetyGate;
use crate::types::{
    GenerationResult, RetrievedChunk, SafetyAssessment, SeverityLevel, SourceCitation, clamp_unit,
};

/// Interface to the generation service.
pub trait GenerationClient: Send + Sync {
    /// Produce an answer for `query` grounded in `chunks`.
    ///
    /// An empty chunk list must still yield an answer, with lower confidence
    /// and no citations.
    fn generate(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        brand: Option<&str>,
        model: Option<&str>,
    ) -> Result<GenerationResult, StageError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    query: &'a str,
    chunks: &'a [RetrievedChunk],
    brand: Option<&'a str>,
    model: Option<&'a str>,
}

/// Wire body of `POST /generate`, with defaults applied once here.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default = "default_answer")]
    answer: String,
    #[serde(default = "default_confidence")]
    confidence_score: f64,
    #[serde(default)]
    sources: Vec<SourceCitation>,
    #[serde(default)]
    safety_level: Option<String>,
    #[serde(default)]
    safety_message: Option<String>,
}

fn default_answer() -> String {
    "No answer generated".to_string()
}

fn default_confidence() -> f64 {
    0.85
}

impl From<GenerateResponse> for GenerationResult {
    fn from(body: GenerateResponse) -> Self {
        let level = body
            .safety_level
            .as_deref()
            .map(SeverityLevel::parse_lenient)
            .unwrap_or_default();
        GenerationResult {
            answer: body.answer,
            confidence_score: clamp_unit(body.confidence_score),
            sources: body.sources,
            safety: SafetyAssessment::new(level, body.safety_message),
        }
    }
}

/// Client for a remote generation service exposing `POST /generate`.
pub struct HttpGenerationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("generation client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/generate", base_url.trim_end_matches('/')),
        })
    }

    async fn generate_remote(
        &self,
        request: GenerateRequest<'_>,
    ) -> Result<GenerationResult, StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| StageError::from_http(Stage::Generation, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(StageError::unavailable(
                Stage::Generation,
                "model is not loaded",
            ));
        }
        if !status.is_success() {
            return Err(StageError::failed(
                Stage::Generation,
                format!("generate returned HTTP {status}"),
            ));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            StageError::failed(Stage::Generation, format!("bad generate body: {e}"))
        })?;
        Ok(body.into())
    }
}

impl GenerationClient for HttpGenerationClient {
    fn generate(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        brand: Option<&str>,
        model: Option<&str>,
    ) -> Result<GenerationResult, StageError> {
        let request = GenerateRequest {
            query,
            chunks,
            brand,
            model,
        };
        run_on_runtime(Stage::Generation, self.generate_remote(request))
    }
}

/// Chunks that count toward confidence.
const CONFIDENCE_SATURATION: usize = 5;
/// Confidence reported when no chunks were retrieved.
const NO_CONTEXT_CONFIDENCE: f64 = 0.1;
/// Excerpts quoted in an extractive answer.
const MAX_EXCERPTS: usize = 3;

/// Confidence from retrieval evidence.
///
/// Grows with the number of chunks (up to five) and with their mean
/// relevance, so fewer or weaker chunks never raise it.
pub fn evidence_confidence(chunks: &[RetrievedChunk]) -> f64 {
    if chunks.is_empty() {
        return NO_CONTEXT_CONFIDENCE;
    }
    let used = &chunks[..chunks.len().min(CONFIDENCE_SATURATION)];
    let mean = used.iter().map(|c| clamp_unit(c.relevance_score)).sum::<f64>() / used.len() as f64;
    let coverage = used.len() as f64 / CONFIDENCE_SATURATION as f64;
    let confidence = mean * (0.5 + 0.5 * coverage);
    clamp_unit(confidence.max(NO_CONTEXT_CONFIDENCE))
}

/// Offline generator that quotes the best-matching manual passages.
///
/// Used with a local corpus when no generation service is configured.
pub struct ExtractiveGenerator {
    safety: SafetyGate,
}

impl ExtractiveGenerator {
    pub fn new(safety: SafetyGate) -> Self {
        Self { safety }
    }
}

impl GenerationClient for ExtractiveGenerator {
    fn generate(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        brand: Option<&str>,
        model: Option<&str>,
    ) -> Result<GenerationResult, StageError> {
        let safety = self.safety.assess(query);
        let appliance = match (brand, model) {
            (Some(b), Some(m)) => format!(" for your {b} {m}"),
            (Some(b), None) => format!(" for your {b} appliance"),
            (None, Some(m)) => format!(" for model {m}"),
            (None, None) => String::new(),
        };

        let mut answer = String::new();
        if let Some(message) = &safety.message {
            answer.push_str(message);
            answer.push_str("\n\n");
        }
        if chunks.is_empty() {
            answer.push_str(&format!(
                "I couldn't find a matching passage in the manuals{appliance}. \
                 Check the troubleshooting section of your owner's manual or contact the manufacturer."
            ));
        } else {
            answer.push_str(&format!("Here is what the manuals say{appliance}:\n"));
            for chunk in chunks.iter().take(MAX_EXCERPTS) {
                let page = chunk.page.map(|p| format!(", p. {p}")).unwrap_or_default();
                answer.push_str(&format!(
                    "\n- {} ({}{page})",
                    chunk.text.trim(),
                    chunk.filename
                ));
            }
        }

        Ok(GenerationResult {
            answer,
            confidence_score: evidence_confidence(chunks),
            sources: chunks.iter().map(SourceCitation::from).collect(),
            safety,
        })
    }
}
