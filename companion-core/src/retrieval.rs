//! Retrieval clients: scored manual chunks for a query.
//!
//! Calls are blocking; the orchestrator runs them on the blocking worker pool.
//! A backend that cannot be reached reports `StageError::Unavailable` instead
//! of an empty list, so "no results" and "no connection" stay distinguishable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::blocking::run_on_runtime;
use crate::error::{ConfigError, Stage, StageError};
use crate::types::{RetrievedChunk, clamp_unit};

/// Interface to the retrieval service.
pub trait RetrievalClient: Send + Sync {
    /// Return at most `k` chunks ordered by descending relevance.
    fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, StageError>;
}

/// Sort by descending relevance and cut to `k`.
pub fn rank_chunks(mut chunks: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    for chunk in &mut chunks {
        chunk.relevance_score = clamp_unit(chunk.relevance_score);
    }
    chunks.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    chunks.truncate(k);
    chunks
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    chunks: Vec<RetrievedChunk>,
}

/// Client for a remote retrieval service exposing `POST /search`.
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRetrievalClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("retrieval client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/search", base_url.trim_end_matches('/')),
        })
    }

    async fn search_remote(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequest { query, k })
            .send()
            .await
            .map_err(|e| StageError::from_http(Stage::Retrieval, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(StageError::unavailable(
                Stage::Retrieval,
                "index is not ready",
            ));
        }
        if !status.is_success() {
            return Err(StageError::failed(
                Stage::Retrieval,
                format!("search returned HTTP {status}"),
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| StageError::failed(Stage::Retrieval, format!("bad search body: {e}")))?;
        if body.chunks.len() > k {
            tracing::warn!(
                returned = body.chunks.len(),
                k,
                "Retrieval service returned more chunks than requested"
            );
        }
        Ok(rank_chunks(body.chunks, k))
    }
}

impl RetrievalClient for HttpRetrievalClient {
    fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, StageError> {
        run_on_runtime(Stage::Retrieval, self.search_remote(query, k))
    }
}

/// In-memory retriever over a JSONL export of manual chunks.
///
/// Scores are the fraction of distinct query terms present in the chunk,
/// with a small bonus for brand or model mentions, capped at 1.0.
pub struct CorpusRetriever {
    chunks: Vec<RetrievedChunk>,
    terms: Vec<HashSet<String>>,
}

impl CorpusRetriever {
    pub fn new(chunks: Vec<RetrievedChunk>) -> Self {
        let terms = chunks.iter().map(|c| tokenize(&c.text)).collect();
        Self { chunks, terms }
    }

    /// Load one chunk per line. Blank lines are skipped.
    pub fn from_jsonl(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::CorpusNotFound {
                path: path.to_path_buf(),
            });
        }
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::CorpusLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut chunks = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let chunk: RetrievedChunk =
                serde_json::from_str(line).map_err(|e| ConfigError::CorpusLoad {
                    path: path.to_path_buf(),
                    message: format!("line {}: {e}", line_no + 1),
                })?;
            chunks.push(chunk);
        }
        tracing::info!(path = %path.display(), chunks = chunks.len(), "Loaded manual corpus");
        Ok(Self::new(chunks))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn score(&self, idx: usize, query_terms: &HashSet<String>) -> f64 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let chunk_terms = &self.terms[idx];
        let overlap = query_terms.intersection(chunk_terms).count() as f64;
        let mut score = overlap / query_terms.len() as f64;

        let chunk = &self.chunks[idx];
        let mentions = |field: &Option<String>| {
            field
                .as_ref()
                .is_some_and(|v| query_terms.contains(&v.to_lowercase()))
        };
        if mentions(&chunk.brand) {
            score += 0.1;
        }
        if mentions(&chunk.model) {
            score += 0.1;
        }
        score.min(1.0)
    }
}

impl RetrievalClient for CorpusRetriever {
    fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, StageError> {
        let query_terms = tokenize(query);
        let mut scored: Vec<(usize, f64)> = (0..self.chunks.len())
            .map(|idx| (idx, self.score(idx, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        // Stable tie-break on corpus order keeps results deterministic.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(idx, score)| RetrievedChunk {
                relevance_score: score,
                ..self.chunks[idx].clone()
            })
            .collect())
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "does", "for", "from", "how", "i", "in", "is", "it", "my", "of", "on",
    "the", "to", "what", "when", "why", "with",
];

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}
