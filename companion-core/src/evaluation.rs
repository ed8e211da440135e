//! Evaluation harness: scores the answer pipeline against fixed quality targets.
//!
//! A fixed battery of queries is sent one at a time (never concurrently, so
//! latency is not skewed by self-inflicted load). Each response is scored for
//! Precision@5, safety accuracy and simulated satisfaction; the scores are
//! aggregated, compared to the targets, and persisted as a JSON report.
//! Missed targets are data, not errors.

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::EvaluationError;
use crate::orchestrator::RequestOrchestrator;
use crate::persistence::atomic_write_json;
use crate::types::{AnswerRecord, AnswerRequest, DEFAULT_K, SeverityLevel};

/// Minimum mean Precision@5.
pub const PRECISION_TARGET: f64 = 0.8;
/// Maximum mean end-to-end latency in seconds.
pub const LATENCY_TARGET_SECS: f64 = 2.0;
/// Minimum fraction of queries with an acceptable safety level.
pub const SAFETY_ACCURACY_TARGET: f64 = 0.9;
/// Minimum mean satisfaction score.
pub const SATISFACTION_TARGET: f64 = 0.8;

/// Sources above this relevance count as highly relevant.
const HIGH_RELEVANCE: f64 = 0.7;
/// Confidence above this earns the satisfaction bonus.
const CONFIDENT: f64 = 0.7;
/// Levels of disagreement tolerated by safety accuracy.
const SAFETY_TOLERANCE: u8 = 1;

/// Kind of problem a fixture query represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    Troubleshooting,
    Maintenance,
    Safety,
}

/// A test query with its expected outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationQuery {
    pub query: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub expected_keywords: Vec<String>,
    pub expected_safety: SeverityLevel,
    pub category: QueryCategory,
}

impl EvaluationQuery {
    fn fixture(
        query: &str,
        appliance: Option<(&str, &str)>,
        keywords: &[&str],
        expected_safety: SeverityLevel,
        category: QueryCategory,
    ) -> Self {
        Self {
            query: query.to_string(),
            brand: appliance.map(|(b, _)| b.to_string()),
            model: appliance.map(|(_, m)| m.to_string()),
            expected_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            expected_safety,
            category,
        }
    }
}

/// The standard evaluation battery.
pub fn standard_queries() -> Vec<EvaluationQuery> {
    use QueryCategory::*;
    use SeverityLevel::*;
    vec![
        EvaluationQuery::fixture(
            "My Samsung WF45 won't spin, what does E3 mean?",
            Some(("Samsung", "WF45")),
            &["drainage", "pump", "filter", "error", "E3"],
            Safe,
            Troubleshooting,
        ),
        EvaluationQuery::fixture(
            "How to clean lint filter?",
            None,
            &["filter", "clean", "lint", "remove", "maintenance"],
            Safe,
            Maintenance,
        ),
        EvaluationQuery::fixture(
            "I smell gas from the oven",
            None,
            &["gas", "leak", "emergency", "evacuate", "call"],
            Emergency,
            Safety,
        ),
        EvaluationQuery::fixture(
            "My microwave is sparking",
            None,
            &["spark", "dangerous", "stop", "unplug", "safety"],
            Danger,
            Safety,
        ),
        EvaluationQuery::fixture(
            "Dishwasher not draining properly",
            None,
            &["drain", "clog", "filter", "pump", "water"],
            Safe,
            Troubleshooting,
        ),
        EvaluationQuery::fixture(
            "Refrigerator making loud noise",
            None,
            &["noise", "compressor", "fan", "vibration", "normal"],
            Safe,
            Troubleshooting,
        ),
        EvaluationQuery::fixture(
            "Water leaking from washing machine",
            None,
            &["leak", "water", "hose", "drain", "check"],
            Caution,
            Safety,
        ),
        EvaluationQuery::fixture(
            "Oven temperature seems incorrect",
            None,
            &["temperature", "calibration", "thermometer", "oven", "adjust"],
            Safe,
            Troubleshooting,
        ),
    ]
}

/// Precision@5: mean of answer keyword coverage and the share of the top
/// five sources that are highly relevant. Zero when there are no sources.
pub fn precision_at_5(record: &AnswerRecord, expected_keywords: &[String]) -> f64 {
    let top = &record.sources[..record.sources.len().min(5)];
    if top.is_empty() {
        return 0.0;
    }

    let answer = record.answer.to_lowercase();
    let keyword_score = if expected_keywords.is_empty() {
        0.0
    } else {
        let found = expected_keywords
            .iter()
            .filter(|k| answer.contains(&k.to_lowercase()))
            .count();
        found as f64 / expected_keywords.len() as f64
    };

    let relevant = top
        .iter()
        .filter(|s| s.relevance_score > HIGH_RELEVANCE)
        .count();
    let source_score = relevant as f64 / top.len() as f64;

    (keyword_score + source_score) / 2.0
}

/// A detected level within one step of the expected level is accurate.
pub fn safety_accurate(expected: SeverityLevel, detected: SeverityLevel) -> bool {
    expected.distance(detected) <= SAFETY_TOLERANCE
}

/// Simulated satisfaction: five unit bonuses, normalised to `[0, 1]`.
pub fn satisfaction(record: &AnswerRecord, expected_safety: SeverityLevel, latency: f64) -> f64 {
    let bonuses = [
        !record.answer.is_empty(),
        expected_safety != SeverityLevel::Safe && record.safety_flag,
        !record.sources.is_empty(),
        latency < LATENCY_TARGET_SECS,
        record.confidence_score > CONFIDENT,
    ];
    let earned = bonuses.iter().filter(|b| **b).count() as f64;
    (earned / bonuses.len() as f64).min(1.0)
}

/// Scores for one answered query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredQuery {
    pub query: String,
    pub precision_at_5: f64,
    pub latency: f64,
    pub search_time: f64,
    pub llm_time: f64,
    pub detected_safety: SeverityLevel,
    pub safety_accurate: bool,
    pub satisfaction: f64,
}

impl ScoredQuery {
    pub fn score(query: &EvaluationQuery, record: &AnswerRecord, latency: f64) -> Self {
        Self {
            query: query.query.clone(),
            precision_at_5: precision_at_5(record, &query.expected_keywords),
            latency,
            search_time: record.search_time,
            llm_time: record.llm_time,
            detected_safety: record.safety_level,
            safety_accurate: safety_accurate(query.expected_safety, record.safety_level),
            satisfaction: satisfaction(record, query.expected_safety, latency),
        }
    }
}

/// Per-query score series, in run order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResults {
    pub precision_scores: Vec<f64>,
    pub latencies: Vec<f64>,
    pub search_times: Vec<f64>,
    pub llm_times: Vec<f64>,
    pub safety_accuracy: Vec<f64>,
    pub user_satisfaction: Vec<f64>,
}

impl RawResults {
    pub fn push(&mut self, scored: &ScoredQuery) {
        self.precision_scores.push(scored.precision_at_5);
        self.latencies.push(scored.latency);
        self.search_times.push(scored.search_time);
        self.llm_times.push(scored.llm_time);
        self.safety_accuracy
            .push(if scored.safety_accurate { 1.0 } else { 0.0 });
        self.user_satisfaction.push(scored.satisfaction);
    }

    pub fn len(&self) -> usize {
        self.precision_scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.precision_scores.is_empty()
    }
}

/// Summary statistics of a non-empty series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        Some(Self {
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
            min: sorted[0],
            max: sorted[n - 1],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_queries: usize,
    pub evaluation_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMetrics {
    pub average: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub target_met: bool,
}

impl ScoreMetrics {
    fn from_stats(stats: Stats, target_met: bool) -> Self {
        Self {
            average: stats.mean,
            median: stats.median,
            min: stats.min,
            max: stats.max,
            target_met,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub average_total: f64,
    pub median_total: f64,
    pub average_search: f64,
    pub median_search: f64,
    pub average_llm: f64,
    pub median_llm: f64,
    pub target_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyMetrics {
    pub accuracy: f64,
    pub target_met: bool,
}

/// Aggregated result of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub evaluation_summary: EvaluationSummary,
    pub precision_at_5: ScoreMetrics,
    pub latency_metrics: LatencyMetrics,
    pub safety_accuracy: SafetyMetrics,
    pub user_satisfaction: ScoreMetrics,
}

impl EvaluationMetrics {
    /// Aggregate raw scores. `None` when nothing was scored.
    pub fn from_raw(raw: &RawResults) -> Option<Self> {
        let precision = Stats::of(&raw.precision_scores)?;
        let latency = Stats::of(&raw.latencies)?;
        let search = Stats::of(&raw.search_times)?;
        let llm = Stats::of(&raw.llm_times)?;
        let safety = Stats::of(&raw.safety_accuracy)?;
        let satisfaction = Stats::of(&raw.user_satisfaction)?;

        Some(Self {
            evaluation_summary: EvaluationSummary {
                total_queries: raw.len(),
                evaluation_date: Local::now().to_rfc3339(),
            },
            precision_at_5: ScoreMetrics::from_stats(precision, precision.mean >= PRECISION_TARGET),
            latency_metrics: LatencyMetrics {
                average_total: latency.mean,
                median_total: latency.median,
                average_search: search.mean,
                median_search: search.median,
                average_llm: llm.mean,
                median_llm: llm.median,
                target_met: latency.mean <= LATENCY_TARGET_SECS,
            },
            safety_accuracy: SafetyMetrics {
                accuracy: safety.mean,
                target_met: safety.mean >= SAFETY_ACCURACY_TARGET,
            },
            user_satisfaction: ScoreMetrics::from_stats(
                satisfaction,
                satisfaction.mean >= SATISFACTION_TARGET,
            ),
        })
    }

    pub fn all_targets_met(&self) -> bool {
        self.precision_at_5.target_met
            && self.latency_metrics.target_met
            && self.safety_accuracy.target_met
            && self.user_satisfaction.target_met
    }

    /// Plain-text pass/fail summary.
    pub fn render_summary(&self) -> String {
        let verdict = |met: bool| if met { "PASS" } else { "FAIL" };
        let mut out = String::new();
        out.push_str("COMPANIONAI PERFORMANCE EVALUATION RESULTS\n");
        out.push_str(&format!(
            "Queries scored:    {}\n",
            self.evaluation_summary.total_queries
        ));
        out.push_str(&format!(
            "Precision@5:       {:.2} (target >= {PRECISION_TARGET}) {}\n",
            self.precision_at_5.average,
            verdict(self.precision_at_5.target_met)
        ));
        out.push_str(&format!(
            "Avg latency:       {:.2}s (target <= {LATENCY_TARGET_SECS}s) {}\n",
            self.latency_metrics.average_total,
            verdict(self.latency_metrics.target_met)
        ));
        out.push_str(&format!(
            "  search {:.2}s | llm {:.2}s\n",
            self.latency_metrics.average_search, self.latency_metrics.average_llm
        ));
        out.push_str(&format!(
            "Safety accuracy:   {:.2} (target >= {SAFETY_ACCURACY_TARGET}) {}\n",
            self.safety_accuracy.accuracy,
            verdict(self.safety_accuracy.target_met)
        ));
        out.push_str(&format!(
            "User satisfaction: {:.2} (target >= {SATISFACTION_TARGET}) {}\n",
            self.user_satisfaction.average,
            verdict(self.user_satisfaction.target_met)
        ));
        out.push_str(if self.all_targets_met() {
            "Overall: ALL TARGETS MET\n"
        } else {
            "Overall: SOME TARGETS MISSED\n"
        });
        out
    }
}

/// Something that answers queries for the harness.
#[async_trait]
pub trait AnswerBackend: Send + Sync {
    /// Fails only when the pipeline cannot be reached at all.
    async fn check_health(&self) -> Result<(), EvaluationError>;

    async fn answer(&self, request: &AnswerRequest) -> Result<AnswerRecord, EvaluationError>;
}

/// Runs queries through an orchestrator in this process.
pub struct InProcessBackend {
    orchestrator: RequestOrchestrator,
}

impl InProcessBackend {
    pub fn new(orchestrator: RequestOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl AnswerBackend for InProcessBackend {
    async fn check_health(&self) -> Result<(), EvaluationError> {
        if !self.orchestrator.is_available() {
            tracing::warn!("Pipeline is not configured; answers will be degraded");
        }
        Ok(())
    }

    async fn answer(&self, request: &AnswerRequest) -> Result<AnswerRecord, EvaluationError> {
        let k = request
            .validate()
            .map_err(|e| EvaluationError::RequestFailed {
                message: e.to_string(),
            })?;
        Ok(self
            .orchestrator
            .answer(
                &request.query,
                request.brand.as_deref(),
                request.model.as_deref(),
                k,
            )
            .await)
    }
}

/// Calls `POST /answer` on a running server.
pub struct HttpAnswerBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnswerBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EvaluationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvaluationError::PipelineUnreachable {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AnswerBackend for HttpAnswerBackend {
    async fn check_health(&self) -> Result<(), EvaluationError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            EvaluationError::PipelineUnreachable {
                message: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(EvaluationError::PipelineUnreachable {
                message: format!("health check returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    async fn answer(&self, request: &AnswerRequest) -> Result<AnswerRecord, EvaluationError> {
        let url = format!("{}/answer", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| EvaluationError::RequestFailed {
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EvaluationError::RequestFailed {
                message: format!("HTTP {status}: {body}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| EvaluationError::RequestFailed {
                message: format!("bad answer body: {e}"),
            })
    }
}

/// Files written for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPaths {
    pub summary: PathBuf,
    pub detailed: PathBuf,
}

#[derive(Debug, Serialize)]
struct DetailedReport<'a> {
    raw_results: &'a RawResults,
    metrics: &'a EvaluationMetrics,
}

/// Write `evaluation_results_<stamp>.json` and `detailed_evaluation_results_<stamp>.json`.
pub fn persist_report(
    dir: &Path,
    raw: &RawResults,
    metrics: &EvaluationMetrics,
) -> Result<ReportPaths, EvaluationError> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("evaluation_results_{stamp}.json");
    let paths = ReportPaths {
        summary: dir.join(&filename),
        detailed: dir.join(format!("detailed_{filename}")),
    };
    let write_error = |path: &Path, e: std::io::Error| EvaluationError::ReportWrite {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    atomic_write_json(&paths.summary, metrics).map_err(|e| write_error(&paths.summary, e))?;
    atomic_write_json(
        &paths.detailed,
        &DetailedReport {
            raw_results: raw,
            metrics,
        },
    )
    .map_err(|e| write_error(&paths.detailed, e))?;
    tracing::info!(path = %paths.summary.display(), "Evaluation report saved");
    Ok(paths)
}

/// Outcome of a harness run.
#[derive(Debug, Clone)]
pub struct EvaluationRun {
    pub metrics: EvaluationMetrics,
    pub raw: RawResults,
    pub scored: Vec<ScoredQuery>,
    /// Number of queries whose request failed and were skipped.
    pub skipped: usize,
    pub report: Option<ReportPaths>,
}

/// Sequential driver over an [`AnswerBackend`].
pub struct EvaluationHarness {
    backend: Arc<dyn AnswerBackend>,
    delay: Duration,
    k: usize,
    results_dir: Option<PathBuf>,
}

impl EvaluationHarness {
    pub fn new(backend: Arc<dyn AnswerBackend>) -> Self {
        Self {
            backend,
            delay: Duration::from_millis(500),
            k: DEFAULT_K,
            results_dir: None,
        }
    }

    /// Pause between consecutive queries.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Persist reports under `dir`.
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = Some(dir.into());
        self
    }

    /// Run the battery once.
    ///
    /// Fails only if the pipeline is unreachable up front, nothing could be
    /// scored, or the report cannot be written.
    pub async fn run(&self, queries: &[EvaluationQuery]) -> Result<EvaluationRun, EvaluationError> {
        self.backend.check_health().await?;
        tracing::info!(queries = queries.len(), "Starting evaluation");

        let mut raw = RawResults::default();
        let mut scored = Vec::with_capacity(queries.len());
        let mut skipped = 0;

        for (i, query) in queries.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let request = AnswerRequest::new(query.query.clone())
                .with_appliance(query.brand.clone(), query.model.clone())
                .with_k(self.k);
            let started = Instant::now();
            let record = match self.backend.answer(&request).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(query = %query.query, error = %e, "Query failed, skipping");
                    skipped += 1;
                    continue;
                }
            };
            let latency = started.elapsed().as_secs_f64();

            let result = ScoredQuery::score(query, &record, latency);
            tracing::info!(
                index = i + 1,
                total = queries.len(),
                precision = result.precision_at_5,
                latency = result.latency,
                safety_accurate = result.safety_accurate,
                "Query scored"
            );
            raw.push(&result);
            scored.push(result);
        }

        let metrics = EvaluationMetrics::from_raw(&raw).ok_or(EvaluationError::NoScoredQueries)?;
        let report = match &self.results_dir {
            Some(dir) => Some(persist_report(dir, &raw, &metrics)?),
            None => None,
        };

        Ok(EvaluationRun {
            metrics,
            raw,
            scored,
            skipped,
            report,
        })
    }
}
