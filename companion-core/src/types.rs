//! Fundamental types shared across the pipeline stages.
//!
//! Stage outputs have explicit schemas here; wire-level defaults (unknown
//! filenames, string page numbers, missing scores) are resolved once at this
//! boundary instead of at every call site.

use serde::{Deserialize, Deserializer, Serialize};

/// Smallest accepted `k`.
pub const MIN_K: usize = 1;
/// Largest accepted `k`.
pub const MAX_K: usize = 20;
/// `k` used when a request omits it.
pub const DEFAULT_K: usize = 10;

/// Ordinal safety classification of a query or answer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    #[default]
    Safe = 0,
    Caution = 1,
    Danger = 2,
    Emergency = 3,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 4] = [
        SeverityLevel::Safe,
        SeverityLevel::Caution,
        SeverityLevel::Danger,
        SeverityLevel::Emergency,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Absolute number of levels between two classifications.
    pub fn distance(self, other: SeverityLevel) -> u8 {
        self.ordinal().abs_diff(other.ordinal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Safe => "safe",
            SeverityLevel::Caution => "caution",
            SeverityLevel::Danger => "danger",
            SeverityLevel::Emergency => "emergency",
        }
    }

    /// Parse a level name, treating anything unrecognised as `Safe`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SeverityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(SeverityLevel::Safe),
            "caution" => Ok(SeverityLevel::Caution),
            "danger" => Ok(SeverityLevel::Danger),
            "emergency" => Ok(SeverityLevel::Emergency),
            other => Err(format!("unknown severity level: {other}")),
        }
    }
}

/// A severity level with an optional explanation for the user.
///
/// The alert flag is derived from the level and never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub level: SeverityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SafetyAssessment {
    pub fn new(level: SeverityLevel, message: Option<String>) -> Self {
        Self {
            level,
            message: message.filter(|m| !m.trim().is_empty()),
        }
    }

    pub fn safe() -> Self {
        Self::default()
    }

    pub fn flag(&self) -> bool {
        self.level != SeverityLevel::Safe
    }

    /// The more severe of two assessments; `self` wins ties.
    pub fn most_severe(self, other: SafetyAssessment) -> SafetyAssessment {
        if other.level > self.level { other } else { self }
    }
}

/// A scored unit of manual text returned by the retrieval service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    #[serde(default = "unknown_filename")]
    pub filename: String,
    #[serde(default, deserialize_with = "deserialize_page")]
    pub page: Option<u32>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub relevance_score: f64,
}

/// Citation of a source shown alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    #[serde(default = "unknown_filename")]
    pub filename: String,
    #[serde(default, deserialize_with = "deserialize_page")]
    pub page: Option<u32>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub relevance_score: f64,
}

impl From<&RetrievedChunk> for SourceCitation {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            filename: chunk.filename.clone(),
            page: chunk.page,
            brand: chunk.brand.clone(),
            model: chunk.model.clone(),
            relevance_score: chunk.relevance_score,
        }
    }
}

/// Output of the generation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub answer: String,
    pub confidence_score: f64,
    pub sources: Vec<SourceCitation>,
    pub safety: SafetyAssessment,
}

/// Request body for `POST /answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub query: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_k")]
    pub k: i64,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            brand: None,
            model: None,
            k: DEFAULT_K as i64,
        }
    }

    pub fn with_appliance(mut self, brand: Option<String>, model: Option<String>) -> Self {
        self.brand = brand;
        self.model = model;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k as i64;
        self
    }

    /// Check the request shape before it reaches the orchestrator.
    pub fn validate(&self) -> Result<usize, crate::error::ValidationError> {
        if self.query.trim().is_empty() {
            return Err(crate::error::ValidationError::EmptyQuery);
        }
        if self.k < MIN_K as i64 || self.k > MAX_K as i64 {
            return Err(crate::error::ValidationError::KOutOfRange {
                value: self.k,
                min: MIN_K,
                max: MAX_K,
            });
        }
        Ok(self.k as usize)
    }
}

/// The externally visible answer to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub answer: String,
    pub safety_flag: bool,
    pub safety_level: SeverityLevel,
    pub safety_message: Option<String>,
    pub sources: Vec<SourceCitation>,
    pub chunks_used: usize,
    pub processing_time: f64,
    pub search_time: f64,
    pub llm_time: f64,
    pub confidence_score: f64,
    /// Measured but not part of the wire format.
    #[serde(skip)]
    pub safety_time: f64,
}

/// Per-stage wall-clock timings in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub safety: f64,
    pub search: f64,
    pub generation: f64,
}

impl AnswerRecord {
    /// Assemble a record, deriving the flag and chunk count and enforcing the
    /// `k` bound and score range on sources.
    pub fn assemble(
        answer: String,
        safety: SafetyAssessment,
        mut sources: Vec<SourceCitation>,
        k: usize,
        confidence_score: f64,
        processing_time: f64,
        timings: StageTimings,
    ) -> Self {
        sources.truncate(k);
        for source in &mut sources {
            source.relevance_score = clamp_unit(source.relevance_score);
        }
        Self {
            answer,
            safety_flag: safety.flag(),
            safety_level: safety.level,
            safety_message: safety.message,
            chunks_used: sources.len(),
            sources,
            processing_time,
            search_time: timings.search,
            llm_time: timings.generation,
            confidence_score: clamp_unit(confidence_score),
            safety_time: timings.safety,
        }
    }

    pub fn safety(&self) -> SafetyAssessment {
        SafetyAssessment {
            level: self.safety_level,
            message: self.safety_message.clone(),
        }
    }
}

/// Clamp a score into `[0, 1]`, mapping NaN to zero.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn default_k() -> i64 {
    DEFAULT_K as i64
}

fn unknown_filename() -> String {
    "unknown".to_string()
}

/// Accept pages as integers or numeric strings; anything else is absent.
fn deserialize_page<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let page = match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(page
        .filter(|p| *p > 0)
        .and_then(|p| u32::try_from(p).ok()))
}

fn deserialize_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(clamp_unit(value.unwrap_or(0.0)))
}
