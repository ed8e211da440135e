//! Configuration system for CompanionAI.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/companion/config.toml` and/or
//! `.companion/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::SafetyAssessment;

/// Top-level configuration for the CompanionAI service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub safety: SafetyConfig,
    pub metrics: MetricsConfig,
    pub ingest: IngestConfig,
    pub feedback: FeedbackConfig,
    pub evaluation: EvaluationConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted upload body in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Retrieval backend: a remote service, a local chunk export, or neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Base URL of the retrieval service.
    pub url: Option<String>,
    /// JSONL file of pre-chunked manual text, used when no URL is set.
    pub corpus_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            url: None,
            corpus_path: None,
            timeout_secs: 30,
        }
    }
}

/// Generation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL of the generation service.
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Quote retrieved passages locally when no URL is set.
    pub extractive_fallback: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 60,
            extractive_fallback: true,
        }
    }
}

/// Which safety assessment reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyPrecedence {
    /// The generation stage's assessment replaces the gate's on success, and
    /// the error fallback reports `safe`.
    #[default]
    Generation,
    /// The more severe of gate and generation wins, on every path.
    MostSevere,
}

impl SafetyPrecedence {
    /// Final assessment when generation succeeded.
    pub fn resolve(self, gate: SafetyAssessment, generated: SafetyAssessment) -> SafetyAssessment {
        match self {
            SafetyPrecedence::Generation => generated,
            SafetyPrecedence::MostSevere => generated.most_severe(gate),
        }
    }

    /// Final assessment on the error fallback path.
    pub fn on_error(self, gate: SafetyAssessment) -> SafetyAssessment {
        match self {
            SafetyPrecedence::Generation => SafetyAssessment::safe(),
            SafetyPrecedence::MostSevere => gate,
        }
    }
}

/// Safety gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Install the keyword classifier. When false every query is `safe`.
    pub enabled: bool,
    pub precedence: SafetyPrecedence,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            precedence: SafetyPrecedence::default(),
        }
    }
}

/// Metrics window and audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_size: usize,
    /// Append-only JSONL log of served requests. `None` disables it.
    pub audit_log_path: Option<PathBuf>,
    /// Reported as `precision_at_5` by the live snapshot.
    pub placeholder_precision_at_5: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            audit_log_path: Some(PathBuf::from("logs/api_metrics.jsonl")),
            placeholder_precision_at_5: 0.85,
        }
    }
}

/// Upload staging and ingestion queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub staging_dir: PathBuf,
    /// Ingestion endpoint. Falls back to `<retrieval.url>/ingest`.
    pub url: Option<String>,
    pub queue_capacity: usize,
    pub timeout_secs: u64,
    /// Finished jobs kept for polling; the oldest are evicted past this.
    pub max_retained_jobs: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("uploads"),
            url: None,
            queue_capacity: 32,
            timeout_secs: 300,
            max_retained_jobs: 1000,
        }
    }
}

/// User feedback log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub log_path: PathBuf,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data/feedback.jsonl"),
        }
    }
}

/// Evaluation harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Server evaluated by `companion evaluate` unless run in-process.
    pub api_url: String,
    pub results_dir: PathBuf,
    pub inter_query_delay_ms: u64,
    pub k: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            results_dir: PathBuf::from("results"),
            inter_query_delay_ms: 500,
            k: 10,
        }
    }
}

impl CompanionConfig {
    /// Resolve the ingestion endpoint, if any backend is configured.
    pub fn ingest_url(&self) -> Option<String> {
        self.ingest.url.clone().or_else(|| {
            self.retrieval
                .url
                .as_ref()
                .map(|base| format!("{}/ingest", base.trim_end_matches('/')))
        })
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.metrics.window_size == 0 {
            return Err(crate::error::ConfigError::Invalid {
                message: "metrics.window_size must be at least 1".into(),
            });
        }
        if self.ingest.queue_capacity == 0 {
            return Err(crate::error::ConfigError::Invalid {
                message: "ingest.queue_capacity must be at least 1".into(),
            });
        }
        if self.ingest.max_retained_jobs == 0 {
            return Err(crate::error::ConfigError::Invalid {
                message: "ingest.max_retained_jobs must be at least 1".into(),
            });
        }
        if !(crate::types::MIN_K..=crate::types::MAX_K).contains(&self.evaluation.k) {
            return Err(crate::error::ConfigError::Invalid {
                message: format!(
                    "evaluation.k must be between {} and {}",
                    crate::types::MIN_K,
                    crate::types::MAX_K
                ),
            });
        }
        for (name, url) in [
            ("retrieval.url", self.retrieval.url.as_deref()),
            ("generation.url", self.generation.url.as_deref()),
            ("ingest.url", self.ingest.url.as_deref()),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(crate::error::ConfigError::Invalid {
                        message: format!("{name} must be an http(s) URL, got '{url}'"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `COMPANION_`)
/// 3. Workspace-local config (`.companion/config.toml`)
/// 4. User config (`~/.config/companion/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&CompanionConfig>,
) -> Result<CompanionConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(CompanionConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "companion", "companion") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".companion").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // COMPANION_SERVER__PORT, COMPANION_RETRIEVAL__URL, etc.
    figment = figment.merge(Env::prefixed("COMPANION_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
