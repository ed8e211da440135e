//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use companion_core::config::CompanionConfig;
use companion_core::gateway::run_gateway;
use companion_core::{
    AnswerBackend, AnswerRecord, AnswerRequest, AppContext, EvaluationHarness, HttpAnswerBackend,
    InProcessBackend, MetricsAggregator, build_orchestrator, load_config, standard_queries,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for each request made by the HTTP evaluation backend.
const EVALUATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => handle_serve(workspace, host, port).await,
        Commands::Ask {
            query,
            brand,
            model,
            k,
        } => handle_ask(workspace, query, brand, model, k).await,
        Commands::Evaluate {
            in_process,
            api_url,
            results_dir,
            delay_ms,
            no_save,
        } => {
            let options = EvaluateOptions {
                in_process,
                api_url,
                results_dir,
                delay_ms,
                no_save,
            };
            handle_evaluate(workspace, options).await
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<CompanionConfig> {
    load_config(Some(workspace), None).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

async fn handle_serve(
    workspace: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = load(workspace)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let ctx = AppContext::build(config).await?;
    if !ctx.orchestrator.is_available() {
        tracing::warn!(
            "No retrieval or generation backend configured; /answer will return degraded responses"
        );
    }
    run_gateway(Arc::new(ctx)).await?;
    Ok(())
}

/// Answer one query in this process.
async fn ask(config: &CompanionConfig, request: AnswerRequest) -> anyhow::Result<AnswerRecord> {
    let k = request.validate()?;
    let metrics = Arc::new(MetricsAggregator::new(&config.metrics));
    let orchestrator = build_orchestrator(config, metrics)?;
    Ok(orchestrator
        .answer(
            &request.query,
            request.brand.as_deref(),
            request.model.as_deref(),
            k,
        )
        .await)
}

async fn handle_ask(
    workspace: &Path,
    query: String,
    brand: Option<String>,
    model: Option<String>,
    k: Option<i64>,
) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let mut request = AnswerRequest::new(query).with_appliance(brand, model);
    if let Some(k) = k {
        request.k = k;
    }
    let record = ask(&config, request).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

#[derive(Debug, Default)]
struct EvaluateOptions {
    in_process: bool,
    api_url: Option<String>,
    results_dir: Option<PathBuf>,
    delay_ms: Option<u64>,
    no_save: bool,
}

fn evaluation_backend(
    config: &CompanionConfig,
    options: &EvaluateOptions,
) -> anyhow::Result<Arc<dyn AnswerBackend>> {
    if options.in_process {
        let metrics = Arc::new(MetricsAggregator::new(&config.metrics));
        let orchestrator = build_orchestrator(config, metrics)?;
        return Ok(Arc::new(InProcessBackend::new(orchestrator)));
    }
    let url = options
        .api_url
        .as_deref()
        .unwrap_or(&config.evaluation.api_url);
    println!("Evaluating server at {url}");
    Ok(Arc::new(HttpAnswerBackend::new(
        url,
        EVALUATION_REQUEST_TIMEOUT,
    )?))
}

async fn handle_evaluate(workspace: &Path, options: EvaluateOptions) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let backend = evaluation_backend(&config, &options)?;

    let delay = options
        .delay_ms
        .unwrap_or(config.evaluation.inter_query_delay_ms);
    let mut harness = EvaluationHarness::new(backend)
        .with_delay(Duration::from_millis(delay))
        .with_k(config.evaluation.k);
    if !options.no_save {
        let dir = options
            .results_dir
            .clone()
            .unwrap_or_else(|| workspace.join(&config.evaluation.results_dir));
        harness = harness.with_results_dir(dir);
    }

    let queries = standard_queries();
    let run = harness.run(&queries).await?;

    println!("{}", run.metrics.render_summary());
    if run.skipped > 0 {
        println!("{} of {} queries failed and were skipped", run.skipped, queries.len());
    }
    if let Some(report) = &run.report {
        println!("Results saved to: {}", report.summary.display());
        println!("Detailed results: {}", report.detailed.display());
    }

    if !run.metrics.all_targets_met() {
        anyhow::bail!("one or more evaluation targets were not met");
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = init_config(workspace)?;
            match config_path {
                Some(path) => println!("Created configuration file: {}", path.display()),
                None => println!("Configuration file already exists"),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Write the default config into `<workspace>/.companion/config.toml` unless
/// one already exists.
fn init_config(workspace: &Path) -> anyhow::Result<Option<PathBuf>> {
    let config_dir = workspace.join(".companion");
    std::fs::create_dir_all(&config_dir)?;
    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        return Ok(None);
    }
    let toml_str = toml::to_string_pretty(&CompanionConfig::default())?;
    std::fs::write(&config_path, toml_str)?;
    Ok(Some(config_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::DEGRADED_ANSWER;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir) -> CompanionConfig {
        let mut config = CompanionConfig::default();
        config.metrics.audit_log_path = None;
        config.ingest.staging_dir = dir.path().join("uploads");
        config
    }

    #[test]
    fn test_init_config_once() {
        let dir = TempDir::new().unwrap();
        let path = init_config(dir.path()).unwrap().unwrap();
        assert!(path.ends_with(".companion/config.toml"));
        assert!(init_config(dir.path()).unwrap().is_none());

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 8000);
    }

    #[tokio::test]
    async fn test_ask_without_backends_is_degraded() {
        let dir = TempDir::new().unwrap();
        let record = ask(&offline_config(&dir), AnswerRequest::new("My microwave is sparking"))
            .await
            .unwrap();
        assert_eq!(record.answer, DEGRADED_ANSWER);
        assert!(record.safety_flag);
    }

    #[tokio::test]
    async fn test_ask_rejects_bad_k() {
        let dir = TempDir::new().unwrap();
        let mut request = AnswerRequest::new("noise");
        request.k = 42;
        assert!(ask(&offline_config(&dir), request).await.is_err());
    }

    #[tokio::test]
    async fn test_evaluate_in_process_misses_targets_when_degraded() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        let options = EvaluateOptions {
            in_process: true,
            ..Default::default()
        };
        let backend = evaluation_backend(&config, &options).unwrap();
        let run = EvaluationHarness::new(backend)
            .with_delay(Duration::ZERO)
            .run(&standard_queries())
            .await
            .unwrap();
        assert_eq!(run.scored.len(), 8);
        assert!(!run.metrics.all_targets_met());
        assert_eq!(run.metrics.precision_at_5.average, 0.0);
    }
}
