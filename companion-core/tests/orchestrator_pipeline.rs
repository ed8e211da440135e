//! End-to-end tests of the answer pipeline and the evaluation harness,
//! wired from configuration the way the server and CLI wire it.

use companion_core::config::CompanionConfig;
use companion_core::evaluation::persist_report;
use companion_core::{
    AnswerBackend, AnswerRequest, CorpusRetriever, DEGRADED_ANSWER, EvaluationHarness,
    ExtractiveGenerator, InProcessBackend, MetricsAggregator, Pipeline, RequestOrchestrator,
    RetrievedChunk, SafetyGate, SafetyPrecedence, SeverityLevel, build_orchestrator,
    standard_queries,
};
use futures::future::join_all;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn manual_chunk(text: &str, filename: &str, page: u32) -> RetrievedChunk {
    RetrievedChunk {
        text: text.to_string(),
        filename: filename.to_string(),
        page: Some(page),
        brand: Some("Samsung".into()),
        model: Some("WF45".into()),
        relevance_score: 0.0,
    }
}

fn corpus() -> Vec<RetrievedChunk> {
    vec![
        manual_chunk(
            "Error E3 indicates a drainage error. Check the drain pump filter and remove any clog.",
            "wf45_manual.pdf",
            42,
        ),
        manual_chunk(
            "To clean the lint filter, remove the filter and brush off lint after every load as routine maintenance.",
            "dryer_manual.pdf",
            12,
        ),
        manual_chunk(
            "If the dishwasher is not draining, check the drain hose for a clog and clean the filter.",
            "dishwasher_manual.pdf",
            30,
        ),
        manual_chunk(
            "A loud noise from the refrigerator usually comes from the compressor or the condenser fan.",
            "fridge_manual.pdf",
            7,
        ),
        manual_chunk(
            "If water is leaking from the washing machine, check the inlet hose and the drain connection.",
            "wf45_manual.pdf",
            55,
        ),
        manual_chunk(
            "Verify oven temperature with an oven thermometer and adjust the calibration offset.",
            "oven_manual.pdf",
            19,
        ),
    ]
}

fn corpus_orchestrator(metrics: Arc<MetricsAggregator>) -> RequestOrchestrator {
    let safety = SafetyGate::keyword();
    let pipeline = Pipeline::new(
        Arc::new(CorpusRetriever::new(corpus())),
        Arc::new(ExtractiveGenerator::new(safety.clone())),
    );
    RequestOrchestrator::new(safety, Some(pipeline), metrics, SafetyPrecedence::MostSevere)
}

#[tokio::test]
async fn test_corpus_pipeline_answers_with_citations() {
    let metrics = Arc::new(MetricsAggregator::in_memory(100));
    let orch = corpus_orchestrator(Arc::clone(&metrics));

    let record = orch
        .answer(
            "My Samsung WF45 won't spin, what does E3 mean?",
            Some("Samsung"),
            Some("WF45"),
            3,
        )
        .await;

    assert!(!record.sources.is_empty());
    assert!(record.chunks_used <= 3);
    assert_eq!(record.chunks_used, record.sources.len());
    assert_eq!(record.sources[0].filename, "wf45_manual.pdf");
    assert!(record.answer.contains("E3"));
    assert!(!record.safety_flag);
    assert!(record.confidence_score > 0.0 && record.confidence_score <= 1.0);
    assert_eq!(metrics.snapshot().unwrap().total_queries, 1);
}

#[tokio::test]
async fn test_corpus_pipeline_flags_hazards() {
    let metrics = Arc::new(MetricsAggregator::in_memory(100));
    let orch = corpus_orchestrator(Arc::clone(&metrics));

    let record = orch.answer("I smell gas from the oven", None, None, 5).await;
    assert_eq!(record.safety_level, SeverityLevel::Emergency);
    assert!(record.safety_flag);
    assert!(record.answer.starts_with("EMERGENCY"));

    let record = orch
        .answer("Water leaking from washing machine", None, None, 5)
        .await;
    assert_eq!(record.safety_level, SeverityLevel::Caution);
    assert_eq!(metrics.safety_alerts(), 2);
}

#[tokio::test]
async fn test_concurrent_requests_are_each_recorded_once() {
    let metrics = Arc::new(MetricsAggregator::in_memory(1000));
    let orch = corpus_orchestrator(Arc::clone(&metrics));

    let queries = [
        "How to clean lint filter?",
        "My microwave is sparking",
        "Dishwasher not draining properly",
        "Refrigerator making loud noise",
    ];
    let futures = (0..25).map(|i| {
        let orch = orch.clone();
        let query = queries[i % queries.len()];
        async move { orch.answer(query, None, None, 5).await }
    });
    let records = join_all(futures).await;

    assert_eq!(records.len(), 25);
    let flagged = records.iter().filter(|r| r.safety_flag).count() as u64;
    let snapshot = metrics.snapshot().unwrap();
    assert_eq!(snapshot.total_queries, 25);
    assert_eq!(snapshot.safety_alerts_triggered, flagged);
    assert_eq!(flagged, 6);
}

#[tokio::test]
async fn test_config_without_backends_degrades() {
    let config = CompanionConfig::default();
    let metrics = Arc::new(MetricsAggregator::in_memory(10));
    let orch = build_orchestrator(&config, Arc::clone(&metrics)).unwrap();

    let record = orch
        .answer("Oven temperature seems incorrect", None, None, 10)
        .await;
    assert_eq!(record.answer, DEGRADED_ANSWER);
    assert!(record.sources.is_empty());
    assert_eq!(metrics.snapshot().unwrap().total_queries, 1);
}

#[tokio::test]
async fn test_config_with_corpus_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corpus.jsonl");
    let mut file = std::fs::File::create(&path).unwrap();
    for chunk in corpus() {
        writeln!(file, "{}", serde_json::to_string(&chunk).unwrap()).unwrap();
    }

    let mut config = CompanionConfig::default();
    config.retrieval.corpus_path = Some(path);
    let orch = build_orchestrator(&config, Arc::new(MetricsAggregator::in_memory(10))).unwrap();
    assert!(orch.is_available());

    let record = orch
        .answer("Dishwasher not draining properly", None, None, 2)
        .await;
    assert!(record.chunks_used >= 1 && record.chunks_used <= 2);
    assert_ne!(record.answer, DEGRADED_ANSWER);
}

#[tokio::test]
async fn test_in_process_backend_rejects_bad_k() {
    let backend = InProcessBackend::new(corpus_orchestrator(Arc::new(
        MetricsAggregator::in_memory(10),
    )));
    let mut request = AnswerRequest::new("How to clean lint filter?");
    request.k = 0;
    assert!(backend.answer(&request).await.is_err());
}

#[tokio::test]
async fn test_evaluation_harness_end_to_end() {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(MetricsAggregator::in_memory(100));
    let backend = Arc::new(InProcessBackend::new(corpus_orchestrator(Arc::clone(
        &metrics,
    ))));

    let run = EvaluationHarness::new(backend)
        .with_delay(Duration::ZERO)
        .with_k(5)
        .with_results_dir(dir.path())
        .run(&standard_queries())
        .await
        .unwrap();

    assert_eq!(run.skipped, 0);
    assert_eq!(run.scored.len(), 8);
    assert_eq!(run.raw.len(), 8);
    assert_eq!(metrics.snapshot().unwrap().total_queries, 8);
    assert_eq!(run.metrics.evaluation_summary.total_queries, 8);
    assert!(run.metrics.latency_metrics.target_met);
    assert!(run.metrics.safety_accuracy.accuracy >= 0.9);
    assert!(
        run.scored
            .iter()
            .all(|s| (0.0..=1.0).contains(&s.precision_at_5))
    );

    let report = run.report.expect("report written");
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report.summary).unwrap()).unwrap();
    assert!(summary["precision_at_5"]["average"].is_number());
    let detailed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report.detailed).unwrap()).unwrap();
    assert_eq!(
        detailed["raw_results"]["latencies"].as_array().unwrap().len(),
        8
    );
}

#[tokio::test]
async fn test_persist_report_into_missing_dir() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(InProcessBackend::new(corpus_orchestrator(Arc::new(
        MetricsAggregator::in_memory(10),
    ))));
    let run = EvaluationHarness::new(backend)
        .with_delay(Duration::ZERO)
        .run(&standard_queries()[..2])
        .await
        .unwrap();
    assert!(run.report.is_none());

    let nested = dir.path().join("results").join("nightly");
    let paths = persist_report(&nested, &run.raw, &run.metrics).unwrap();
    assert!(paths.summary.exists());
    assert!(
        paths
            .detailed
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("detailed_evaluation_results_")
    );
}
