//! Integration tests for the gateway REST API endpoints.

use axum::body::Body;
use companion_core::config::CompanionConfig;
use companion_core::gateway::{SharedContext, gateway_router};
use companion_core::ingest::IngestQueue;
use companion_core::{
    AppContext, GenerationClient, GenerationResult, MetricsAggregator, Pipeline,
    RequestOrchestrator, RetrievalClient, RetrievedChunk, SafetyAssessment, SafetyGate,
    SourceCitation, Stage, StageError,
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct ManualRetrieval;

impl RetrievalClient for ManualRetrieval {
    fn search(&self, _query: &str, k: usize) -> Result<Vec<RetrievedChunk>, StageError> {
        Ok((0..k.min(6))
            .map(|i| RetrievedChunk {
                text: format!("Check the drain pump filter, step {i}."),
                filename: "wf45.pdf".into(),
                page: Some(i as u32 + 10),
                brand: Some("Samsung".into()),
                model: Some("WF45".into()),
                relevance_score: 0.95 - i as f64 * 0.05,
            })
            .collect())
    }
}

struct ManualGeneration;

impl GenerationClient for ManualGeneration {
    fn generate(
        &self,
        _query: &str,
        chunks: &[RetrievedChunk],
        _brand: Option<&str>,
        _model: Option<&str>,
    ) -> Result<GenerationResult, StageError> {
        Ok(GenerationResult {
            answer: "E3 means a drainage error. Clean the pump filter.".into(),
            confidence_score: 0.88,
            sources: chunks.iter().map(SourceCitation::from).collect(),
            safety: SafetyAssessment::safe(),
        })
    }
}

struct FailingGeneration;

impl GenerationClient for FailingGeneration {
    fn generate(
        &self,
        _query: &str,
        _chunks: &[RetrievedChunk],
        _brand: Option<&str>,
        _model: Option<&str>,
    ) -> Result<GenerationResult, StageError> {
        Err(StageError::failed(Stage::Generation, "CUDA out of memory"))
    }
}

fn make_context(
    dir: &TempDir,
    generation: Option<Arc<dyn GenerationClient>>,
) -> SharedContext {
    let mut config = CompanionConfig::default();
    config.ingest.staging_dir = dir.path().join("uploads");
    config.feedback.log_path = dir.path().join("data").join("feedback.jsonl");
    config.metrics.audit_log_path = Some(dir.path().join("logs").join("api_metrics.jsonl"));

    let pipeline = generation.map(|g| Pipeline::new(Arc::new(ManualRetrieval), g));
    let orchestrator = RequestOrchestrator::new(
        SafetyGate::keyword(),
        pipeline,
        Arc::new(MetricsAggregator::new(&config.metrics)),
        config.safety.precedence,
    );
    let (ingest, _worker) = IngestQueue::spawn(&config.ingest, None);
    Arc::new(AppContext::from_parts(config, orchestrator, ingest))
}

fn make_request(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn make_post_request(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn make_upload_request(filename: &str, content: &[u8]) -> axum::http::Request<Body> {
    let boundary = "companion-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    axum::http::Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(
    ctx: SharedContext,
    req: axum::http::Request<Body>,
) -> (axum::http::StatusCode, serde_json::Value) {
    let app = gateway_router(ctx);
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 100_000)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

// --- /answer ---

#[tokio::test]
async fn test_answer_success() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, Some(Arc::new(ManualGeneration)));
    let (status, json) = send(
        ctx,
        make_post_request(
            "/answer",
            serde_json::json!({
                "query": "My Samsung WF45 won't spin, what does E3 mean?",
                "brand": "Samsung",
                "model": "WF45",
                "k": 4
            }),
        ),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(json["safety_flag"], false);
    assert_eq!(json["safety_level"], "safe");
    assert_eq!(json["chunks_used"], 4);
    assert_eq!(json["sources"].as_array().unwrap().len(), 4);
    assert_eq!(json["sources"][0]["page"], 10);
    assert_eq!(json["confidence_score"], 0.88);
    assert!(json["processing_time"].as_f64().unwrap() >= 0.0);
    assert!(json.get("safety_time").is_none());
}

#[tokio::test]
async fn test_answer_degraded_when_unconfigured() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    let (status, json) = send(
        ctx,
        make_post_request("/answer", serde_json::json!({"query": "I smell gas from the oven"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(
        json["answer"],
        "System is initializing. Please try again in a moment."
    );
    assert_eq!(json["safety_level"], "emergency");
    assert_eq!(json["safety_flag"], true);
    assert_eq!(json["confidence_score"], 0.0);
    assert_eq!(json["chunks_used"], 0);
}

#[tokio::test]
async fn test_answer_error_fallback_is_200() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, Some(Arc::new(FailingGeneration)));
    let (status, json) = send(
        ctx.clone(),
        make_post_request("/answer", serde_json::json!({"query": "My microwave is sparking"})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(
        json["answer"],
        "I apologize, but I encountered an error processing your request. Please try again."
    );
    assert_eq!(json["safety_flag"], false);
    assert_eq!(json["confidence_score"], 0.0);
    assert_eq!(ctx.metrics.snapshot().unwrap().total_queries, 1);
}

#[tokio::test]
async fn test_answer_rejects_k_out_of_range() {
    let dir = TempDir::new().unwrap();
    for k in [0, 21, -3] {
        let ctx = make_context(&dir, Some(Arc::new(ManualGeneration)));
        let (status, json) = send(
            ctx.clone(),
            make_post_request("/answer", serde_json::json!({"query": "noise", "k": k})),
        )
        .await;
        assert_eq!(status, 400, "k = {k}");
        assert_eq!(json["error"], "bad_request");
        assert_eq!(ctx.metrics.snapshot().unwrap().total_queries, 0);
    }
}

#[tokio::test]
async fn test_answer_rejects_empty_query() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, Some(Arc::new(ManualGeneration)));
    let (status, json) = send(
        ctx,
        make_post_request("/answer", serde_json::json!({"query": "   "})),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(json["message"], "Query must not be empty");
}

// --- /metrics ---

#[tokio::test]
async fn test_metrics_empty() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    let (status, json) = send(ctx, make_request("/metrics")).await;
    assert_eq!(status, 200);
    assert_eq!(json["total_queries"], 0);
    assert_eq!(json["avg_response_time"], 0.0);
    assert_eq!(json["precision_at_5"], 0.0);
    assert_eq!(json["safety_alerts_triggered"], 0);
}

#[tokio::test]
async fn test_metrics_after_requests() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    for query in ["I smell gas from the oven", "How to clean lint filter?"] {
        let (status, _) = send(
            ctx.clone(),
            make_post_request("/answer", serde_json::json!({"query": query})),
        )
        .await;
        assert_eq!(status, 200);
    }
    let (status, json) = send(ctx.clone(), make_request("/metrics")).await;
    assert_eq!(status, 200);
    assert_eq!(json["total_queries"], 2);
    assert_eq!(json["safety_alerts_triggered"], 1);
    assert_eq!(json["precision_at_5"], 0.85);

    ctx.metrics.close_audit();
    let audit = std::fs::read_to_string(dir.path().join("logs").join("api_metrics.jsonl")).unwrap();
    assert_eq!(audit.lines().count(), 2);
}

// --- /health and /demo/queries ---

#[tokio::test]
async fn test_health_reports_pipeline() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, Some(Arc::new(ManualGeneration)));
    let (status, json) = send(ctx, make_request("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(json["companion_ai_loaded"], true);
    assert_eq!(json["safety_checker_loaded"], true);
    assert!(json["timestamp"].is_string());
    assert!(json["uptime_secs"].is_u64());
}

#[tokio::test]
async fn test_demo_queries_levels() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    let (_, json) = send(ctx, make_request("/demo/queries")).await;
    let levels: Vec<_> = json["safety_queries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["expected_safety"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(levels, vec!["emergency", "danger", "caution"]);
}

// --- /upload ---

#[tokio::test]
async fn test_upload_pdf_is_queued() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    let (status, json) = send(ctx.clone(), make_upload_request("wf45.pdf", b"%PDF-1.4 test")).await;
    assert_eq!(status, 200);
    assert_eq!(json["filename"], "wf45.pdf");
    assert_eq!(json["status"], "processing");
    assert_eq!(json["chunks_processed"], 0);

    let job_id = json["job_id"].as_str().unwrap().to_string();
    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        let (status, job) = send(ctx.clone(), make_request(&format!("/upload/{job_id}"))).await;
        assert_eq!(status, 200);
        last = job;
        if last["status"] == "failed" || last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    // No ingestion backend is configured in this context.
    assert_eq!(last["status"], "failed");

    let (status, jobs) = send(ctx, make_request("/upload")).await;
    assert_eq!(status, 200);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["job_id"], job_id.as_str());
}

#[tokio::test]
async fn test_upload_rejects_non_pdf() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    let (status, json) = send(ctx, make_upload_request("manual.docx", b"PK")).await;
    assert_eq!(status, 400);
    assert_eq!(json["message"], "Only PDF files are supported");
}

// --- /feedback ---

#[tokio::test]
async fn test_feedback_roundtrip() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir, None);
    for helpful in [true, false, true, true] {
        let (status, json) = send(
            ctx.clone(),
            make_post_request(
                "/feedback",
                serde_json::json!({
                    "query": "How to clean lint filter?",
                    "response": "Pull the screen out and brush it.",
                    "helpful": helpful
                }),
            ),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(json["status"], "recorded");
    }
    let (status, json) = send(ctx, make_request("/feedback")).await;
    assert_eq!(status, 200);
    assert_eq!(json["total"], 4);
    assert_eq!(json["helpful"], 3);
    assert_eq!(json["satisfaction_rate"], 0.75);
    assert_eq!(json["recent"][0]["helpful"], true);

    let log = std::fs::read_to_string(dir.path().join("data").join("feedback.jsonl")).unwrap();
    let first: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert!(first.get("timestamp").is_some());
    assert_eq!(first["helpful"], true);
}
