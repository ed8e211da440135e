//! HTTP gateway built on axum.

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, rejection::JsonRejection},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::error::ApiError;
use crate::context::AppContext;
use crate::error::IngestError;
use crate::feedback::{FeedbackEntry, FeedbackSummary};
use crate::ingest::IngestJob;
use crate::metrics::MetricsSnapshot;
use crate::types::{AnswerRecord, AnswerRequest, SeverityLevel};

/// Shared state for axum handlers.
pub type SharedContext = Arc<AppContext>;

/// Build the router with every route and middleware layer.
pub fn router(ctx: SharedContext) -> Router {
    let body_limit = ctx.config.server.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/answer", post(answer_handler))
        .route("/upload", post(upload_handler).get(upload_list_handler))
        .route("/upload/{job_id}", get(upload_status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/demo/queries", get(demo_queries_handler))
        .route("/feedback", post(feedback_handler).get(feedback_summary_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Health check endpoint.
async fn health_handler(State(ctx): State<SharedContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "companion_ai_loaded": ctx.orchestrator.is_available(),
        "safety_checker_loaded": ctx.orchestrator.safety_loaded(),
        "timestamp": Local::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.metrics.uptime_secs(),
    }))
}

/// Answer a question. Pipeline failures still yield 200.
async fn answer_handler(
    State(ctx): State<SharedContext>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> Result<Json<AnswerRecord>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let k = request.validate()?;
    let record = ctx
        .orchestrator
        .answer(
            &request.query,
            request.brand.as_deref(),
            request.model.as_deref(),
            k,
        )
        .await;
    Ok(Json(record))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: Uuid,
    pub filename: String,
    pub status: String,
    pub chunks_processed: usize,
    pub processing_time: f64,
}

/// Stage a PDF and queue it for ingestion.
async fn upload_handler(
    State(ctx): State<SharedContext>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let started = Instant::now();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let job = ctx.ingest.submit(&filename, &bytes).await?;
        return Ok(Json(UploadResponse {
            job_id: job.job_id,
            filename: job.filename,
            status: "processing".to_string(),
            chunks_processed: 0,
            processing_time: started.elapsed().as_secs_f64(),
        }));
    }
    Err(IngestError::MissingFile.into())
}

/// Poll an ingestion job.
async fn upload_status_handler(
    State(ctx): State<SharedContext>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<IngestJob>, ApiError> {
    ctx.ingest
        .status(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("upload job {job_id}")))
}

/// Every known ingestion job, oldest first.
async fn upload_list_handler(State(ctx): State<SharedContext>) -> Json<Vec<IngestJob>> {
    Json(ctx.ingest.list().await)
}

/// Live metrics over the recent request window.
async fn metrics_handler(
    State(ctx): State<SharedContext>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    match ctx.metrics.snapshot() {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => {
            tracing::error!(error = %e, "Metrics error");
            Err(e.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct DemoQuery {
    query: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    brand: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'static str>,
    expected_safety: SeverityLevel,
}

const fn demo(query: &'static str, expected_safety: SeverityLevel) -> DemoQuery {
    DemoQuery {
        query,
        brand: None,
        model: None,
        expected_safety,
    }
}

/// Canned queries for the demo UI.
async fn demo_queries_handler() -> impl IntoResponse {
    let safe_queries = [
        DemoQuery {
            query: "My Samsung WF45 won't spin, what does E3 mean?",
            brand: Some("Samsung"),
            model: Some("WF45"),
            expected_safety: SeverityLevel::Safe,
        },
        demo("How to clean lint filter?", SeverityLevel::Safe),
        demo("Dishwasher not draining properly", SeverityLevel::Safe),
    ];
    let safety_queries = [
        demo("I smell gas from the oven", SeverityLevel::Emergency),
        demo("My microwave is sparking", SeverityLevel::Danger),
        demo("Water leaking from washing machine", SeverityLevel::Caution),
    ];
    Json(serde_json::json!({
        "safe_queries": safe_queries,
        "safety_queries": safety_queries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub query: String,
    pub response: String,
    pub helpful: bool,
}

/// Record thumbs up/down on an answer.
async fn feedback_handler(
    State(ctx): State<SharedContext>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let entry = FeedbackEntry {
        timestamp: Utc::now(),
        query: request.query,
        response: request.response,
        helpful: request.helpful,
    };
    ctx.feedback.append(&entry).await?;
    Ok(Json(serde_json::json!({ "status": "recorded" })))
}

async fn feedback_summary_handler(
    State(ctx): State<SharedContext>,
) -> Result<Json<FeedbackSummary>, ApiError> {
    Ok(Json(ctx.feedback.summary().await?))
}

/// Bind and serve until ctrl-c.
pub async fn run(ctx: SharedContext) -> Result<(), std::io::Error> {
    let addr = ctx.config.server.bind_addr();
    let app = router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "CompanionAI API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    ctx.metrics.close_audit();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
