//! # HTTP Gateway
//!
//! JSON API over the answer pipeline: answers, health, uploads and their
//! ingestion status, live metrics, demo fixtures, and user feedback.

mod error;
mod server;

pub use error::{ApiError, ErrorResponse};
pub use server::{
    FeedbackRequest, SharedContext, UploadResponse, router as gateway_router, run as run_gateway,
};
