//! HTTP boundary for the job handler.
//!
//! `POST /runsync` runs one job and returns its result in a queue
//! envelope. Jobs are serialized: the staging directory is shared, so a
//! second request waits until the first has finished.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Instrument, Level};

use crate::handler::JobHandler;

/// A job as delivered by the queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub output: Value,
}

/// Runs jobs one at a time.
pub struct JobRunner {
    handler: JobHandler,
    gate: Mutex<()>,
}

impl JobRunner {
    pub fn new(handler: JobHandler) -> Self {
        Self {
            handler,
            gate: Mutex::new(()),
        }
    }

    pub fn handler(&self) -> &JobHandler {
        &self.handler
    }

    pub async fn run(&self, envelope: JobEnvelope) -> JobResponse {
        let id = envelope
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!("job", job_id = %id);

        let _guard = self.gate.lock().await;
        let result = self.handler.handle(&envelope.input).instrument(span).await;

        let status = if result.is_success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        JobResponse {
            id,
            status,
            output: result.to_value(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub engine_url: String,
    pub profile: String,
}

/// GET /health -- liveness of the worker process. Does not probe the engine.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let handler = state.runner.handler();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine_url: handler.engine_url().to_string(),
        profile: handler.profile().name.clone(),
    })
}

/// POST /runsync -- run one job and wait for its result.
async fn run_sync(State(state): State<AppState>, Json(envelope): Json<JobEnvelope>) -> Json<JobResponse> {
    Json(state.runner.run(envelope).await)
}

/// Build the application router with its middleware stack.
pub fn router(runner: Arc<JobRunner>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/runsync", post(run_sync))
        // Panic recovery: catch panics and return 500.
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(AppState { runner })
}
