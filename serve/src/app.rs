//! Axum app: shared state, CORS, and the route table.

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::queue::QueueWorker;
use crate::store::Store;
use crate::{batch, run, runs};

/// Shared per-process state: the SQLite store and the queue worker handle.
pub struct AppState {
    pub store: Arc<Store>,
    pub worker: Arc<QueueWorker>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn cors_layer() -> CorsLayer {
    let origins = std::env::var("CORS_ALLOW_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    let allow_origin = if origins.trim() == "*" || parsed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run::run_once))
        .route("/invoke", post(run::invoke))
        .route("/prompts/resolve", post(run::resolve_prompt))
        .route("/llm/complete", post(run::llm_complete))
        .route("/runs", get(runs::list_runs))
        .route("/runs/:run_id", get(runs::get_run))
        .route("/runs/:run_id/stream", get(runs::stream_run))
        .route("/run-batch/upload", post(batch::upload_batch))
        .route("/run-batch", post(batch::run_batch))
        .route("/experiments", get(batch::list_experiments))
        .route("/experiments/:experiment_id", get(batch::get_experiment))
        .layer(cors_layer())
        .with_state(state)
}
