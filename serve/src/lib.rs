//! HTTP server for arbor runs (axum + JSON).
//!
//! Serves `/run`, `/invoke`, `/prompts/resolve`, `/llm/complete`, run history
//! with SSE replay, batch upload, and the experiment queue. On startup the
//! provider registry is populated, stale queue leases are recovered, and the
//! drainer is armed.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`], [`build_state`].

pub mod app;
pub mod batch;
pub mod queue;
pub mod response;
pub mod run;
pub mod runs;
pub mod store;
pub mod upload;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use app::{router, AppState};
use queue::QueueWorker;
use run::RunOnceRunner;
use store::Store;

const DEFAULT_ADDR: &str = "0.0.0.0:8000";

/// Builds the shared state from the environment: `DATABASE_URL` selects the
/// SQLite path (default `arbor.db`).
pub fn build_state() -> Result<Arc<AppState>, store::StoreError> {
    let db_path = std::env::var("DATABASE_URL").unwrap_or_else(|_| "arbor.db".to_string());
    let db_path = db_path
        .strip_prefix("sqlite://")
        .unwrap_or(&db_path)
        .to_string();
    let store = Arc::new(Store::new(&db_path)?);
    let runner = Arc::new(RunOnceRunner::new(Arc::clone(&store)));
    let worker = QueueWorker::new(Arc::clone(&store), runner);
    Ok(Arc::new(AppState { store, worker }))
}

/// Runs the server on an existing listener. Used by tests (bind to
/// `127.0.0.1:0`, then pass the listener).
pub async fn run_serve_on_listener(
    listener: TcpListener,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("arbor API listening on http://{addr}");

    arbor::register_builtin_providers();
    // Startup recovery + drain of anything left in the queue.
    state.worker.ensure_running().await;

    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the server. Listens on `addr` (default `0.0.0.0:8000`, or
/// `ARBOR_ADDR`).
pub async fn run_serve(
    addr: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_addr = std::env::var("ARBOR_ADDR").ok();
    let addr = addr
        .map(String::from)
        .or(env_addr)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let state = build_state()?;
    let listener = TcpListener::bind(&addr).await?;
    run_serve_on_listener(listener, state).await
}
