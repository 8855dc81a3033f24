//! Experiment queue worker: a single in-process drainer with lease-and-
//! complete discipline and stale-lease recovery.
//!
//! At-least-once semantics: a run interrupted by a crash is retried after the
//! stale timeout, so queued runs must tolerate duplicate external side
//! effects.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::store::Store;

/// Lease older than this is considered dead and re-queued.
pub const STALE_LEASE_MS: i64 = 5 * 60 * 1000;

/// Outcome summary of one drained item.
#[derive(Clone, Debug)]
pub struct QueueRunSummary {
    pub succeeded: bool,
    pub status: String,
    pub trace_id: Option<String>,
    pub error: Option<String>,
}

/// Executes one queued run request. The production runner drives the same
/// run-once path as `POST /run`; tests substitute a stub.
#[async_trait]
pub trait QueueRunner: Send + Sync {
    async fn run(&self, payload: Value) -> QueueRunSummary;
}

/// The process-wide drainer. At most one drain task runs at a time, guarded
/// by the handle mutex; `ensure_running` is called on startup and after every
/// enqueue.
pub struct QueueWorker {
    store: Arc<Store>,
    runner: Arc<dyn QueueRunner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueWorker {
    pub fn new(store: Arc<Store>, runner: Arc<dyn QueueRunner>) -> Arc<Self> {
        Arc::new(Self {
            store,
            runner,
            handle: Mutex::new(None),
        })
    }

    /// (Re)starts the drainer unless one is already running. Recovers stale
    /// leases first, so rows orphaned by a crashed process become eligible
    /// again before the drain starts.
    pub async fn ensure_running(self: &Arc<Self>) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        match self.store.recover_stale(STALE_LEASE_MS).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("recovered {n} stale queue leases"),
            Err(e) => tracing::warn!("stale lease recovery failed: {e}"),
        }
        let worker = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            worker.drain().await;
            // Clear the handle so the next enqueue re-arms the drainer even
            // after a crash inside drain().
            let mut guard = worker.handle.lock().await;
            *guard = None;
        }));
    }

    async fn drain(&self) {
        loop {
            let row = match self.store.lease_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("queue lease failed: {e}");
                    break;
                }
            };
            tracing::info!(
                experiment = %row.experiment_id,
                item = row.item_index,
                iteration = row.iteration,
                "draining queue item"
            );
            let summary = self.runner.run(row.payload.clone()).await;
            let result = json!({
                "item_index": row.item_index,
                "iteration": row.iteration,
                "trace_id": summary.trace_id,
                "status": summary.status,
            });
            if let Err(e) = self
                .store
                .mark_completed(row.id, summary.succeeded, summary.error.as_deref(), Some(&result))
                .await
            {
                tracing::warn!("queue completion update failed: {e}");
            }
            tokio::task::yield_now().await;
        }
    }
}
