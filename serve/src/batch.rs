//! Batch endpoints: upload parsing, experiment registration + enqueue, and
//! experiment status queries.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use arbor::ids::opaque_id;
use arbor::CompiledGraph;

use crate::app::AppState;
use crate::response::ApiError;
use crate::run::{resolve_graph, RunOnceRequest};
use crate::store::QueueItemInsert;
use crate::upload::parse_upload;

/// `POST /run-batch/upload`: parse a CSV or JSONL file (extension-based) and
/// return the parsed items with warnings, errors, and the column contract.
/// Nothing is queued.
pub async fn upload_batch(mut multipart: Multipart) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let Some(filename) = field.file_name().map(String::from) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;
        let report =
            parse_upload(&filename, &bytes).map_err(|e| ApiError::bad_request(e.to_string()))?;
        return Ok(Json(report.to_value()));
    }
    Err(ApiError::bad_request("no file field in multipart body"))
}

/// One experiment item: how many runs, and the per-run overrides.
#[derive(Clone, Debug, Deserialize, serde::Serialize)]
pub struct BatchItem {
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Body of `POST /run-batch`.
#[derive(Debug, Deserialize)]
pub struct RunBatchRequest {
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub experiment_desc: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub snapshot: Option<CompiledGraph>,
    #[serde(default)]
    pub agent_key: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub user_message: Option<String>,
    pub items: Vec<BatchItem>,
}

/// Registers an experiment and enqueues `sum(iterations)` runs, then kicks
/// the worker.
pub async fn run_batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunBatchRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.items.is_empty() {
        return Err(ApiError::bad_request("items must not be empty"));
    }
    // Fail fast on an unresolvable target before anything is queued.
    resolve_graph(
        &state.store,
        payload.network.as_deref(),
        payload.snapshot.clone(),
        payload.version,
    )
    .await?;

    let experiment_id = payload
        .experiment_id
        .clone()
        .unwrap_or_else(opaque_id);

    let mut inserts: Vec<QueueItemInsert> = Vec::new();
    for (item_index, item) in payload.items.iter().enumerate() {
        if item.iterations < 1 {
            return Err(ApiError::bad_request(format!(
                "items[{item_index}].iterations must be >= 1"
            )));
        }
        let user_message = item
            .user_message
            .clone()
            .or_else(|| payload.user_message.clone())
            .ok_or_else(|| {
                ApiError::bad_request(format!("items[{item_index}] has no user_message"))
            })?;
        for iteration in 1..=i64::from(item.iterations) {
            let request = RunOnceRequest {
                network: payload.network.clone(),
                agent_key: payload.agent_key.clone(),
                user_message: user_message.clone(),
                version: payload.version,
                system_params: item.system_params.clone(),
                model: payload.model.clone(),
                debug: payload.debug,
                snapshot: payload.snapshot.clone(),
                max_steps: payload.max_steps,
                experiment_id: Some(experiment_id.clone()),
                experiment_desc: payload.experiment_desc.clone(),
                experiment_item_index: Some(item_index as i64),
                experiment_iteration: Some(iteration),
                experiment_item_payload: serde_json::to_value(item).ok(),
            };
            inserts.push(QueueItemInsert {
                experiment_id: experiment_id.clone(),
                item_index: item_index as i64,
                iteration,
                payload: serde_json::to_value(&request)
                    .map_err(|e| ApiError::internal(e.to_string()))?,
            });
        }
    }
    let total_runs = inserts.len();

    state
        .store
        .insert_experiment(
            &experiment_id,
            payload.experiment_desc.as_deref(),
            &json!({
                "network": payload.network,
                "agent_key": payload.agent_key,
                "version": payload.version,
                "model": payload.model,
                "max_steps": payload.max_steps,
                "items": payload.items,
                "total_runs": total_runs,
            }),
        )
        .await?;
    state.store.enqueue_items(inserts).await?;
    state.worker.ensure_running().await;

    Ok(Json(json!({
        "experiment_id": experiment_id,
        "queued": true,
        "total_runs": total_runs,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListExperimentsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /experiments`: summaries with per-status queue counts.
pub async fn list_experiments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListExperimentsQuery>,
) -> Result<Json<Value>, ApiError> {
    let experiments = state.store.list_experiments(query.limit.unwrap_or(50)).await?;
    let mut out = Vec::new();
    for exp in experiments {
        let counts = state
            .store
            .queue_counts_for_experiment(&exp.experiment_id)
            .await?;
        let mut by_status = Map::new();
        for (status, count) in counts {
            by_status.insert(status, json!(count));
        }
        out.push(json!({
            "experiment_id": exp.experiment_id,
            "description": exp.description,
            "created_at_ms": exp.created_at_ms,
            "queue": by_status,
        }));
    }
    Ok(Json(Value::Array(out)))
}

/// `GET /experiments/{id}`: the experiment plus its per-item queue status.
pub async fn get_experiment(
    State(state): State<Arc<AppState>>,
    Path(experiment_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let experiment = state
        .store
        .get_experiment(&experiment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("experiment not found"))?;
    let rows = state.store.queue_rows_for_experiment(&experiment_id).await?;
    let items: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "item_index": row.item_index,
                "iteration": row.iteration,
                "status": row.status,
                "enqueued_at_ms": row.enqueued_at_ms,
                "started_at_ms": row.started_at_ms,
                "completed_at_ms": row.completed_at_ms,
                "error": row.error,
                "result": row.result,
            })
        })
        .collect();
    Ok(Json(json!({
        "experiment_id": experiment.experiment_id,
        "description": experiment.description,
        "payload": experiment.payload,
        "created_at_ms": experiment.created_at_ms,
        "items": items,
    })))
}
