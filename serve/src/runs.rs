//! Run history endpoints: listing, detail, and SSE replay of step envelopes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::response::ApiError;
use crate::store::RunRow;

/// Projects a stored run into the wire snapshot:
/// `{traceId, graphVersionId, steps, metadata}`.
pub fn run_record_to_snapshot(record: &RunRow, include_steps: bool) -> Value {
    let mut envelopes: Vec<Value> = Vec::new();
    if include_steps {
        if let Some(events) = record.response_payload.get("step_events").and_then(Value::as_array)
        {
            for (idx, env) in events.iter().enumerate() {
                let Some(env) = env.as_object() else {
                    continue;
                };
                let Some(step) = env.get("step").filter(|s| s.is_object()) else {
                    continue;
                };
                envelopes.push(json!({
                    "traceId": record.run_id,
                    "seq": env.get("seq").and_then(Value::as_u64).unwrap_or(idx as u64),
                    "t": env.get("t").and_then(Value::as_i64).unwrap_or(0),
                    "step": step,
                }));
            }
        }
    }

    let mut metadata = json!({
        "created_at_ms": record.created_at_ms,
        "status": record.status,
        "network_id": record.network_id,
        "network_version_id": record.network_version_id,
        "graph_version_key": record.graph_version_key,
        "user_message": record.user_message,
        "system_params": record.response_payload.get("system_params"),
    });
    if let Some(final_payload) = record.response_payload.get("final") {
        metadata["final"] = final_payload.clone();
    }

    json!({
        "traceId": record.run_id,
        "graphVersionId": record.graph_version_key,
        "steps": envelopes,
        "metadata": metadata,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = state.store.list_runs(query.limit.unwrap_or(20)).await?;
    let snapshots: Vec<Value> = records
        .iter()
        .map(|rec| run_record_to_snapshot(rec, false))
        .collect();
    Ok(Json(Value::Array(snapshots)))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("run not found"))?;
    Ok(Json(run_record_to_snapshot(&record, true)))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub from_seq: Option<u64>,
}

/// Replays a stored run's step envelopes as Server-Sent Events, one
/// `run.step` event per envelope, optionally from a given sequence number.
pub async fn stream_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let record = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("run not found"))?;
    let snapshot = run_record_to_snapshot(&record, true);
    let from_seq = query.from_seq.unwrap_or(0);
    let envelopes: Vec<Value> = snapshot["steps"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|env| env.get("seq").and_then(Value::as_u64).unwrap_or(0) >= from_seq)
        .collect();

    let stream = stream::iter(envelopes.into_iter().map(|env| {
        Ok(Event::default().event("run.step").data(env.to_string()))
    }));
    Ok(Sse::new(stream))
}
