//! Run execution endpoints: `/run`, `/invoke`, `/prompts/resolve`,
//! `/llm/complete`, plus the run-once path the queue worker drains through.
//!
//! The engine is synchronous; every call into it goes through
//! `spawn_blocking` so the HTTP event loop stays responsive.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use arbor::ids::{now_ms, opaque_id};
use arbor::orchestrator::Instruction;
use arbor::run_config::GraphConfigSource;
use arbor::{
    build_run_config, execute_instruction, merge_with_defaults, prompts, run_loop,
    CompiledGraph, GeminiDecider, RunOptions,
};

use crate::app::AppState;
use crate::queue::{QueueRunSummary, QueueRunner};
use crate::response::ApiError;
use crate::store::{RunRow, Store};

/// Body of `POST /run` (and of each queued experiment item). Exactly one of
/// `network` or `snapshot` must be present.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunOnceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_key: Option<String>,
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<CompiledGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_item_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_iteration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_item_payload: Option<Value>,
}

/// A resolved compiled graph plus its persistence identifiers.
pub struct GraphBundle {
    pub graph: CompiledGraph,
    pub network_id: Option<i64>,
    pub network_version_id: Option<i64>,
    pub graph_version_key: Option<String>,
}

/// Resolves the run target: an inline snapshot (validated) or a published
/// `(network, version)` from the store.
pub async fn resolve_graph(
    store: &Store,
    network: Option<&str>,
    snapshot: Option<CompiledGraph>,
    version: Option<i64>,
) -> Result<GraphBundle, ApiError> {
    match (network, snapshot) {
        (None, None) | (Some(_), Some(_)) => Err(ApiError::bad_request(
            "Provide exactly one of 'network' or 'snapshot'",
        )),
        (None, Some(graph)) => {
            graph
                .validate()
                .map_err(|e| ApiError::bad_request(format!("invalid snapshot: {e}")))?;
            let graph_version_key = graph.version_id.map(|v| v.to_string());
            Ok(GraphBundle {
                network_version_id: graph.version_id,
                graph_version_key,
                network_id: None,
                graph,
            })
        }
        (Some(network), None) => {
            let row = store
                .load_snapshot(network, version)
                .await?
                .ok_or_else(|| match version {
                    Some(v) => ApiError::not_found(format!(
                        "Version {v} not found for network '{network}'"
                    )),
                    None => ApiError::not_found(format!(
                        "Network '{network}' not found or has no published version"
                    )),
                })?;
            let graph: CompiledGraph = serde_json::from_value(row.compiled_graph.clone())
                .map_err(|e| ApiError::internal(format!("corrupt snapshot: {e}")))?;
            Ok(GraphBundle {
                network_id: Some(row.network_id),
                network_version_id: graph.version_id.or(Some(row.version)),
                graph_version_key: Some(row.graph_version_key()),
                graph,
            })
        }
    }
}

fn default_model() -> String {
    std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string())
}

fn debug_forced() -> bool {
    std::env::var("DEBUG")
        .map(|v| {
            let v = v.trim().to_lowercase();
            !v.is_empty() && v != "0" && v != "false"
        })
        .unwrap_or(false)
}

fn stamp_step_events(out: &mut Value, run_id: &str) {
    let Some(events) = out.get_mut("step_events").and_then(Value::as_array_mut) else {
        return;
    };
    for (idx, env) in events.iter_mut().enumerate() {
        let Some(env) = env.as_object_mut() else {
            continue;
        };
        env.entry("traceId").or_insert_with(|| json!(run_id));
        env.entry("seq").or_insert_with(|| json!(idx));
        if env.get("t").map(Value::is_null).unwrap_or(true) {
            env.insert("t".to_string(), json!(now_ms()));
        }
    }
}

fn write_run_file(run_id: &str, record: &Value) {
    let dir = PathBuf::from("logs").join("runs");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::debug!("run file dir: {e}");
        return;
    }
    let path = dir.join(format!("run_{}_{run_id}.json", now_ms()));
    match serde_json::to_string_pretty(record) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&path, text) {
                tracing::debug!("run file write: {e}");
            }
        }
        Err(e) => tracing::debug!("run file encode: {e}"),
    }
}

/// Executes one run request end to end: resolve the snapshot, run the engine
/// on a worker thread, decorate the artifact, persist the run record
/// (best-effort), and return the full artifact.
pub async fn execute_run_request(
    store: &Arc<Store>,
    payload: RunOnceRequest,
) -> Result<Value, ApiError> {
    let run_started_at_ms = now_ms();
    let run_id = opaque_id();
    let merged = merge_with_defaults(payload.system_params.as_ref());

    let mut request_payload = serde_json::to_value(&payload).unwrap_or(Value::Null);
    if let Some(obj) = request_payload.as_object_mut() {
        obj.insert("system_params".to_string(), Value::Object(merged.clone()));
        obj.insert("trace_id".to_string(), json!(run_id));
    }

    let bundle = resolve_graph(
        store,
        payload.network.as_deref(),
        payload.snapshot.clone(),
        payload.version,
    )
    .await?;

    let default_agent = payload
        .agent_key
        .clone()
        .or_else(|| bundle.graph.default_agent_key.clone())
        .ok_or_else(|| {
            ApiError::bad_request("No default agent in snapshot and no agent_key provided")
        })?;
    let default_agent = bundle
        .graph
        .agent(&default_agent)
        .map(|a| a.key.clone())
        .ok_or_else(|| ApiError::not_found(format!("Agent '{default_agent}' not in snapshot")))?;

    let model_used = payload.model.clone().unwrap_or_else(default_model);
    let opts = RunOptions {
        max_steps: payload.max_steps.unwrap_or(10).max(1),
        model: payload.model.clone(),
        debug: payload.debug || debug_forced(),
    };

    let graph = bundle.graph;
    let user_message = payload.user_message.clone();
    let merged_for_run = merged.clone();
    // The blocking HTTP client must live on the worker thread, so the
    // decider is built inside the closure as well.
    let artifact = tokio::task::spawn_blocking(move || {
        let decider = GeminiDecider::from_env()?;
        let source = GraphConfigSource::new(&graph, merged_for_run);
        Ok::<_, arbor::DecideError>(run_loop(
            &source,
            &default_agent,
            &user_message,
            &decider,
            &opts,
        ))
    })
    .await
    .map_err(|e| ApiError::internal(format!("run task failed: {e}")))?
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut out = artifact.to_value();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("trace_id".to_string(), json!(run_id));
        if let Some(key) = &bundle.graph_version_key {
            obj.insert("graph_version_id".to_string(), json!(key));
        }
        obj.insert("network_id".to_string(), json!(bundle.network_id));
        obj.insert("system_params".to_string(), Value::Object(merged));
        obj.insert("model".to_string(), json!(model_used));
    }
    stamp_step_events(&mut out, &run_id);

    let status = out["final"]["status"].as_str().unwrap_or("unknown").to_string();
    let row = RunRow {
        run_id: run_id.clone(),
        network_id: bundle.network_id,
        network_version_id: bundle.network_version_id,
        graph_version_key: bundle.graph_version_key.clone(),
        user_message: Some(payload.user_message.clone()),
        status,
        request_payload: request_payload.clone(),
        response_payload: out.clone(),
        experiment_id: payload.experiment_id.clone(),
        experiment_desc: payload.experiment_desc.clone(),
        experiment_item_index: payload.experiment_item_index,
        experiment_iteration: payload.experiment_iteration,
        experiment_item_payload: payload.experiment_item_payload.clone(),
        created_at_ms: run_started_at_ms,
    };
    if let Err(e) = store.insert_run(row).await {
        // Persistence failure never blocks the response.
        tracing::warn!("run record persist failed: {e}");
    }

    write_run_file(
        &run_id,
        &json!({
            "run_id": run_id,
            "started_at_ms": run_started_at_ms,
            "duration_ms": now_ms() - run_started_at_ms,
            "request": request_payload,
            "response": out,
        }),
    );

    Ok(out)
}

pub async fn run_once(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunOnceRequest>,
) -> Result<Json<Value>, ApiError> {
    let out = execute_run_request(&state.store, payload).await?;
    Ok(Json(out))
}

/// Body of `POST /invoke`: one pre-formed instruction against one agent.
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub instruction: Value,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub snapshot: Option<CompiledGraph>,
    pub agent_key: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default = "default_true")]
    pub allow_respond: bool,
    #[serde(default)]
    pub system_params: Option<Map<String, Value>>,
}

fn default_true() -> bool {
    true
}

pub async fn invoke(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InvokeRequest>,
) -> Result<Json<Value>, ApiError> {
    let bundle = resolve_graph(
        &state.store,
        payload.network.as_deref(),
        payload.snapshot.clone(),
        payload.version,
    )
    .await?;
    let instr: Instruction = serde_json::from_value(payload.instruction.clone())
        .map_err(|e| ApiError::bad_request(format!("invalid instruction: {e}")))?;
    let merged = merge_with_defaults(payload.system_params.as_ref());
    let cfg = build_run_config(&bundle.graph, &payload.agent_key, payload.allow_respond, merged)
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let result = tokio::task::spawn_blocking(move || execute_instruction(&instr, &cfg))
        .await
        .map_err(|e| ApiError::internal(format!("invoke task failed: {e}")))?;
    Ok(Json(json!({
        "trace_id": Value::Null,
        "result": result,
    })))
}

/// Body of `POST /prompts/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolvePromptRequest {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub snapshot: Option<CompiledGraph>,
    #[serde(default)]
    pub agent_key: Option<String>,
    pub user_message: String,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Returns the exact prompt the given agent would see at step 0.
pub async fn resolve_prompt(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResolvePromptRequest>,
) -> Result<Json<Value>, ApiError> {
    let bundle = resolve_graph(
        &state.store,
        payload.network.as_deref(),
        payload.snapshot.clone(),
        payload.version,
    )
    .await?;
    let agent_key = payload
        .agent_key
        .clone()
        .or_else(|| bundle.graph.default_agent_key.clone())
        .ok_or_else(|| {
            ApiError::bad_request("No default agent in snapshot and no agent_key provided")
        })?;
    let cfg = build_run_config(&bundle.graph, &agent_key, true, Map::new())
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let log = arbor::ExecutionLog::new();
    let tool_defs = prompts::build_tool_definitions(&cfg);
    let route_defs = prompts::build_route_definitions(&cfg);
    let constraints = prompts::build_constraints(&cfg);
    let context = prompts::build_context(&payload.user_message, &log, &[], None);
    let prompt = prompts::build_prompt(
        cfg.prompt.as_deref(),
        &tool_defs,
        &route_defs,
        &constraints,
        &context,
    );
    Ok(Json(json!({
        "agent_key": cfg.current_agent,
        "prompt": prompt,
    })))
}

/// Body of `POST /llm/complete`.
#[derive(Debug, Deserialize)]
pub struct LlmCompleteRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Connectivity probe: plain-text completion through the configured LLM.
pub async fn llm_complete(
    Json(payload): Json<LlmCompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let model = payload.model.clone().unwrap_or_else(default_model);
    let text = tokio::task::spawn_blocking(move || {
        let decider = GeminiDecider::from_env()?;
        decider.complete(&payload.prompt, payload.model.as_deref())
    })
    .await
    .map_err(|e| ApiError::internal(format!("llm task failed: {e}")))?
    .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "model": model, "text": text })))
}

/// Queue runner that drives queued payloads through the same run-once path
/// as `POST /run`.
pub struct RunOnceRunner {
    store: Arc<Store>,
}

impl RunOnceRunner {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueRunner for RunOnceRunner {
    async fn run(&self, payload: Value) -> QueueRunSummary {
        let request: RunOnceRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                return QueueRunSummary {
                    succeeded: false,
                    status: "error".to_string(),
                    trace_id: None,
                    error: Some(format!("invalid queue payload: {e}")),
                };
            }
        };
        match execute_run_request(&self.store, request).await {
            Ok(out) => {
                let status = out["final"]["status"].as_str().unwrap_or("unknown").to_string();
                QueueRunSummary {
                    succeeded: status == "ok",
                    status: status.clone(),
                    trace_id: out["trace_id"].as_str().map(String::from),
                    error: (status != "ok")
                        .then(|| out["final"]["error"].as_str().map(String::from))
                        .flatten(),
                }
            }
            Err(e) => QueueRunSummary {
                succeeded: false,
                status: "error".to_string(),
                trace_id: None,
                error: Some(e.detail),
            },
        }
    }
}
