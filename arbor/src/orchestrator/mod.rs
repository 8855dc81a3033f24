//! Instruction executor: gate a single chosen action against the active
//! agent's `RunConfig` and carry it out.
//!
//! The only side effect lives behind the tool provider invoked for
//! `USE_TOOL`; everything else is a pure translation into an
//! [`OrchestratorResult`]. Task groups are scheduled by the engine, not here.

pub mod decision;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::graph::{CompiledTool, ParamSource};
use crate::run_config::RunConfig;
use crate::secrets::resolve_secret;
use crate::tools::{provider_for, ToolInput};

/// Retry policy for one task-group child.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
        }
    }
}

/// One delegated sub-run: which agent, what assignment, how many steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegationDetails {
    pub agent_key: String,
    pub assignment: String,
    #[serde(default)]
    pub context_overrides: Map<String, Value>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_max_steps() -> u32 {
    1
}

/// A tool invocation inside a task group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UseToolTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_params: Map<String, Value>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// An agent delegation inside a task group. Multiple details run
/// sequentially; failure of any aborts the task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegateAgentTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub delegation_details: Vec<DelegationDetails>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// One child of a task group, tagged by `task_type` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum GroupTask {
    UseTool(UseToolTask),
    DelegateAgent(DelegateAgentTask),
}

impl GroupTask {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::UseTool(t) => t.task_id.as_deref(),
            Self::DelegateAgent(t) => t.task_id.as_deref(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::UseTool(t) => t.retry_policy,
            Self::DelegateAgent(t) => t.retry_policy,
        }
    }

    pub fn task_type(&self) -> &'static str {
        match self {
            Self::UseTool(_) => "use_tool",
            Self::DelegateAgent(_) => "delegate_agent",
        }
    }
}

/// The TASK_GROUP action body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskGroupAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub tasks: Vec<GroupTask>,
}

/// The validated action chosen by an LLM decision: exactly one of five kinds,
/// tagged by `type` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "USE_TOOL")]
    UseTool {
        tool_name: String,
        #[serde(default)]
        tool_params: Map<String, Value>,
    },
    #[serde(rename = "ROUTE_TO_AGENT")]
    RouteToAgent {
        target_agent_name: String,
        #[serde(default)]
        context: Map<String, Value>,
    },
    #[serde(rename = "RESPOND")]
    Respond { payload: Value },
    #[serde(rename = "TASK_GROUP")]
    TaskGroup(TaskGroupAction),
    #[serde(rename = "TASK_RESPOND")]
    TaskRespond { payload: Value },
}

impl Action {
    /// The wire discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UseTool { .. } => "USE_TOOL",
            Self::RouteToAgent { .. } => "ROUTE_TO_AGENT",
            Self::Respond { .. } => "RESPOND",
            Self::TaskGroup(_) => "TASK_GROUP",
            Self::TaskRespond { .. } => "TASK_RESPOND",
        }
    }
}

/// A validated decision: reasoning plus exactly one action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instruction {
    pub reasoning: String,
    pub action: Action,
}

/// Result status of executing one instruction. `retry` means the gate
/// rejected the decision; the step loop treats that as terminal for the run
/// (only task-group children retry).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    #[default]
    Ok,
    NotImplemented,
    Retry,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotImplemented => "not_implemented",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

/// Outcome of one executed instruction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestratorResult {
    pub fn ok(response: Value) -> Self {
        Self {
            status: ResultStatus::Ok,
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Retry,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn route_to(next_agent: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::NotImplemented,
            next_agent: Some(next_agent.into()),
            ..Default::default()
        }
    }
}

fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid schema: {e}"))?;
    validator.validate(instance).map_err(|e| e.to_string())
}

/// Merges agent-supplied tool params with the schema's system/const entries.
///
/// Order matters: agent-supplied system params are rejected before anything
/// else, then required agent params are checked, system values injected,
/// defaults applied, and finally the **raw** agent params are validated
/// against the tool's agent-facing JSON Schema.
pub fn merge_tool_params(
    tool: &CompiledTool,
    agent_params: &Map<String, Value>,
    system_params: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let mut offending: Vec<&str> = tool
        .params_schema
        .iter()
        .filter(|(name, spec)| {
            spec.source == ParamSource::System && agent_params.contains_key(*name)
        })
        .map(|(name, _)| name.as_str())
        .collect();
    offending.sort_unstable();
    if !offending.is_empty() {
        return Err(format!(
            "system_params_not_allowed: agent may not set {offending:?}"
        ));
    }

    let mut missing: Vec<&str> = tool
        .params_schema
        .iter()
        .filter(|(name, spec)| {
            spec.source == ParamSource::Agent
                && spec.required
                && !agent_params.contains_key(*name)
        })
        .map(|(name, _)| name.as_str())
        .collect();
    missing.sort_unstable();
    if !missing.is_empty() {
        return Err(format!("missing_required_params: {missing:?}"));
    }

    let mut merged = agent_params.clone();
    for (name, spec) in &tool.params_schema {
        if spec.source != ParamSource::System {
            continue;
        }
        match system_params.get(name) {
            Some(value) => {
                merged.insert(name.clone(), value.clone());
            }
            None if spec.required => {
                return Err(format!("missing_system_param: '{name}'"));
            }
            None => {}
        }
    }
    for (name, spec) in &tool.params_schema {
        if let Some(default) = &spec.default {
            if !default.is_null() && !merged.contains_key(name) {
                merged.insert(name.clone(), default.clone());
            }
        }
    }

    if let Some(schema) = tool.agent_params_json_schema() {
        let raw = Value::Object(agent_params.clone());
        if let Err(e) = validate_against_schema(schema, &raw) {
            return Err(format!("tool_params_schema_violation: {e}"));
        }
    }

    Ok(merged)
}

fn execute_use_tool(
    tool_name: &str,
    tool_params: &Map<String, Value>,
    cfg: &RunConfig,
) -> OrchestratorResult {
    if !cfg.is_equipped(tool_name) {
        return OrchestratorResult::retry(format!(
            "tool_not_permitted: '{tool_name}' is not equipped for agent '{}'",
            cfg.current_agent
        ));
    }
    let Some(tool) = cfg.tool(tool_name) else {
        return OrchestratorResult::retry(format!(
            "tool_not_configured: '{tool_name}' is missing from the snapshot tool table"
        ));
    };

    let merged = match merge_tool_params(tool, tool_params, &cfg.system_params) {
        Ok(merged) => merged,
        Err(e) => return OrchestratorResult::retry(e),
    };

    let Some(provider) = provider_for(&tool.provider_type) else {
        return OrchestratorResult::error(format!(
            "no_provider_for_type: '{}'",
            tool.provider_type
        ));
    };

    let input = ToolInput {
        params: merged.clone(),
        system: cfg.system_params.clone(),
        metadata: tool.metadata.clone(),
        secret: resolve_secret(tool.secret_ref.as_deref()),
    };
    let started = Instant::now();
    let output = provider.run(&input);
    let duration_ms = started.elapsed().as_millis() as u64;

    if output.ok {
        OrchestratorResult::ok(json!({
            "tool": tool.key,
            "params": merged,
            "result": output.result,
            "duration_ms": duration_ms,
        }))
    } else {
        let mut res = OrchestratorResult::error(
            output.error.unwrap_or_else(|| "tool execution failed".to_string()),
        );
        res.response = Some(json!({
            "tool": tool.key,
            "params": merged,
            "duration_ms": duration_ms,
        }));
        res
    }
}

fn validate_respond_payload(payload: &Value, cfg: &RunConfig) -> Result<(), String> {
    let Some(policy) = &cfg.respond_policy else {
        return Ok(());
    };
    let Some(schema) = &policy.payload_schema else {
        return Ok(());
    };
    validate_against_schema(schema, payload)
        .map_err(|e| format!("respond_payload_schema_violation: {e}"))
}

/// Gates and executes one instruction against the active agent's config.
/// Single-threaded; side-effecting only through the tool provider.
pub fn execute_instruction(instr: &Instruction, cfg: &RunConfig) -> OrchestratorResult {
    match &instr.action {
        Action::Respond { payload } => {
            if !cfg.allow_respond {
                return OrchestratorResult::retry(format!(
                    "respond_not_permitted: agent '{}' may not RESPOND",
                    cfg.current_agent
                ));
            }
            if let Err(e) = validate_respond_payload(payload, cfg) {
                return OrchestratorResult::retry(e);
            }
            OrchestratorResult::ok(payload.clone())
        }
        Action::TaskRespond { payload } => {
            if !cfg.allow_task_respond {
                return OrchestratorResult::retry(format!(
                    "task_respond_not_permitted: agent '{}' may not TASK_RESPOND",
                    cfg.current_agent
                ));
            }
            if let Err(e) = validate_respond_payload(payload, cfg) {
                return OrchestratorResult::retry(e);
            }
            OrchestratorResult::ok(payload.clone())
        }
        Action::UseTool {
            tool_name,
            tool_params,
        } => execute_use_tool(tool_name, tool_params, cfg),
        Action::RouteToAgent {
            target_agent_name, ..
        } => {
            let lookup = target_agent_name.trim().to_lowercase();
            let matched = cfg
                .allowed_routes
                .iter()
                .find(|r| r.to_lowercase() == lookup);
            match matched {
                Some(route) => OrchestratorResult::route_to(route.clone()),
                None => OrchestratorResult::retry(format!(
                    "route_not_permitted: agent '{}' may not route to '{target_agent_name}'",
                    cfg.current_agent
                )),
            }
        }
        Action::TaskGroup(_) => {
            if !cfg.allow_task_group {
                return OrchestratorResult::retry(format!(
                    "task_group_not_permitted: agent '{}' may not TASK_GROUP",
                    cfg.current_agent
                ));
            }
            // Scheduled by the engine; reaching here means the caller skipped it.
            OrchestratorResult {
                status: ResultStatus::NotImplemented,
                ..Default::default()
            }
        }
    }
}
