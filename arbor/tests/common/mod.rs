//! Shared helpers for engine tests: snapshot builders and scripted decisions.
#![allow(dead_code)]

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use arbor::graph::{CompiledAgent, CompiledGraph, CompiledTool, ParamSpec};
use arbor::orchestrator::decision::AgentDecision;

pub fn agent(key: &str, allow_respond: bool) -> CompiledAgent {
    CompiledAgent {
        key: key.to_string(),
        display_name: None,
        description: None,
        prompt: None,
        allow_respond,
        allow_task_group: false,
        allow_task_respond: false,
        equipped_tools: vec![],
        allowed_routes: vec![],
    }
}

pub fn tool(key: &str, provider_type: &str, params_schema: Value) -> CompiledTool {
    let params_schema: HashMap<String, ParamSpec> =
        serde_json::from_value(params_schema).expect("valid params schema");
    CompiledTool {
        key: key.to_string(),
        provider_type: provider_type.to_string(),
        params_schema,
        secret_ref: None,
        metadata: Map::new(),
        description: None,
    }
}

/// Snapshot `S0`: `triage` (no respond, routes to `writer`) and `writer`
/// (responds, no routes), default agent `triage`.
pub fn handoff_graph() -> CompiledGraph {
    let mut triage = agent("triage", false);
    triage.allowed_routes = vec!["writer".to_string()];
    let writer = agent("writer", true);
    CompiledGraph {
        default_agent_key: Some("triage".to_string()),
        agents: vec![triage, writer],
        ..Default::default()
    }
}

/// Snapshot `S1`: one agent `solo` equipped with the echo tool (required
/// `message` from the agent, `customer_id` from the system).
pub fn echo_graph() -> CompiledGraph {
    let mut solo = agent("solo", true);
    solo.equipped_tools = vec!["echo".to_string()];
    CompiledGraph {
        default_agent_key: Some("solo".to_string()),
        agents: vec![solo],
        tools: vec![tool(
            "echo",
            "builtin:echo",
            json!({
                "message": {"source": "agent", "required": true},
                "customer_id": {"source": "system", "required": false},
            }),
        )],
        ..Default::default()
    }
}

pub fn decision(value: Value) -> AgentDecision {
    serde_json::from_value(value).expect("valid decision")
}

pub fn respond(message: &str) -> AgentDecision {
    decision(json!({
        "action": "RESPOND",
        "action_reasoning": "done",
        "action_details": {"payload": {"message": message}},
    }))
}

pub fn route_to(target: &str) -> AgentDecision {
    decision(json!({
        "action": "ROUTE_TO_AGENT",
        "action_reasoning": "hand off",
        "action_details": {"target_agent_name": target, "context": {"summary": "ok"}},
    }))
}

pub fn use_tool(tool_name: &str, params: Value) -> AgentDecision {
    decision(json!({
        "action": "USE_TOOL",
        "action_reasoning": "need the tool",
        "action_details": {"tool_name": tool_name, "tool_params": params},
    }))
}

/// Entries of an execution log (already serialized) with a given type tag.
pub fn entries_of<'a>(log: &'a [Value], entry_type: &str) -> Vec<&'a Value> {
    log.iter()
        .filter(|e| e["type"] == entry_type)
        .collect()
}
