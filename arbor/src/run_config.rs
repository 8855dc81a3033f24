//! Per-step projection of a compiled snapshot for one agent: its equipped
//! tools, allowed routes, permitted action kinds, merged system params, and
//! the response-payload contract.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::graph::{CompiledGraph, CompiledTool, RespondPolicy};
use crate::logs::policy::ExecutionLogPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("agent_not_in_snapshot: '{0}'")]
    AgentNotInSnapshot(String),
}

/// Everything the engine needs to run one step for one agent.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub current_agent: String,
    pub display_name: Option<String>,
    pub equipped_tools: Vec<String>,
    pub tools_map: HashMap<String, CompiledTool>,
    pub allowed_routes: Vec<String>,
    pub route_descriptions: HashMap<String, String>,
    pub allow_respond: bool,
    pub allow_task_group: bool,
    pub allow_task_respond: bool,
    pub system_params: Map<String, Value>,
    pub prompt: Option<String>,
    pub respond_policy: Option<RespondPolicy>,
    pub log_policy: Option<ExecutionLogPolicy>,
}

impl RunConfig {
    /// Case-insensitive membership test against the equipped-tool list.
    pub fn is_equipped(&self, tool_name: &str) -> bool {
        let lookup = tool_name.trim().to_lowercase();
        self.equipped_tools
            .iter()
            .any(|t| t.to_lowercase() == lookup)
    }

    /// Case-insensitive lookup in the projected tool table.
    pub fn tool(&self, tool_name: &str) -> Option<&CompiledTool> {
        let lookup = tool_name.trim().to_lowercase();
        self.tools_map
            .iter()
            .find(|(k, _)| k.to_lowercase() == lookup)
            .map(|(_, t)| t)
    }

    /// Case-insensitive membership test against the allowed routes.
    pub fn may_route_to(&self, target: &str) -> bool {
        let lookup = target.trim().to_lowercase();
        self.allowed_routes
            .iter()
            .any(|r| r.to_lowercase() == lookup)
    }
}

/// Builds the per-step view of `agent_key` over `graph`.
///
/// Equipped tool keys that are absent from the graph's tool table are skipped
/// rather than failing the step, so a drifted snapshot still runs with the
/// tools it can resolve.
pub fn build_run_config(
    graph: &CompiledGraph,
    agent_key: &str,
    allow_respond_override: bool,
    system_params: Map<String, Value>,
) -> Result<RunConfig, ConfigError> {
    let agent = graph
        .agent(agent_key)
        .ok_or_else(|| ConfigError::AgentNotInSnapshot(agent_key.to_string()))?;

    let mut tools_map = HashMap::new();
    for tool_key in &agent.equipped_tools {
        match graph.tool(tool_key) {
            Some(tool) => {
                tools_map.insert(tool.key.clone(), tool.clone());
            }
            None => {
                tracing::debug!(
                    agent = %agent.key,
                    tool = %tool_key,
                    "equipped tool missing from snapshot, skipping"
                );
            }
        }
    }

    let mut route_descriptions = HashMap::new();
    for target in &agent.allowed_routes {
        if let Some(route_agent) = graph.agent(target) {
            if let Some(desc) = &route_agent.description {
                route_descriptions.insert(route_agent.key.clone(), desc.clone());
            }
        }
    }

    Ok(RunConfig {
        current_agent: agent.key.clone(),
        display_name: agent.display_name.clone(),
        equipped_tools: agent.equipped_tools.clone(),
        tools_map,
        allowed_routes: agent.allowed_routes.clone(),
        route_descriptions,
        allow_respond: agent.allow_respond && allow_respond_override,
        allow_task_group: agent.allow_task_group,
        allow_task_respond: agent.allow_task_respond,
        system_params,
        prompt: agent.prompt.clone(),
        respond_policy: graph.respond.clone(),
        log_policy: graph.execution_log.clone(),
    })
}

/// Source of per-step configs. The engine resolves the active agent through
/// this on every step; delegation wraps a source to override the permission
/// flags for the nested run.
pub trait RunConfigSource: Sync {
    fn run_config(&self, agent_key: &str) -> Result<RunConfig, ConfigError>;
}

/// Standard source: project a compiled graph with fixed system params.
pub struct GraphConfigSource<'a> {
    graph: &'a CompiledGraph,
    system_params: Map<String, Value>,
    allow_respond: bool,
}

impl<'a> GraphConfigSource<'a> {
    pub fn new(graph: &'a CompiledGraph, system_params: Map<String, Value>) -> Self {
        Self {
            graph,
            system_params,
            allow_respond: true,
        }
    }

    pub fn with_allow_respond(mut self, allow_respond: bool) -> Self {
        self.allow_respond = allow_respond;
        self
    }
}

impl RunConfigSource for GraphConfigSource<'_> {
    fn run_config(&self, agent_key: &str) -> Result<RunConfig, ConfigError> {
        build_run_config(
            self.graph,
            agent_key,
            self.allow_respond,
            self.system_params.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CompiledAgent, CompiledTool};

    fn graph() -> CompiledGraph {
        CompiledGraph {
            agents: vec![
                CompiledAgent {
                    key: "Triage".to_string(),
                    display_name: Some("Triage".to_string()),
                    description: Some("first contact".to_string()),
                    prompt: Some("You are triage.".to_string()),
                    allow_respond: true,
                    allow_task_group: false,
                    allow_task_respond: false,
                    equipped_tools: vec!["echo".to_string(), "ghost".to_string()],
                    allowed_routes: vec!["writer".to_string()],
                },
                CompiledAgent {
                    key: "writer".to_string(),
                    display_name: None,
                    description: Some("writes the answer".to_string()),
                    prompt: None,
                    allow_respond: true,
                    allow_task_group: false,
                    allow_task_respond: false,
                    equipped_tools: vec![],
                    allowed_routes: vec![],
                },
            ],
            tools: vec![CompiledTool {
                key: "echo".to_string(),
                provider_type: "builtin:echo".to_string(),
                params_schema: HashMap::new(),
                secret_ref: None,
                metadata: Map::new(),
                description: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn builds_view_and_skips_missing_equipped_tools() {
        let cfg = build_run_config(&graph(), "triage", true, Map::new()).unwrap();
        assert_eq!(cfg.current_agent, "Triage");
        assert_eq!(cfg.equipped_tools.len(), 2);
        assert_eq!(cfg.tools_map.len(), 1);
        assert!(cfg.tool("ECHO").is_some());
        assert_eq!(
            cfg.route_descriptions.get("writer").map(String::as_str),
            Some("writes the answer")
        );
    }

    #[test]
    fn allow_respond_is_anded_with_override() {
        let cfg = build_run_config(&graph(), "triage", false, Map::new()).unwrap();
        assert!(!cfg.allow_respond);
    }

    #[test]
    fn unknown_agent_fails() {
        let err = build_run_config(&graph(), "nobody", true, Map::new()).unwrap_err();
        assert!(err.to_string().contains("agent_not_in_snapshot"));
    }
}
