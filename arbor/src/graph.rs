//! Compiled snapshot of an agent network: agents, tools, routes, response
//! policy, execution-log policy. Produced by the configuration store when a
//! network version is published; consumed read-only by the run engine.
//!
//! Agents and tools are stored by key and resolved by case-insensitive lookup
//! at step time; routing decisions are by name, never by pointer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::logs::policy::ExecutionLogPolicy;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("duplicate agent key '{0}' (keys are case-insensitive)")]
    DuplicateAgent(String),
    #[error("duplicate tool key '{0}' (keys are case-insensitive)")]
    DuplicateTool(String),
    #[error("default agent '{0}' not present in snapshot")]
    UnknownDefaultAgent(String),
    #[error("agent '{agent}' routes to unknown agent '{target}'")]
    UnknownRoute { agent: String, target: String },
    #[error("agent '{0}' routes to itself")]
    SelfRoute(String),
}

/// Where a tool parameter's value comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamSource {
    #[default]
    Agent,
    System,
    Const,
    Secret,
}

/// One entry of a tool's parameter schema.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub source: ParamSource,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A tool as published in a snapshot. `metadata` carries provider-specific
/// config plus the optional `agent_params_json_schema` used to validate
/// agent-supplied params.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledTool {
    pub key: String,
    pub provider_type: String,
    #[serde(default)]
    pub params_schema: HashMap<String, ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CompiledTool {
    /// Agent-facing JSON Schema for `tool_params`, when the tool declares one.
    pub fn agent_params_json_schema(&self) -> Option<&Value> {
        self.metadata.get("agent_params_json_schema")
    }
}

/// An agent as published in a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledAgent {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub allow_respond: bool,
    #[serde(default)]
    pub allow_task_group: bool,
    #[serde(default)]
    pub allow_task_respond: bool,
    #[serde(default)]
    pub equipped_tools: Vec<String>,
    #[serde(default)]
    pub allowed_routes: Vec<String>,
}

/// Network-level contract for the final RESPOND / TASK_RESPOND payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RespondPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_example: Option<Value>,
}

/// Immutable, versioned view of a network. Shared read-only by every run
/// against that version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompiledGraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent_key: Option<String>,
    #[serde(default)]
    pub agents: Vec<CompiledAgent>,
    #[serde(default)]
    pub tools: Vec<CompiledTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond: Option<RespondPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_log: Option<ExecutionLogPolicy>,
}

impl CompiledGraph {
    /// Case-insensitive agent lookup; original case preserved in the result.
    pub fn agent(&self, key: &str) -> Option<&CompiledAgent> {
        let lookup = key.trim().to_lowercase();
        self.agents.iter().find(|a| a.key.to_lowercase() == lookup)
    }

    /// Case-insensitive tool lookup.
    pub fn tool(&self, key: &str) -> Option<&CompiledTool> {
        let lookup = key.trim().to_lowercase();
        self.tools.iter().find(|t| t.key.to_lowercase() == lookup)
    }

    /// Checks the snapshot's uniqueness and routing rules. Published
    /// snapshots satisfy these by construction; inline snapshots supplied on
    /// a run request are validated here.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut agent_keys = HashMap::new();
        for agent in &self.agents {
            let lower = agent.key.to_lowercase();
            if agent_keys.insert(lower, ()).is_some() {
                return Err(GraphError::DuplicateAgent(agent.key.clone()));
            }
        }
        let mut tool_keys = HashMap::new();
        for tool in &self.tools {
            let lower = tool.key.to_lowercase();
            if tool_keys.insert(lower, ()).is_some() {
                return Err(GraphError::DuplicateTool(tool.key.clone()));
            }
        }
        if let Some(default_key) = &self.default_agent_key {
            if self.agent(default_key).is_none() {
                return Err(GraphError::UnknownDefaultAgent(default_key.clone()));
            }
        }
        for agent in &self.agents {
            for target in &agent.allowed_routes {
                if target.to_lowercase() == agent.key.to_lowercase() {
                    return Err(GraphError::SelfRoute(agent.key.clone()));
                }
                if self.agent(target).is_none() {
                    return Err(GraphError::UnknownRoute {
                        agent: agent.key.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(key: &str, routes: &[&str]) -> CompiledAgent {
        CompiledAgent {
            key: key.to_string(),
            display_name: None,
            description: None,
            prompt: None,
            allow_respond: true,
            allow_task_group: false,
            allow_task_respond: false,
            equipped_tools: vec![],
            allowed_routes: routes.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let graph = CompiledGraph {
            agents: vec![agent("Triage", &[])],
            ..Default::default()
        };
        assert_eq!(graph.agent("triage").map(|a| a.key.as_str()), Some("Triage"));
        assert_eq!(graph.agent(" TRIAGE ").map(|a| a.key.as_str()), Some("Triage"));
    }

    #[test]
    fn validate_rejects_self_route() {
        let graph = CompiledGraph {
            agents: vec![agent("a", &["a"])],
            ..Default::default()
        };
        assert!(matches!(graph.validate(), Err(GraphError::SelfRoute(_))));
    }

    #[test]
    fn validate_rejects_duplicate_agent_keys_case_insensitively() {
        let graph = CompiledGraph {
            agents: vec![agent("a", &[]), agent("A", &[])],
            ..Default::default()
        };
        assert!(matches!(graph.validate(), Err(GraphError::DuplicateAgent(_))));
    }

    #[test]
    fn validate_rejects_unknown_default_and_route() {
        let graph = CompiledGraph {
            default_agent_key: Some("missing".to_string()),
            agents: vec![agent("a", &[])],
            ..Default::default()
        };
        assert!(matches!(
            graph.validate(),
            Err(GraphError::UnknownDefaultAgent(_))
        ));

        let graph = CompiledGraph {
            agents: vec![agent("a", &["ghost"])],
            ..Default::default()
        };
        assert!(matches!(graph.validate(), Err(GraphError::UnknownRoute { .. })));
    }
}
