//! Prompt context builder: assembles the text prompt shown to the LLM for
//! one step from the agent's base prompt, the permitted-action constraints
//! and schemas, and the run context (user message, handoff context, tool
//! outputs, log summary).
//!
//! Only tools and routes present in the `RunConfig` are ever listed; nothing
//! is invented here.

use serde_json::{json, Value};

use crate::logs::{ExecutionLog, LogEntry, ToolRecord};
use crate::run_config::RunConfig;

/// Tool section: per equipped tool, one compact JSON block with the key, the
/// description, and the exact agent-facing params schema.
pub fn build_tool_definitions(cfg: &RunConfig) -> String {
    if cfg.equipped_tools.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "Available Tools and Schemas (use EXACTLY these for tool_params):".to_string(),
    ];
    for key in &cfg.equipped_tools {
        let Some(tool) = cfg.tool(key) else {
            continue;
        };
        let block = json!({
            "tool": tool.key,
            "description": tool.description.clone().unwrap_or_default(),
            "tool_params_schema": tool.agent_params_json_schema().cloned().unwrap_or(json!({})),
        });
        lines.push("```json".to_string());
        lines.push(block.to_string());
        lines.push("```".to_string());
    }
    lines.join("\n")
}

/// Route section: allowed route keys, their descriptions, a strict schema for
/// ROUTE_TO_AGENT details, and one example.
pub fn build_route_definitions(cfg: &RunConfig) -> String {
    if cfg.allowed_routes.is_empty() {
        return String::new();
    }
    let routes = &cfg.allowed_routes;
    let mut lines = vec!["Available Routes and Schema (use EXACT agent keys):".to_string()];
    for route in routes {
        match cfg.route_descriptions.get(route) {
            Some(desc) => lines.push(format!("- {route}: {desc}")),
            None => lines.push(format!("- {route}")),
        }
    }
    let route_schema = json!({
        "type": "object",
        "properties": {
            "target_agent_name": {"type": "string", "enum": routes},
            "context": {"type": "object"},
        },
        "required": ["target_agent_name"],
        "additionalProperties": false,
    });
    let block = json!({
        "allowed_routes": routes,
        "route_params_schema": route_schema,
    });
    lines.push("```json".to_string());
    lines.push(block.to_string());
    lines.push("```".to_string());
    lines.push("Example for ROUTE_TO_AGENT (follow exactly; use exact key):".to_string());
    let example = json!({
        "action": "ROUTE_TO_AGENT",
        "action_reasoning": "why route",
        "action_details": {"target_agent_name": routes[0]},
    });
    lines.push("```json".to_string());
    lines.push(example.to_string());
    lines.push("```".to_string());
    lines.join("\n")
}

fn push_example(lines: &mut Vec<String>, heading: &str, example: Value) {
    lines.push(heading.to_string());
    lines.push("```json".to_string());
    lines.push(example.to_string());
    lines.push("```".to_string());
}

/// Constraint section: which actions this agent may emit, tool/route
/// enumerations, one example per enabled action, and the network's
/// respond-payload contract when responding is permitted.
pub fn build_constraints(cfg: &RunConfig) -> String {
    let has_tools = !cfg.equipped_tools.is_empty();
    let has_routes = !cfg.allowed_routes.is_empty();

    let mut actions: Vec<&str> = Vec::new();
    if has_tools {
        actions.push("USE_TOOL");
    }
    if has_routes {
        actions.push("ROUTE_TO_AGENT");
    }
    if cfg.allow_respond {
        actions.push("RESPOND");
    }
    if cfg.allow_task_group {
        actions.push("TASK_GROUP");
    }
    if cfg.allow_task_respond {
        actions.push("TASK_RESPOND");
    }

    let mut lines: Vec<String> = Vec::new();
    if !actions.is_empty() {
        lines.push(format!(
            "You MUST respond as JSON with fields: action ({}), action_reasoning (string), action_details (object).",
            actions.join("|")
        ));
    }

    let mut tool_names: Vec<&str> = Vec::new();
    if has_tools {
        lines.push("Allowed tools and agent-provided params:".to_string());
        for key in &cfg.equipped_tools {
            let Some(tool) = cfg.tool(key) else {
                continue;
            };
            let agent_params: Vec<&str> = tool
                .params_schema
                .iter()
                .filter(|(_, spec)| spec.source == crate::graph::ParamSource::Agent)
                .map(|(name, _)| name.as_str())
                .collect();
            lines.push(format!("- {key}: params={agent_params:?}"));
            tool_names.push(key);
        }
        if !tool_names.is_empty() {
            lines.push(format!("tool_name must be one of: {tool_names:?}"));
        }
        lines.push(
            "When using USE_TOOL, action_details must include tool_name and tool_params."
                .to_string(),
        );
    }

    if has_routes {
        lines.push(
            "When routing, action_details must include target_agent_name (use the exact agent key)."
                .to_string(),
        );
    }

    if cfg.allow_respond {
        lines.push("When responding, put your payload in action_details.payload.".to_string());
        push_example(
            &mut lines,
            "Example for RESPOND (follow exactly):",
            json!({
                "action": "RESPOND",
                "action_reasoning": "why final",
                "action_details": {"payload": {"message": "<final text>"}},
            }),
        );
    }

    if has_tools && !tool_names.is_empty() {
        let first = tool_names[0];
        let example_params = cfg
            .tool(first)
            .map(|tool| {
                let mut params = serde_json::Map::new();
                for (name, spec) in &tool.params_schema {
                    if spec.source == crate::graph::ParamSource::Agent {
                        params.insert(name.clone(), json!(format!("<{name}>")));
                    }
                }
                if params.is_empty() {
                    json!({"example": "value"})
                } else {
                    Value::Object(params)
                }
            })
            .unwrap_or_else(|| json!({"example": "value"}));
        push_example(
            &mut lines,
            "Example for USE_TOOL (follow exactly):",
            json!({
                "action": "USE_TOOL",
                "action_reasoning": "why this tool",
                "action_details": {"tool_name": first, "tool_params": example_params},
            }),
        );
    }

    if cfg.allow_task_group {
        lines.push(
            "When launching a TASK_GROUP, action_details must include tasks: a non-empty list of use_tool and delegate_agent entries, each with an optional task_id and retry_policy {attempts >= 1}."
                .to_string(),
        );
        push_example(
            &mut lines,
            "Example for TASK_GROUP (follow exactly):",
            json!({
                "action": "TASK_GROUP",
                "action_reasoning": "why these tasks",
                "action_details": {"tasks": [
                    {"task_type": "use_tool", "tool_name": "<tool>", "tool_params": {}},
                    {"task_type": "delegate_agent", "delegation_details": [
                        {"agent_key": "<agent>", "assignment": "<what to do>", "max_steps": 3}
                    ]},
                ]},
            }),
        );
    }

    if cfg.allow_task_respond {
        lines.push(
            "When your delegated assignment is complete, emit TASK_RESPOND with the result in action_details.payload."
                .to_string(),
        );
        push_example(
            &mut lines,
            "Example for TASK_RESPOND (follow exactly):",
            json!({
                "action": "TASK_RESPOND",
                "action_reasoning": "assignment done",
                "action_details": {"payload": {"message": "<result>"}},
            }),
        );
    }

    if cfg.allow_respond || cfg.allow_task_respond {
        if let Some(policy) = &cfg.respond_policy {
            if let Some(schema) = &policy.payload_schema {
                lines.push("Response payload schema (STRICT):".to_string());
                lines.push("```json".to_string());
                lines.push(schema.to_string());
                lines.push("```".to_string());
            }
            if let Some(guidance) = &policy.payload_guidance {
                lines.push(format!("Response payload guidance: {guidance}"));
            }
            if let Some(example) = &policy.payload_example {
                push_example(&mut lines, "Response payload example:", example.clone());
            }
        }
    }

    lines.join("\n")
}

/// Context section: the original user message (always verbatim), the handoff
/// context left by a routing agent, the agent's own tool outputs for its
/// current epoch (newest first), and the last ten log entries as one-liners.
pub fn build_context(
    user_message: &str,
    log: &ExecutionLog,
    full_tool_outputs: &[(String, &ToolRecord)],
    handoff_context: Option<&serde_json::Map<String, Value>>,
) -> String {
    let mut parts = vec![format!("User message:\n{user_message}")];

    if let Some(context) = handoff_context {
        if !context.is_empty() {
            parts.push(format!(
                "Handoff context from the previous agent:\n{}",
                Value::Object(context.clone())
            ));
        }
    }

    if !full_tool_outputs.is_empty() {
        let mut lines = vec!["Tool outputs (most recent first):".to_string()];
        for (_, record) in full_tool_outputs.iter().rev() {
            if record.result.is_null() {
                lines.push(format!("- {}: (no result)", record.tool_key));
            } else {
                lines.push(format!("- {}: {}", record.tool_key, record.result));
            }
        }
        parts.push(lines.join("\n"));
    }

    let entries = log.entries();
    if !entries.is_empty() {
        let mut lines = vec!["Execution log summary:".to_string()];
        let start = entries.len().saturating_sub(10);
        for entry in &entries[start..] {
            match entry {
                LogEntry::Agent(e) => lines.push(format!(
                    "  step {}: agent {} → {}",
                    e.step, e.agent_key, e.decision.action
                )),
                LogEntry::Tool(e) => lines.push(format!(
                    "  step {}: tool {} status={}",
                    e.step, e.tool_key, e.status
                )),
                LogEntry::TaskGroup(e) => lines.push(format!(
                    "  step {}: task_group {} status={}",
                    e.step, e.group_id, e.status
                )),
                LogEntry::System(_) => {}
            }
        }
        parts.push(lines.join("\n"));
    }

    parts.join("\n")
}

/// Final assembly: base prompt, tool definitions, route definitions,
/// constraints, context — non-empty blocks joined with blank lines.
pub fn build_prompt(
    base_prompt: Option<&str>,
    tool_defs: &str,
    route_defs: &str,
    constraints: &str,
    context: &str,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(base) = base_prompt {
        if !base.is_empty() {
            parts.push(base);
        }
    }
    for block in [tool_defs, route_defs, constraints, context] {
        if !block.is_empty() {
            parts.push(block);
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CompiledTool, ParamSpec, ParamSource};
    use std::collections::HashMap;

    fn cfg_with_echo() -> RunConfig {
        let mut params_schema = HashMap::new();
        params_schema.insert(
            "message".to_string(),
            ParamSpec {
                source: ParamSource::Agent,
                required: true,
                default: None,
            },
        );
        params_schema.insert(
            "customer_id".to_string(),
            ParamSpec {
                source: ParamSource::System,
                required: false,
                default: None,
            },
        );
        let tool = CompiledTool {
            key: "echo".to_string(),
            provider_type: "builtin:echo".to_string(),
            params_schema,
            secret_ref: None,
            metadata: serde_json::Map::new(),
            description: Some("echoes its input".to_string()),
        };
        let mut tools_map = HashMap::new();
        tools_map.insert("echo".to_string(), tool);
        RunConfig {
            current_agent: "solo".to_string(),
            display_name: None,
            equipped_tools: vec!["echo".to_string()],
            tools_map,
            allowed_routes: vec![],
            route_descriptions: HashMap::new(),
            allow_respond: true,
            allow_task_group: false,
            allow_task_respond: false,
            system_params: serde_json::Map::new(),
            prompt: Some("You are solo.".to_string()),
            respond_policy: None,
            log_policy: None,
        }
    }

    #[test]
    fn constraints_list_only_permitted_actions() {
        let cfg = cfg_with_echo();
        let constraints = build_constraints(&cfg);
        assert!(constraints.contains("USE_TOOL|RESPOND"));
        assert!(!constraints.contains("ROUTE_TO_AGENT|"));
        assert!(constraints.contains("tool_name must be one of"));
        // System-sourced params are never advertised to the agent.
        assert!(constraints.contains("message"));
        assert!(!constraints.contains("- echo: params=[\"customer_id\""));
    }

    #[test]
    fn context_repeats_user_message_and_lists_tool_outputs_newest_first() {
        let cfg = cfg_with_echo();
        let log = ExecutionLog::new();
        let first = ToolRecord {
            agent_key: "solo".to_string(),
            tool_key: "echo".to_string(),
            params: serde_json::json!({}),
            result: serde_json::json!({"echo": "first"}),
            duration_ms: 1,
            ts: 1,
            started_at_ms: None,
            completed_at_ms: None,
            total_duration_ms: None,
            group_id: None,
            parent_task_id: None,
            attempt: None,
        };
        let mut second = first.clone();
        second.result = serde_json::json!({"echo": "second"});
        let outputs = vec![("a".to_string(), &first), ("b".to_string(), &second)];
        let context = build_context("say hi", &log, &outputs, None);
        assert!(context.starts_with("User message:\nsay hi"));
        let newest = context.find("second").unwrap();
        let oldest = context.find("first").unwrap();
        assert!(newest < oldest);

        let prompt = build_prompt(
            cfg.prompt.as_deref(),
            &build_tool_definitions(&cfg),
            &build_route_definitions(&cfg),
            &build_constraints(&cfg),
            &context,
        );
        assert!(prompt.starts_with("You are solo."));
        assert!(prompt.contains("Available Tools"));
    }
}
