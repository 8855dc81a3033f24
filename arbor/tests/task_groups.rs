//! Task-group scheduling: success with delegation, per-task retry
//! exhaustion aborting the run, and tool accounting inside groups.

mod common;

use std::sync::Arc;

use serde_json::{json, Map};

use arbor::graph::CompiledGraph;
use arbor::run_config::GraphConfigSource;
use arbor::{
    register_builtin_providers, register_provider, run_loop, MockDecider, RunOptions,
    ToolInput, ToolOutput, ToolProvider,
};

use common::{agent, decision, entries_of, respond, tool};

fn opts(max_steps: u32) -> RunOptions {
    RunOptions {
        max_steps,
        model: None,
        debug: false,
    }
}

struct FailingTool;

impl ToolProvider for FailingTool {
    fn run(&self, _input: &ToolInput) -> ToolOutput {
        ToolOutput::error("boom")
    }
}

/// `primary` may launch task groups; `child` may only TASK_RESPOND.
fn delegation_graph() -> CompiledGraph {
    let mut primary = agent("primary", true);
    primary.allow_task_group = true;
    primary.equipped_tools = vec!["echo".to_string()];
    let mut child = agent("child", false);
    child.allow_task_respond = true;
    CompiledGraph {
        default_agent_key: Some("primary".to_string()),
        agents: vec![primary, child],
        tools: vec![tool(
            "echo",
            "builtin:echo",
            json!({"message": {"source": "agent", "required": true}}),
        )],
        ..Default::default()
    }
}

#[test]
fn task_group_with_tool_and_delegation_succeeds() {
    register_builtin_providers();
    let graph = delegation_graph();
    let decisions = vec![
        decision(json!({
            "action": "TASK_GROUP",
            "action_reasoning": "plan tasks",
            "action_details": {
                "group_id": "group-1",
                "tasks": [
                    {
                        "task_type": "use_tool",
                        "task_id": "echo-task",
                        "tool_name": "echo",
                        "tool_params": {"message": "hi"},
                    },
                    {
                        "task_type": "delegate_agent",
                        "task_id": "delegate-task",
                        "delegation_details": [{
                            "agent_key": "child",
                            "assignment": "summarise X",
                            "context_overrides": {},
                            "max_steps": 3,
                        }],
                    },
                ],
            },
        })),
        // Consumed by the nested run for `child`.
        decision(json!({
            "action": "TASK_RESPOND",
            "action_reasoning": "finished",
            "action_details": {"payload": {"message": "delegated done"}},
        })),
        respond("all done"),
    ];
    let decider = MockDecider::from_decisions(decisions);
    let source = GraphConfigSource::new(&graph, Map::new());

    let out = run_loop(&source, "primary", "process the document", &decider, &opts(5));

    assert_eq!(decider.remaining(), 0);
    assert_eq!(out.final_outcome.status, "ok");
    assert_eq!(
        out.final_outcome.response,
        Some(json!({"message": "all done"}))
    );

    let groups = entries_of(&out.execution_log, "task_group");
    assert_eq!(groups.len(), 1);
    let group = groups[0];
    assert_eq!(group["status"], "ok");
    assert_eq!(group["group_id"], "group-1");
    let tasks = group["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["status"], "ok");
    assert_eq!(tasks[1]["status"], "ok");
    assert_eq!(tasks[1]["result"], json!([{"message": "delegated done"}]));

    // The delegated run's artifacts are nested under the attempt entry.
    let delegations = tasks[1]["attempts"][0]["delegations"].as_array().unwrap();
    assert_eq!(delegations[0]["status"], "ok");
    assert_eq!(
        delegations[0]["run"]["final"]["action_type"],
        "TASK_RESPOND"
    );

    // Exactly one tool entry, tagged with the group id, visible to the
    // parent agent's epoch.
    let tools = entries_of(&out.execution_log, "tool");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["group_id"], "group-1");
    assert_eq!(tools[0]["agent_key"], "primary");
    assert_eq!(tools[0]["epoch"], 0);
    let execution_id = tools[0]["execution_id"].as_str().unwrap();
    assert_eq!(out.tool_log[execution_id]["group_id"], "group-1");
    assert_eq!(out.tool_log[execution_id]["tool_key"], "echo");

    // The delegated agent saw its assignment in system params.
    let nested_log = delegations[0]["run"]["execution_log"].as_array().unwrap();
    let nested_prompt = nested_log[0]["prompt"].as_str().unwrap();
    assert!(nested_prompt.contains("summarise X"));
}

#[test]
fn exhausted_retries_abort_the_group_and_the_run() {
    register_provider("test:fail", Arc::new(FailingTool));
    let mut primary = agent("primary", true);
    primary.allow_task_group = true;
    primary.equipped_tools = vec!["fail".to_string()];
    let graph = CompiledGraph {
        default_agent_key: Some("primary".to_string()),
        agents: vec![primary],
        tools: vec![tool("fail", "test:fail", json!({}))],
        ..Default::default()
    };
    let decider = MockDecider::from_decisions(vec![decision(json!({
        "action": "TASK_GROUP",
        "action_reasoning": "try failing tool",
        "action_details": {
            "group_id": "fail-group",
            "tasks": [{
                "task_type": "use_tool",
                "task_id": "fail-task",
                "tool_name": "fail",
                "tool_params": {},
                "retry_policy": {"attempts": 2},
            }],
        },
    }))]);
    let source = GraphConfigSource::new(&graph, Map::new());

    let out = run_loop(&source, "primary", "trigger failure", &decider, &opts(3));

    assert_eq!(decider.remaining(), 0);
    assert_eq!(out.final_outcome.status, "error");
    assert_eq!(out.final_outcome.action_type.as_deref(), Some("TASK_GROUP"));
    assert!(out.final_outcome.error.as_deref().unwrap().contains("boom"));

    let groups = entries_of(&out.execution_log, "task_group");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["status"], "error");
    let attempts = groups[0]["tasks"][0]["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a["status"] == "error"));

    // Both attempts produced tool entries tagged with the group.
    let tools = entries_of(&out.execution_log, "tool");
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().all(|t| t["group_id"] == "fail-group"));
    assert_eq!(tools[0]["attempt"], 1);
    assert_eq!(tools[1]["attempt"], 2);
    assert_eq!(out.tool_log.len(), 2);
}

#[test]
fn single_attempt_task_runs_at_most_once() {
    register_provider("test:fail", Arc::new(FailingTool));
    let mut primary = agent("primary", true);
    primary.allow_task_group = true;
    primary.equipped_tools = vec!["fail".to_string()];
    let graph = CompiledGraph {
        default_agent_key: Some("primary".to_string()),
        agents: vec![primary],
        tools: vec![tool("fail", "test:fail", json!({}))],
        ..Default::default()
    };
    let decider = MockDecider::from_decisions(vec![decision(json!({
        "action": "TASK_GROUP",
        "action_reasoning": "one shot",
        "action_details": {
            "tasks": [{
                "task_type": "use_tool",
                "tool_name": "fail",
                "retry_policy": {"attempts": 1},
            }],
        },
    }))]);
    let source = GraphConfigSource::new(&graph, Map::new());

    let out = run_loop(&source, "primary", "one shot", &decider, &opts(3));

    assert_eq!(entries_of(&out.execution_log, "tool").len(), 1);
    assert_eq!(out.final_outcome.status, "error");
}

#[test]
fn failing_task_stops_later_siblings() {
    register_builtin_providers();
    register_provider("test:fail", Arc::new(FailingTool));
    let mut primary = agent("primary", true);
    primary.allow_task_group = true;
    primary.equipped_tools = vec!["fail".to_string(), "echo".to_string()];
    let graph = CompiledGraph {
        default_agent_key: Some("primary".to_string()),
        agents: vec![primary],
        tools: vec![
            tool("fail", "test:fail", json!({})),
            tool("echo", "builtin:echo", json!({})),
        ],
        ..Default::default()
    };
    let decider = MockDecider::from_decisions(vec![decision(json!({
        "action": "TASK_GROUP",
        "action_reasoning": "fail then echo",
        "action_details": {
            "tasks": [
                {"task_type": "use_tool", "tool_name": "fail"},
                {"task_type": "use_tool", "tool_name": "echo", "tool_params": {"message": "never"}},
            ],
        },
    }))]);
    let source = GraphConfigSource::new(&graph, Map::new());

    let out = run_loop(&source, "primary", "stop early", &decider, &opts(3));

    // Only the failing task ran; the echo sibling never started.
    let tools = entries_of(&out.execution_log, "tool");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["tool_key"], "fail");
    let groups = entries_of(&out.execution_log, "task_group");
    assert_eq!(groups[0]["tasks"].as_array().unwrap().len(), 1);
}
