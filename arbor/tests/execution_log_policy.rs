//! Execution-log policy applied to real tool entries: configured field
//! extraction shapes the previews, and the defaults truncate.

mod common;

use serde_json::{json, Map};

use arbor::logs::policy::{ExecutionLogPolicy, DEFAULT_RESPONSE_PREVIEW_LIMIT};
use arbor::run_config::GraphConfigSource;
use arbor::{register_builtin_providers, run_loop, MockDecider, RunOptions};

use common::{echo_graph, entries_of, respond, use_tool};

#[test]
fn configured_fields_shape_the_previews() {
    register_builtin_providers();
    let mut graph = echo_graph();
    let policy: ExecutionLogPolicy = serde_json::from_value(json!({
        "defaults": {"request_max_chars": 120, "response_max_chars": 200},
        "tools": {
            "echo": {
                "request": [{"path": "message", "label": "msg", "max_chars": 5}],
                "response": [{"path": "echo.message"}],
            },
        },
    }))
    .unwrap();
    graph.execution_log = Some(policy);

    let decider = MockDecider::from_decisions(vec![
        use_tool("echo", json!({"message": "hello world"})),
        respond("done"),
    ]);
    let source = GraphConfigSource::new(&graph, Map::new());
    let out = run_loop(&source, "solo", "go", &decider, &RunOptions::default());

    let tools = entries_of(&out.execution_log, "tool");
    assert_eq!(tools.len(), 1);
    let entry = tools[0];
    assert_eq!(entry["request_preview"], "msg=hell…");
    assert_eq!(entry["response_preview"], "echo.message=hello world");
    assert_eq!(entry["request_excerpt"]["msg"], "hell…");
}

#[test]
fn without_a_policy_the_fallback_limits_apply() {
    register_builtin_providers();
    let graph = echo_graph();
    let long_message = "x".repeat(500);
    let decider = MockDecider::from_decisions(vec![
        use_tool("echo", json!({"message": long_message})),
        respond("done"),
    ]);
    let source = GraphConfigSource::new(&graph, Map::new());
    let out = run_loop(&source, "solo", "go", &decider, &RunOptions::default());

    let tools = entries_of(&out.execution_log, "tool");
    let response_preview = tools[0]["response_preview"].as_str().unwrap();
    assert!(response_preview.chars().count() <= DEFAULT_RESPONSE_PREVIEW_LIMIT);
    assert!(response_preview.ends_with('…'));
    // The full payload is still available through the tool store.
    let execution_id = tools[0]["execution_id"].as_str().unwrap();
    assert!(out.tool_log[execution_id]["result"]["echo"]["message"]
        .as_str()
        .unwrap()
        .contains("xxxxx"));
}
