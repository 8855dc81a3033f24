//! Decision wire-shape tests: parsing the JSON the model returns, payload
//! lifting, and the action union's exact discriminants.

mod common;

use serde_json::json;

use arbor::llm::{DecideResult, Decider, MockDecider};
use arbor::orchestrator::decision::{decision_to_instruction, AgentDecision};
use arbor::orchestrator::{Action, GroupTask};

use common::decision;

#[test]
fn use_tool_decision_translates_with_params() {
    let d = decision(json!({
        "action": "USE_TOOL",
        "action_reasoning": "need the time",
        "action_details": {"tool_name": "clock", "tool_params": {"tz": "UTC"}},
    }));
    let instr = decision_to_instruction(&d).unwrap();
    assert_eq!(instr.reasoning, "need the time");
    let Action::UseTool {
        tool_name,
        tool_params,
    } = instr.action
    else {
        panic!("expected USE_TOOL");
    };
    assert_eq!(tool_name, "clock");
    assert_eq!(tool_params["tz"], "UTC");
}

#[test]
fn respond_string_payload_is_lifted_to_message_object() {
    let d = decision(json!({
        "action": "RESPOND",
        "action_reasoning": "final",
        "action_details": {"payload": "The sunrise is at 5:58 AM."},
    }));
    let instr = decision_to_instruction(&d).unwrap();
    let Action::Respond { payload } = instr.action else {
        panic!("expected RESPOND");
    };
    assert_eq!(payload, json!({"message": "The sunrise is at 5:58 AM."}));
}

#[test]
fn task_respond_missing_payload_defaults_to_empty_object() {
    let d = decision(json!({
        "action": "TASK_RESPOND",
        "action_reasoning": "finished",
        "action_details": {},
    }));
    let instr = decision_to_instruction(&d).unwrap();
    let Action::TaskRespond { payload } = instr.action else {
        panic!("expected TASK_RESPOND");
    };
    assert_eq!(payload, json!({}));
}

#[test]
fn task_group_details_parse_into_typed_tasks() {
    let d = decision(json!({
        "action": "TASK_GROUP",
        "action_reasoning": "parallel work",
        "action_details": {
            "tasks": [
                {"task_type": "use_tool", "tool_name": "echo", "tool_params": {"message": "a"}},
                {"task_type": "delegate_agent", "delegation_details": [
                    {"agent_key": "child", "assignment": "do it", "max_steps": 2}
                ]},
            ],
        },
    }));
    let instr = decision_to_instruction(&d).unwrap();
    let Action::TaskGroup(group) = instr.action else {
        panic!("expected TASK_GROUP");
    };
    assert_eq!(group.tasks.len(), 2);
    assert!(matches!(group.tasks[0], GroupTask::UseTool(_)));
    let GroupTask::DelegateAgent(delegate) = &group.tasks[1] else {
        panic!("expected delegate task");
    };
    assert_eq!(delegate.delegation_details[0].agent_key, "child");
    assert_eq!(delegate.delegation_details[0].max_steps, 2);
    assert_eq!(delegate.retry_policy.attempts, 1);
}

#[test]
fn unknown_action_string_fails_to_parse() {
    let result = serde_json::from_value::<AgentDecision>(json!({
        "action": "DO_EVERYTHING",
        "action_reasoning": "nope",
        "action_details": {},
    }));
    assert!(result.is_err());
}

#[test]
fn instruction_serializes_with_wire_discriminants() {
    let d = decision(json!({
        "action": "ROUTE_TO_AGENT",
        "action_reasoning": "hand off",
        "action_details": {"target_agent_name": "writer"},
    }));
    let instr = decision_to_instruction(&d).unwrap();
    let value = serde_json::to_value(&instr).unwrap();
    assert_eq!(value["action"]["type"], "ROUTE_TO_AGENT");
    assert_eq!(value["action"]["target_agent_name"], "writer");
}

#[test]
fn mock_decider_yields_scripted_results_in_order_then_errors() {
    let decider = MockDecider::from_results(vec![DecideResult {
        text: "{}".to_string(),
        ..DecideResult::default()
    }]);
    assert!(decider.decide("p", None).is_ok());
    assert!(decider.decide("p", None).is_err());
}
