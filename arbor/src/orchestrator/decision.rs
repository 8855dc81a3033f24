//! The LLM-facing decision envelope and its translation into a typed
//! [`Instruction`]. The union is validated here, at the edge: bad shapes are
//! rejected before the engine sees them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{Action, GroupTask, Instruction, TaskGroupAction};

/// The five action kinds an agent may emit, using the exact wire strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    #[serde(rename = "USE_TOOL")]
    UseTool,
    #[serde(rename = "ROUTE_TO_AGENT")]
    RouteToAgent,
    #[serde(rename = "RESPOND")]
    Respond,
    #[serde(rename = "TASK_GROUP")]
    TaskGroup,
    #[serde(rename = "TASK_RESPOND")]
    TaskRespond,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseTool => "USE_TOOL",
            Self::RouteToAgent => "ROUTE_TO_AGENT",
            Self::Respond => "RESPOND",
            Self::TaskGroup => "TASK_GROUP",
            Self::TaskRespond => "TASK_RESPOND",
        }
    }
}

/// What the model returns: `action` + `action_reasoning` + `action_details`.
/// The details stay raw here and are shaped during translation, so a decision
/// can be logged even when its details are malformed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDecision {
    pub action: DecisionKind,
    pub action_reasoning: String,
    #[serde(default)]
    pub action_details: Value,
}

impl AgentDecision {
    /// Full parse-time validation: the details must translate. Used by the
    /// decide layer so a malformed decision counts as a parse failure (and
    /// triggers the strict retry).
    pub fn validate(&self) -> Result<(), String> {
        decision_to_instruction(self).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UseToolDetails {
    tool_name: String,
    #[serde(default)]
    tool_params: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteToAgentDetails {
    target_agent_name: String,
    #[serde(default)]
    context: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadDetails {
    #[serde(default)]
    payload: Value,
}

fn details<T: serde::de::DeserializeOwned>(raw: &Value, kind: &str) -> Result<T, String> {
    serde_json::from_value(raw.clone()).map_err(|e| format!("invalid {kind} action_details: {e}"))
}

/// Lifts a bare-string payload into `{"message": ...}`; a missing payload
/// becomes an empty object.
fn lift_payload(payload: Value) -> Value {
    match payload {
        Value::String(message) => json!({ "message": message }),
        Value::Null => json!({}),
        other => other,
    }
}

/// Translates a parsed decision into a typed instruction.
pub fn decision_to_instruction(decision: &AgentDecision) -> Result<Instruction, String> {
    let reasoning = decision.action_reasoning.clone();
    let action = match decision.action {
        DecisionKind::UseTool => {
            let d: UseToolDetails = details(&decision.action_details, "USE_TOOL")?;
            Action::UseTool {
                tool_name: d.tool_name,
                tool_params: d.tool_params,
            }
        }
        DecisionKind::RouteToAgent => {
            let d: RouteToAgentDetails = details(&decision.action_details, "ROUTE_TO_AGENT")?;
            Action::RouteToAgent {
                target_agent_name: d.target_agent_name,
                context: d.context,
            }
        }
        DecisionKind::Respond => {
            let d: PayloadDetails = details(&decision.action_details, "RESPOND")?;
            Action::Respond {
                payload: lift_payload(d.payload),
            }
        }
        DecisionKind::TaskRespond => {
            let d: PayloadDetails = details(&decision.action_details, "TASK_RESPOND")?;
            Action::TaskRespond {
                payload: lift_payload(d.payload),
            }
        }
        DecisionKind::TaskGroup => {
            let d: TaskGroupAction = details(&decision.action_details, "TASK_GROUP")?;
            if d.tasks.is_empty() {
                return Err("TASK_GROUP tasks must contain at least one entry".to_string());
            }
            for task in &d.tasks {
                if let GroupTask::DelegateAgent(delegate) = task {
                    if delegate.delegation_details.is_empty() {
                        return Err(
                            "delegate_agent task requires at least one delegation entry"
                                .to_string(),
                        );
                    }
                }
            }
            Action::TaskGroup(d)
        }
    };
    Ok(Instruction { reasoning, action })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_payload_is_lifted() {
        let decision = AgentDecision {
            action: DecisionKind::Respond,
            action_reasoning: "done".to_string(),
            action_details: json!({"payload": "plain text"}),
        };
        let instr = decision_to_instruction(&decision).unwrap();
        let Action::Respond { payload } = instr.action else {
            panic!("expected RESPOND");
        };
        assert_eq!(payload, json!({"message": "plain text"}));
    }

    #[test]
    fn empty_task_group_is_a_parse_error() {
        let decision = AgentDecision {
            action: DecisionKind::TaskGroup,
            action_reasoning: "plan".to_string(),
            action_details: json!({"tasks": []}),
        };
        let err = decision_to_instruction(&decision).unwrap_err();
        assert!(err.contains("at least one entry"));
        assert!(decision.validate().is_err());
    }

    #[test]
    fn unknown_detail_fields_are_rejected() {
        let decision = AgentDecision {
            action: DecisionKind::UseTool,
            action_reasoning: "call".to_string(),
            action_details: json!({"tool_name": "echo", "bogus": 1}),
        };
        assert!(decision_to_instruction(&decision).is_err());
    }
}
