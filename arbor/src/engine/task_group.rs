//! Task-group scheduler: runs a group's child tasks sequentially, each with
//! its own retry loop, and aborts the group on the first task that exhausts
//! its attempts.
//!
//! Tool children execute through the instruction gate with the parent's
//! config; delegation children run a nested synchronous engine loop on the
//! delegated agent with responding swapped for task-responding.

use std::time::Instant;

use serde_json::{json, Map, Value};

use super::{run_loop, RunOptions, RunState};
use crate::ids::{now_ms, opaque_id};
use crate::llm::Decider;
use crate::orchestrator::{
    execute_instruction, Action, DelegationDetails, GroupTask, Instruction, ResultStatus,
    TaskGroupAction,
};
use crate::run_config::{ConfigError, RunConfig, RunConfigSource};

/// Result of scheduling one task group.
pub(crate) struct GroupOutcome {
    pub status: ResultStatus,
    pub error: Option<String>,
    pub group_id: String,
    pub tasks_log: Vec<Value>,
    pub response: Value,
}

/// Wraps the parent's config source for a delegated run: the delegated agent
/// may not RESPOND, must TASK_RESPOND, and sees the delegation assignment in
/// its system params.
struct DelegatedConfigSource<'a> {
    inner: &'a dyn RunConfigSource,
    delegation: Map<String, Value>,
}

impl RunConfigSource for DelegatedConfigSource<'_> {
    fn run_config(&self, agent_key: &str) -> Result<RunConfig, ConfigError> {
        let mut cfg = self.inner.run_config(agent_key)?;
        cfg.allow_respond = false;
        cfg.allow_task_respond = true;
        cfg.system_params.insert(
            "delegation".to_string(),
            Value::Object(self.delegation.clone()),
        );
        Ok(cfg)
    }
}

struct DelegationOutcome {
    ok: bool,
    attempt_entry: Value,
    result_payload: Option<Value>,
    error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn run_delegation_attempt(
    detail: &DelegationDetails,
    delegating_agent_key: &str,
    group_id: &str,
    parent_task_id: &str,
    attempt_index: u32,
    cfg_source: &dyn RunConfigSource,
    decider: &dyn Decider,
    opts: &RunOptions,
) -> DelegationOutcome {
    let mut delegation = detail.context_overrides.clone();
    delegation.insert("assignment".to_string(), json!(detail.assignment));
    delegation.insert("parent_agent".to_string(), json!(delegating_agent_key));
    delegation.insert("group_id".to_string(), json!(group_id));
    delegation.insert("task_id".to_string(), json!(parent_task_id));

    let delegated_source = DelegatedConfigSource {
        inner: cfg_source,
        delegation,
    };
    let sub_opts = RunOptions {
        max_steps: detail.max_steps.max(1),
        model: opts.model.clone(),
        debug: opts.debug,
    };

    let attempt_started_at_ms = now_ms();
    let sub_run = run_loop(
        &delegated_source,
        &detail.agent_key,
        &detail.assignment,
        decider,
        &sub_opts,
    );
    let attempt_completed_at_ms = now_ms();

    let final_outcome = &sub_run.final_outcome;
    let ok = final_outcome.status == "ok"
        && final_outcome.action_type.as_deref() == Some("TASK_RESPOND");
    let error = if ok {
        None
    } else {
        Some(
            final_outcome
                .error
                .clone()
                .unwrap_or_else(|| "Delegated agent did not complete successfully".to_string()),
        )
    };
    let result_payload = ok.then(|| final_outcome.response.clone()).flatten();

    let mut attempt_entry = json!({
        "attempt": attempt_index,
        "status": if ok { "ok" } else { "error" },
        "agent_key": detail.agent_key,
        "assignment": detail.assignment,
        "started_at_ms": attempt_started_at_ms,
        "completed_at_ms": attempt_completed_at_ms,
        "duration_ms": (attempt_completed_at_ms - attempt_started_at_ms).max(0),
        "run": {
            "final": final_outcome,
            "execution_log": sub_run.execution_log,
            "tool_log": sub_run.tool_log,
            "step_events": sub_run.step_events,
            "run_duration_ms": sub_run.run_duration_ms,
        },
    });
    if let (Some(err), Some(obj)) = (&error, attempt_entry.as_object_mut()) {
        obj.insert("error".to_string(), json!(err));
    }

    DelegationOutcome {
        ok,
        attempt_entry,
        result_payload,
        error,
    }
}

/// Schedules one TASK_GROUP action with the current agent's config.
#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_task_group(
    action: &TaskGroupAction,
    cfg: &RunConfig,
    state: &mut RunState,
    cfg_source: &dyn RunConfigSource,
    decider: &dyn Decider,
    opts: &RunOptions,
    agent_key: &str,
    step_idx: u64,
) -> GroupOutcome {
    let group_id = action
        .group_id
        .clone()
        .unwrap_or_else(opaque_id);

    if !cfg.allow_task_group {
        return GroupOutcome {
            status: ResultStatus::Error,
            error: Some(format!(
                "task_group_not_permitted: agent '{agent_key}' may not TASK_GROUP"
            )),
            group_id,
            tasks_log: Vec::new(),
            response: Value::Null,
        };
    }

    let mut tasks_log: Vec<Value> = Vec::new();
    let mut response_tasks: Vec<Value> = Vec::new();

    for (idx, task) in action.tasks.iter().enumerate() {
        let task_identifier = task
            .task_id()
            .map(String::from)
            .unwrap_or_else(|| idx.to_string());
        let attempts_allowed = task.retry_policy().attempts.max(1);
        let mut attempt_entries: Vec<Value> = Vec::new();
        let mut task_success = false;
        let mut last_error: Option<String> = None;
        let mut result_payload: Option<Value> = None;

        for attempt_idx in 1..=attempts_allowed {
            let attempt_started_at_ms = now_ms();
            let attempt_perf_start = Instant::now();

            match task {
                GroupTask::UseTool(use_tool) => {
                    let child_instr = Instruction {
                        reasoning: format!("TASK_GROUP child {task_identifier}"),
                        action: Action::UseTool {
                            tool_name: use_tool.tool_name.clone(),
                            tool_params: use_tool.tool_params.clone(),
                        },
                    };
                    let child_result = execute_instruction(&child_instr, cfg);
                    let action_duration_ms =
                        attempt_perf_start.elapsed().as_millis() as u64;
                    let info = state.log_tool_execution(
                        agent_key,
                        cfg.display_name.as_deref(),
                        step_idx + 1,
                        &use_tool.tool_name,
                        &use_tool.tool_params,
                        &child_result,
                        attempt_started_at_ms,
                        action_duration_ms,
                        Some(&group_id),
                        Some(&task_identifier),
                        Some(attempt_idx),
                        cfg.log_policy.as_ref(),
                    );
                    let mut entry = Map::new();
                    entry.insert("attempt".to_string(), json!(attempt_idx));
                    entry.insert("status".to_string(), json!(child_result.status.as_str()));
                    entry.insert("tool".to_string(), json!(use_tool.tool_name));
                    entry.insert("execution_id".to_string(), json!(info.execution_id));
                    entry.insert("duration_ms".to_string(), json!(action_duration_ms));
                    if child_result.status == ResultStatus::Ok {
                        entry.insert("result".to_string(), info.result.clone());
                        result_payload = Some(info.result);
                        task_success = true;
                        last_error = None;
                    } else {
                        let err = child_result
                            .error
                            .unwrap_or_else(|| "tool execution failed".to_string());
                        entry.insert("error".to_string(), json!(err));
                        last_error = Some(err);
                    }
                    attempt_entries.push(Value::Object(entry));
                }
                GroupTask::DelegateAgent(delegate) => {
                    let mut delegation_attempts: Vec<Value> = Vec::new();
                    let mut delegation_results: Vec<Value> = Vec::new();
                    let mut delegation_error: Option<String> = None;
                    for detail in &delegate.delegation_details {
                        let outcome = run_delegation_attempt(
                            detail,
                            agent_key,
                            &group_id,
                            &task_identifier,
                            attempt_idx,
                            cfg_source,
                            decider,
                            opts,
                        );
                        delegation_attempts.push(outcome.attempt_entry);
                        if !outcome.ok {
                            delegation_error = Some(
                                outcome
                                    .error
                                    .unwrap_or_else(|| "delegated agent failed".to_string()),
                            );
                            break;
                        }
                        delegation_results
                            .push(outcome.result_payload.unwrap_or(Value::Null));
                    }

                    let mut entry = Map::new();
                    entry.insert("attempt".to_string(), json!(attempt_idx));
                    entry.insert(
                        "status".to_string(),
                        json!(if delegation_error.is_none() { "ok" } else { "error" }),
                    );
                    entry.insert("delegations".to_string(), json!(delegation_attempts));
                    match delegation_error {
                        Some(err) => {
                            entry.insert("error".to_string(), json!(err));
                            last_error = Some(err);
                        }
                        None => {
                            result_payload = Some(Value::Array(delegation_results));
                            task_success = true;
                            last_error = None;
                        }
                    }
                    attempt_entries.push(Value::Object(entry));
                }
            }

            if task_success {
                break;
            }
        }

        let mut task_entry = Map::new();
        task_entry.insert("task_id".to_string(), json!(task_identifier));
        task_entry.insert("task_type".to_string(), json!(task.task_type()));
        task_entry.insert(
            "status".to_string(),
            json!(if task_success { "ok" } else { "error" }),
        );
        task_entry.insert("attempts".to_string(), json!(attempt_entries));
        if let Some(result) = &result_payload {
            task_entry.insert("result".to_string(), result.clone());
        }
        if !task_success {
            if let Some(err) = &last_error {
                task_entry.insert("error".to_string(), json!(err));
            }
        }
        tasks_log.push(Value::Object(task_entry));

        response_tasks.push(json!({
            "task_id": task_identifier,
            "status": if task_success { "ok" } else { "error" },
            "result": result_payload,
            "error": if task_success { Value::Null } else { json!(last_error) },
        }));

        // First exhausted task aborts the group; later siblings never start.
        if !task_success {
            return GroupOutcome {
                status: ResultStatus::Error,
                error: last_error,
                group_id: group_id.clone(),
                tasks_log,
                response: json!({
                    "group_id": group_id,
                    "tasks": response_tasks,
                }),
            };
        }
    }

    GroupOutcome {
        status: ResultStatus::Ok,
        error: None,
        group_id: group_id.clone(),
        tasks_log,
        response: json!({
            "group_id": group_id,
            "tasks": response_tasks,
        }),
    }
}
