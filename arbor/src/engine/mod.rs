//! The run engine: a per-run state machine that iterates build-prompt →
//! decide → execute → log until a terminal action, enforcing max steps,
//! switching agents on routing, and scheduling task groups.
//!
//! One run is strictly single-threaded; the engine blocks on the LLM and on
//! tool providers. Async callers dispatch [`run_loop`] to a worker thread.

pub mod task_group;

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Map, Value};
use step_event::{StepEntryType, StepEnvelope, StepSeq};

use crate::ids::now_ms;
use crate::llm::{parse_decision, Decider, LlmUsage};
use crate::logs::policy::{build_previews, truncate, ExecutionLogPolicy};
use crate::logs::{
    AgentEntry, AgentTiming, DecisionPreview, ExecutionLog, TaskGroupEntry, ToolEntry,
    ToolRecord, ToolStore, ToolTiming,
};
use crate::orchestrator::decision::decision_to_instruction;
use crate::orchestrator::{
    execute_instruction, Action, OrchestratorResult, ResultStatus,
};
use crate::prompts;
use crate::run_config::RunConfigSource;

/// Options for one run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub max_steps: u32,
    pub model: Option<String>,
    pub debug: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            model: None,
            debug: false,
        }
    }
}

/// Terminal outcome of a run: the executed result of the final action, plus
/// the action kind for TASK_RESPOND / failed TASK_GROUP terminations.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FinalOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

impl FinalOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    fn from_result(res: &OrchestratorResult) -> Self {
        Self {
            status: res.status.as_str().to_string(),
            response: res.response.clone(),
            next_agent: res.next_agent.clone(),
            error: res.error.clone(),
            action_type: None,
        }
    }
}

/// Per-step and whole-run timing block.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LatencyBlock {
    pub steps: Vec<Value>,
    pub total_run_ms: u64,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
}

/// Everything one run produced. The HTTP layer adds the trace id and
/// network/version fields before returning it.
#[derive(Debug, Serialize)]
pub struct RunArtifact {
    #[serde(rename = "final")]
    pub final_outcome: FinalOutcome,
    pub execution_log: Vec<Value>,
    pub tool_log: Map<String, Value>,
    pub tool_log_keys: Vec<String>,
    pub step_events: Vec<StepEnvelope>,
    pub latency: LatencyBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_usage_totals: Option<LlmUsage>,
    pub run_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<Value>>,
}

impl RunArtifact {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Mutable per-run accumulators shared between the step loop and the
/// task-group scheduler.
pub(crate) struct RunState {
    pub log: ExecutionLog,
    pub tool_store: ToolStore,
    seq: StepSeq,
    pub step_events: Vec<StepEnvelope>,
    pub step_summaries: Vec<Value>,
    pub total_usage: Option<LlmUsage>,
    pub debug_steps: Vec<Value>,
}

/// What one tool execution contributed to the log and store.
pub(crate) struct ToolExecInfo {
    pub execution_id: String,
    pub tool_key: String,
    pub duration_ms: u64,
    pub result: Value,
}

impl RunState {
    fn new() -> Self {
        Self {
            log: ExecutionLog::new(),
            tool_store: ToolStore::new(),
            seq: StepSeq::new(),
            step_events: Vec::new(),
            step_summaries: Vec::new(),
            total_usage: None,
            debug_steps: Vec::new(),
        }
    }

    fn push_step_event(&mut self, entry_type: StepEntryType, payload: Value, timestamp_ms: i64) {
        let env = self.seq.envelope(entry_type, payload, timestamp_ms);
        self.step_events.push(env);
    }

    fn last_entry_value(&self) -> Value {
        self.log
            .entries()
            .last()
            .and_then(|e| serde_json::to_value(e).ok())
            .unwrap_or(Value::Null)
    }

    /// Records one tool execution in the store and the log, and emits its
    /// step event. Used both by the top-level USE_TOOL dispatch and by
    /// task-group children (which tag group/task/attempt).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn log_tool_execution(
        &mut self,
        agent_key: &str,
        agent_display_name: Option<&str>,
        step_idx: u64,
        attempted_tool: &str,
        attempted_params: &Map<String, Value>,
        res: &OrchestratorResult,
        action_started_at_ms: i64,
        action_duration_ms: u64,
        group_id: Option<&str>,
        parent_task_id: Option<&str>,
        attempt: Option<u32>,
        log_policy: Option<&ExecutionLogPolicy>,
    ) -> ToolExecInfo {
        let response = res.response.as_ref().and_then(Value::as_object);
        let tool_key = response
            .and_then(|r| r.get("tool"))
            .and_then(Value::as_str)
            .unwrap_or(attempted_tool)
            .to_string();
        let params_for_log = response
            .and_then(|r| r.get("params"))
            .cloned()
            .unwrap_or_else(|| {
                if res.status == ResultStatus::Ok {
                    json!({})
                } else {
                    Value::Object(attempted_params.clone())
                }
            });
        let mut full_result = response.and_then(|r| r.get("result")).cloned().unwrap_or(
            Value::Null,
        );
        if res.status != ResultStatus::Ok && full_result.is_null() {
            full_result = json!({ "error": res.error });
        }
        let duration_ms = response
            .and_then(|r| r.get("duration_ms"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let started_at_ms = action_started_at_ms;
        let completed_at_ms = started_at_ms + duration_ms.max(action_duration_ms) as i64;

        let execution_id = self.tool_store.put(ToolRecord {
            agent_key: agent_key.to_string(),
            tool_key: tool_key.clone(),
            params: params_for_log.clone(),
            result: full_result.clone(),
            duration_ms,
            ts: completed_at_ms,
            started_at_ms: Some(started_at_ms),
            completed_at_ms: Some(completed_at_ms),
            total_duration_ms: Some(action_duration_ms),
            group_id: group_id.map(String::from),
            parent_task_id: parent_task_id.map(String::from),
            attempt,
        });

        let previews = build_previews(log_policy, &tool_key, &params_for_log, &full_result);
        self.log.push_tool(ToolEntry {
            step: step_idx,
            epoch: 0,
            agent_key: agent_key.to_string(),
            tool_key: tool_key.clone(),
            execution_id: execution_id.clone(),
            request_preview: previews.request_preview,
            response_preview: previews.response_preview,
            request_excerpt: previews.request_excerpt,
            response_excerpt: previews.response_excerpt,
            status: res.status.as_str().to_string(),
            duration_ms,
            total_duration_ms: Some(action_duration_ms),
            request_payload: Some(params_for_log),
            response_payload: Some(full_result.clone()),
            timing: Some(ToolTiming {
                started_at_ms,
                completed_at_ms,
                duration_ms,
                total_duration_ms: Some(action_duration_ms),
            }),
            group_id: group_id.map(String::from),
            parent_task_id: parent_task_id.map(String::from),
            attempt,
        });
        let entry_value = self.last_entry_value();
        self.push_step_event(StepEntryType::Tool, entry_value, started_at_ms);

        ToolExecInfo {
            execution_id,
            tool_key,
            duration_ms,
            result: full_result,
        }
    }
}

fn finalize(
    state: RunState,
    final_outcome: FinalOutcome,
    run_perf_start: Instant,
    run_started_at_ms: i64,
    debug: bool,
) -> RunArtifact {
    let run_duration_ms = run_perf_start.elapsed().as_millis() as u64;
    RunArtifact {
        final_outcome,
        execution_log: state.log.to_values(),
        tool_log: state.tool_store.to_map(),
        tool_log_keys: state.tool_store.execution_ids(),
        step_events: state.step_events,
        latency: LatencyBlock {
            steps: state.step_summaries,
            total_run_ms: run_duration_ms,
            started_at_ms: run_started_at_ms,
            completed_at_ms: run_started_at_ms + run_duration_ms as i64,
        },
        llm_usage_totals: state.total_usage,
        run_duration_ms,
        debug: debug.then_some(state.debug_steps),
    }
}

/// Drives one run to a terminal outcome.
///
/// The loop never panics on a bad decision: configuration misses, parse
/// failures, and gate rejections all terminate with `final.status == "error"`
/// so the caller can inspect the log.
pub fn run_loop(
    cfg_source: &dyn RunConfigSource,
    default_agent_key: &str,
    user_message: &str,
    decider: &dyn Decider,
    opts: &RunOptions,
) -> RunArtifact {
    let run_perf_start = Instant::now();
    let run_started_at_ms = now_ms();
    let mut state = RunState::new();
    let mut current_agent = default_agent_key.to_string();
    let mut pending_route_context: HashMap<String, Map<String, Value>> = HashMap::new();
    let max_steps = u64::from(opts.max_steps.max(1));
    let mut step: u64 = 0;

    loop {
        if step >= max_steps {
            return finalize(
                state,
                FinalOutcome::error("max_steps_exceeded"),
                run_perf_start,
                run_started_at_ms,
                opts.debug,
            );
        }

        let cfg = match cfg_source.run_config(&current_agent) {
            Ok(cfg) => cfg,
            Err(e) => {
                return finalize(
                    state,
                    FinalOutcome::error(format!("config_missing: {e}")),
                    run_perf_start,
                    run_started_at_ms,
                    opts.debug,
                );
            }
        };
        let handoff_context = pending_route_context.remove(&current_agent);
        let agent_key = cfg.current_agent.clone();
        state.log.start_agent_epoch(&agent_key);
        let epoch = state.log.current_epoch_for(&agent_key);

        let step_started_at_ms = now_ms();
        let step_perf_start = Instant::now();

        let prompt = {
            let full_tool_outputs = state.tool_store.collect_full_for(&state.log, &agent_key, epoch);
            let tool_defs = prompts::build_tool_definitions(&cfg);
            let route_defs = prompts::build_route_definitions(&cfg);
            let constraints = prompts::build_constraints(&cfg);
            // The original user message is repeated verbatim on every step so
            // routed agents see the full request instead of a placeholder.
            let context = prompts::build_context(
                user_message,
                &state.log,
                &full_tool_outputs,
                handoff_context.as_ref(),
            );
            prompts::build_prompt(
                cfg.prompt.as_deref(),
                &tool_defs,
                &route_defs,
                &constraints,
                &context,
            )
        };
        if opts.debug {
            tracing::debug!(step, agent = %agent_key, "LLM request prompt:\n{prompt}");
        }

        let llm_started_at_ms = now_ms();
        let llm_perf_start = Instant::now();
        let decide_res = match decider.decide(&prompt, opts.model.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                return finalize(
                    state,
                    FinalOutcome::error(e.to_string()),
                    run_perf_start,
                    run_started_at_ms,
                    opts.debug,
                );
            }
        };
        let llm_duration_ms = llm_perf_start.elapsed().as_millis() as u64;
        let llm_completed_at_ms = llm_started_at_ms + llm_duration_ms as i64;

        let step_usage = decide_res.usage;
        let cumulative_usage = match step_usage {
            Some(usage) => {
                let normalized = LlmUsage {
                    prompt_tokens: usage.prompt_tokens,
                    response_tokens: usage.response_tokens,
                    total_tokens: usage.effective_total(),
                };
                let total = state
                    .total_usage
                    .map(|t| t.combined(&usage))
                    .unwrap_or(normalized);
                state.total_usage = Some(total);
                Some(total)
            }
            None => state.total_usage,
        };

        let decision = match decide_res.parsed.clone() {
            Some(d) => d,
            None => match parse_decision(&decide_res.text) {
                Ok(d) => d,
                Err(e) => {
                    return finalize(
                        state,
                        FinalOutcome::error(format!("llm_parse_error: {e}")),
                        run_perf_start,
                        run_started_at_ms,
                        opts.debug,
                    );
                }
            },
        };
        let decision_value = serde_json::to_value(&decision).unwrap_or(Value::Null);
        if opts.debug {
            tracing::debug!(step, agent = %agent_key, "LLM raw response:\n{}", decide_res.text);
            state.debug_steps.push(json!({
                "agent": agent_key,
                "prompt": prompt,
                "raw": decide_res.text,
            }));
        }

        let instr = match decision_to_instruction(&decision) {
            Ok(instr) => instr,
            Err(e) => {
                return finalize(
                    state,
                    FinalOutcome::error(format!("invalid_decision: {e}")),
                    run_perf_start,
                    run_started_at_ms,
                    opts.debug,
                );
            }
        };

        let action_started_at_ms = now_ms();
        let action_perf_start = Instant::now();
        let (res, group_outcome) = match &instr.action {
            Action::TaskGroup(group) => {
                let outcome = task_group::handle_task_group(
                    group,
                    &cfg,
                    &mut state,
                    cfg_source,
                    decider,
                    opts,
                    &agent_key,
                    step,
                );
                let res = OrchestratorResult {
                    status: outcome.status,
                    response: Some(outcome.response.clone()),
                    next_agent: None,
                    error: outcome.error.clone(),
                };
                (res, Some(outcome))
            }
            _ => (execute_instruction(&instr, &cfg), None),
        };
        let action_duration_ms = action_perf_start.elapsed().as_millis() as u64;
        let step_duration_ms = step_perf_start.elapsed().as_millis() as u64;
        let step_completed_at_ms = step_started_at_ms + step_duration_ms as i64;

        let is_terminal_respond = matches!(
            instr.action,
            Action::Respond { .. } | Action::TaskRespond { .. }
        ) && res.status == ResultStatus::Ok;
        let route_context = match &instr.action {
            Action::RouteToAgent { context, .. }
                if res.status == ResultStatus::NotImplemented && !context.is_empty() =>
            {
                Some(context.clone())
            }
            _ => None,
        };

        let mut agent_entry = AgentEntry {
            step,
            epoch: 0,
            agent_key: agent_key.clone(),
            agent_display_name: cfg.display_name.clone(),
            input_preview: truncate(user_message, 80),
            decision: DecisionPreview {
                action: decision.action.as_str().to_string(),
                action_reasoning: truncate(&decision.action_reasoning, 120),
                action_details: truncate(&decision.action_details.to_string(), 120),
            },
            prompt: Some(prompt.clone()),
            raw_response: Some(decide_res.text.clone()),
            decision_full: Some(decision_value),
            duration_ms: Some(step_duration_ms),
            llm_duration_ms: Some(llm_duration_ms),
            timing: Some(AgentTiming {
                step_started_at_ms,
                step_duration_ms,
                step_completed_at_ms,
                llm_started_at_ms,
                llm_duration_ms,
                llm_completed_at_ms,
            }),
            llm_usage: step_usage,
            llm_usage_raw: decide_res.usage_raw.clone(),
            llm_response_payload: decide_res.response_payload.clone(),
            llm_usage_cumulative: cumulative_usage,
            route_context: route_context
                .as_ref()
                .map(|c| Value::Object(c.clone())),
            run_duration_ms: is_terminal_respond
                .then(|| run_perf_start.elapsed().as_millis() as u64),
        };

        let mut summary = Map::new();
        summary.insert("step".to_string(), json!(step));
        summary.insert("agent_key".to_string(), json!(agent_key));
        summary.insert("action_type".to_string(), json!(instr.action.kind()));
        summary.insert("duration_ms".to_string(), json!(step_duration_ms));
        summary.insert("started_at_ms".to_string(), json!(step_started_at_ms));
        summary.insert("completed_at_ms".to_string(), json!(step_completed_at_ms));
        summary.insert("llm_duration_ms".to_string(), json!(llm_duration_ms));
        summary.insert("llm_started_at_ms".to_string(), json!(llm_started_at_ms));
        summary.insert("llm_completed_at_ms".to_string(), json!(llm_completed_at_ms));
        if let Some(usage) = step_usage {
            summary.insert("llm_prompt_tokens".to_string(), json!(usage.prompt_tokens));
            summary.insert(
                "llm_response_tokens".to_string(),
                json!(usage.response_tokens),
            );
            summary.insert("llm_total_tokens".to_string(), json!(usage.total_tokens));
        }
        if let Some(total) = cumulative_usage {
            summary.insert(
                "llm_prompt_tokens_total".to_string(),
                json!(total.prompt_tokens),
            );
            summary.insert(
                "llm_response_tokens_total".to_string(),
                json!(total.response_tokens),
            );
            summary.insert("llm_total_tokens_total".to_string(), json!(total.total_tokens));
        }
        summary.insert("result_status".to_string(), json!(res.status.as_str()));

        // Gate rejections are terminal at the loop level: surface the reason
        // as a run error (only task-group children retry).
        if res.status == ResultStatus::Retry {
            agent_entry.run_duration_ms = Some(run_perf_start.elapsed().as_millis() as u64);
            state.log.push_agent(agent_entry);
            let entry_value = state.last_entry_value();
            state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);
            state.step_summaries.push(Value::Object(summary));
            let final_outcome = FinalOutcome {
                status: "error".to_string(),
                response: res.response.clone(),
                next_agent: None,
                error: res.error.clone(),
                action_type: Some(instr.action.kind().to_string()),
            };
            return finalize(state, final_outcome, run_perf_start, run_started_at_ms, opts.debug);
        }

        match &instr.action {
            Action::Respond { .. } | Action::TaskRespond { .. } => {
                let run_duration_ms = run_perf_start.elapsed().as_millis() as u64;
                agent_entry.run_duration_ms = Some(run_duration_ms);
                summary.insert("run_duration_ms".to_string(), json!(run_duration_ms));
                let is_task_respond = matches!(instr.action, Action::TaskRespond { .. });
                state.log.push_agent(agent_entry);
                let entry_value = state.last_entry_value();
                state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);
                state.step_summaries.push(Value::Object(summary));
                let mut final_outcome = FinalOutcome::from_result(&res);
                if is_task_respond {
                    final_outcome.action_type = Some("TASK_RESPOND".to_string());
                }
                return finalize(
                    state,
                    final_outcome,
                    run_perf_start,
                    run_started_at_ms,
                    opts.debug,
                );
            }
            Action::UseTool {
                tool_name,
                tool_params,
            } => {
                state.log.push_agent(agent_entry);
                let entry_value = state.last_entry_value();
                state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);

                // Tool entries carry the next step index, matching the log
                // sequence the agent observes on its following turn.
                let info = state.log_tool_execution(
                    &agent_key,
                    cfg.display_name.as_deref(),
                    step + 1,
                    tool_name,
                    tool_params,
                    &res,
                    action_started_at_ms,
                    action_duration_ms,
                    None,
                    None,
                    None,
                    cfg.log_policy.as_ref(),
                );
                summary.insert("tool_key".to_string(), json!(info.tool_key));
                summary.insert("tool_status".to_string(), json!(res.status.as_str()));
                summary.insert("tool_duration_ms".to_string(), json!(info.duration_ms));
                summary.insert(
                    "tool_total_duration_ms".to_string(),
                    json!(action_duration_ms),
                );
                state.step_summaries.push(Value::Object(summary));
                // Provider errors are non-fatal: the model observes the
                // failure on its next step. The agent is unchanged.
            }
            Action::RouteToAgent { .. } => {
                let target = res.next_agent.clone().unwrap_or_default();
                if target.is_empty() {
                    // not_implemented without a target: bail verbatim.
                    state.log.push_agent(agent_entry);
                    let entry_value = state.last_entry_value();
                    state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);
                    state.step_summaries.push(Value::Object(summary));
                    return finalize(
                        state,
                        FinalOutcome::from_result(&res),
                        run_perf_start,
                        run_started_at_ms,
                        opts.debug,
                    );
                }
                state.log.push_agent(agent_entry);
                let entry_value = state.last_entry_value();
                state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);
                summary.insert("routed_to_agent".to_string(), json!(target));
                if let Some(context) = &route_context {
                    let mut keys: Vec<&String> = context.keys().collect();
                    keys.sort();
                    summary.insert("route_context_keys".to_string(), json!(keys));
                    pending_route_context.insert(target.clone(), context.clone());
                } else {
                    pending_route_context.insert(target.clone(), Map::new());
                }
                state.step_summaries.push(Value::Object(summary));
                current_agent = target;
            }
            Action::TaskGroup(_) => {
                state.log.push_agent(agent_entry);
                let entry_value = state.last_entry_value();
                state.push_step_event(StepEntryType::Agent, entry_value, step_started_at_ms);

                if let Some(outcome) = &group_outcome {
                    let group_completed_at_ms =
                        action_started_at_ms + action_duration_ms as i64;
                    state.log.push_task_group(TaskGroupEntry {
                        step: step + 1,
                        epoch: 0,
                        agent_key: agent_key.clone(),
                        group_id: outcome.group_id.clone(),
                        status: outcome.status.as_str().to_string(),
                        reasoning: Some(instr.reasoning.clone()),
                        tasks: Value::Array(outcome.tasks_log.clone()),
                        started_at_ms: action_started_at_ms,
                        duration_ms: action_duration_ms,
                        completed_at_ms: group_completed_at_ms,
                    });
                    let entry_value = state.last_entry_value();
                    state.push_step_event(
                        StepEntryType::TaskGroup,
                        entry_value,
                        action_started_at_ms,
                    );
                    summary.insert("task_group_id".to_string(), json!(outcome.group_id));
                    summary.insert(
                        "task_group_status".to_string(),
                        json!(outcome.status.as_str()),
                    );
                    summary.insert(
                        "task_group_duration_ms".to_string(),
                        json!(action_duration_ms),
                    );
                }
                state.step_summaries.push(Value::Object(summary));

                if res.status != ResultStatus::Ok {
                    let mut final_outcome = FinalOutcome::from_result(&res);
                    final_outcome.action_type = Some("TASK_GROUP".to_string());
                    return finalize(
                        state,
                        final_outcome,
                        run_perf_start,
                        run_started_at_ms,
                        opts.debug,
                    );
                }
            }
        }

        step += 1;
    }
}
