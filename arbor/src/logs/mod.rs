//! Execution log and tool store for one run.
//!
//! The log is the totally-ordered record of agent steps, tool calls, task
//! groups, and system messages; the tool store keeps the full tool payloads
//! by execution id so log entries stay small. Epoch accounting scopes
//! tool-output visibility: each contiguous run of steps by one agent is one
//! epoch, and an agent only sees tool outputs from its current epoch.

pub mod policy;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{now_ms, opaque_id};
use crate::llm::LlmUsage;

/// One entry of the execution log, tagged by type on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Agent(AgentEntry),
    Tool(ToolEntry),
    TaskGroup(TaskGroupEntry),
    System(SystemEntry),
}

impl LogEntry {
    pub fn step(&self) -> Option<u64> {
        match self {
            Self::Agent(e) => Some(e.step),
            Self::Tool(e) => Some(e.step),
            Self::TaskGroup(e) => Some(e.step),
            Self::System(_) => None,
        }
    }

    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Agent(e) => Some(e.epoch),
            Self::Tool(e) => Some(e.epoch),
            Self::TaskGroup(e) => Some(e.epoch),
            Self::System(_) => None,
        }
    }
}

/// Truncated view of the decision shown in the log listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionPreview {
    pub action: String,
    pub action_reasoning: String,
    pub action_details: String,
}

/// Timing block for one agent step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentTiming {
    pub step_started_at_ms: i64,
    pub step_duration_ms: u64,
    pub step_completed_at_ms: i64,
    pub llm_started_at_ms: i64,
    pub llm_duration_ms: u64,
    pub llm_completed_at_ms: i64,
}

/// One agent step: the decision the LLM made, with prompt, raw response, and
/// token usage for this step and cumulatively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentEntry {
    pub step: u64,
    pub epoch: u64,
    pub agent_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_display_name: Option<String>,
    pub input_preview: String,
    pub decision: DecisionPreview,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_full: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<AgentTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage_raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage_cumulative: Option<LlmUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_duration_ms: Option<u64>,
}

/// Timing block for one tool execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolTiming {
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
}

/// One tool execution. Carries previews and the execution id; the full
/// payloads live in the [`ToolStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolEntry {
    pub step: u64,
    pub epoch: u64,
    pub agent_key: String,
    pub tool_key: String,
    pub execution_id: String,
    pub request_preview: String,
    pub response_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_excerpt: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_excerpt: Option<HashMap<String, String>>,
    pub status: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ToolTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// One task group: status plus the aggregated child-task log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskGroupEntry {
    pub step: u64,
    pub epoch: u64,
    pub agent_key: String,
    pub group_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub tasks: Value,
    pub started_at_ms: i64,
    pub duration_ms: u64,
    pub completed_at_ms: i64,
}

/// Free-form system message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemEntry {
    pub message: String,
    pub timestamp_ms: i64,
}

/// Ordered event log of one run, with per-agent epoch accounting.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
    epoch_by_agent: HashMap<String, u64>,
    current_epoch: u64,
    last_agent: Option<String>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the epoch counter for a step by `agent_key`. The first agent
    /// starts at epoch 0; every transition to a different agent increments
    /// the counter, and the new agent adopts the incremented value (also on
    /// re-entry, so each contiguous run of steps by one agent is one epoch).
    pub fn start_agent_epoch(&mut self, agent_key: &str) {
        match &self.last_agent {
            None => self.current_epoch = 0,
            Some(last) if last != agent_key => self.current_epoch += 1,
            Some(_) => {}
        }
        self.epoch_by_agent
            .insert(agent_key.to_string(), self.current_epoch);
        self.last_agent = Some(agent_key.to_string());
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn current_epoch_for(&self, agent_key: &str) -> u64 {
        self.epoch_by_agent
            .get(agent_key)
            .copied()
            .unwrap_or(self.current_epoch)
    }

    /// Appends an agent entry, stamping the current epoch.
    pub fn push_agent(&mut self, mut entry: AgentEntry) {
        entry.epoch = self.current_epoch;
        self.entries.push(LogEntry::Agent(entry));
    }

    /// Appends a tool entry, stamping the current epoch.
    pub fn push_tool(&mut self, mut entry: ToolEntry) {
        entry.epoch = self.current_epoch;
        self.entries.push(LogEntry::Tool(entry));
    }

    /// Appends a task-group entry, stamping the current epoch.
    pub fn push_task_group(&mut self, mut entry: TaskGroupEntry) {
        entry.epoch = self.current_epoch;
        self.entries.push(LogEntry::TaskGroup(entry));
    }

    /// Appends a free-form system message with the current timestamp.
    pub fn push_system(&mut self, message: impl Into<String>) {
        self.entries.push(LogEntry::System(SystemEntry {
            message: message.into(),
            timestamp_ms: now_ms(),
        }));
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Mutable access to the most recent agent entry, for late annotations
    /// (route context, final run duration).
    pub fn last_agent_mut(&mut self) -> Option<&mut AgentEntry> {
        self.entries.iter_mut().rev().find_map(|e| match e {
            LogEntry::Agent(entry) => Some(entry),
            _ => None,
        })
    }

    /// Serializes every entry for the wire.
    pub fn to_values(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect()
    }
}

/// Full record of one tool execution, stored by opaque execution id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRecord {
    pub agent_key: String,
    pub tool_key: String,
    pub params: Value,
    pub result: Value,
    pub duration_ms: u64,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// By-id store of full tool payloads, insertion-ordered.
#[derive(Debug, Default)]
pub struct ToolStore {
    records: Vec<(String, ToolRecord)>,
}

impl ToolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record and returns its fresh opaque execution id.
    pub fn put(&mut self, mut record: ToolRecord) -> String {
        if record.ts == 0 {
            record.ts = record.completed_at_ms.unwrap_or_else(now_ms);
        }
        let execution_id = opaque_id();
        self.records.push((execution_id.clone(), record));
        execution_id
    }

    pub fn get(&self, execution_id: &str) -> Option<&ToolRecord> {
        self.records
            .iter()
            .find(|(id, _)| id == execution_id)
            .map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn execution_ids(&self) -> Vec<String> {
        self.records.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Walks the log and returns every tool execution tagged with
    /// `(agent_key, epoch)`, in insertion order, with its full record. This
    /// is how an agent sees the outputs of its own tool calls within its
    /// current epoch and nothing across agent boundaries.
    pub fn collect_full_for<'a>(
        &'a self,
        log: &ExecutionLog,
        agent_key: &str,
        epoch: u64,
    ) -> Vec<(String, &'a ToolRecord)> {
        let mut out = Vec::new();
        for entry in log.entries() {
            let LogEntry::Tool(tool) = entry else {
                continue;
            };
            if tool.agent_key != agent_key || tool.epoch != epoch {
                continue;
            }
            if let Some(record) = self.get(&tool.execution_id) {
                out.push((tool.execution_id.clone(), record));
            }
        }
        out
    }

    /// Serializes the store as an object keyed by execution id.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for (id, record) in &self.records {
            map.insert(
                id.clone(),
                serde_json::to_value(record).unwrap_or(Value::Null),
            );
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent_entry(step: u64, agent: &str) -> AgentEntry {
        AgentEntry {
            step,
            epoch: 0,
            agent_key: agent.to_string(),
            agent_display_name: None,
            input_preview: String::new(),
            decision: DecisionPreview {
                action: "RESPOND".to_string(),
                action_reasoning: String::new(),
                action_details: String::new(),
            },
            prompt: None,
            raw_response: None,
            decision_full: None,
            duration_ms: None,
            llm_duration_ms: None,
            timing: None,
            llm_usage: None,
            llm_usage_raw: None,
            llm_response_payload: None,
            llm_usage_cumulative: None,
            route_context: None,
            run_duration_ms: None,
        }
    }

    fn tool_entry(step: u64, agent: &str, execution_id: &str) -> ToolEntry {
        ToolEntry {
            step,
            epoch: 0,
            agent_key: agent.to_string(),
            tool_key: "echo".to_string(),
            execution_id: execution_id.to_string(),
            request_preview: String::new(),
            response_preview: String::new(),
            request_excerpt: None,
            response_excerpt: None,
            status: "ok".to_string(),
            duration_ms: 1,
            total_duration_ms: None,
            request_payload: None,
            response_payload: None,
            timing: None,
            group_id: None,
            parent_task_id: None,
            attempt: None,
        }
    }

    #[test]
    fn epochs_advance_on_agent_change_only() {
        let mut log = ExecutionLog::new();
        log.start_agent_epoch("a");
        assert_eq!(log.current_epoch(), 0);
        log.start_agent_epoch("a");
        assert_eq!(log.current_epoch(), 0);
        log.start_agent_epoch("b");
        assert_eq!(log.current_epoch(), 1);
        log.start_agent_epoch("a"); // re-entry takes a fresh epoch
        assert_eq!(log.current_epoch(), 2);
        assert_eq!(log.current_epoch_for("a"), 2);
        assert_eq!(log.current_epoch_for("b"), 1);
    }

    #[test]
    fn collect_full_for_scopes_by_agent_and_epoch() {
        let mut log = ExecutionLog::new();
        let mut store = ToolStore::new();

        log.start_agent_epoch("a");
        log.push_agent(agent_entry(0, "a"));
        let id_a = store.put(ToolRecord {
            agent_key: "a".to_string(),
            tool_key: "echo".to_string(),
            params: json!({}),
            result: json!({"echo": "first"}),
            duration_ms: 1,
            ts: 1,
            started_at_ms: None,
            completed_at_ms: None,
            total_duration_ms: None,
            group_id: None,
            parent_task_id: None,
            attempt: None,
        });
        log.push_tool(tool_entry(1, "a", &id_a));

        // Same agent, same epoch: visible.
        let visible = store.collect_full_for(&log, "a", 0);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0, id_a);

        // After yielding to b and returning, a is in epoch 2 and the old
        // output is no longer collected.
        log.start_agent_epoch("b");
        log.start_agent_epoch("a");
        let visible = store.collect_full_for(&log, "a", log.current_epoch_for("a"));
        assert!(visible.is_empty());
    }

    #[test]
    fn log_entry_wire_shape_is_tagged() {
        let mut log = ExecutionLog::new();
        log.start_agent_epoch("a");
        log.push_agent(agent_entry(0, "a"));
        log.push_system("drained");
        let values = log.to_values();
        assert_eq!(values[0]["type"], "agent");
        assert_eq!(values[0]["epoch"], 0);
        assert_eq!(values[1]["type"], "system");
    }
}
