//! Envelope (traceId, seq, t) around one log entry payload.
//! `StepSeq` tracks the per-run sequence counter and wraps each entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of execution-log entry carried by a step envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEntryType {
    Agent,
    Tool,
    TaskGroup,
}

/// Inner step block: `kind` is always `log_entry`; `payload` is the full entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepPayload {
    pub kind: String,
    #[serde(rename = "entryType")]
    pub entry_type: StepEntryType,
    pub payload: Value,
}

impl StepPayload {
    pub fn log_entry(entry_type: StepEntryType, payload: Value) -> Self {
        Self {
            kind: "log_entry".to_string(),
            entry_type,
            payload,
        }
    }
}

/// One step event on the wire. `seq` is contiguous from 0 within a run;
/// `t` is wall-clock milliseconds and monotone-non-decreasing within a run.
/// `traceId` is stamped by the layer that knows the run id (the HTTP server);
/// the engine leaves it unset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepEnvelope {
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub seq: u64,
    pub t: i64,
    pub step: StepPayload,
}

/// Per-run sequence state: hands out contiguous `seq` values starting at 0.
#[derive(Debug, Default)]
pub struct StepSeq {
    next_seq: u64,
}

impl StepSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps one entry payload and advances the counter.
    pub fn envelope(
        &mut self,
        entry_type: StepEntryType,
        payload: Value,
        timestamp_ms: i64,
    ) -> StepEnvelope {
        let env = StepEnvelope {
            trace_id: None,
            seq: self.next_seq,
            t: timestamp_ms,
            step: StepPayload::log_entry(entry_type, payload),
        };
        self.next_seq += 1;
        env
    }

    /// Number of envelopes handed out so far.
    pub fn emitted(&self) -> u64 {
        self.next_seq
    }
}

/// Stamps a trace id onto every envelope that does not carry one yet.
pub fn stamp_trace_id(envelopes: &mut [StepEnvelope], trace_id: &str) {
    for env in envelopes.iter_mut() {
        if env.trace_id.is_none() {
            env.trace_id = Some(trace_id.to_string());
        }
    }
}
