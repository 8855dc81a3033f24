//! Step event wire shape: one run step wrapped in a `traceId`/`seq`/`t` envelope.
//!
//! This crate defines the envelope emitted for every execution-log entry a run
//! produces. It does not depend on the engine; the engine serializes its log
//! entries into `serde_json::Value` and wraps them here.

pub mod envelope;

pub use envelope::{StepEntryType, StepEnvelope, StepPayload, StepSeq};
