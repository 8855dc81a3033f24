//! # Arbor
//!
//! Run multi-agent LLM workflows against a versioned, declaratively
//! configured agent network. A compiled snapshot names the agents, the tools
//! each may invoke, the routing graph between them, and the response policy;
//! each run drives a bounded step loop in which one agent at a time chooses
//! exactly one action (invoke a tool, route to another agent, launch a task
//! group, respond, or return a delegated sub-result), gated against its
//! capability set and recorded in a totally-ordered execution log.
//!
//! ## Main modules
//!
//! - [`graph`]: [`CompiledGraph`], [`CompiledAgent`], [`CompiledTool`] — the
//!   immutable snapshot consumed by the engine.
//! - [`run_config`]: [`RunConfig`], [`build_run_config`],
//!   [`RunConfigSource`] — the per-step view of one agent.
//! - [`orchestrator`]: [`Instruction`], [`Action`], [`execute_instruction`]
//!   — the capability gate; [`orchestrator::decision`] — the LLM-facing
//!   decision envelope and its translation.
//! - [`engine`]: [`run_loop`], [`RunOptions`], [`RunArtifact`] — the step
//!   loop and the task-group scheduler.
//! - [`logs`]: [`ExecutionLog`], [`ToolStore`] — epoch-scoped event log and
//!   full tool-output store; [`logs::policy`] — preview extraction.
//! - [`prompts`]: prompt context builder.
//! - [`llm`]: [`Decider`] trait, [`GeminiDecider`], [`MockDecider`].
//! - [`tools`]: [`ToolProvider`] contract, process-wide registry, built-in
//!   providers (`builtin:echo`, `http:request`, `rag:hybrid`).
//!
//! The engine is synchronous by design: one run is strictly single-threaded,
//! delegated runs are synchronous recursive calls, and async callers dispatch
//! [`run_loop`] to a worker thread.

pub mod engine;
pub mod graph;
pub mod ids;
pub mod llm;
pub mod logs;
pub mod orchestrator;
pub mod prompts;
pub mod run_config;
pub mod secrets;
pub mod system_params;
pub mod tools;

pub use engine::{run_loop, FinalOutcome, RunArtifact, RunOptions};
pub use graph::{CompiledAgent, CompiledGraph, CompiledTool, GraphError, RespondPolicy};
pub use llm::{DecideError, DecideResult, Decider, GeminiDecider, LlmUsage, MockDecider};
pub use logs::{ExecutionLog, LogEntry, ToolRecord, ToolStore};
pub use orchestrator::{
    execute_instruction, Action, Instruction, OrchestratorResult, ResultStatus,
};
pub use run_config::{build_run_config, ConfigError, GraphConfigSource, RunConfig, RunConfigSource};
pub use system_params::merge_with_defaults;
pub use tools::{
    provider_for, register_builtin_providers, register_provider, ToolInput, ToolOutput,
    ToolProvider,
};
