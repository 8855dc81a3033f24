//! LLM decide contract: one structured-JSON call that returns the raw text,
//! the parsed agent decision when parsing succeeded, and token usage.
//!
//! The engine depends on the [`Decider`] trait only; implementations are
//! [`GeminiDecider`] (real API, JSON mode, one strict retry on parse failure)
//! and [`MockDecider`] (scripted decisions for tests).

mod gemini;
mod mock;

pub use gemini::GeminiDecider;
pub use mock::MockDecider;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::orchestrator::decision::AgentDecision;

/// Token usage for one decide call (or the combined usage across the parse
/// retry).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
}

impl LlmUsage {
    /// Returns the total, falling back to prompt + response when the provider
    /// omitted it.
    pub fn effective_total(&self) -> u64 {
        if self.total_tokens == 0 {
            self.prompt_tokens + self.response_tokens
        } else {
            self.total_tokens
        }
    }

    /// Sums two usage blocks field-wise.
    pub fn combined(&self, other: &Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            response_tokens: self.response_tokens + other.response_tokens,
            total_tokens: self.effective_total() + other.effective_total(),
        }
    }
}

/// Result of one decide call.
#[derive(Clone, Debug, Default)]
pub struct DecideResult {
    /// Raw model text (the last attempt's text when a retry happened).
    pub text: String,
    /// Parsed decision when the provider parsed the text successfully.
    pub parsed: Option<AgentDecision>,
    /// Combined usage across attempts, when the provider reported any.
    pub usage: Option<LlmUsage>,
    /// Provider-shaped usage payload, verbatim.
    pub usage_raw: Option<Value>,
    /// Full provider response payload, verbatim.
    pub response_payload: Option<Value>,
}

#[derive(Error, Debug)]
pub enum DecideError {
    /// Missing credentials; fatal to the request before any step runs.
    #[error("llm not configured: {0}")]
    NotConfigured(String),
    /// Transport or provider failure.
    #[error("llm request failed: {0}")]
    Request(String),
    /// The text did not parse as an agent decision even after the strict
    /// retry; the step loop terminates the run with `llm_parse_error`.
    #[error("llm_parse_error: {0}")]
    Parse(String),
}

/// One structured decision call. Implementations must request JSON-only
/// output, attempt to parse the text as the agent-decision union, and retry
/// exactly once with a stricter instruction when parsing fails.
pub trait Decider: Send + Sync {
    fn decide(&self, prompt: &str, model: Option<&str>) -> Result<DecideResult, DecideError>;
}

/// Strips a fenced ```json block down to its body; text without a complete
/// fence is returned unchanged.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let after = after.strip_prefix('\n').unwrap_or(after);
    match after.find("```") {
        Some(close) => after[..close].trim(),
        None => text,
    }
}

/// Parses raw model text into a validated [`AgentDecision`].
pub(crate) fn parse_decision(text: &str) -> Result<AgentDecision, String> {
    let clean = strip_code_fences(text);
    let decision: AgentDecision =
        serde_json::from_str(clean).map_err(|e| format!("invalid decision JSON: {e}"))?;
    decision.validate()?;
    Ok(decision)
}
