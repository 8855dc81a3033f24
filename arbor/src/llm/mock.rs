//! Scripted decider for tests: hands out a fixed sequence of decisions.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{DecideError, DecideResult, Decider};
use crate::orchestrator::decision::AgentDecision;

/// Decider that returns pre-scripted results in order. Running out of script
/// is a request error, which surfaces as a run failure in tests that consumed
/// more steps than expected.
pub struct MockDecider {
    script: Mutex<VecDeque<DecideResult>>,
}

impl MockDecider {
    pub fn from_results(results: Vec<DecideResult>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
        }
    }

    /// Scripts parsed decisions with empty raw text and no usage.
    pub fn from_decisions(decisions: Vec<AgentDecision>) -> Self {
        Self::from_results(
            decisions
                .into_iter()
                .map(|decision| DecideResult {
                    parsed: Some(decision),
                    ..DecideResult::default()
                })
                .collect(),
        )
    }

    /// Number of scripted results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Decider for MockDecider {
    fn decide(&self, _prompt: &str, _model: Option<&str>) -> Result<DecideResult, DecideError> {
        self.script
            .lock()
            .map_err(|_| DecideError::Request("mock decider poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| DecideError::Request("mock decider script exhausted".to_string()))
    }
}
