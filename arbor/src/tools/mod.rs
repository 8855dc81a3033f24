//! Tool provider contract and the process-wide provider registry.
//!
//! A provider is resolved by its `provider_type` string. Providers are pure
//! with respect to their input: they see the merged params, the run's system
//! params, the tool's metadata, and the resolved secret, never the
//! orchestrator's state.

mod echo;
mod http;
mod rag;

pub use echo::EchoTool;
pub use http::HttpRequestTool;
pub use rag::RagHybridTool;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

/// Input for one tool execution.
#[derive(Clone, Debug, Default)]
pub struct ToolInput {
    /// Merged params (agent-supplied + injected system values + defaults).
    pub params: Map<String, Value>,
    /// The run's system params, for providers with `source: system` bindings.
    pub system: Map<String, Value>,
    /// Provider-specific config from the compiled tool.
    pub metadata: Map<String, Value>,
    /// Resolved secret for the tool's `secret_ref`, when any.
    pub secret: Option<String>,
}

/// Uniform result of one tool execution.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// A tool executor, registered under a `provider_type` string.
pub trait ToolProvider: Send + Sync {
    fn run(&self, input: &ToolInput) -> ToolOutput;
}

static PROVIDERS: Lazy<RwLock<HashMap<String, Arc<dyn ToolProvider>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers (or replaces) a provider. Called at process startup; tests may
/// add their own provider types.
pub fn register_provider(provider_type: &str, provider: Arc<dyn ToolProvider>) {
    if let Ok(mut providers) = PROVIDERS.write() {
        providers.insert(provider_type.to_string(), provider);
    }
}

/// Resolves a provider by type.
pub fn provider_for(provider_type: &str) -> Option<Arc<dyn ToolProvider>> {
    PROVIDERS
        .read()
        .ok()
        .and_then(|providers| providers.get(provider_type).cloned())
}

/// Registers the built-in provider set. Idempotent.
pub fn register_builtin_providers() {
    register_provider("builtin:echo", Arc::new(EchoTool));
    register_provider("http:request", Arc::new(HttpRequestTool::new()));
    register_provider("rag:hybrid", Arc::new(RagHybridTool::new()));
}
