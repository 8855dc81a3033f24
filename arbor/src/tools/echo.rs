//! Built-in echo provider: returns its inputs (`provider_type: builtin:echo`).

use serde_json::json;

use super::{ToolInput, ToolOutput, ToolProvider};

pub struct EchoTool;

impl ToolProvider for EchoTool {
    fn run(&self, input: &ToolInput) -> ToolOutput {
        ToolOutput::ok(json!({
            "echo": input.params,
            "system": input.system,
            "metadata": input.metadata,
        }))
    }
}
