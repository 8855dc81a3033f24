//! Hybrid RAG provider (`provider_type: rag:hybrid`): forwards the query to
//! an external search service over HTTP and returns its payload.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ToolInput, ToolOutput, ToolProvider};

#[derive(Clone, Debug, Deserialize)]
struct RagServiceSpec {
    base_url: String,
    #[serde(default = "default_search_path")]
    search_path: String,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    api_key_header: Option<String>,
    #[serde(default)]
    default_payload: Map<String, Value>,
}

fn default_search_path() -> String {
    "/search".to_string()
}

fn default_timeout() -> f64 {
    20.0
}

impl RagServiceSpec {
    fn from_metadata(metadata: &Map<String, Value>) -> Result<Self, String> {
        let source = metadata
            .get("rag")
            .or_else(|| metadata.get("service"))
            .cloned()
            .ok_or_else(|| "rag tool requires metadata.rag with base_url".to_string())?;
        serde_json::from_value(source).map_err(|e| format!("invalid rag spec: {e}"))
    }

    fn search_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.search_path.trim_start_matches('/')
        )
    }
}

pub struct RagHybridTool {
    client: reqwest::blocking::Client,
}

impl RagHybridTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for RagHybridTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolProvider for RagHybridTool {
    fn run(&self, input: &ToolInput) -> ToolOutput {
        let spec = match RagServiceSpec::from_metadata(&input.metadata) {
            Ok(spec) => spec,
            Err(e) => return ToolOutput::error(e),
        };

        let Some(query) = input.params.get("query").and_then(Value::as_str) else {
            return ToolOutput::error("query parameter is required");
        };

        let mut body = spec.default_payload.clone();
        body.insert("query".to_string(), Value::String(query.to_string()));
        match input.params.get("top_k") {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) if n.as_i64().is_some() => {
                let top_k = n.as_i64().unwrap_or(1).max(1);
                body.insert("top_k".to_string(), Value::from(top_k));
            }
            Some(_) => return ToolOutput::error("top_k must be an integer"),
        }
        match input.params.get("filter") {
            None | Some(Value::Null) => {}
            Some(Value::Object(filter)) => {
                body.insert("filter".to_string(), Value::Object(filter.clone()));
            }
            Some(_) => {
                return ToolOutput::error("filter must be an object compatible with the service")
            }
        }
        if !input.system.is_empty() && !body.contains_key("system_params") {
            body.insert(
                "system_params".to_string(),
                Value::Object(input.system.clone()),
            );
        }

        let mut request = self
            .client
            .post(spec.search_url())
            .timeout(Duration::from_secs_f64(spec.timeout.max(0.0)))
            .json(&body);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if let (Some(header), Some(secret)) = (&spec.api_key_header, &input.secret) {
            request = request.header(header, secret);
        }

        let response = match request.send() {
            Ok(r) => r,
            Err(e) => return ToolOutput::error(format!("rag service error: {e}")),
        };
        if let Err(e) = response.error_for_status_ref() {
            return ToolOutput::error(format!("rag service error: {e}"));
        }
        match response.json::<Value>() {
            Ok(Value::Object(data)) => ToolOutput::ok(Value::Object(data)),
            Ok(_) => ToolOutput::error("RAG service returned a non-object response"),
            Err(e) => ToolOutput::error(format!("rag service error: {e}")),
        }
    }
}
