//! Generic declarative HTTP provider (`provider_type: http:request`).
//!
//! The call is driven entirely by the tool's metadata: method, url (or
//! base_url + path), query/header/body parameter bindings with per-parameter
//! sources, and optional response shaping.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ToolInput, ToolOutput, ToolProvider};
use crate::graph::ParamSource;

/// One query/header/body binding: where the value comes from and how it is
/// rendered.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpParamSpec {
    #[serde(default)]
    source: ParamSource,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    default: Value,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpResponseSpec {
    #[serde(default)]
    unwrap: Option<String>,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpToolSpec {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    query: HashMap<String, HttpParamSpec>,
    #[serde(default)]
    headers: HashMap<String, HttpParamSpec>,
    #[serde(default)]
    body: Option<Map<String, Value>>,
    #[serde(default)]
    response: HttpResponseSpec,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> f64 {
    15.0
}

impl HttpToolSpec {
    fn resolved_url(&self) -> Result<String, String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let base = self
            .base_url
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('/');
        let path = self.path.as_deref().unwrap_or("").trim_start_matches('/');
        match (base.is_empty(), path.is_empty()) {
            (false, false) => Ok(format!("{base}/{path}")),
            (false, true) => Ok(base.to_string()),
            (true, false) => Ok(path.to_string()),
            (true, true) => Err("HTTP tool requires either url or base_url/path".to_string()),
        }
    }
}

pub struct HttpRequestTool {
    client: reqwest::blocking::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }

    fn resolve_param(
        key: &str,
        spec: &HttpParamSpec,
        input: &ToolInput,
    ) -> Option<Value> {
        let prefixed = |value: &Value, prefix: Option<&str>| -> Value {
            match (prefix, value) {
                (Some(p), Value::String(s)) => Value::String(format!("{p}{s}")),
                (Some(p), other) => Value::String(format!("{p}{other}")),
                (None, other) => other.clone(),
            }
        };
        match spec.source {
            ParamSource::Agent => input
                .params
                .get(key)
                .cloned()
                .or_else(|| (!spec.default.is_null()).then(|| spec.default.clone())),
            ParamSource::System => {
                let lookup = spec.name.as_deref().unwrap_or(key);
                input
                    .system
                    .get(lookup)
                    .map(|v| prefixed(v, spec.prefix.as_deref()))
                    .or_else(|| (!spec.default.is_null()).then(|| spec.default.clone()))
            }
            ParamSource::Const => {
                let value = if spec.value.is_null() {
                    &spec.default
                } else {
                    &spec.value
                };
                (!value.is_null()).then(|| value.clone())
            }
            ParamSource::Secret => input
                .secret
                .as_ref()
                .map(|s| {
                    let prefix = spec.prefix.as_deref().unwrap_or("");
                    Value::String(format!("{prefix}{s}"))
                })
                .or_else(|| (!spec.default.is_null()).then(|| spec.default.clone())),
        }
    }

    fn build_params(
        specs: &HashMap<String, HttpParamSpec>,
        input: &ToolInput,
    ) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (key, spec) in specs {
            if let Some(value) = Self::resolve_param(key, spec, input) {
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.push((spec.name.clone().unwrap_or_else(|| key.clone()), rendered));
            }
        }
        out.sort();
        out
    }

    fn build_body(body_spec: &Map<String, Value>, input: &ToolInput) -> Map<String, Value> {
        let mut resolved = Map::new();
        for (key, value) in body_spec {
            let is_binding = value
                .as_object()
                .map(|o| o.contains_key("source"))
                .unwrap_or(false);
            if is_binding {
                match serde_json::from_value::<HttpParamSpec>(value.clone()) {
                    Ok(spec) => {
                        if let Some(v) = Self::resolve_param(key, &spec, input) {
                            resolved.insert(key.clone(), v);
                        }
                    }
                    Err(_) => {
                        resolved.insert(key.clone(), value.clone());
                    }
                }
            } else {
                resolved.insert(key.clone(), value.clone());
            }
        }
        resolved
    }

    fn shape_response(data: Value, spec: &HttpResponseSpec) -> Value {
        let mut data = data;
        if let Some(unwrap) = &spec.unwrap {
            if let Value::Object(map) = &data {
                data = map.get(unwrap).cloned().unwrap_or(Value::Null);
            }
        }
        if let Some(keys) = &spec.keys {
            if let Value::Object(map) = &data {
                let mut picked = Map::new();
                for key in keys {
                    picked.insert(key.clone(), map.get(key).cloned().unwrap_or(Value::Null));
                }
                data = Value::Object(picked);
            }
        }
        data
    }

    /// The HTTP spec may be nested under `metadata.http` or spread over the
    /// metadata map itself (minus the agent-facing keys); the nested form is
    /// preferred, the flat form keeps older snapshots working.
    fn spec_from_metadata(metadata: &Map<String, Value>) -> Result<HttpToolSpec, String> {
        let source = match metadata.get("http") {
            Some(Value::Object(http)) => Value::Object(http.clone()),
            _ => {
                let flat: Map<String, Value> = metadata
                    .iter()
                    .filter(|(k, _)| {
                        k.as_str() != "agent_params_json_schema" && k.as_str() != "description"
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(flat)
            }
        };
        serde_json::from_value(source).map_err(|e| format!("invalid http spec: {e}"))
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolProvider for HttpRequestTool {
    fn run(&self, input: &ToolInput) -> ToolOutput {
        let spec = match Self::spec_from_metadata(&input.metadata) {
            Ok(spec) => spec,
            Err(e) => return ToolOutput::error(e),
        };
        let url = match spec.resolved_url() {
            Ok(url) => url,
            Err(e) => return ToolOutput::error(e),
        };

        let query = Self::build_params(&spec.query, input);
        let headers = Self::build_params(&spec.headers, input);
        let timeout = Duration::from_secs_f64(spec.timeout.max(0.0));

        let method = spec.method.trim().to_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            other => return ToolOutput::error(format!("unsupported http method: {other}")),
        };
        request = request.timeout(timeout).query(&query);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if matches!(method.as_str(), "POST" | "PUT") {
            let body = Self::build_body(spec.body.as_ref().unwrap_or(&Map::new()), input);
            request = request.json(&body);
        }

        let response = match request.send() {
            Ok(r) => r,
            Err(e) => return ToolOutput::error(e.to_string()),
        };
        if let Err(e) = response.error_for_status_ref() {
            return ToolOutput::error(e.to_string());
        }
        match response.json::<Value>() {
            Ok(data) => ToolOutput::ok(Self::shape_response(data, &spec.response)),
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_with(params: Value, system: Value, secret: Option<&str>) -> ToolInput {
        ToolInput {
            params: params.as_object().cloned().unwrap_or_default(),
            system: system.as_object().cloned().unwrap_or_default(),
            metadata: Map::new(),
            secret: secret.map(String::from),
        }
    }

    #[test]
    fn resolved_url_variants() {
        let spec: HttpToolSpec =
            serde_json::from_value(json!({"base_url": "https://api.x/", "path": "/v1/sun"}))
                .unwrap();
        assert_eq!(spec.resolved_url().unwrap(), "https://api.x/v1/sun");

        let spec: HttpToolSpec = serde_json::from_value(json!({"url": "https://api.x/y"})).unwrap();
        assert_eq!(spec.resolved_url().unwrap(), "https://api.x/y");

        let spec: HttpToolSpec = serde_json::from_value(json!({})).unwrap();
        assert!(spec.resolved_url().is_err());
    }

    #[test]
    fn param_sources_resolve() {
        let input = input_with(
            json!({"lat": 36.7}),
            json!({"session": "s-1"}),
            Some("sk-123"),
        );

        let agent: HttpParamSpec = serde_json::from_value(json!({"source": "agent"})).unwrap();
        assert_eq!(
            HttpRequestTool::resolve_param("lat", &agent, &input),
            Some(json!(36.7))
        );

        let system: HttpParamSpec =
            serde_json::from_value(json!({"source": "system", "name": "session"})).unwrap();
        assert_eq!(
            HttpRequestTool::resolve_param("sid", &system, &input),
            Some(json!("s-1"))
        );

        let constant: HttpParamSpec =
            serde_json::from_value(json!({"source": "const", "value": "fixed"})).unwrap();
        assert_eq!(
            HttpRequestTool::resolve_param("k", &constant, &input),
            Some(json!("fixed"))
        );

        let secret: HttpParamSpec =
            serde_json::from_value(json!({"source": "secret", "prefix": "Bearer "})).unwrap();
        assert_eq!(
            HttpRequestTool::resolve_param("auth", &secret, &input),
            Some(json!("Bearer sk-123"))
        );
    }

    #[test]
    fn response_shaping_unwrap_then_keys() {
        let spec: HttpResponseSpec =
            serde_json::from_value(json!({"unwrap": "results", "keys": ["sunrise"]})).unwrap();
        let shaped = HttpRequestTool::shape_response(
            json!({"results": {"sunrise": "6:00", "sunset": "19:00"}}),
            &spec,
        );
        assert_eq!(shaped, json!({"sunrise": "6:00"}));
    }

    #[test]
    fn flat_metadata_excludes_agent_facing_keys() {
        let mut metadata = Map::new();
        metadata.insert("url".to_string(), json!("https://api.x/y"));
        metadata.insert("agent_params_json_schema".to_string(), json!({"type": "object"}));
        metadata.insert("description".to_string(), json!("doc"));
        let spec = HttpRequestTool::spec_from_metadata(&metadata).unwrap();
        assert_eq!(spec.url.as_deref(), Some("https://api.x/y"));
    }
}
