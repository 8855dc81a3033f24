//! Process-wide system-parameter defaults, loaded once from
//! `config/system_params_defaults.json` and merged under caller overrides.

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::ids::opaque_id;

static DEFAULTS: Lazy<Map<String, Value>> = Lazy::new(load_defaults);

fn load_defaults() -> Map<String, Value> {
    let path = std::path::Path::new("config").join("system_params_defaults.json");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "malformed system param defaults, ignoring");
            Map::new()
        }
    }
}

/// The cached defaults, unmerged (exposed for API responses).
pub fn system_param_defaults() -> &'static Map<String, Value> {
    &DEFAULTS
}

/// Overlays caller-provided system params onto the process defaults and
/// generates a fresh `dialogflow_session_id` when absent. Called once per
/// run; every step of the run sees the same merged map.
pub fn merge_with_defaults(system_params: Option<&Map<String, Value>>) -> Map<String, Value> {
    let mut merged = DEFAULTS.clone();
    if let Some(params) = system_params {
        for (key, value) in params {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
        .entry("dialogflow_session_id".to_string())
        .or_insert_with(|| Value::String(opaque_id()));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caller_params_override_defaults_and_session_id_is_generated() {
        let mut params = Map::new();
        params.insert("customer_id".to_string(), json!("abc"));
        let merged = merge_with_defaults(Some(&params));
        assert_eq!(merged["customer_id"], "abc");
        assert!(merged["dialogflow_session_id"].as_str().is_some());
    }

    #[test]
    fn provided_session_id_is_kept() {
        let mut params = Map::new();
        params.insert("dialogflow_session_id".to_string(), json!("fixed"));
        let merged = merge_with_defaults(Some(&params));
        assert_eq!(merged["dialogflow_session_id"], "fixed");
    }
}
