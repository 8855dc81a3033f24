//! Execution-log preview policy: which fields of a tool request/response are
//! surfaced in the log, and at what character limits.
//!
//! Networks may configure per-tool extraction rules; without any rule the
//! whole payload is stringified and truncated at the default limits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Preview limit used for tool requests when no policy applies.
pub const DEFAULT_REQUEST_PREVIEW_LIMIT: usize = 50;
/// Preview limit used for tool responses when no policy applies.
pub const DEFAULT_RESPONSE_PREVIEW_LIMIT: usize = 100;

/// How to surface a single field of a payload in the execution log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<usize>,
}

/// Per-tool overrides for execution-log extraction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolLogConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request: Vec<FieldRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response: Vec<FieldRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_max_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_max_chars: Option<usize>,
}

/// Network-wide fallback truncation limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogDefaults {
    #[serde(default = "default_request_max")]
    pub request_max_chars: usize,
    #[serde(default = "default_response_max")]
    pub response_max_chars: usize,
}

fn default_request_max() -> usize {
    120
}

fn default_response_max() -> usize {
    200
}

impl Default for LogDefaults {
    fn default() -> Self {
        Self {
            request_max_chars: default_request_max(),
            response_max_chars: default_response_max(),
        }
    }
}

/// Top-level execution-log policy for a network.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionLogPolicy {
    #[serde(default)]
    pub defaults: LogDefaults,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolLogConfig>,
}

impl ExecutionLogPolicy {
    pub fn tool_policy(&self, tool_key: &str) -> Option<&ToolLogConfig> {
        if tool_key.is_empty() {
            return None;
        }
        self.tools.get(tool_key)
    }
}

/// Both previews for one tool execution: the request side and the response side.
#[derive(Clone, Debug, Default)]
pub struct ToolPreviews {
    pub request_preview: String,
    pub request_excerpt: Option<HashMap<String, String>>,
    pub response_preview: String,
    pub response_excerpt: Option<HashMap<String, String>>,
}

/// Truncates to `limit` characters, marking the cut with an ellipsis.
/// A limit of zero disables truncation.
pub fn truncate(text: &str, limit: usize) -> String {
    if limit == 0 {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return text.to_string();
    }
    let cutoff = limit.saturating_sub(1);
    let mut out: String = chars[..cutoff].iter().collect();
    out.push('…');
    out
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug)]
enum PathToken {
    Key(String),
    Index(i64),
}

/// Parses `a.b[0]["c"]` into tokens. Bracket segments may be quoted keys or
/// integer indices; unquoted non-numeric segments fall back to keys.
fn parse_path(path: &str) -> Vec<PathToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                if !current.is_empty() {
                    tokens.push(PathToken::Key(std::mem::take(&mut current)));
                }
                i += 1;
            }
            '[' => {
                if !current.is_empty() {
                    tokens.push(PathToken::Key(std::mem::take(&mut current)));
                }
                let close = chars[i + 1..].iter().position(|&c| c == ']');
                let Some(offset) = close else {
                    // Unterminated bracket: treat the rest as a literal key.
                    tokens.push(PathToken::Key(chars[i..].iter().collect()));
                    break;
                };
                let segment: String = chars[i + 1..i + 1 + offset].iter().collect();
                let segment = segment.trim();
                let unquoted = segment
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| segment.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                if let Some(key) = unquoted {
                    tokens.push(PathToken::Key(key.to_string()));
                } else if let Ok(idx) = segment.parse::<i64>() {
                    tokens.push(PathToken::Index(idx));
                } else {
                    tokens.push(PathToken::Key(segment.to_string()));
                }
                i += offset + 2;
            }
            c => {
                current.push(c);
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        tokens.push(PathToken::Key(current));
    }
    tokens
}

fn traverse<'a>(payload: &'a Value, tokens: &[PathToken]) -> Option<&'a Value> {
    let mut current = payload;
    for token in tokens {
        current = match token {
            PathToken::Key(k) => current.as_object()?.get(k)?,
            PathToken::Index(i) => {
                let arr = current.as_array()?;
                let idx = if *i < 0 { arr.len() as i64 + i } else { *i };
                arr.get(usize::try_from(idx).ok()?)?
            }
        };
    }
    Some(current)
}

/// Resolves a field path against a payload. Paths that prefix a synthetic
/// root such as `result.` or `response.` are retried with the first segment
/// dropped.
fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let tokens = parse_path(path);
    if let Some(v) = traverse(payload, &tokens) {
        return Some(v);
    }
    match tokens.first() {
        Some(PathToken::Key(_)) if tokens.len() > 1 => traverse(payload, &tokens[1..]),
        _ => None,
    }
}

fn effective_limit(
    policy: Option<&ExecutionLogPolicy>,
    tool_cfg: Option<&ToolLogConfig>,
    request_side: bool,
    fallback: usize,
) -> usize {
    if let Some(cfg) = tool_cfg {
        let per_tool = if request_side {
            cfg.request_max_chars
        } else {
            cfg.response_max_chars
        };
        if let Some(limit) = per_tool {
            return limit;
        }
    }
    match policy {
        Some(p) if request_side => p.defaults.request_max_chars,
        Some(p) => p.defaults.response_max_chars,
        None => fallback,
    }
}

fn collect_pairs(
    payload: &Value,
    fields: &[FieldRule],
    default_limit: usize,
) -> (Vec<(String, String)>, Option<HashMap<String, String>>) {
    let mut pairs = Vec::new();
    let mut excerpt = HashMap::new();
    for rule in fields {
        let Some(value) = resolve_path(payload, &rule.path) else {
            continue;
        };
        let text = stringify(value);
        let limit = rule.max_chars.unwrap_or(default_limit);
        let truncated = truncate(&text, limit);
        let label = rule.label.clone().unwrap_or_else(|| rule.path.clone());
        excerpt.insert(label.clone(), truncated.clone());
        pairs.push((label, truncated));
    }
    if pairs.is_empty() {
        (Vec::new(), None)
    } else {
        (pairs, Some(excerpt))
    }
}

/// Builds request/response previews for one tool execution, honoring the
/// network policy when present and falling back to plain stringify+truncate.
pub fn build_previews(
    policy: Option<&ExecutionLogPolicy>,
    tool_key: &str,
    request_payload: &Value,
    response_payload: &Value,
) -> ToolPreviews {
    let tool_cfg = policy.and_then(|p| p.tool_policy(tool_key));

    let request_limit =
        effective_limit(policy, tool_cfg, true, DEFAULT_REQUEST_PREVIEW_LIMIT);
    let response_limit =
        effective_limit(policy, tool_cfg, false, DEFAULT_RESPONSE_PREVIEW_LIMIT);

    let (request_pairs, request_excerpt) = match tool_cfg {
        Some(cfg) if !cfg.request.is_empty() => {
            collect_pairs(request_payload, &cfg.request, request_limit)
        }
        _ => (Vec::new(), None),
    };
    let (response_pairs, response_excerpt) = match tool_cfg {
        Some(cfg) if !cfg.response.is_empty() => {
            collect_pairs(response_payload, &cfg.response, response_limit)
        }
        _ => (Vec::new(), None),
    };

    let request_preview = if request_pairs.is_empty() {
        truncate(&stringify(request_payload), request_limit)
    } else {
        request_pairs
            .iter()
            .map(|(label, value)| format!("{label}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    };
    let response_preview = if response_pairs.is_empty() {
        truncate(&stringify(response_payload), response_limit)
    } else {
        response_pairs
            .iter()
            .map(|(label, value)| format!("{label}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    };

    ToolPreviews {
        request_preview,
        request_excerpt,
        response_preview,
        response_excerpt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 6), "hello…");
        assert_eq!(truncate("hello world", 0), "hello world");
    }

    #[test]
    fn path_with_brackets_and_negative_index() {
        let payload = json!({"items": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(
            resolve_path(&payload, "items[1].name"),
            Some(&json!("b"))
        );
        assert_eq!(
            resolve_path(&payload, "items[-1].name"),
            Some(&json!("b"))
        );
        assert_eq!(resolve_path(&payload, r#"items[0]["name"]"#), Some(&json!("a")));
    }

    #[test]
    fn synthetic_root_prefix_is_dropped() {
        let payload = json!({"city": "Malaga"});
        assert_eq!(resolve_path(&payload, "result.city"), Some(&json!("Malaga")));
    }
}
