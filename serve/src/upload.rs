//! Batch upload parsing: CSV or JSONL by file extension, no queueing.
//!
//! Required column: `iterations` (>= 1). Optional: `user_message`,
//! `correct_answer`, `label`, and arbitrary metadata columns. Columns
//! prefixed `system_params.` (or `system_params__`) become a nested
//! `system_params` object.

use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("unsupported file extension '{0}' (expected .csv or .jsonl)")]
    UnsupportedExtension(String),
    #[error("read upload: {0}")]
    Read(String),
}

/// Result of parsing one uploaded file.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub items: Vec<Value>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl UploadReport {
    pub fn to_value(&self) -> Value {
        json!({
            "items": self.items,
            "warnings": self.warnings,
            "errors": self.errors,
            "schema": schema_hint(),
        })
    }
}

/// The column contract echoed back with every parse.
pub fn schema_hint() -> Value {
    json!({
        "required": ["iterations (integer >= 1)"],
        "optional": [
            "user_message",
            "correct_answer",
            "label",
            "system_params.<key> (or system_params__<key>)",
            "any other column becomes item metadata",
        ],
    })
}

/// Dispatches on the filename extension.
pub fn parse_upload(filename: &str, bytes: &[u8]) -> Result<UploadReport, UploadError> {
    let extension = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "csv" => parse_csv(bytes),
        "jsonl" | "ndjson" => parse_jsonl(bytes),
        other => Err(UploadError::UnsupportedExtension(other.to_string())),
    }
}

fn system_param_key(column: &str) -> Option<&str> {
    column
        .strip_prefix("system_params.")
        .or_else(|| column.strip_prefix("system_params__"))
        .filter(|k| !k.is_empty())
}

fn parse_iterations(raw: &Value) -> Result<u64, String> {
    let n = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n >= 1 => Ok(n),
        _ => Err(format!("iterations must be an integer >= 1, got {raw}")),
    }
}

fn finish_item(
    row_label: &str,
    iterations: Option<Value>,
    mut item: Map<String, Value>,
    system_params: Map<String, Value>,
    metadata: Map<String, Value>,
    report: &mut UploadReport,
) {
    let Some(raw_iterations) = iterations else {
        report
            .errors
            .push(format!("{row_label}: missing required column 'iterations'"));
        return;
    };
    let iterations = match parse_iterations(&raw_iterations) {
        Ok(n) => n,
        Err(e) => {
            report.errors.push(format!("{row_label}: {e}"));
            return;
        }
    };
    item.insert("iterations".to_string(), json!(iterations));
    if !system_params.is_empty() {
        item.insert("system_params".to_string(), Value::Object(system_params));
    }
    if !metadata.is_empty() {
        item.insert("metadata".to_string(), Value::Object(metadata));
    }
    if !item.contains_key("user_message") {
        report
            .warnings
            .push(format!("{row_label}: no user_message column"));
    }
    report.items.push(Value::Object(item));
}

fn parse_csv(bytes: &[u8]) -> Result<UploadReport, UploadError> {
    let mut report = UploadReport::default();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| UploadError::Read(e.to_string()))?
        .clone();

    for (idx, record) in reader.records().enumerate() {
        let row_label = format!("row {}", idx + 1);
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(format!("{row_label}: {e}"));
                continue;
            }
        };
        let mut item = Map::new();
        let mut system_params = Map::new();
        let mut metadata = Map::new();
        let mut iterations: Option<Value> = None;
        for (column, cell) in headers.iter().zip(record.iter()) {
            if cell.is_empty() {
                continue;
            }
            if column == "iterations" {
                iterations = Some(json!(cell));
            } else if let Some(key) = system_param_key(column) {
                system_params.insert(key.to_string(), json!(cell));
            } else if matches!(column, "user_message" | "correct_answer" | "label") {
                item.insert(column.to_string(), json!(cell));
            } else {
                metadata.insert(column.to_string(), json!(cell));
            }
        }
        finish_item(&row_label, iterations, item, system_params, metadata, &mut report);
    }
    Ok(report)
}

fn parse_jsonl(bytes: &[u8]) -> Result<UploadReport, UploadError> {
    let text = std::str::from_utf8(bytes).map_err(|e| UploadError::Read(e.to_string()))?;
    let mut report = UploadReport::default();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row_label = format!("line {}", idx + 1);
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                report.errors.push(format!("{row_label}: invalid JSON: {e}"));
                continue;
            }
        };
        let Value::Object(object) = parsed else {
            report
                .errors
                .push(format!("{row_label}: expected a JSON object"));
            continue;
        };

        let mut item = Map::new();
        let mut system_params = Map::new();
        let mut metadata = Map::new();
        let mut iterations: Option<Value> = None;
        for (key, value) in object {
            if key == "iterations" {
                iterations = Some(value);
            } else if key == "system_params" {
                match value {
                    Value::Object(params) => system_params.extend(params),
                    other => report.warnings.push(format!(
                        "{row_label}: system_params must be an object, ignoring {other}"
                    )),
                }
            } else if let Some(nested) = system_param_key(&key) {
                system_params.insert(nested.to_string(), value);
            } else if matches!(key.as_str(), "user_message" | "correct_answer" | "label") {
                item.insert(key, value);
            } else if key == "metadata" {
                match value {
                    Value::Object(meta) => metadata.extend(meta),
                    other => {
                        metadata.insert("metadata".to_string(), other);
                    }
                }
            } else {
                metadata.insert(key, value);
            }
        }
        finish_item(&row_label, iterations, item, system_params, metadata, &mut report);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_nests_system_params_and_collects_metadata() {
        let csv = "iterations,user_message,system_params.customer_id,notes\n\
                   2,hello,abc,first\n";
        let report = parse_upload("items.csv", csv.as_bytes()).unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(report.items.len(), 1);
        let item = &report.items[0];
        assert_eq!(item["iterations"], 2);
        assert_eq!(item["user_message"], "hello");
        assert_eq!(item["system_params"]["customer_id"], "abc");
        assert_eq!(item["metadata"]["notes"], "first");
    }

    #[test]
    fn missing_or_bad_iterations_is_an_error() {
        let csv = "iterations,user_message\n,no iterations\nzero,still bad\n0,zero\n";
        let report = parse_upload("items.csv", csv.as_bytes()).unwrap();
        assert!(report.items.is_empty());
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn jsonl_accepts_nested_and_prefixed_system_params() {
        let jsonl = r#"{"iterations": 1, "user_message": "a", "system_params": {"x": "1"}}
{"iterations": 3, "user_message": "b", "system_params__y": "2", "label": "l"}"#;
        let report = parse_upload("items.jsonl", jsonl.as_bytes()).unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.items[0]["system_params"]["x"], "1");
        assert_eq!(report.items[1]["system_params"]["y"], "2");
        assert_eq!(report.items[1]["label"], "l");
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(matches!(
            parse_upload("items.xlsx", b""),
            Err(UploadError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn missing_user_message_is_a_warning_not_an_error() {
        let csv = "iterations,label\n1,only-label\n";
        let report = parse_upload("items.csv", csv.as_bytes()).unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }
}
