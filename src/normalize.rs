//! Output normalization
//!
//! Every CLI prints its answer differently: bare text, a JSON object with
//! the answer under one of several keys, or a stream of JSON lines. This
//! module folds all of them into one [`NormalizedOutput`] shape.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Keys that may carry the response text, in priority order
pub const RESPONSE_KEYS: &[&str] = &["response", "text", "content", "output", "message", "completion"];

/// Top-level keys consumed by extraction and never copied as plain metadata
const RESERVED_KEYS: &[&str] = &["data", "usage", "cost", "error", "errors", "warning", "warnings"];

/// Uniform shape of a tool's output
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedOutput {
    pub response_text: String,
    pub metadata: Map<String, Value>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub raw: String,
}

impl NormalizedOutput {
    fn plain(text: &str) -> Self {
        Self {
            response_text: strip_ansi(text).trim().to_string(),
            raw: text.to_string(),
            ..Default::default()
        }
    }

    /// Token count reported by the tool, if any
    pub fn tokens(&self) -> Option<u64> {
        self.metadata.get("tokens").and_then(Value::as_u64)
    }

    pub fn input_tokens(&self) -> Option<u64> {
        self.metadata.get("input_tokens").and_then(Value::as_u64)
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.metadata.get("output_tokens").and_then(Value::as_u64)
    }

    /// Cost in USD reported by the tool, if any
    pub fn cost_usd(&self) -> Option<f64> {
        self.metadata.get("cost_usd").and_then(Value::as_f64)
    }
}

/// A handler that fully replaces normalization for one format tag
pub type FormatHandler = Arc<dyn Fn(&str) -> NormalizedOutput + Send + Sync>;

/// Normalizes raw tool output, with optional per-format overrides
#[derive(Default, Clone)]
pub struct OutputNormalizer {
    handlers: HashMap<String, FormatHandler>,
}

impl std::fmt::Debug for OutputNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("OutputNormalizer").field("handlers", &tags).finish()
    }
}

impl OutputNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route output tagged `format` to `handler` instead of the built-in logic
    pub fn register_handler<F>(&mut self, format: impl Into<String>, handler: F)
    where
        F: Fn(&str) -> NormalizedOutput + Send + Sync + 'static,
    {
        self.handlers.insert(format.into(), Arc::new(handler));
    }

    pub fn has_handler(&self, format: &str) -> bool {
        self.handlers.contains_key(format)
    }

    /// Normalize `text`, guided by an optional format hint
    pub fn normalize(&self, text: &str, hint: Option<&str>) -> NormalizedOutput {
        if let Some(handler) = hint.and_then(|h| self.handlers.get(h)) {
            return handler(text);
        }
        match hint {
            None => match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => from_json(&value, text),
                Err(_) => NormalizedOutput::plain(text),
            },
            Some("json") => match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => from_json(&value, text),
                Err(e) => {
                    let mut out = NormalizedOutput::plain(text);
                    out.response_text = text.to_string();
                    out.errors.push(format!("Failed to parse JSON output: {}", e));
                    out
                }
            },
            Some("jsonl") | Some("stream-json") => from_json_lines(text),
            Some(_) => NormalizedOutput::plain(text),
        }
    }
}

/// Normalize a single parsed JSON document
fn from_json(value: &Value, raw: &str) -> NormalizedOutput {
    let mut out = NormalizedOutput {
        raw: raw.to_string(),
        ..Default::default()
    };

    match value {
        Value::Object(obj) => {
            out.response_text = extract_text(obj).unwrap_or_else(|| raw.trim().to_string());
            extract_metadata(obj, &mut out.metadata);
            out.errors = collect_messages(obj, "error", "errors");
            out.warnings = collect_messages(obj, "warning", "warnings");
        }
        Value::String(s) => out.response_text = s.clone(),
        _ => out.response_text = raw.trim().to_string(),
    }
    out
}

/// Normalize newline-delimited JSON events; the last event with text wins
fn from_json_lines(raw: &str) -> NormalizedOutput {
    let mut out = NormalizedOutput {
        raw: raw.to_string(),
        ..Default::default()
    };
    let mut found_text = false;

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => {
                if let Some(text) = extract_text(&obj) {
                    out.response_text = text;
                    found_text = true;
                }
                extract_metadata(&obj, &mut out.metadata);
                out.errors.extend(collect_messages(&obj, "error", "errors"));
                out.warnings.extend(collect_messages(&obj, "warning", "warnings"));
            }
            Ok(_) => {}
            Err(e) => out
                .warnings
                .push(format!("Skipped unparseable line {}: {}", lineno + 1, e)),
        }
    }

    if !found_text {
        out.response_text = strip_ansi(raw).trim().to_string();
    }
    out
}

fn extract_text(obj: &Map<String, Value>) -> Option<String> {
    let direct = RESPONSE_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str));
    if let Some(text) = direct {
        return Some(text.to_string());
    }
    let data = obj.get("data").and_then(Value::as_object)?;
    RESPONSE_KEYS
        .iter()
        .find_map(|k| data.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_metadata(obj: &Map<String, Value>, meta: &mut Map<String, Value>) {
    if let Some(usage) = obj.get("usage").and_then(Value::as_object) {
        let input = first_u64(usage, &["input_tokens", "prompt_tokens"]);
        let output = first_u64(usage, &["output_tokens", "completion_tokens"]);
        if let Some(n) = input {
            meta.insert("input_tokens".to_string(), Value::from(n));
        }
        if let Some(n) = output {
            meta.insert("output_tokens".to_string(), Value::from(n));
        }
        match usage.get("total_tokens").and_then(Value::as_u64) {
            Some(total) => {
                meta.insert("tokens".to_string(), Value::from(total));
            }
            None => {
                if input.is_some() || output.is_some() {
                    let total = input.unwrap_or(0) + output.unwrap_or(0);
                    meta.insert("tokens".to_string(), Value::from(total));
                }
            }
        }
    }

    let cost = match obj.get("cost") {
        Some(Value::Object(c)) => first_f64(c, &["total", "usd", "total_usd"]),
        Some(v) => v.as_f64(),
        None => None,
    }
    .or_else(|| first_f64(obj, &["cost_usd", "total_cost_usd"]));
    if let Some(c) = cost {
        meta.insert("cost_usd".to_string(), Value::from(c));
    }

    if let Some(model) = obj.get("model").and_then(Value::as_str) {
        meta.insert("model".to_string(), Value::from(model));
    }

    for (key, value) in obj {
        if RESPONSE_KEYS.contains(&key.as_str()) || RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let scalar = matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_));
        if scalar && !meta.contains_key(key) {
            meta.insert(key.clone(), value.clone());
        }
    }
}

fn first_u64(obj: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_u64))
}

fn first_f64(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_f64))
}

/// Gather messages under a singular and a plural key
fn collect_messages(obj: &Map<String, Value>, singular: &str, plural: &str) -> Vec<String> {
    let mut out = Vec::new();
    for key in [singular, plural] {
        match obj.get(key) {
            Some(Value::Array(items)) => out.extend(items.iter().filter_map(message_of)),
            Some(v) => out.extend(message_of(v)),
            None => {}
        }
    }
    out
}

fn message_of(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex"))
}

/// Remove terminal color and cursor escape sequences
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_and_usage_tokens() {
        let out = OutputNormalizer::new().normalize(r#"{"response":"X","usage":{"total_tokens":42}}"#, None);
        assert_eq!(out.response_text, "X");
        assert_eq!(out.metadata["tokens"], 42);
        assert_eq!(out.tokens(), Some(42));
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_key_priority() {
        let out = OutputNormalizer::new().normalize(r#"{"message":"second","text":"first"}"#, None);
        assert_eq!(out.response_text, "first");
    }

    #[test]
    fn test_data_nesting() {
        let out = OutputNormalizer::new().normalize(r#"{"data":{"content":"nested"},"id":"abc"}"#, None);
        assert_eq!(out.response_text, "nested");
        assert_eq!(out.metadata["id"], "abc");
    }

    #[test]
    fn test_input_output_tokens_summed_without_total() {
        let out = OutputNormalizer::new().normalize(
            r#"{"result":"ok","usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            None,
        );
        assert_eq!(out.input_tokens(), Some(10));
        assert_eq!(out.output_tokens(), Some(5));
        assert_eq!(out.tokens(), Some(15));
    }

    #[test]
    fn test_cost_and_model_metadata() {
        let out = OutputNormalizer::new().normalize(
            r#"{"response":"hi","cost":{"total":0.0123},"model":"m1","session_id":"s-1","nested":{"a":1}}"#,
            None,
        );
        assert_eq!(out.cost_usd(), Some(0.0123));
        assert_eq!(out.metadata["model"], "m1");
        assert_eq!(out.metadata["session_id"], "s-1");
        assert!(!out.metadata.contains_key("nested"));
        assert!(!out.metadata.contains_key("response"));
    }

    #[test]
    fn test_top_level_cost_fields() {
        let out = OutputNormalizer::new().normalize(r#"{"result":"r","total_cost_usd":0.5}"#, None);
        assert_eq!(out.cost_usd(), Some(0.5));
    }

    #[test]
    fn test_errors_and_warnings_collected() {
        let out = OutputNormalizer::new().normalize(
            r#"{"response":"","error":{"message":"rate limited"},"errors":["a","b"],"warning":"slow"}"#,
            None,
        );
        assert_eq!(out.errors, vec!["rate limited", "a", "b"]);
        assert_eq!(out.warnings, vec!["slow"]);
    }

    #[test]
    fn test_plain_text_without_hint() {
        let out = OutputNormalizer::new().normalize("  just \x1b[1;32mtext\x1b[0m\n", None);
        assert_eq!(out.response_text, "just text");
        assert!(out.errors.is_empty());
        assert!(out.metadata.is_empty());
    }

    #[test]
    fn test_malformed_json_with_hint_records_one_error() {
        let raw = r#"{"response": "unterminated"#;
        let out = OutputNormalizer::new().normalize(raw, Some("json"));
        assert_eq!(out.response_text, raw);
        assert_eq!(out.raw, raw);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn test_bare_json_string() {
        let out = OutputNormalizer::new().normalize(r#""hello""#, Some("json"));
        assert_eq!(out.response_text, "hello");
    }

    #[test]
    fn test_text_hint_skips_json() {
        let out = OutputNormalizer::new().normalize(r#"{"response":"X"}"#, Some("text"));
        assert_eq!(out.response_text, r#"{"response":"X"}"#);
    }

    #[test]
    fn test_json_lines_last_text_wins() {
        let raw = concat!(
            "{\"type\":\"system\",\"model\":\"m2\"}\n",
            "{\"type\":\"assistant\",\"text\":\"partial\"}\n",
            "not json\n",
            "{\"type\":\"result\",\"result\":\"done\",\"text\":\"final\",\"usage\":{\"input_tokens\":3,\"output_tokens\":4}}\n",
        );
        let out = OutputNormalizer::new().normalize(raw, Some("jsonl"));
        assert_eq!(out.response_text, "final");
        assert_eq!(out.metadata["model"], "m2");
        assert_eq!(out.tokens(), Some(7));
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_registered_handler_replaces_algorithm() {
        let mut normalizer = OutputNormalizer::new();
        normalizer.register_handler("upper", |text: &str| NormalizedOutput {
            response_text: text.to_uppercase(),
            raw: text.to_string(),
            ..Default::default()
        });
        assert!(normalizer.has_handler("upper"));
        let out = normalizer.normalize(r#"{"response":"x"}"#, Some("upper"));
        assert_eq!(out.response_text, r#"{"RESPONSE":"X"}"#);
    }
}
