// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Validate call parameters against a tool's declared JSON schema.
///
/// Supported subset: `type` (object/string/number/integer/boolean/array),
/// `properties`, `required`, `maxLength` for strings, `minimum`/`maximum`
/// for numbers.  Unknown parameters are rejected — a tool's signature is a
/// closed contract.
pub fn validate_parameters(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(obj) = params.as_object() else {
        return Err("parameters must be a JSON object".into());
    };
    let properties = schema.get("properties").and_then(Value::as_object);
    let empty = serde_json::Map::new();
    let properties = properties.unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for req in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(req) {
                return Err(format!("missing required parameter '{req}'"));
            }
        }
    }

    for (key, value) in obj {
        let Some(spec) = properties.get(key) else {
            return Err(format!("unknown parameter '{key}'"));
        };
        check_type(key, spec, value)?;
    }
    Ok(())
}

fn check_type(key: &str, spec: &Value, value: &Value) -> Result<(), String> {
    let Some(ty) = spec.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let ok = match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if !ok {
        return Err(format!("parameter '{key}' must have type {ty}"));
    }
    if let (Some(max_len), Some(s)) = (spec.get("maxLength").and_then(Value::as_u64), value.as_str())
    {
        if s.chars().count() as u64 > max_len {
            return Err(format!("parameter '{key}' exceeds maxLength {max_len}"));
        }
    }
    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("parameter '{key}' is below minimum {min}"));
            }
        }
        if let Some(max) = spec.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("parameter '{key}' is above maximum {max}"));
            }
        }
    }
    Ok(())
}

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</?script\b").expect("static regex"))
}

/// Longest run of one repeated character tolerated inside a string value.
const MAX_CHAR_RUN: usize = 256;

/// Scan parameter values for injection signatures.  Returns a description of
/// the first finding, or `None` when the payload is clean.
///
/// Checked per string value: script tags, shell metacharacters, path
/// traversal, and degenerate repeated runs.  The serialized payload size cap
/// is enforced by the caller (it is configuration).
pub fn scan_unsafe(params: &Value) -> Option<String> {
    match params {
        Value::String(s) => scan_string(s),
        Value::Array(items) => items.iter().find_map(scan_unsafe),
        Value::Object(map) => map.values().find_map(scan_unsafe),
        _ => None,
    }
}

fn scan_string(s: &str) -> Option<String> {
    if script_tag_re().is_match(s) {
        return Some("script tag in parameter value".into());
    }
    if s.contains("../") || s.contains("..\\") {
        return Some("path traversal sequence in parameter value".into());
    }
    if let Some(c) = s.chars().find(|c| matches!(c, ';' | '|' | '`' | '$' | '&')) {
        return Some(format!("shell metacharacter '{c}' in parameter value"));
    }
    let mut run = 0usize;
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if Some(c) == prev {
            run += 1;
            if run >= MAX_CHAR_RUN {
                return Some("degenerate repeated content in parameter value".into());
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
