//! Token-Oriented Object Notation.
//!
//! Uniform arrays of flat objects become a header plus CSV-like rows, objects
//! become indented `key: value` lines, and strings are quoted only when a bare
//! form would be ambiguous.

use serde_json::{Map, Value as JsonValue};

const INDENT: &str = "  ";

pub fn encode(value: &JsonValue) -> String {
    let mut lines = Vec::new();
    match value {
        JsonValue::Object(map) => encode_object(map, 0, &mut lines),
        JsonValue::Array(items) => encode_array(None, items, 0, &mut lines),
        primitive => lines.push(encode_primitive(primitive)),
    }
    lines.join("\n")
}

fn pad(depth: usize) -> String {
    INDENT.repeat(depth)
}

fn encode_object(map: &Map<String, JsonValue>, depth: usize, lines: &mut Vec<String>) {
    for (key, value) in map {
        encode_field(key, value, depth, lines);
    }
}

fn encode_field(key: &str, value: &JsonValue, depth: usize, lines: &mut Vec<String>) {
    let key = encode_key(key);
    match value {
        JsonValue::Object(map) => {
            lines.push(format!("{}{key}:", pad(depth)));
            encode_object(map, depth + 1, lines);
        }
        JsonValue::Array(items) => encode_array(Some(&key), items, depth, lines),
        primitive => lines.push(format!("{}{key}: {}", pad(depth), encode_primitive(primitive))),
    }
}

fn encode_array(key: Option<&str>, items: &[JsonValue], depth: usize, lines: &mut Vec<String>) {
    let prefix = format!("{}{}[{}]", pad(depth), key.unwrap_or(""), items.len());
    if items.is_empty() {
        lines.push(format!("{prefix}:"));
        return;
    }
    if items.iter().all(is_primitive) {
        let row = items.iter().map(encode_primitive).collect::<Vec<_>>().join(",");
        lines.push(format!("{prefix}: {row}"));
        return;
    }
    if let Some(fields) = tabular_fields(items) {
        let header = fields
            .iter()
            .map(|field| encode_key(field))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("{prefix}{{{header}}}:"));
        for item in items {
            let Some(obj) = item.as_object() else {
                continue;
            };
            let row = fields
                .iter()
                .map(|field| obj.get(*field).map(encode_primitive).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(",");
            lines.push(format!("{}{row}", pad(depth + 1)));
        }
        return;
    }
    lines.push(format!("{prefix}:"));
    for item in items {
        encode_list_item(item, depth + 1, lines);
    }
}

fn encode_list_item(item: &JsonValue, depth: usize, lines: &mut Vec<String>) {
    match item {
        JsonValue::Object(map) if !map.is_empty() => {
            let mut nested = Vec::new();
            encode_object(map, depth + 1, &mut nested);
            // The first field moves up onto the dash line.
            if let Some(first) = nested.first_mut() {
                let trimmed = first.trim_start().to_string();
                *first = format!("{}- {trimmed}", pad(depth));
            }
            lines.extend(nested);
        }
        JsonValue::Object(_) => lines.push(format!("{}-", pad(depth))),
        JsonValue::Array(items) => {
            let mut nested = Vec::new();
            encode_array(None, items, depth, &mut nested);
            if let Some(first) = nested.first_mut() {
                let trimmed = first.trim_start().to_string();
                *first = format!("{}- {trimmed}", pad(depth));
            }
            lines.extend(nested);
        }
        primitive => lines.push(format!("{}- {}", pad(depth), encode_primitive(primitive))),
    }
}

fn is_primitive(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Object(_) | JsonValue::Array(_))
}

/// Field order of the first object when every item is a flat object with the same keys.
fn tabular_fields(items: &[JsonValue]) -> Option<Vec<&str>> {
    let first = items.first()?.as_object()?;
    if first.is_empty() {
        return None;
    }
    let fields: Vec<&str> = first.keys().map(String::as_str).collect();
    let uniform = items.iter().all(|item| {
        item.as_object().is_some_and(|obj| {
            obj.len() == fields.len()
                && fields
                    .iter()
                    .all(|field| obj.get(*field).is_some_and(is_primitive))
        })
    });
    uniform.then_some(fields)
}

fn encode_primitive(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        JsonValue::Bool(flag) => flag.to_string(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::String(text) => encode_string(text),
        other => other.to_string(),
    }
}

fn encode_string(text: &str) -> String {
    if needs_quotes(text) {
        serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
    } else {
        text.to_string()
    }
}

fn needs_quotes(text: &str) -> bool {
    text.is_empty()
        || text.trim() != text
        || matches!(text, "true" | "false" | "null")
        || text.parse::<f64>().is_ok()
        || text.starts_with('-')
        || text.chars().any(|ch| {
            matches!(ch, ',' | ':' | '"' | '\\' | '[' | ']' | '{' | '}') || ch.is_control()
        })
}

fn encode_key(key: &str) -> String {
    let mut chars = key.chars();
    let bare = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.');
    if bare {
        key.to_string()
    } else {
        serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""))
    }
}
