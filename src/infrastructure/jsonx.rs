//! Layered recovery of JSON from model and tool output. Providers rarely
//! return bare JSON: the payload arrives fenced, wrapped in prose, or with
//! sloppy quoting. Each layer is tried in order; callers that must never fail
//! finish with [`parse_or_wrap`].

use serde_json::{Map, Value};

/// Tries, in order: strict parse, fenced ```json block, largest brace- or
/// bracket-delimited slice, then a relaxed pass that tolerates trailing
/// commas and single-quoted strings.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(value) = from_fenced_block(trimmed) {
        return Some(value);
    }

    if let Some(candidate) = delimited_slice(trimmed, '{', '}') {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&relax(candidate)) {
            return Some(value);
        }
    }

    if let Some(candidate) = delimited_slice(trimmed, '[', ']') {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&relax(candidate)) {
            return Some(value);
        }
    }

    None
}

/// Terminal fallback: plain prose becomes `{"output_text": <prose>}` so the
/// caller always has a structured value to carry forward.
pub fn parse_or_wrap(content: &str) -> Value {
    match extract_json(content) {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => {
            let mut map = Map::new();
            map.insert("output_text".to_string(), other);
            Value::Object(map)
        }
        None => {
            let mut map = Map::new();
            map.insert(
                "output_text".to_string(),
                Value::String(content.trim().to_string()),
            );
            Value::Object(map)
        }
    }
}

fn from_fenced_block(trimmed: &str) -> Option<Value> {
    let start = trimmed.find("```")?;
    let after_fence = &trimmed[start + 3..];
    let body = after_fence
        .strip_prefix("json")
        .or_else(|| after_fence.strip_prefix("JSON"))
        .unwrap_or(after_fence);
    let end = body.rfind("```")?;
    let slice = body[..end].trim();

    serde_json::from_str::<Value>(slice)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&relax(slice)).ok())
}

fn delimited_slice(content: &str, open: char, close: char) -> Option<&str> {
    let start = content.find(open)?;
    let end = content.rfind(close)?;
    (start < end).then(|| &content[start..=end])
}

/// Rewrites single-quoted strings to double-quoted ones and drops trailing
/// commas before a closing brace or bracket. Text inside double-quoted
/// strings is left untouched.
fn relax(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if escaped {
            output.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_double || in_single => {
                output.push(ch);
                escaped = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                output.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                output.push('"');
            }
            ',' if !in_double && !in_single => {
                let mut lookahead = chars.clone();
                let mut next_meaningful = None;
                for candidate in lookahead.by_ref() {
                    if !candidate.is_whitespace() {
                        next_meaningful = Some(candidate);
                        break;
                    }
                }
                if !matches!(next_meaningful, Some('}') | Some(']')) {
                    output.push(ch);
                }
            }
            _ => output.push(ch),
        }
    }

    output
}
