//! Tolerant extraction of a JSON object from raw model text.
//!
//! Models wrap JSON in markdown fences or surround it with prose. In order:
//! 1. Direct parse of the trimmed text
//! 2. Parse after stripping leading/trailing code-fence markers
//! 3. Parse each balanced `{...}` span, first one that parses wins
//!
//! Total failure yields `None`; callers apply their own fallback.

use serde_json::{Map, Value};

/// Extract the first JSON object from `text`.
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();

    if let Some(obj) = as_object(trimmed) {
        return Some(obj);
    }

    let unfenced = strip_code_fence(trimmed);
    if unfenced != trimmed
        && let Some(obj) = as_object(unfenced)
    {
        return Some(obj);
    }

    let mut from = 0;
    while let Some(offset) = trimmed[from..].find('{') {
        let start = from + offset;
        // An unclosed brace may still contain a complete object further on.
        if let Some(len) = balanced_end(&trimmed[start..])
            && let Some(obj) = as_object(&trimmed[start..start + len])
        {
            return Some(obj);
        }
        from = start + 1;
    }

    None
}

fn as_object(s: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Drop a leading ```` ```lang ```` line and a trailing ```` ``` ````.
fn strip_code_fence(s: &str) -> &str {
    let mut out = s;
    if let Some(rest) = out.strip_prefix("```") {
        out = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest,
        };
    }
    if let Some(rest) = out.trim_end().strip_suffix("```") {
        out = rest;
    }
    out.trim()
}

/// Byte length of the balanced object starting at `s[0] == '{'`.
///
/// Braces inside JSON strings are ignored.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read `key` from a parsed object as a trimmed, non-empty string.
pub(crate) fn string_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
