//! Robust JSON extraction from chat-model output.
//!
//! Models return JSON wrapped in prose, markdown fences, or cut off at the
//! token limit. Extraction runs in tiers: direct parse, fence stripping,
//! truncation repair (brace/bracket balancing), then a scan for balanced
//! top-level objects anywhere in the text.

use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Extract a JSON object from model output, trying all repair tiers.
pub fn extract_json_object(text: &str) -> Result<Value> {
    extract_json(text, false)
}

/// Extract a JSON array (or an object, for callers that accept both).
pub fn extract_json_array(text: &str) -> Result<Value> {
    extract_json(text, true)
}

fn extract_json(text: &str, allow_array: bool) -> Result<Value> {
    let trimmed = text.trim();

    // Tier 1: the whole response is JSON
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if matches(&value, allow_array) {
            return Ok(value);
        }
    }

    // Tier 2: strip markdown code fences
    let unfenced = strip_code_fences(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced.trim()) {
        if matches(&value, allow_array) {
            return Ok(value);
        }
    }

    // Tier 3: complete truncated JSON by balancing braces/brackets
    if let Some(candidate) = first_json_start(unfenced, allow_array)
        .and_then(|start| complete_truncated(&unfenced[start..]))
    {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if matches(&value, allow_array) {
                return Ok(value);
            }
        }
    }

    // Tier 4: scan for balanced top-level values anywhere in the text
    for candidate in scan_balanced(unfenced, allow_array) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if matches(&value, allow_array) {
                return Ok(value);
            }
        }
    }

    Err(CoreError::UpstreamMalformedResponse(format!(
        "no JSON {} found in model response ({} chars)",
        if allow_array { "value" } else { "object" },
        text.len()
    )))
}

fn matches(value: &Value, allow_array: bool) -> bool {
    value.is_object() || (allow_array && value.is_array())
}

/// Strip ```json ... ``` (or bare ```) fences, keeping the inner content.
pub fn strip_code_fences(text: &str) -> &str {
    let re = Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*(?:```|$)").expect("static regex");
    if let Some(caps) = re.captures(text) {
        if let Some(inner) = caps.get(1) {
            let inner = inner.as_str();
            if !inner.trim().is_empty() {
                return inner;
            }
        }
    }
    text
}

fn first_json_start(text: &str, allow_array: bool) -> Option<usize> {
    text.char_indices()
        .find(|(_, c)| *c == '{' || (allow_array && *c == '['))
        .map(|(i, _)| i)
}

/// Repair JSON cut off mid-stream: close an open string, drop a dangling
/// separator, then close every unclosed brace and bracket in order.
pub fn complete_truncated(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None; // mismatched nesting, not repairable
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return Some(text.to_string());
    }

    let mut repaired = text.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    }

    // A trailing `,` or `:` leaves the value position empty
    let tail_trimmed = repaired.trim_end().to_string();
    repaired = tail_trimmed;
    if repaired.ends_with(':') {
        repaired.push_str(" null");
    } else if repaired.ends_with(',') {
        repaired.pop();
    }

    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    Some(repaired)
}

/// Collect balanced `{...}` (and optionally `[...]`) substrings at any
/// position in the text, outermost first.
fn scan_balanced(text: &str, allow_array: bool) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '{' || (allow_array && c == '[') {
            if let Some(end) = balanced_end(&text[i..]) {
                found.push(text[i..i + end].to_string());
                i += end;
                continue;
            }
        }
        i += 1;
    }
    found
}

/// Byte length of the balanced value starting at the first character.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse() {
        let value = extract_json_object(r#"{"title": "X"}"#).unwrap();
        assert_eq!(value, json!({"title": "X"}));
    }

    #[test]
    fn fenced_json() {
        let text = "Here you go:\n```json\n{\"title\": \"X\", \"pages\": []}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["title"], "X");
    }

    #[test]
    fn truncated_fenced_json_is_repaired() {
        // A response cut off mid-string inside a fenced block
        let text = "```json\n{\"title\":\"X\",\"pages\":[{\"id\":\"p1\",\"title\":\"Tekniske";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["title"], "X");
        assert_eq!(value["pages"][0]["id"], "p1");
        assert_eq!(value["pages"][0]["title"], "Tekniske");
    }

    #[test]
    fn truncated_after_colon_gets_null() {
        let text = r#"{"title": "X", "description":"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["title"], "X");
        assert!(value["description"].is_null());
    }

    #[test]
    fn truncated_after_comma() {
        let text = r#"{"items": [{"number": "1"},"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["items"][0]["number"], "1");
    }

    #[test]
    fn embedded_object_in_prose() {
        let text = "The structure is {\"title\": \"Plan\"} as requested.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["title"], "Plan");
    }

    #[test]
    fn array_extraction() {
        let text = "Results:\n```json\n[{\"item_number\": \"1\"}]\n```";
        let value = extract_json_array(text).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["item_number"], "1");
    }

    #[test]
    fn garbage_is_an_error() {
        let err = extract_json_object("no json here at all").unwrap_err();
        assert!(matches!(err, CoreError::UpstreamMalformedResponse(_)));
    }

    #[test]
    fn nested_braces_in_strings_do_not_confuse_the_scanner() {
        let text = r#"prefix {"a": "has { and } inside", "b": 2} suffix"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["b"], 2);
    }
}
