//! Field isolation: lift `content` values out of a broken document, repair
//! what remains, and put the values back after parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::scanner::{scan_string_value, unescape};

static CONTENT_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""content"\s*:\s*""#).expect("valid content key regex"));

const PLACEHOLDER_PREFIX: &str = "__FORGELINE_CONTENT_";
const PLACEHOLDER_SUFFIX: &str = "__";

/// Document with every `content` value replaced by an indexed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolated {
    pub document: String,
    pub contents: Vec<String>,
    /// The text ended inside a content value.
    pub truncated: bool,
}

fn placeholder(index: usize) -> String {
    format!("{PLACEHOLDER_PREFIX}{index}{PLACEHOLDER_SUFFIX}")
}

fn placeholder_index(value: &str) -> Option<usize> {
    value
        .strip_prefix(PLACEHOLDER_PREFIX)?
        .strip_suffix(PLACEHOLDER_SUFFIX)?
        .parse()
        .ok()
}

/// Replace each `"content": "..."` value with a placeholder string.
pub fn isolate_contents(text: &str) -> Isolated {
    let mut document = String::with_capacity(text.len());
    let mut contents = Vec::new();
    let mut cursor = 0;
    let mut truncated = false;

    while let Some(found) = CONTENT_KEY.find_at(text, cursor) {
        let open_quote = found.end() - 1;
        let value = scan_string_value(text, open_quote);
        document.push_str(&text[cursor..open_quote]);
        document.push('"');
        document.push_str(&placeholder(contents.len()));
        document.push('"');
        contents.push(unescape(value.raw));
        cursor = value.end;
        if value.missing_comma {
            document.push(',');
            let rest = &text[cursor..];
            cursor += rest.len() - rest.trim_start().len();
        }
        if !value.terminated {
            truncated = true;
            break;
        }
    }
    if cursor < text.len() {
        document.push_str(&text[cursor..]);
    }

    Isolated {
        document,
        contents,
        truncated,
    }
}

/// Escape raw control characters inside strings and close whatever the text
/// left open: an unterminated string, a dangling key or colon, a trailing
/// comma, and every open object or array.
pub fn close_truncated(document: &str) -> String {
    let mut out = String::with_capacity(document.len() + 16);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // Offset in `out` where the most recent string literal opened.
    let mut last_string_start = 0;

    for c in document.chars() {
        if in_string {
            match c {
                _ if escaped => {
                    escaped = false;
                    out.push(c);
                }
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                last_string_start = out.len();
            }
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
        out.push(c);
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
    if out.ends_with(':') {
        out.push_str("null");
    } else if stack.last() == Some(&'{')
        && out.ends_with('"')
        && is_dangling_key(&out, last_string_start)
    {
        out.push_str(":null");
    }

    while let Some(open) = stack.pop() {
        out.push(if open == '{' { '}' } else { ']' });
    }
    out
}

/// A string literal that opened right after `{` or `,` inside an object is a key.
fn is_dangling_key(out: &str, string_start: usize) -> bool {
    matches!(
        out[..string_start].trim_end().chars().last(),
        Some('{' | ',')
    )
}

/// Replace placeholders in `value` with the isolated contents.
pub fn reinject(value: &mut Value, contents: &[String]) {
    match value {
        Value::String(text) => {
            if let Some(original) = placeholder_index(text).and_then(|index| contents.get(index)) {
                *text = original.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                reinject(item, contents);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                reinject(item, contents);
            }
        }
        _ => {}
    }
}

/// Parse `payload` by isolating content values, repairing the rest if needed.
pub fn parse_isolated(payload: &str) -> Result<Value, serde_json::Error> {
    let isolated = isolate_contents(payload);
    let mut value = match serde_json::from_str::<Value>(&isolated.document) {
        Ok(value) => value,
        Err(_) => serde_json::from_str::<Value>(&close_truncated(&isolated.document))?,
    };
    reinject(&mut value, &isolated.contents);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contents_are_lifted_and_indexed() {
        let text = r#"{"artifacts":[{"path":"a","content":"x "y" z"},{"path":"b","content":"w"}]}"#;
        let isolated = isolate_contents(text);
        assert_eq!(
            isolated.contents,
            vec![r#"x "y" z"#.to_string(), "w".to_string()]
        );
        assert!(isolated.document.contains("__FORGELINE_CONTENT_0__"));
        assert!(isolated.document.contains("__FORGELINE_CONTENT_1__"));
        assert!(!isolated.truncated);
    }

    #[test]
    fn missing_comma_is_restored() {
        let text = r#"{"content":"body" "format":"markdown"}"#;
        let isolated = isolate_contents(text);
        assert_eq!(
            isolated.document,
            r#"{"content":"__FORGELINE_CONTENT_0__","format":"markdown"}"#
        );
    }

    #[test]
    fn missing_comma_across_newline_still_parses() {
        let text = "{\"content\":\"body\"\n  \"format\":\"markdown\"}";
        let isolated = isolate_contents(text);
        assert_eq!(
            isolated.document,
            r#"{"content":"__FORGELINE_CONTENT_0__","format":"markdown"}"#
        );
        let value = parse_isolated(text).expect("parse");
        assert_eq!(value, json!({"content": "body", "format": "markdown"}));
    }

    #[test]
    fn close_truncated_finishes_open_structures() {
        assert_eq!(close_truncated(r#"{"a":[{"b":"c"#), r#"{"a":[{"b":"c"}]}"#);
        assert_eq!(close_truncated(r#"{"a":1,"#), r#"{"a":1}"#);
        assert_eq!(close_truncated(r#"{"a":"#), r#"{"a":null}"#);
        assert_eq!(close_truncated(r#"{"a":1,"b""#), r#"{"a":1,"b":null}"#);
        assert_eq!(
            close_truncated("{\"a\":\"line\nbreak\"}"),
            r#"{"a":"line\nbreak"}"#
        );
    }

    #[test]
    fn truncated_content_is_recovered() {
        let payload = concat!(
            r#"{"status":"OK","artifacts":[{"path":"docs/a.md","#,
            "\"content\":\"# Title\\n- one\n- tw",
        );
        let value = parse_isolated(payload).expect("parse");
        assert_eq!(value["status"], json!("OK"));
        assert_eq!(
            value["artifacts"][0]["content"],
            json!("# Title\n- one\n- tw")
        );
    }

    #[test]
    fn reinject_ignores_unknown_placeholders() {
        let mut value = json!({
            "a": "__FORGELINE_CONTENT_7__",
            "b": ["__FORGELINE_CONTENT_0__"],
        });
        reinject(&mut value, &["zero".to_string()]);
        assert_eq!(
            value,
            json!({"a": "__FORGELINE_CONTENT_7__", "b": ["zero"]})
        );
    }
}
