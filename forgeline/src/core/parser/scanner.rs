//! Quote-aware scanning of JSON string values that may contain unescaped quotes.
//!
//! Generators often emit Markdown or source code inside a JSON string without
//! escaping its double quotes. The scanner decides, one quote at a time,
//! whether a `"` ends the value by looking at what follows it.

use std::sync::LazyLock;

use regex::Regex;

/// `"ident":` at the start of the remaining text.
static KEY_AHEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"[A-Za-z_][A-Za-z0-9_]*"\s*:"#).expect("valid key regex"));

/// Sibling keys of `content` inside an artifact object.
static SIBLING_KEY_AHEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^"(?:format|purpose|path|evidence)"\s*:"#).expect("valid sibling key regex")
});

/// A string value located by [`scan_string_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedValue<'a> {
    /// Raw text between the quotes, escapes untouched.
    pub raw: &'a str,
    /// Byte offset just past the closing quote (or end of text).
    pub end: usize,
    /// False when the text ended before a closing quote was found.
    pub terminated: bool,
    /// True when the closing quote was followed directly by a sibling key with
    /// no separating comma.
    pub missing_comma: bool,
}

/// Scan the string value whose opening quote sits at byte offset `open_quote`.
///
/// An embedded `"` is treated as content unless what follows it (after
/// whitespace) is structural:
/// - end of text;
/// - `}` or `]` that is itself followed by end of text, `,`, `}` or `]`;
/// - `,` followed by end of text, `{`, or a `"key":` pair;
/// - one of the artifact sibling keys (`"format"`, `"purpose"`, `"path"`,
///   `"evidence"`) with the comma missing.
pub fn scan_string_value(text: &str, open_quote: usize) -> ScannedValue<'_> {
    let bytes = text.as_bytes();
    let start = open_quote + 1;
    let mut index = start;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'"' => match closing_kind(&text[index + 1..]) {
                Some(missing_comma) => {
                    return ScannedValue {
                        raw: &text[start..index],
                        end: index + 1,
                        terminated: true,
                        missing_comma,
                    };
                }
                None => index += 1,
            },
            _ => index += 1,
        }
    }
    ScannedValue {
        raw: text.get(start..).unwrap_or(""),
        end: text.len(),
        terminated: false,
        missing_comma: false,
    }
}

/// `Some(missing_comma)` when a quote followed by `rest` closes the value.
fn closing_kind(rest: &str) -> Option<bool> {
    let rest = rest.trim_start();
    let mut chars = rest.chars();
    match chars.next() {
        None => Some(false),
        Some('}' | ']') => {
            let after = chars.as_str().trim_start();
            matches!(after.chars().next(), None | Some(',' | '}' | ']')).then_some(false)
        }
        Some(',') => {
            let after = chars.as_str().trim_start();
            (after.is_empty() || after.starts_with('{') || KEY_AHEAD.is_match(after))
                .then_some(false)
        }
        Some('"') => SIBLING_KEY_AHEAD.is_match(rest).then_some(true),
        _ => None,
    }
}

/// Decode the escapes generators use inside string values.
///
/// `\\` is consumed as a unit before any other escape is considered, so an
/// escaped backslash followed by `n` stays a backslash and an `n`. Unknown
/// escapes are kept verbatim.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
