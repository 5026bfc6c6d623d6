//! Payload extraction from raw generator text.

const RESPONSE_OPEN: &str = "<response>";
const RESPONSE_CLOSE: &str = "</response>";
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// Locate the JSON payload inside raw generator output.
///
/// Order of preference:
/// 1. `<response>` wrapper, closed by the last `</response>` after it. A
///    missing closing tag means the output was truncated, so the payload runs
///    from the first `{` to end of text.
/// 2. Text that starts with `{` once reasoning is stripped.
/// 3. A fenced block (```` ```json ```` first, then any fence). An unclosed
///    fence runs to end of text.
/// 4. The span from the first `{` to the last `}` (or end of text).
pub fn extract_payload(raw: &str) -> Option<&str> {
    if let Some(open) = raw.find(RESPONSE_OPEN) {
        let start = open + RESPONSE_OPEN.len();
        let body = match raw[start..].rfind(RESPONSE_CLOSE) {
            Some(close) => &raw[start..start + close],
            None => match raw[start..].find('{') {
                Some(brace) => &raw[start + brace..],
                None => &raw[start..],
            },
        };
        if let Some(payload) = payload_from_body(body) {
            return Some(payload);
        }
    }

    payload_from_body(strip_thinking(raw))
}

fn payload_from_body(body: &str) -> Option<&str> {
    let text = body.trim();
    if text.is_empty() {
        return None;
    }
    if text.starts_with('{') {
        return Some(text);
    }
    if let Some(fenced) = fenced_block(text) {
        return Some(fenced);
    }
    let brace = text.find('{')?;
    let end = text
        .rfind('}')
        .filter(|end| *end > brace)
        .map_or(text.len(), |end| end + 1);
    Some(text[brace..end].trim())
}

fn fenced_block(text: &str) -> Option<&str> {
    let (start, skip) = match text.find("```json") {
        Some(index) => (index, "```json".len()),
        None => (text.find("```")?, 3),
    };
    let after_fence = &text[start + skip..];
    // Drop the rest of the fence line (language tag or nothing).
    let body = match after_fence.find('\n') {
        Some(newline) if is_fence_tag(&after_fence[..newline]) => &after_fence[newline + 1..],
        _ => after_fence,
    };
    let inner = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    let inner = inner.trim();
    if inner.is_empty() { None } else { Some(inner) }
}

fn is_fence_tag(line: &str) -> bool {
    line.trim().chars().all(|c| c.is_ascii_alphanumeric())
}

fn strip_thinking(raw: &str) -> &str {
    match (raw.find(THINKING_OPEN), raw.rfind(THINKING_CLOSE)) {
        (Some(open), Some(close)) if close > open => &raw[close + THINKING_CLOSE.len()..],
        _ => raw,
    }
}

/// Reasoning text from the first `<thinking>` block; empty when absent.
pub fn extract_thinking(raw: &str) -> String {
    let Some(open) = raw.find(THINKING_OPEN) else {
        return String::new();
    };
    let start = open + THINKING_OPEN.len();
    let rest = &raw[start..];
    let end = rest
        .find(THINKING_CLOSE)
        .or_else(|| rest.find(RESPONSE_OPEN))
        .unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_tags_win_over_everything_else() {
        let raw = concat!(
            "<thinking>\nplan {not json}\n</thinking>\n",
            "<response>\n{\"status\":\"OK\"}\n</response>",
        );
        assert_eq!(extract_payload(raw), Some("{\"status\":\"OK\"}"));
    }

    #[test]
    fn last_closing_tag_is_used_when_payload_mentions_the_tag() {
        let raw = "<response>{\"summary\":\"wrap in </response> tags\"}</response>";
        assert_eq!(
            extract_payload(raw),
            Some("{\"summary\":\"wrap in </response> tags\"}")
        );
    }

    #[test]
    fn truncated_response_runs_to_end_of_text() {
        let raw = concat!(
            "<thinking>x</thinking>\n<response>\n",
            "{\n \"status\": \"OK\",\n \"summary\": \"cut",
        );
        assert_eq!(
            extract_payload(raw),
            Some("{\n \"status\": \"OK\",\n \"summary\": \"cut")
        );
    }

    #[test]
    fn fenced_json_block_is_extracted() {
        let raw = "Text before\n```json\n{\"status\":\"QA_PASS\"}\n```\ntrailing";
        assert_eq!(extract_payload(raw), Some("{\"status\":\"QA_PASS\"}"));
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        let raw = "Here:\n```\n{\"status\":\"OK\", \"summary\": \"partial";
        assert_eq!(
            extract_payload(raw),
            Some("{\"status\":\"OK\", \"summary\": \"partial")
        );
    }

    #[test]
    fn leading_brace_is_taken_as_is() {
        let raw = "  {\"status\":\"OK\"}  ";
        assert_eq!(extract_payload(raw), Some("{\"status\":\"OK\"}"));
    }

    #[test]
    fn prose_without_braces_has_no_payload() {
        assert_eq!(extract_payload("not json at all"), None);
        assert_eq!(extract_payload(""), None);
    }

    #[test]
    fn thinking_is_extracted_and_trimmed() {
        let raw = "<thinking>\nMapping FR-01.\n</thinking>\n<response>{}</response>";
        assert_eq!(extract_thinking(raw), "Mapping FR-01.");
        assert_eq!(extract_thinking("{\"status\":\"OK\"}"), "");
    }
}
