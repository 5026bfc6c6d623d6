//! Last-resort recovery for documents with a known, fixed set of artifacts.
//!
//! Bypasses JSON parsing entirely: artifact paths are fingerprinted by file
//! name and each `path`/`content` pair is pulled straight from the raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use super::scanner::{scan_string_value, unescape};
use crate::core::path::sanitize_path;
use crate::core::types::{Artifact, ResponseEnvelope, Status};

/// A document known to carry a fixed set of named artifacts under one directory.
struct Fingerprint {
    dir: &'static str,
    names: &'static [&'static str],
}

const FINGERPRINTS: [Fingerprint; 2] = [
    Fingerprint {
        dir: "docs/engineer/",
        names: &[
            "engineer_proposal.md",
            "engineer_architecture.md",
            "engineer_dependencies.md",
        ],
    },
    Fingerprint {
        dir: "docs/monitor/",
        names: &["TASK_STATE.json", "STATUS.md"],
    },
];

/// Recovered content shorter than this is treated as noise.
const MIN_RECOVERED_CHARS: usize = 50;
/// Meta-commentary is only trimmed past this offset so a document opening
/// with "Let me ..." keeps its first lines.
const META_TRIM_MIN_OFFSET: usize = 100;

static PATH_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""path"\s*:\s*"([^"\n]+)""#).expect("valid path regex"));

static CONTENT_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""content"\s*:\s*""#).expect("valid content key regex"));

static META_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?im)^(?:Now I |Let me |The key challenge|Actually,? |I need to |I'll |",
        r"So the |OK I think |Scanning for |So we need )",
    ))
    .expect("valid meta line regex")
});

/// Rebuild an envelope from fingerprinted artifacts in `raw`, if any are found.
pub fn pattern_fallback(raw: &str, request_id: &str) -> Option<ResponseEnvelope> {
    let artifacts = recover_artifacts(raw);
    if artifacts.is_empty() {
        return None;
    }
    let paths: Vec<&str> = artifacts
        .iter()
        .map(|artifact| artifact.path.as_str())
        .collect();
    let evidence = vec![json!({
        "type": "parser_recovery",
        "detail": format!("recovered {} artifact(s) from raw output", artifacts.len()),
        "paths": paths,
    })];
    Some(ResponseEnvelope {
        request_id: request_id.to_string(),
        status: Status::Ok,
        summary: Some(format!(
            "recovered {} artifact(s) from malformed output",
            artifacts.len()
        )),
        evidence,
        artifacts,
        ..ResponseEnvelope::default()
    })
}

/// Every fingerprinted artifact recoverable from `raw`, first occurrence wins.
pub fn recover_artifacts(raw: &str) -> Vec<Artifact> {
    let mut recovered: Vec<Artifact> = Vec::new();
    for fingerprint in &FINGERPRINTS {
        for name in fingerprint.names {
            if !raw.contains(name) {
                continue;
            }
            let content = content_from_pair(raw, name).or_else(|| content_from_marker(raw, name));
            let Some(content) = content else {
                continue;
            };
            let path = format!("{}{}", fingerprint.dir, name);
            if recovered.iter().any(|artifact| artifact.path == path) {
                continue;
            }
            let format = if name.ends_with(".json") { "json" } else { "markdown" };
            recovered.push(Artifact {
                format: Some(format.to_string()),
                ..Artifact::new(path, content)
            });
        }
    }
    recovered
}

/// `"path": ".../<name>"` followed by its `"content": "..."` in the same object.
fn content_from_pair(raw: &str, name: &str) -> Option<String> {
    PATH_PAIR.captures_iter(raw).find_map(|captures| {
        let path = captures.get(1)?;
        let path_text = sanitize_path(path.as_str())?;
        if !path_text.ends_with(name) {
            return None;
        }
        let whole = captures.get(0)?;
        let next_path = PATH_PAIR
            .find_at(raw, whole.end())
            .map_or(raw.len(), |next| next.start());
        let content_key = CONTENT_KEY.find_at(raw, whole.end())?;
        if content_key.start() > next_path {
            return None;
        }
        let value = scan_string_value(raw, content_key.end() - 1);
        let content = unescape(value.raw).trim().to_string();
        (content.chars().count() >= MIN_RECOVERED_CHARS).then_some(content)
    })
}

/// `**<name> content:**` followed by a fenced block, as written inside reasoning.
fn content_from_marker(raw: &str, name: &str) -> Option<String> {
    let marker = format!("**{name} content:**");
    let start = raw.find(&marker)? + marker.len();
    let fence = start + raw[start..].find("```")?;
    let content_start = raw[fence + 3..]
        .find('\n')
        .map_or(fence + 3, |newline| fence + 3 + newline + 1);

    let mut end = raw.len();
    for other in FINGERPRINTS.iter().flat_map(|entry| entry.names) {
        if *other == name {
            continue;
        }
        if let Some(position) = raw[content_start..].find(&format!("**{other} content:**")) {
            end = end.min(content_start + position);
        }
    }
    for terminator in ["<response>", "</thinking>"] {
        if let Some(position) = raw[content_start..].find(terminator) {
            end = end.min(content_start + position);
        }
    }

    let mut content = raw[content_start..end].trim_end();
    if let Some(stripped) = content.strip_suffix("```") {
        content = stripped.trim_end();
    }
    let content = trim_meta_commentary(content.trim());
    (content.chars().count() >= MIN_RECOVERED_CHARS).then(|| content.to_string())
}

/// Cut at the first line that reads like the generator talking to itself.
fn trim_meta_commentary(content: &str) -> &str {
    let cut = META_LINE
        .find_iter(content)
        .map(|found| {
            content[..found.start()]
                .rfind('\n')
                .map_or(0, |newline| newline + 1)
        })
        .find(|line_start| *line_start > META_TRIM_MIN_OFFSET);
    match cut {
        Some(line_start) => content[..line_start].trim_end(),
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str) -> String {
        format!(
            "# {title}\n\n{}",
            "Details about the design of the landing page. ".repeat(3)
        )
    }

    #[test]
    fn recovers_pairs_from_broken_json() {
        let raw = format!(
            concat!(
                r#"{{"status":"OK","artifacts":["#,
                r#"{{"path":"docs/engineer/engineer_proposal.md","content":"{}"}}, "#,
                r#"{{"path":"docs/engineer/engineer_architecture.md","content":"{}"#,
            ),
            doc("Proposal").replace('\n', "\\n"),
            doc("Architecture").replace('\n', "\\n"),
        );
        let envelope = pattern_fallback(&raw, "req-9").expect("recovered");
        assert_eq!(envelope.status, Status::Ok);
        assert_eq!(envelope.request_id, "req-9");
        assert_eq!(envelope.artifacts.len(), 2);
        assert_eq!(
            envelope.artifacts[0].path,
            "docs/engineer/engineer_proposal.md"
        );
        let architecture = envelope.artifacts[1].content_str();
        assert!(architecture.starts_with("# Architecture\n"));
        assert!(!envelope.evidence.is_empty());
    }

    #[test]
    fn recovers_marker_blocks_and_trims_meta_commentary() {
        let raw = format!(
            concat!(
                "<thinking>\n**engineer_dependencies.md content:**\n```markdown\n",
                "{}\nNow I need to write the JSON.\n```\n</thinking>",
            ),
            doc("Dependencies")
        );
        let artifacts = recover_artifacts(&raw);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, "docs/engineer/engineer_dependencies.md");
        assert!(!artifacts[0].content_str().contains("Now I need"));
        assert!(artifacts[0].content_str().starts_with("# Dependencies"));
    }

    #[test]
    fn unknown_documents_are_not_recovered() {
        let raw = r#"{"status":"OK","artifacts":[{"path":"docs/x.md","content": invalid}]}"#;
        assert!(pattern_fallback(raw, "req").is_none());
    }

    #[test]
    fn short_fragments_are_ignored() {
        let raw = r#"{"path":"docs/monitor/STATUS.md","content":"ok"}"#;
        assert!(recover_artifacts(raw).is_empty());
    }
}
