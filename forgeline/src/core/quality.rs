//! Heuristic quality gate for otherwise-valid responses.
//!
//! Catches the usual ways a generator cuts corners: stub files, elided
//! sections, and unfinished-work markers. Failures feed the same repair loop
//! as schema violations.

use crate::core::path::root_of;
use crate::core::types::{AgentRole, ResponseEnvelope, Status};

/// Minimum characters for a document artifact.
pub const MIN_DOC_CHARS: usize = 100;
/// Minimum characters for a code or provisioning artifact.
pub const MIN_CODE_CHARS: usize = 50;

const PLACEHOLDER_MARKERS: [&str; 5] = ["[...]", "// ...", "# ...", "// rest of", "/* ... */"];
const UNFINISHED_MARKERS: [&str; 6] = [
    "// TODO",
    "# TODO",
    "/* TODO */",
    "TODO implement",
    "FIXME",
    "// implement",
];

/// Return quality violations for an OK/QA_PASS response. Other statuses pass.
pub fn check_quality(role: AgentRole, envelope: &ResponseEnvelope) -> Vec<String> {
    if !matches!(envelope.status, Status::Ok | Status::QaPass) {
        return Vec::new();
    }

    let mut errors = Vec::new();
    for artifact in &envelope.artifacts {
        let content = artifact.content_str();
        let chars = content.trim().chars().count();
        let minimum = min_content_chars(role, &artifact.path);
        if chars < minimum {
            errors.push(format!("{}: content too short ({chars} chars)", artifact.path));
        }

        if let Some(marker) = PLACEHOLDER_MARKERS
            .iter()
            .find(|marker| content.contains(*marker))
        {
            errors.push(format!("{}: placeholder marker '{marker}' found", artifact.path));
        } else if content.lines().any(|line| line.trim() == "...") {
            errors.push(format!("{}: placeholder marker '...' found", artifact.path));
        }

        if let Some(marker) = UNFINISHED_MARKERS
            .iter()
            .find(|marker| content.contains(*marker))
        {
            errors.push(format!("{}: unfinished-work marker '{marker}' found", artifact.path));
        }
    }
    errors
}

fn min_content_chars(role: AgentRole, path: &str) -> usize {
    match (role, root_of(path)) {
        (_, Some("apps/")) | (AgentRole::Devops, Some("project/")) => MIN_CODE_CHARS,
        _ => MIN_DOC_CHARS,
    }
}
