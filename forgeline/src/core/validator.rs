//! Response envelope validation and per-mode gates.
//!
//! Validation never edits the envelope. It returns the list of violations;
//! an empty list means the envelope passed.

use tracing::{debug, warn};

use crate::core::path::{file_name, sanitize_path};
use crate::core::types::{AgentRole, Artifact, Mode, ResponseEnvelope, Status};

/// Base-schema requirements for a `(role, mode)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequirements {
    pub require_artifacts: bool,
    pub require_evidence_when_ok: bool,
}

/// Artifact path a gate insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredPath {
    /// A named file; satisfied when an artifact path contains it or ends with its file name.
    File(&'static str),
    /// A directory prefix; satisfied when an artifact path starts with it.
    Prefix(&'static str),
}

impl RequiredPath {
    pub fn is_satisfied_by(self, path: &str) -> bool {
        match self {
            RequiredPath::File(required) => {
                path.contains(required) || path.ends_with(file_name(required))
            }
            RequiredPath::Prefix(prefix) => path.starts_with(prefix),
        }
    }

    fn violation(self, mode: Mode) -> String {
        match self {
            RequiredPath::File(required) => {
                format!("mode {mode} requires an artifact whose path contains {required}")
            }
            RequiredPath::Prefix(prefix) => {
                format!("mode {mode} requires at least one artifact under {prefix}")
            }
        }
    }
}

/// Every role/mode pair with a path gate must produce artifacts; every OK requires evidence.
pub fn requirements_for_mode(role: AgentRole, mode: Mode) -> ModeRequirements {
    ModeRequirements {
        require_artifacts: !required_paths_for_mode(role, mode, None).is_empty(),
        require_evidence_when_ok: true,
    }
}

/// Artifact paths the gate for `(role, mode)` requires.
pub fn required_paths_for_mode(
    role: AgentRole,
    mode: Mode,
    task_id: Option<&str>,
) -> Vec<RequiredPath> {
    use RequiredPath::{File, Prefix};

    match (role, mode) {
        (AgentRole::Cto, Mode::SpecIntakeAndNormalize) => vec![File("docs/spec/PRODUCT_SPEC.md")],
        (
            AgentRole::Cto,
            Mode::ValidateEngineerDocs | Mode::ValidateBacklog | Mode::CharterAndProposal,
        ) => vec![Prefix("docs/cto/")],
        (AgentRole::Engineer, Mode::GenerateEngineeringDocs) => vec![
            File("docs/engineer/engineer_proposal.md"),
            File("docs/engineer/engineer_architecture.md"),
            File("docs/engineer/engineer_dependencies.md"),
        ],
        (AgentRole::Pm, Mode::GenerateBacklog) => vec![Prefix("docs/pm/")],
        (AgentRole::Dev, Mode::ImplementTask) => {
            let mut required = vec![Prefix("apps/")];
            if task_id.is_some_and(|id| !id.trim().is_empty()) {
                required.push(Prefix("docs/dev/dev_implementation_"));
            }
            required
        }
        (AgentRole::Qa, Mode::ValidateTask) => vec![Prefix("docs/qa/")],
        (AgentRole::Monitor, Mode::Orchestrate) => vec![
            File("docs/monitor/TASK_STATE.json"),
            File("docs/monitor/STATUS.md"),
        ],
        (AgentRole::Devops, Mode::ProvisionArtifacts) => {
            vec![Prefix("project/"), Prefix("docs/devops/")]
        }
        _ => Vec::new(),
    }
}

/// Base schema validation.
pub fn validate(
    envelope: &ResponseEnvelope,
    require_artifacts: bool,
    require_evidence_when_ok: bool,
) -> Vec<String> {
    let mut errors = Vec::new();

    if let Status::Unrecognized(raw) = &envelope.status {
        if raw.is_empty() {
            errors.push(format!(
                "status is required; expected one of {}",
                Status::RECOGNIZED.join(", ")
            ));
        } else {
            errors.push(format!(
                "status '{raw}' is invalid; expected one of {}",
                Status::RECOGNIZED.join(", ")
            ));
        }
    }

    if envelope.summary.is_none() {
        errors.push("summary is required and must be a string".to_string());
    }

    if require_artifacts && envelope.artifacts.is_empty() {
        errors.push("mode requires at least one artifact".to_string());
    }
    for (index, artifact) in envelope.artifacts.iter().enumerate() {
        errors.extend(artifact_errors(index, artifact, require_artifacts));
    }
    if require_artifacts
        && !envelope.artifacts.is_empty()
        && !envelope.artifacts.iter().any(is_usable)
    {
        errors.push(
            "at least one artifact must have a valid path and non-empty content".to_string(),
        );
    }

    if envelope.status == Status::Ok && require_evidence_when_ok && envelope.evidence.is_empty() {
        errors.push("status OK requires non-empty evidence".to_string());
    }

    if envelope.status == Status::NeedsInfo && envelope.next_actions.questions.is_empty() {
        errors.push("status NEEDS_INFO requires non-empty next_actions.questions".to_string());
    }

    errors
}

fn artifact_errors(index: usize, artifact: &Artifact, require_content: bool) -> Vec<String> {
    let mut errors = Vec::new();
    if artifact.path.trim().is_empty() {
        errors.push(format!("artifacts[{index}].path is required and must be a string"));
    } else if sanitize_path(&artifact.path).is_none() {
        errors.push(format!(
            "artifacts[{index}].path is invalid or blocked: {:?}",
            artifact.path
        ));
    }
    if require_content && artifact.content.is_none() {
        errors.push(format!("artifacts[{index}] must carry content"));
    }
    errors
}

fn is_usable(artifact: &Artifact) -> bool {
    sanitize_path(&artifact.path).is_some() && !artifact.content_str().trim().is_empty()
}

/// Base validation plus the mode's gates.
///
/// Gates run only once the base schema passes, so the reported list is either
/// base violations or gate violations, never a mix.
pub fn validate_for_mode(
    envelope: &ResponseEnvelope,
    role: AgentRole,
    mode: Mode,
    task_id: Option<&str>,
) -> Vec<String> {
    let requirements = requirements_for_mode(role, mode);
    let errors = validate(
        envelope,
        requirements.require_artifacts,
        requirements.require_evidence_when_ok,
    );
    if !errors.is_empty() {
        debug!(%role, %mode, count = errors.len(), "base validation failed");
        return errors;
    }

    let paths: Vec<String> = envelope
        .artifacts
        .iter()
        .filter_map(|artifact| sanitize_path(&artifact.path))
        .collect();
    let mut gate_errors: Vec<String> = required_paths_for_mode(role, mode, task_id)
        .into_iter()
        .filter(|required| !paths.iter().any(|path| required.is_satisfied_by(path)))
        .map(|required| required.violation(mode))
        .collect();

    if role == AgentRole::Qa
        && mode == Mode::ValidateTask
        && !matches!(envelope.status, Status::QaPass | Status::QaFail)
    {
        gate_errors.push(format!(
            "QA validate_task must return status QA_PASS or QA_FAIL, got {}",
            envelope.status
        ));
    }

    if !gate_errors.is_empty() {
        debug!(%role, %mode, count = gate_errors.len(), "mode gate failed");
    }
    gate_errors
}

/// Keep only artifacts whose path passes the path policy, rewriting each path
/// to its normalized form.
pub fn filter_artifacts(artifacts: &[Artifact]) -> Vec<Artifact> {
    artifacts
        .iter()
        .filter_map(|artifact| match sanitize_path(&artifact.path) {
            Some(path) => Some(Artifact {
                path,
                ..artifact.clone()
            }),
            None => {
                warn!(path = %artifact.path, "artifact dropped by path policy");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(status: Status, artifacts: Vec<Artifact>) -> ResponseEnvelope {
        ResponseEnvelope {
            request_id: "req".to_string(),
            status,
            summary: Some("done".to_string()),
            artifacts,
            evidence: vec![json!("checked")],
            ..ResponseEnvelope::default()
        }
    }

    #[test]
    fn well_formed_envelope_passes_base_validation() {
        let env = envelope(Status::Ok, vec![Artifact::new("docs/a.md", "body")]);
        assert!(validate(&env, true, true).is_empty());
    }

    #[test]
    fn ok_without_evidence_is_rejected() {
        let mut env = envelope(Status::Ok, vec![Artifact::new("docs/a.md", "body")]);
        env.evidence.clear();
        let errors = validate(&env, true, true);
        assert_eq!(
            errors,
            vec!["status OK requires non-empty evidence".to_string()]
        );
        assert!(validate(&env, true, false).is_empty());
    }

    #[test]
    fn needs_info_requires_questions() {
        let mut env = envelope(Status::NeedsInfo, vec![Artifact::new("docs/a.md", "body")]);
        assert_eq!(validate(&env, false, true).len(), 1);
        env.next_actions
            .questions
            .push("Which database?".to_string());
        assert!(validate(&env, false, true).is_empty());
    }

    #[test]
    fn unrecognized_status_and_missing_summary_are_reported() {
        let mut env = envelope(Status::Unrecognized("DONE".to_string()), Vec::new());
        env.summary = None;
        let errors = validate(&env, false, true);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("'DONE'"));
    }

    #[test]
    fn blocked_paths_and_missing_content_are_reported_by_index() {
        let env = envelope(
            Status::Ok,
            vec![
                Artifact::new("../etc/passwd", "x"),
                Artifact {
                    path: "docs/b.md".to_string(),
                    ..Artifact::default()
                },
            ],
        );
        let errors = validate(&env, true, true);
        let reported = |prefix: &str| errors.iter().any(|e| e.starts_with(prefix));
        assert!(reported("artifacts[0].path is invalid"));
        assert!(reported("artifacts[1] must carry content"));
        assert!(reported("at least one artifact"));
    }

    #[test]
    fn empty_artifacts_fail_when_required() {
        let env = envelope(Status::Ok, Vec::new());
        assert_eq!(
            validate(&env, true, true),
            vec!["mode requires at least one artifact".to_string()]
        );
        assert!(validate(&env, false, true).is_empty());
    }

    #[test]
    fn validate_task_rejects_non_verdict_status() {
        let env = envelope(
            Status::Ok,
            vec![Artifact::new("docs/qa/report.md", "looks good")],
        );
        let errors = validate_for_mode(&env, AgentRole::Qa, Mode::ValidateTask, Some("t1"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("QA_PASS or QA_FAIL"));
    }

    #[test]
    fn validate_task_accepts_qa_pass_with_artifact() {
        let env = envelope(
            Status::QaPass,
            vec![Artifact::new("docs/qa/report.md", "looks good")],
        );
        assert!(validate_for_mode(&env, AgentRole::Qa, Mode::ValidateTask, Some("t1")).is_empty());
    }

    #[test]
    fn engineering_docs_gate_names_missing_files() {
        let env = envelope(
            Status::Ok,
            vec![Artifact::new("docs/engineer/engineer_proposal.md", "proposal")],
        );
        let errors = validate_for_mode(
            &env,
            AgentRole::Engineer,
            Mode::GenerateEngineeringDocs,
            None,
        );
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("engineer_architecture.md"));
        assert!(errors[1].contains("engineer_dependencies.md"));
    }

    #[test]
    fn required_file_matches_by_file_name() {
        let spec = RequiredPath::File("docs/spec/PRODUCT_SPEC.md");
        assert!(spec.is_satisfied_by("docs/PRODUCT_SPEC.md"));
        assert!(!RequiredPath::Prefix("docs/pm/").is_satisfied_by("docs/pmx/a.md"));
    }

    #[test]
    fn dev_gate_requires_implementation_notes_only_with_task_id() {
        assert_eq!(
            required_paths_for_mode(AgentRole::Dev, Mode::ImplementTask, None).len(),
            1
        );
        assert_eq!(
            required_paths_for_mode(AgentRole::Dev, Mode::ImplementTask, Some("t-1")).len(),
            2
        );
    }

    #[test]
    fn base_errors_suppress_gate_errors() {
        let mut env = envelope(Status::Ok, vec![Artifact::new("docs/other.md", "x")]);
        env.evidence.clear();
        let errors = validate_for_mode(&env, AgentRole::Pm, Mode::GenerateBacklog, None);
        assert_eq!(
            errors,
            vec!["status OK requires non-empty evidence".to_string()]
        );
    }

    #[test]
    fn filter_artifacts_drops_and_normalizes() {
        let kept = filter_artifacts(&[
            Artifact::new("docs//a.md", "a"),
            Artifact::new("/etc/passwd", "b"),
            Artifact::new("src/main.rs", "c"),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].path, "docs/a.md");
    }
}
