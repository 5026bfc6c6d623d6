//! Envelope types exchanged with the generator.
//!
//! Requests are strongly typed and built by the orchestrator. Responses come from
//! an untrusted text generator, so they decode leniently: a field with the wrong
//! JSON shape decodes to its empty form and the validator reports it, instead of
//! the whole document failing to decode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a role or mode tag is not part of the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

/// Role tag of a specialized agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentRole {
    Cto,
    Engineer,
    Pm,
    Dev,
    Qa,
    Monitor,
    Devops,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Cto,
        AgentRole::Engineer,
        AgentRole::Pm,
        AgentRole::Dev,
        AgentRole::Qa,
        AgentRole::Monitor,
        AgentRole::Devops,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Cto => "CTO",
            AgentRole::Engineer => "ENGINEER",
            AgentRole::Pm => "PM",
            AgentRole::Dev => "DEV",
            AgentRole::Qa => "QA",
            AgentRole::Monitor => "MONITOR",
            AgentRole::Devops => "DEVOPS",
        }
    }

    /// Path segment used by the invocation service (`/invoke/{slug}`).
    pub fn endpoint_slug(self) -> &'static str {
        match self {
            AgentRole::Cto => "cto",
            AgentRole::Engineer => "engineer",
            AgentRole::Pm => "pm",
            AgentRole::Dev => "dev",
            AgentRole::Qa => "qa",
            AgentRole::Monitor => "monitor",
            AgentRole::Devops => "devops",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = UnknownTag;

    /// Case-insensitive; accepts the service slugs and the `_BACKEND`-style
    /// variant suffixes some callers attach to a role.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let base = normalized
            .strip_suffix("_BACKEND")
            .or_else(|| normalized.strip_suffix("_DOCKER"))
            .unwrap_or(&normalized);
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == base)
            .ok_or_else(|| UnknownTag {
                kind: "agent role",
                value: s.to_string(),
            })
    }
}

/// Operation requested from an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    SpecIntakeAndNormalize,
    GenerateEngineeringDocs,
    CharterAndProposal,
    ValidateEngineerDocs,
    GenerateBacklog,
    ValidateBacklog,
    ImplementTask,
    ValidateTask,
    Orchestrate,
    ProvisionArtifacts,
}

impl Mode {
    pub const ALL: [Mode; 10] = [
        Mode::SpecIntakeAndNormalize,
        Mode::GenerateEngineeringDocs,
        Mode::CharterAndProposal,
        Mode::ValidateEngineerDocs,
        Mode::GenerateBacklog,
        Mode::ValidateBacklog,
        Mode::ImplementTask,
        Mode::ValidateTask,
        Mode::Orchestrate,
        Mode::ProvisionArtifacts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::SpecIntakeAndNormalize => "spec_intake_and_normalize",
            Mode::GenerateEngineeringDocs => "generate_engineering_docs",
            Mode::CharterAndProposal => "charter_and_proposal",
            Mode::ValidateEngineerDocs => "validate_engineer_docs",
            Mode::GenerateBacklog => "generate_backlog",
            Mode::ValidateBacklog => "validate_backlog",
            Mode::ImplementTask => "implement_task",
            Mode::ValidateTask => "validate_task",
            Mode::Orchestrate => "orchestrate",
            Mode::ProvisionArtifacts => "provision_artifacts",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| UnknownTag {
                kind: "mode",
                value: s.to_string(),
            })
    }
}

/// Response status declared by an agent.
///
/// `Unrecognized` keeps whatever the generator sent so the validator can name it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Fail,
    Blocked,
    NeedsInfo,
    Revision,
    QaPass,
    QaFail,
    Unrecognized(String),
}

impl Status {
    /// Every status tag the protocol recognizes.
    pub const RECOGNIZED: [&'static str; 7] = [
        "OK",
        "FAIL",
        "BLOCKED",
        "NEEDS_INFO",
        "REVISION",
        "QA_PASS",
        "QA_FAIL",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Status::Ok => "OK",
            Status::Fail => "FAIL",
            Status::Blocked => "BLOCKED",
            Status::NeedsInfo => "NEEDS_INFO",
            Status::Revision => "REVISION",
            Status::QaPass => "QA_PASS",
            Status::QaFail => "QA_FAIL",
            Status::Unrecognized(raw) => raw,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "OK" => Status::Ok,
            "FAIL" => Status::Fail,
            "BLOCKED" => Status::Blocked,
            "NEEDS_INFO" => Status::NeedsInfo,
            "REVISION" => Status::Revision,
            "QA_PASS" => Status::QaPass,
            "QA_FAIL" => Status::QaFail,
            other => Status::Unrecognized(other.to_string()),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unrecognized(String::new())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(tag) => Status::from_tag(&tag),
            Value::Null => Status::default(),
            other => Status::Unrecognized(other.to_string()),
        })
    }
}

/// A named, path-addressed piece of generated content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: String,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub format: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub purpose: Option<String>,
}

impl Artifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            format: None,
            purpose: None,
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Follow-up actions requested by an agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NextActions {
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "lenient_values")]
    pub items: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub questions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structured response decoded from generator output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, deserialize_with = "lenient_string")]
    pub request_id: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient_artifacts")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, deserialize_with = "lenient_values")]
    pub evidence: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_next_actions")]
    pub next_actions: NextActions,
}

impl ResponseEnvelope {
    /// Envelope carrying only a terminal status and a diagnostic summary.
    pub fn terminal(
        request_id: impl Into<String>,
        status: Status,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn summary_str(&self) -> &str {
        self.summary.as_deref().unwrap_or("")
    }

    /// Artifacts that carry non-empty content.
    pub fn produced_artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(|artifact| !artifact.content_str().trim().is_empty())
    }
}

/// Failure kind of a call the circuit breaker refused.
pub const CIRCUIT_OPEN: &str = "circuit_open";

/// A response envelope wrapped with the validator's verdict.
///
/// The envelope itself is never edited after validation; diagnostics live beside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedResponse {
    #[serde(flatten)]
    pub envelope: ResponseEnvelope,
    #[serde(default)]
    pub validator_pass: bool,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub artifacts_paths: Vec<String>,
    /// Why the runtime produced a terminal envelope instead of an answer,
    /// e.g. `circuit_open` or `repairs_exhausted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
}

impl ValidatedResponse {
    pub fn new(envelope: ResponseEnvelope, validation_errors: Vec<String>) -> Self {
        let artifacts_paths = envelope
            .artifacts
            .iter()
            .map(|artifact| artifact.path.clone())
            .collect();
        Self {
            validator_pass: validation_errors.is_empty(),
            envelope,
            validation_errors,
            artifacts_paths,
            failure_kind: None,
        }
    }

    pub fn with_failure_kind(mut self, kind: impl Into<String>) -> Self {
        self.failure_kind = Some(kind.into());
        self
    }

    pub fn is_circuit_open(&self) -> bool {
        self.failure_kind.as_deref() == Some(CIRCUIT_OPEN)
    }

    pub fn status(&self) -> &Status {
        &self.envelope.status
    }
}

/// Existing artifact forwarded to an agent as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub content: String,
}

/// Round, rework, and timeout caps attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub round: u32,
    pub max_rounds: u32,
    pub max_rework: u32,
    pub timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            round: 1,
            max_rounds: 3,
            max_rework: 3,
            timeout_secs: 120,
        }
    }
}

/// Request sent to an agent. Built once, never edited after sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub request_id: String,
    pub project_id: String,
    pub agent: AgentRole,
    #[serde(default)]
    pub variant: String,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub existing_artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub limits: Limits,
}

impl MessageEnvelope {
    pub fn new(
        project_id: impl Into<String>,
        agent: AgentRole,
        mode: Mode,
        task: impl Into<String>,
    ) -> Self {
        Self {
            request_id: new_request_id(mode),
            project_id: project_id.into(),
            agent,
            variant: String::new(),
            mode,
            task_id: None,
            task: task.into(),
            inputs: Map::new(),
            existing_artifacts: Vec::new(),
            limits: Limits::default(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_existing_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.existing_artifacts = artifacts;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Fresh request id, prefixed with the mode for log readability.
pub fn new_request_id(mode: Mode) -> String {
    format!("{}-{}", mode.as_str(), Uuid::new_v4().simple())
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_values<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

fn lenient_strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Value::String(single) if !single.trim().is_empty() => vec![single],
        _ => Vec::new(),
    })
}

fn lenient_artifacts<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<Artifact>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        // Non-object entries become empty artifacts so the validator reports them by index.
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(_) => serde_json::from_value(item).unwrap_or_default(),
                _ => Artifact::default(),
            })
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_next_actions<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<NextActions, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
        Value::Array(items) => NextActions {
            items,
            ..NextActions::default()
        },
        _ => NextActions::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_parses_case_insensitively_and_with_suffixes() {
        assert_eq!("qa".parse::<AgentRole>(), Ok(AgentRole::Qa));
        assert_eq!("Dev".parse::<AgentRole>(), Ok(AgentRole::Dev));
        assert_eq!("pm_backend".parse::<AgentRole>(), Ok(AgentRole::Pm));
        assert_eq!("devops-docker".parse::<AgentRole>(), Ok(AgentRole::Devops));
        assert!("designer".parse::<AgentRole>().is_err());
    }

    #[test]
    fn mode_round_trips_through_its_tag() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>(), Ok(mode));
            let encoded = serde_json::to_value(mode).expect("encode");
            assert_eq!(encoded, json!(mode.as_str()));
        }
    }

    #[test]
    fn unknown_status_is_kept_verbatim() {
        let envelope: ResponseEnvelope =
            serde_json::from_value(json!({"status": "DONE", "summary": "x"})).expect("decode");
        assert_eq!(envelope.status, Status::Unrecognized("DONE".to_string()));
    }

    #[test]
    fn wrong_shapes_decode_to_empty_forms() {
        let envelope: ResponseEnvelope = serde_json::from_value(json!({
            "status": "OK",
            "summary": 42,
            "artifacts": {"path": "docs/a.md"},
            "evidence": "none",
            "next_actions": ["ask the PM"],
        }))
        .expect("decode");
        assert_eq!(envelope.summary, None);
        assert!(envelope.artifacts.is_empty());
        assert!(envelope.evidence.is_empty());
        assert_eq!(envelope.next_actions.items, vec![json!("ask the PM")]);
    }

    #[test]
    fn non_object_artifact_entries_become_empty_artifacts() {
        let envelope: ResponseEnvelope = serde_json::from_value(json!({
            "status": "OK",
            "artifacts": ["docs/a.md", {"path": "docs/b.md", "content": "b"}],
        }))
        .expect("decode");
        assert_eq!(envelope.artifacts.len(), 2);
        assert_eq!(envelope.artifacts[0], Artifact::default());
        assert_eq!(envelope.artifacts[1].content_str(), "b");
    }

    #[test]
    fn validated_response_serializes_flat() {
        let envelope = ResponseEnvelope {
            request_id: "req-1".to_string(),
            status: Status::QaPass,
            summary: Some("approved".to_string()),
            artifacts: vec![Artifact::new("docs/qa/report.md", "fine")],
            ..ResponseEnvelope::default()
        };
        let response = ValidatedResponse::new(envelope, Vec::new());
        let value = serde_json::to_value(response).expect("encode");
        assert_eq!(value["status"], json!("QA_PASS"));
        assert_eq!(value["validator_pass"], json!(true));
        assert_eq!(value["artifacts_paths"], json!(["docs/qa/report.md"]));
    }

    #[test]
    fn message_envelope_builder_sets_fields() {
        let request = MessageEnvelope::new("p1", AgentRole::Dev, Mode::ImplementTask, "Build X")
            .with_variant("backend")
            .with_task_id("t1")
            .with_input("spec_ref", "p1");
        assert!(request.request_id.starts_with("implement_task-"));
        assert_eq!(request.task_id.as_deref(), Some("t1"));
        assert_eq!(request.inputs["spec_ref"], json!("p1"));
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(encoded["agent"], json!("DEV"));
        assert_eq!(encoded["mode"], json!("implement_task"));
    }
}
