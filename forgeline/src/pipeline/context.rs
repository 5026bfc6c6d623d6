//! Per-project accumulator of cross-phase text and approved artifacts.
//!
//! Text fields grow as phases complete and are capped only when read into an
//! agent request. Artifact paths pass the path policy before they are stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::core::path::sanitize_path;
use crate::io::task_board::BoardTask;

pub const SPEC_RAW_CAP: usize = 30_000;
pub const PRODUCT_SPEC_CAP: usize = 20_000;
pub const PROPOSAL_CAP: usize = 15_000;
pub const CHARTER_CAP: usize = 15_000;
pub const BACKLOG_CAP: usize = 20_000;

/// Files above this size are reduced to their interface view.
pub const INTERFACE_VIEW_THRESHOLD: usize = 20_000;
pub const MAX_DEPENDENCY_FILE_CHARS: usize = 8_000;
pub const MAX_TOTAL_DEPENDENCY_CHARS: usize = 60_000;

const TRUNCATION_MARKER: &str = "\n... [truncated]";
const INTERFACE_HEADER: &str = "// [interface view: signatures and types only]";
const INTERFACE_KEYWORDS: [&str; 13] = [
    "export ",
    "import ",
    "interface ",
    "type ",
    "enum ",
    "class ",
    "async function",
    "function ",
    "const ",
    "extends",
    "implements",
    "}: ",
    "return type",
];

const CONSTRAINTS: [&str; 3] = ["spec-driven", "paths-resilient", "no-invent"];

/// Resume cursor values stored in `current_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Start,
    SpecNormalized,
    ProposalDrafted,
    CharterAgreed,
    BacklogApproved,
    TasksSeeded,
    Monitoring,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Start,
        Phase::SpecNormalized,
        Phase::ProposalDrafted,
        Phase::CharterAgreed,
        Phase::BacklogApproved,
        Phase::TasksSeeded,
        Phase::Monitoring,
    ];

    pub fn step(self) -> u8 {
        match self {
            Phase::Start => 0,
            Phase::SpecNormalized => 1,
            Phase::ProposalDrafted => 2,
            Phase::CharterAgreed => 3,
            Phase::BacklogApproved => 4,
            Phase::TasksSeeded => 5,
            Phase::Monitoring => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::SpecNormalized => "spec_normalized",
            Phase::ProposalDrafted => "proposal_drafted",
            Phase::CharterAgreed => "charter_agreed",
            Phase::BacklogApproved => "backlog_approved",
            Phase::TasksSeeded => "tasks_seeded",
            Phase::Monitoring => "monitoring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineContext {
    pub project_id: String,
    pub spec_raw: String,
    pub product_spec: String,
    pub engineer_proposal: String,
    pub charter: String,
    pub backlog: String,
    /// Tasks from the backlog round the CTO accepted.
    pub approved_tasks: Vec<BoardTask>,
    /// Approved artifacts keyed by sanitized path.
    pub artifacts: BTreeMap<String, String>,
    pub completed_tasks: Vec<String>,
    pub current_step: u8,
}

impl PipelineContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn has_completed(&self, phase: Phase) -> bool {
        phase.step() <= self.current_step
    }

    /// Advance the resume cursor. Never moves it backwards.
    pub fn mark_phase(&mut self, phase: Phase) {
        if phase.step() > self.current_step {
            debug!(project_id = %self.project_id, phase = phase.as_str(), "phase reached");
            self.current_step = phase.step();
        }
    }

    pub fn spec_raw_view(&self) -> &str {
        cap_chars(&self.spec_raw, SPEC_RAW_CAP)
    }

    /// Normalized spec, or the raw spec before normalization has happened.
    pub fn product_spec_view(&self) -> &str {
        if self.product_spec.is_empty() {
            cap_chars(&self.spec_raw, PRODUCT_SPEC_CAP)
        } else {
            cap_chars(&self.product_spec, PRODUCT_SPEC_CAP)
        }
    }

    pub fn proposal_view(&self) -> &str {
        cap_chars(&self.engineer_proposal, PROPOSAL_CAP)
    }

    pub fn charter_view(&self) -> &str {
        cap_chars(&self.charter, CHARTER_CAP)
    }

    pub fn backlog_view(&self) -> &str {
        cap_chars(&self.backlog, BACKLOG_CAP)
    }

    /// Store an artifact under its sanitized path. Rejected paths are logged and
    /// never stored.
    pub fn add_artifact(&mut self, path: &str, content: &str) -> bool {
        match sanitize_path(path) {
            Some(clean) => {
                self.artifacts.insert(clean, content.to_string());
                true
            }
            None => {
                warn!(project_id = %self.project_id, path, "artifact path rejected by policy");
                false
            }
        }
    }

    pub fn add_completed_task(&mut self, task_id: &str) {
        if !task_id.is_empty() && !self.completed_tasks.iter().any(|done| done == task_id) {
            self.completed_tasks.push(task_id.to_string());
        }
    }

    /// Record an approved artifact and, when given, the task that produced it.
    pub fn register_artifact(&mut self, path: &str, content: &str, task_id: Option<&str>) -> bool {
        let stored = self.add_artifact(path, content);
        if let Some(task_id) = task_id {
            self.add_completed_task(task_id);
        }
        stored
    }

    /// Only the requested files, in request order.
    ///
    /// Large files are reduced to their interface view, then capped per file.
    /// Once the total would pass [`MAX_TOTAL_DEPENDENCY_CHARS`], the remaining
    /// files are dropped.
    pub fn dependency_code(&self, paths: &[String]) -> Vec<(String, String)> {
        let mut files = Vec::new();
        let mut total = 0usize;
        for requested in paths {
            let Some(path) = sanitize_path(requested) else {
                warn!(path = %requested, "dependency path rejected by policy");
                continue;
            };
            let Some(content) = self.artifacts.get(&path) else {
                debug!(path = %path, "dependency not produced yet");
                continue;
            };
            let mut content = if content.chars().count() > INTERFACE_VIEW_THRESHOLD {
                interface_view(content)
            } else {
                content.clone()
            };
            if content.chars().count() > MAX_DEPENDENCY_FILE_CHARS {
                let capped = cap_chars(&content, MAX_DEPENDENCY_FILE_CHARS);
                content = format!("{capped}{TRUNCATION_MARKER}");
            }
            let size = content.chars().count();
            if total + size > MAX_TOTAL_DEPENDENCY_CHARS {
                warn!(
                    cap = MAX_TOTAL_DEPENDENCY_CHARS,
                    included = files.len(),
                    requested = paths.len(),
                    "dependency code cap reached; dropping remaining files"
                );
                break;
            }
            total += size;
            files.push((path, content));
        }
        files
    }

    fn base_inputs(&self) -> Map<String, Value> {
        let mut inputs = Map::new();
        inputs.insert("spec_ref".to_string(), json!(self.project_id));
        inputs.insert("constraints".to_string(), json!(CONSTRAINTS));
        inputs
    }

    /// Inputs for CTO calls. `backlog_summary` is set only when validating a backlog.
    pub fn build_inputs_for_cto(&self, backlog_summary: Option<&str>) -> Map<String, Value> {
        let mut inputs = self.base_inputs();
        if !self.spec_raw.is_empty() {
            inputs.insert("spec_raw".to_string(), json!(self.spec_raw_view()));
            inputs.insert("product_spec".to_string(), json!(self.product_spec_view()));
        }
        if !self.engineer_proposal.is_empty() {
            inputs.insert("engineer_proposal".to_string(), json!(self.proposal_view()));
        }
        if !self.charter.is_empty() {
            inputs.insert("charter".to_string(), json!(self.charter_view()));
        }
        if let Some(summary) = backlog_summary {
            inputs.insert(
                "backlog_summary".to_string(),
                json!(cap_chars(summary, PROPOSAL_CAP)),
            );
            inputs.insert("validate_backlog_only".to_string(), json!(true));
        }
        inputs
    }

    pub fn build_inputs_for_engineer(&self, cto_feedback: Option<&str>) -> Map<String, Value> {
        let mut inputs = self.base_inputs();
        inputs.insert("product_spec".to_string(), json!(self.product_spec_view()));
        if let Some(feedback) = cto_feedback {
            inputs.insert("cto_feedback".to_string(), json!(feedback));
        }
        inputs
    }

    pub fn build_inputs_for_pm(&self, cto_feedback: Option<&str>) -> Map<String, Value> {
        let mut inputs = self.base_inputs();
        inputs.insert("charter".to_string(), json!(self.charter_view()));
        if !self.engineer_proposal.is_empty() {
            inputs.insert("engineer_proposal".to_string(), json!(self.proposal_view()));
        }
        if let Some(feedback) = cto_feedback {
            inputs.insert("cto_feedback".to_string(), json!(feedback));
        }
        inputs
    }

    /// Inputs for implementing one task: the task itself, its dependency code,
    /// and the charter and backlog for orientation.
    pub fn build_inputs_for_dev(
        &self,
        task: &BoardTask,
        previous_attempt: Option<&Value>,
    ) -> Map<String, Value> {
        let mut inputs = self.base_inputs();
        inputs.insert("current_task".to_string(), task.as_input());
        inputs.insert("charter".to_string(), json!(self.charter_view()));
        inputs.insert("backlog".to_string(), json!(self.backlog_view()));
        let dependency_code = self.dependency_code(&task.depends_on_files);
        if !dependency_code.is_empty() {
            inputs.insert(
                "dependency_code".to_string(),
                files_to_value(dependency_code),
            );
        }
        if let Some(previous) = previous_attempt {
            inputs.insert("previous_attempt".to_string(), previous.clone());
        }
        inputs
    }

    pub fn build_inputs_for_qa(&self, task: &BoardTask) -> Map<String, Value> {
        let mut inputs = self.base_inputs();
        inputs.insert("current_task".to_string(), task.as_input());
        let dependency_code = self.dependency_code(&task.depends_on_files);
        if !dependency_code.is_empty() {
            inputs.insert(
                "dependency_code".to_string(),
                files_to_value(dependency_code),
            );
        }
        inputs
    }
}

fn files_to_value(files: Vec<(String, String)>) -> Value {
    Value::Object(
        files
            .into_iter()
            .map(|(path, content)| (path, Value::String(content)))
            .collect(),
    )
}

/// Import, export, type, and signature lines only.
pub fn interface_view(code: &str) -> String {
    let mut view = String::from(INTERFACE_HEADER);
    for line in code.lines() {
        let stripped = line.trim();
        if INTERFACE_KEYWORDS
            .iter()
            .any(|keyword| stripped.contains(keyword))
        {
            view.push('\n');
            view.push_str(line);
        }
    }
    view
}

/// Prefix of `text` holding at most `max_chars` characters.
pub fn cap_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task_state::TaskStatus;

    fn task_with_deps(deps: &[&str]) -> BoardTask {
        let mut task = BoardTask::new("TSK-1", TaskStatus::Assigned);
        task.title = "List vehicles".to_string();
        task.depends_on_files = deps.iter().map(|dep| dep.to_string()).collect();
        task
    }

    #[test]
    fn rejected_paths_never_reach_the_context() {
        let mut ctx = PipelineContext::new("p1");
        assert!(!ctx.add_artifact("../etc/passwd", "x"));
        assert!(!ctx.add_artifact("src/main.ts", "x"));
        assert!(ctx.add_artifact("apps//src/./main.ts", "x"));
        assert_eq!(
            ctx.artifacts.keys().collect::<Vec<_>>(),
            vec!["apps/src/main.ts"]
        );
    }

    #[test]
    fn register_artifact_records_task_once() {
        let mut ctx = PipelineContext::new("p1");
        ctx.register_artifact("apps/a.ts", "a", Some("TSK-1"));
        ctx.register_artifact("apps/b.ts", "b", Some("TSK-1"));
        assert_eq!(ctx.completed_tasks, vec!["TSK-1".to_string()]);
        assert_eq!(ctx.artifacts.len(), 2);
    }

    #[test]
    fn dependency_code_returns_only_requested_files() {
        let mut ctx = PipelineContext::new("p1");
        ctx.add_artifact("apps/src/models/vehicle.ts", "export interface Vehicle {}");
        ctx.add_artifact("apps/src/routes/users.ts", "export const users = [];");
        let wanted = [
            "apps/src/models/vehicle.ts".to_string(),
            "apps/missing.ts".to_string(),
        ];
        let files = ctx.dependency_code(&wanted);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "apps/src/models/vehicle.ts");
    }

    #[test]
    fn large_files_are_reduced_to_their_interface() {
        let mut ctx = PipelineContext::new("p1");
        let mut code = String::from("import { Router } from 'express';\n");
        code.push_str("export function list(): Vehicle[] {\n");
        while code.len() <= INTERFACE_VIEW_THRESHOLD {
            code.push_str("  const total = items.reduce((acc, item) => acc + item.price, 0);\n");
            code.push_str("  console.log(total);\n");
        }
        code.push_str("}\n");
        ctx.add_artifact("apps/src/big.ts", &code);
        let files = ctx.dependency_code(&["apps/src/big.ts".to_string()]);
        let content = &files[0].1;
        assert!(content.starts_with(INTERFACE_HEADER));
        assert!(content.contains("export function list(): Vehicle[]"));
        assert!(!content.contains("console.log"));
        assert!(content.chars().count() <= MAX_DEPENDENCY_FILE_CHARS + TRUNCATION_MARKER.len());
    }

    #[test]
    fn total_cap_drops_remaining_files_whole() {
        let mut ctx = PipelineContext::new("p1");
        let paths: Vec<String> = (0..10).map(|i| format!("apps/src/f{i}.ts")).collect();
        for path in &paths {
            ctx.add_artifact(path, &"x".repeat(7_500));
        }
        let files = ctx.dependency_code(&paths);
        assert_eq!(files.len(), 8);
        assert!(files.iter().all(|(_, content)| content.len() == 7_500));
    }

    #[test]
    fn text_fields_are_capped_on_read_only() {
        let mut ctx = PipelineContext::new("p1");
        ctx.spec_raw = "é".repeat(SPEC_RAW_CAP + 10);
        assert_eq!(ctx.spec_raw.chars().count(), SPEC_RAW_CAP + 10);
        assert_eq!(ctx.spec_raw_view().chars().count(), SPEC_RAW_CAP);
        assert_eq!(ctx.product_spec_view().chars().count(), PRODUCT_SPEC_CAP);
    }

    #[test]
    fn phase_cursor_only_moves_forward() {
        let mut ctx = PipelineContext::new("p1");
        ctx.mark_phase(Phase::CharterAgreed);
        ctx.mark_phase(Phase::SpecNormalized);
        assert_eq!(ctx.current_step, 3);
        assert!(ctx.has_completed(Phase::ProposalDrafted));
        assert!(!ctx.has_completed(Phase::BacklogApproved));
    }

    #[test]
    fn dev_inputs_carry_task_and_dependencies() {
        let mut ctx = PipelineContext::new("p1");
        ctx.charter = "Node.js backend".to_string();
        ctx.add_artifact("apps/src/db.ts", "export const db = connect();");
        let task = task_with_deps(&["apps/src/db.ts"]);
        let inputs = ctx.build_inputs_for_dev(&task, None);
        assert_eq!(inputs["current_task"]["id"], json!("TSK-1"));
        assert_eq!(
            inputs["dependency_code"]["apps/src/db.ts"],
            json!("export const db = connect();")
        );
        assert_eq!(inputs["charter"], json!("Node.js backend"));
        assert!(inputs.get("previous_attempt").is_none());
    }

    #[test]
    fn cto_backlog_review_flags_validate_only() {
        let mut ctx = PipelineContext::new("p1");
        ctx.spec_raw = "spec".to_string();
        let inputs = ctx.build_inputs_for_cto(Some("backlog"));
        assert_eq!(inputs["validate_backlog_only"], json!(true));
        assert_eq!(inputs["product_spec"], json!("spec"));
    }
}
