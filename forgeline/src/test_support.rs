//! Test doubles and reply fixtures shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::{Value, json};

use crate::core::task_state::TaskStatus;
use crate::core::types::{AgentRole, MessageEnvelope, ResponseEnvelope, ValidatedResponse};
use crate::io::generator::{Completion, CompletionRequest, Generator, TransportError};
use crate::io::task_board::{
    BoardTask, ProjectInfo, ProjectPatch, ProjectStatus, TaskBoard, TaskUpdate,
};
use crate::runtime::AgentInvoker;
use crate::runtime::retry::Sleeper;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generator that replays canned replies in order and records every request.
pub struct ScriptedGenerator {
    model: String,
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedGenerator {
    pub fn new(replies: impl IntoIterator<Item = Result<String, TransportError>>) -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        locked(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        locked(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        locked(&self.replies).len()
    }
}

impl Generator for ScriptedGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        locked(&self.requests).push(request.clone());
        match locked(&self.replies).pop_front() {
            Some(Ok(text)) => Ok(Completion {
                text,
                stop_reason: Some("end_turn".to_string()),
                ..Completion::default()
            }),
            Some(Err(err)) => Err(err),
            None => Err(TransportError::Malformed("script exhausted".to_string())),
        }
    }
}

/// Records requested waits instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        locked(&self.waits).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        locked(&self.waits).push(duration);
    }
}

/// Invoker answering from per-role queues of responses.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<AgentRole, VecDeque<ValidatedResponse>>>,
    requests: Mutex<Vec<MessageEnvelope>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: AgentRole, envelope: ResponseEnvelope) {
        self.push_response(role, ValidatedResponse::new(envelope, Vec::new()));
    }

    /// Queue a full response, e.g. a terminal one carrying a failure kind.
    pub fn push_response(&self, role: AgentRole, response: ValidatedResponse) {
        locked(&self.replies)
            .entry(role)
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<MessageEnvelope> {
        locked(&self.requests).clone()
    }

    pub fn requests_for(&self, role: AgentRole) -> Vec<MessageEnvelope> {
        self.requests()
            .into_iter()
            .filter(|request| request.agent == role)
            .collect()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn dispatch(&self, request: &MessageEnvelope) -> Result<ValidatedResponse> {
        locked(&self.requests).push(request.clone());
        let Some(mut response) = locked(&self.replies)
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
        else {
            bail!("no scripted reply for {}", request.agent);
        };
        response.envelope.request_id = request.request_id.clone();
        Ok(response)
    }
}

#[derive(Debug, Default)]
struct BoardState {
    project_status: ProjectStatus,
    tasks: Vec<BoardTask>,
    updates: Vec<(String, TaskUpdate)>,
    patches: Vec<ProjectPatch>,
}

/// Task board held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskBoard {
    state: Mutex<BoardState>,
}

impl InMemoryTaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<BoardTask>) -> Self {
        let board = Self::new();
        locked(&board.state).tasks = tasks;
        board
    }

    pub fn set_project_status(&self, status: ProjectStatus) {
        locked(&self.state).project_status = status;
    }

    pub fn task(&self, task_id: &str) -> Option<BoardTask> {
        locked(&self.state)
            .tasks
            .iter()
            .find(|task| task.task_id == task_id)
            .cloned()
    }

    pub fn all_tasks(&self) -> Vec<BoardTask> {
        locked(&self.state).tasks.clone()
    }

    pub fn updates(&self) -> Vec<(String, TaskUpdate)> {
        locked(&self.state).updates.clone()
    }

    /// Project statuses patched so far, in order.
    pub fn status_history(&self) -> Vec<ProjectStatus> {
        locked(&self.state)
            .patches
            .iter()
            .filter_map(|patch| patch.status)
            .collect()
    }
}

impl TaskBoard for InMemoryTaskBoard {
    fn project(&self, project_id: &str) -> Result<ProjectInfo> {
        Ok(ProjectInfo {
            id: project_id.to_string(),
            status: locked(&self.state).project_status,
        })
    }

    fn tasks(&self, _project_id: &str) -> Result<Vec<BoardTask>> {
        Ok(self.all_tasks())
    }

    fn update_task(&self, _project_id: &str, task_id: &str, update: &TaskUpdate) -> Result<()> {
        let mut state = locked(&self.state);
        let Some(task) = state.tasks.iter_mut().find(|task| task.task_id == task_id) else {
            bail!("unknown task {task_id}");
        };
        task.status = update.status;
        state.updates.push((task_id.to_string(), update.clone()));
        Ok(())
    }

    fn seed_tasks(&self, _project_id: &str, tasks: &[BoardTask]) -> Result<()> {
        let mut state = locked(&self.state);
        for task in tasks {
            let exists = state.tasks.iter().any(|seen| seen.task_id == task.task_id);
            if !exists {
                state.tasks.push(task.clone());
            }
        }
        Ok(())
    }

    fn patch_project(&self, _project_id: &str, patch: &ProjectPatch) -> Result<()> {
        let mut state = locked(&self.state);
        if let Some(status) = patch.status {
            state.project_status = status;
        }
        state.patches.push(patch.clone());
        Ok(())
    }
}

/// A task in `status` depending on `depends_on`.
pub fn board_task(task_id: &str, status: TaskStatus, depends_on: &[&str]) -> BoardTask {
    let mut task = BoardTask::new(task_id, status);
    task.module = "backend".to_string();
    task.owner_role = Some(AgentRole::Dev);
    task.title = format!("{task_id} title");
    task.description = format!("Implement {task_id}.");
    task.acceptance_criteria = vec!["Returns 200".to_string()];
    task.depends_on_files = depends_on.iter().map(|path| path.to_string()).collect();
    task
}

/// Markdown body long enough to pass the quality check.
pub fn long_doc(title: &str) -> String {
    format!(
        "# {title}\n\nThis document describes {title} in enough detail for the next agent \
         to act on it. It lists goals, constraints, and the decisions taken so far.\n"
    )
}

/// Generator output wrapping `envelope` in the reasoning/response tags.
pub fn reply_with(envelope: Value) -> String {
    format!(
        "<thinking>\nChecking the request.\n</thinking>\n<response>\n{envelope}\n</response>"
    )
}

pub fn qa_pass_reply() -> String {
    reply_with(json!({
        "status": "QA_PASS",
        "summary": "All acceptance criteria met.",
        "artifacts": [{
            "path": "docs/qa/qa_report_TSK-1.md",
            "content": long_doc("QA report for TSK-1"),
        }],
        "evidence": [{"type": "review", "detail": "checked every criterion"}],
        "next_actions": {"owner": "MONITOR", "items": [], "questions": []},
    }))
}

/// Parsed envelope with the given status, summary, and artifacts.
pub fn envelope(status: &str, summary: &str, artifacts: &[(&str, &str)]) -> ResponseEnvelope {
    serde_json::from_value(json!({
        "status": status,
        "summary": summary,
        "artifacts": artifacts
            .iter()
            .map(|(path, content)| json!({"path": path, "content": content}))
            .collect::<Vec<_>>(),
        "evidence": [{"type": "fixture"}],
    }))
    .unwrap_or_default()
}
