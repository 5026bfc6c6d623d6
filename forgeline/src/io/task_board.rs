//! Client for the external task/project API.
//!
//! The board owns the task list and project status; the orchestrator only polls
//! and patches it. [`TaskBoard`] is the seam tests replace with an in-memory board.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::task_state::TaskStatus;
use crate::core::types::AgentRole;
use crate::io::config::BoardConfig;
use crate::io::generator::truncate;

/// Project lifecycle as reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Created,
    CtoCharter,
    PmBacklog,
    DevQa,
    Devops,
    Completed,
    Failed,
    /// Set by a human once the delivery is signed off.
    Accepted,
    /// Set by a human to halt the pipeline.
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default, alias = "project_id")]
    pub id: String,
    #[serde(default)]
    pub status: ProjectStatus,
}

/// A task as stored on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardTask {
    #[serde(alias = "id")]
    pub task_id: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub owner_role: Option<AgentRole>,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on_files: Vec<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub estimated_files: Vec<String>,
}

impl BoardTask {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            module: String::new(),
            owner_role: None,
            status,
            depends_on_files: Vec::new(),
            title: String::new(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            estimated_files: Vec::new(),
        }
    }

    /// The task as the `current_task` input of an agent request.
    pub fn as_input(&self) -> Value {
        serde_json::json!({
            "id": self.task_id,
            "title": self.title,
            "module": self.module,
            "description": self.description,
            "acceptance_criteria": self.acceptance_criteria,
            "depends_on_files": self.depends_on_files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self { status, note: None }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProjectPatch {
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn started(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Task/project polling API.
pub trait TaskBoard: Send + Sync {
    fn project(&self, project_id: &str) -> Result<ProjectInfo>;
    fn tasks(&self, project_id: &str) -> Result<Vec<BoardTask>>;
    fn update_task(&self, project_id: &str, task_id: &str, update: &TaskUpdate) -> Result<()>;
    fn seed_tasks(&self, project_id: &str, tasks: &[BoardTask]) -> Result<()>;
    fn patch_project(&self, project_id: &str, patch: &ProjectPatch) -> Result<()>;
}

/// [`TaskBoard`] over HTTP with an optional bearer token.
pub struct HttpTaskBoard {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTaskBoard {
    pub fn from_config(config: &BoardConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("build task board http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorized(request)
            .send()
            .with_context(|| format!("task board {what}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = truncate(&response.text().unwrap_or_default(), 320);
            bail!("task board {what} returned {status}: {body}");
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskList {
    Bare(Vec<BoardTask>),
    Wrapped { tasks: Vec<BoardTask> },
}

impl TaskBoard for HttpTaskBoard {
    #[instrument(skip_all, fields(project_id = %project_id))]
    fn project(&self, project_id: &str) -> Result<ProjectInfo> {
        let url = self.url(&format!("/projects/{project_id}"));
        let response = self.send(self.client.get(url), "get project")?;
        response.json().context("decode project")
    }

    #[instrument(skip_all, fields(project_id = %project_id))]
    fn tasks(&self, project_id: &str) -> Result<Vec<BoardTask>> {
        let url = self.url(&format!("/projects/{project_id}/tasks"));
        let response = self.send(self.client.get(url), "list tasks")?;
        let tasks = match response.json::<TaskList>().context("decode task list")? {
            TaskList::Bare(tasks) | TaskList::Wrapped { tasks } => tasks,
        };
        debug!(count = tasks.len(), "fetched tasks");
        Ok(tasks)
    }

    #[instrument(skip_all, fields(project_id = %project_id, task_id = %task_id, status = %update.status))]
    fn update_task(&self, project_id: &str, task_id: &str, update: &TaskUpdate) -> Result<()> {
        self.send(
            self.client
                .patch(self.url(&format!("/projects/{project_id}/tasks/{task_id}")))
                .json(update),
            "update task",
        )?;
        Ok(())
    }

    #[instrument(skip_all, fields(project_id = %project_id, count = tasks.len()))]
    fn seed_tasks(&self, project_id: &str, tasks: &[BoardTask]) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("/projects/{project_id}/tasks")))
                .json(&serde_json::json!({ "tasks": tasks })),
            "seed tasks",
        )?;
        Ok(())
    }

    #[instrument(skip_all, fields(project_id = %project_id))]
    fn patch_project(&self, project_id: &str, patch: &ProjectPatch) -> Result<()> {
        self.send(
            self.client
                .patch(self.url(&format!("/projects/{project_id}")))
                .json(patch),
            "patch project",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn board_task_accepts_id_alias_and_review_alias() {
        let task: BoardTask = serde_json::from_value(json!({
            "id": "TSK-1",
            "status": "IN_REVIEW",
            "owner_role": "DEV",
            "depends_on_files": ["apps/src/a.ts"],
        }))
        .expect("decode");
        assert_eq!(task.task_id, "TSK-1");
        assert_eq!(task.status, TaskStatus::InReview);
        assert_eq!(task.owner_role, Some(AgentRole::Dev));
        assert!(task.acceptance_criteria.is_empty());
    }

    #[test]
    fn unknown_project_status_decodes_as_unknown() {
        let info: ProjectInfo =
            serde_json::from_value(json!({"id": "p1", "status": "archived"})).expect("decode");
        assert_eq!(info.status, ProjectStatus::Unknown);
        let info: ProjectInfo =
            serde_json::from_value(json!({"id": "p1", "status": "accepted"})).expect("decode");
        assert_eq!(info.status, ProjectStatus::Accepted);
    }

    #[test]
    fn project_patch_omits_unset_fields() {
        let patch = ProjectPatch::status(ProjectStatus::DevQa);
        let value = serde_json::to_value(&patch).expect("encode");
        assert_eq!(value, json!({"status": "dev_qa"}));
        let patch = ProjectPatch::status(ProjectStatus::Completed).completed();
        let value = serde_json::to_value(&patch).expect("encode");
        assert!(value.get("completed_at").is_some());
        assert!(value.get("started_at").is_none());
    }

    #[test]
    fn task_list_accepts_bare_and_wrapped_forms() {
        let bare: TaskList =
            serde_json::from_value(json!([{"task_id": "a", "status": "DONE"}])).expect("bare");
        let wrapped: TaskList =
            serde_json::from_value(json!({"tasks": [{"task_id": "a", "status": "DONE"}]}))
                .expect("wrapped");
        for list in [bare, wrapped] {
            let (TaskList::Bare(tasks) | TaskList::Wrapped { tasks }) = list;
            assert_eq!(tasks[0].status, TaskStatus::Done);
        }
    }
}
