//! Backlog task extraction for seeding the task board.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::path::sanitize_path;
use crate::core::task_state::TaskStatus;
use crate::core::types::{AgentRole, Artifact};
use crate::io::task_board::BoardTask;

pub const MAX_FILES_PER_TASK: usize = 3;

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[^\n]*\n(.*?)```").expect("valid fence regex"));

/// Markdown backlog text from the PM's `docs/pm/` documents.
pub fn backlog_text(artifacts: &[Artifact]) -> String {
    artifacts
        .iter()
        .filter(|artifact| {
            artifact.path.starts_with("docs/pm/") && !artifact.path.ends_with(".json")
        })
        .map(|artifact| artifact.content_str().trim())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tasks declared in the backlog: a `docs/pm/*.json` artifact first, then any
/// fenced json block inside the backlog markdown.
pub fn extract_tasks(artifacts: &[Artifact]) -> Vec<BoardTask> {
    let json_docs = artifacts.iter().filter(|artifact| {
        artifact.path.starts_with("docs/pm/") && artifact.path.ends_with(".json")
    });
    for artifact in json_docs {
        if let Ok(value) = serde_json::from_str::<Value>(artifact.content_str()) {
            let tasks = tasks_from_value(&value);
            if !tasks.is_empty() {
                debug!(
                    path = %artifact.path,
                    count = tasks.len(),
                    "tasks read from json artifact"
                );
                return tasks;
            }
        }
    }

    let markdown_docs = artifacts
        .iter()
        .filter(|artifact| artifact.path.starts_with("docs/pm/"));
    for artifact in markdown_docs {
        for captures in JSON_FENCE.captures_iter(artifact.content_str()) {
            let Some(block) = captures.get(1) else { continue };
            if let Ok(value) = serde_json::from_str::<Value>(block.as_str()) {
                let tasks = tasks_from_value(&value);
                if !tasks.is_empty() {
                    debug!(
                        path = %artifact.path,
                        count = tasks.len(),
                        "tasks read from fenced block"
                    );
                    return tasks;
                }
            }
        }
    }
    warn!("backlog declares no tasks");
    Vec::new()
}

/// Accepts a bare array or an object with a `tasks` array.
pub fn tasks_from_value(value: &Value) -> Vec<BoardTask> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("tasks") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .enumerate()
        .map(|(index, task)| {
            let text = |keys: &[&str]| -> String {
                keys.iter()
                    .find_map(|key| task.get(*key).and_then(Value::as_str))
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            let list = |keys: &[&str]| -> Vec<String> {
                keys.iter()
                    .find_map(|key| task.get(*key))
                    .map(string_list)
                    .unwrap_or_default()
            };
            let mut task_id = text(&["task_id", "id", "taskId"]);
            if task_id.is_empty() {
                task_id = format!("TSK-{:03}", index + 1);
            }
            let mut board_task = BoardTask::new(task_id, TaskStatus::Assigned);
            board_task.module = text(&["module"]);
            board_task.owner_role = text(&["owner_role", "owner"]).parse::<AgentRole>().ok();
            board_task.title = text(&["title"]);
            board_task.description = text(&["description"]);
            board_task.acceptance_criteria = list(&["acceptance_criteria"]);
            board_task.depends_on_files = list(&["depends_on_files", "depends_on"])
                .into_iter()
                .filter_map(|path| sanitize_path(&path))
                .collect();
            board_task.estimated_files = list(&["estimated_files", "files_to_create"]);
            board_task
        })
        .collect()
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .filter(|item| !item.trim().is_empty())
            .collect(),
        Value::String(single) if !single.trim().is_empty() => vec![single.clone()],
        _ => Vec::new(),
    }
}

/// One message per task that would produce more than `max_files` files.
pub fn check_task_file_limits(tasks: &[BoardTask], max_files: usize) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| task.estimated_files.len() > max_files)
        .map(|task| {
            format!(
                "task {}: produces {} files (max {max_files}); split it into smaller tasks",
                task.task_id,
                task.estimated_files.len()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_artifact_wins_over_markdown() {
        let tasks = json!([
            {"id": "TSK-1", "title": "Models", "owner_role": "dev", "depends_on_files": []}
        ]);
        let artifacts = vec![
            Artifact::new(
                "docs/pm/backlog.md",
                "```json\n[{\"task_id\": \"MD-1\"}]\n```",
            ),
            Artifact::new("docs/pm/tasks.json", tasks.to_string()),
        ];
        let tasks = extract_tasks(&artifacts);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "TSK-1");
        assert_eq!(tasks[0].owner_role, Some(AgentRole::Dev));
        assert_eq!(tasks[0].status, TaskStatus::Assigned);
    }

    #[test]
    fn fenced_block_inside_markdown_is_read() {
        let markdown = "# Backlog\n\nTasks below.\n\n```json\n{\"tasks\": [\
            {\"task_id\": \"TSK-1\", \"acceptance_criteria\": \"Returns 200\"},\
            {\"title\": \"No id\", \"depends_on_files\": [\"apps/src/a.ts\", \"../x\"]}]}\n```\n";
        let tasks = extract_tasks(&[Artifact::new("docs/pm/backlog.md", markdown)]);
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0].acceptance_criteria,
            vec!["Returns 200".to_string()]
        );
        assert_eq!(tasks[1].task_id, "TSK-002");
        assert_eq!(tasks[1].depends_on_files, vec!["apps/src/a.ts".to_string()]);
    }

    #[test]
    fn no_tasks_yields_empty_list() {
        assert!(extract_tasks(&[Artifact::new("docs/pm/backlog.md", "nothing here")]).is_empty());
    }

    #[test]
    fn oversized_tasks_are_reported() {
        let tasks = tasks_from_value(&json!([
            {"task_id": "small", "estimated_files": ["a", "b"]},
            {"task_id": "big", "files_to_create": ["a", "b", "c", "d"]},
        ]));
        assert_eq!(
            check_task_file_limits(&tasks, MAX_FILES_PER_TASK),
            vec!["task big: produces 4 files (max 3); split it into smaller tasks".to_string()]
        );
    }

    #[test]
    fn backlog_text_skips_json_documents() {
        let artifacts = vec![
            Artifact::new("docs/pm/backlog.md", "# Backlog"),
            Artifact::new("docs/pm/tasks.json", "[]"),
            Artifact::new("docs/cto/review.md", "# Review"),
        ];
        assert_eq!(backlog_text(&artifacts), "# Backlog");
    }
}
