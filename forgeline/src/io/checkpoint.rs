//! Pipeline checkpoints (`<state_dir>/<project_id>/checkpoint.json`).
//!
//! One JSON document per project, replaced atomically on every save.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::io::atomic::write_atomic;
use crate::pipeline::context::PipelineContext;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(flatten)]
    context: PipelineContext,
    saved_at: DateTime<Utc>,
}

/// Directory holding everything persisted for one project.
///
/// Project ids become path segments, so they are restricted to ASCII
/// alphanumerics, `-`, and `_`.
pub fn project_dir(state_dir: &Path, project_id: &str) -> Result<PathBuf> {
    let valid = !project_id.is_empty()
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("invalid project id '{project_id}'");
    }
    Ok(state_dir.join(project_id))
}

pub fn checkpoint_path(state_dir: &Path, project_id: &str) -> Result<PathBuf> {
    Ok(project_dir(state_dir, project_id)?.join(CHECKPOINT_FILE))
}

/// Snapshot the context, replacing any previous checkpoint.
pub fn save_checkpoint(state_dir: &Path, context: &PipelineContext) -> Result<PathBuf> {
    let path = checkpoint_path(state_dir, &context.project_id)?;
    let checkpoint = Checkpoint {
        context: context.clone(),
        saved_at: Utc::now(),
    };
    let mut buf = serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
    buf.push('\n');
    write_atomic(&path, buf.as_bytes())?;
    info!(
        project_id = %context.project_id,
        step = context.current_step,
        completed_tasks = context.completed_tasks.len(),
        "checkpoint saved"
    );
    Ok(path)
}

/// Restore the last checkpoint. `Ok(None)` when none was ever saved.
pub fn load_checkpoint(state_dir: &Path, project_id: &str) -> Result<Option<PipelineContext>> {
    let path = checkpoint_path(state_dir, project_id)?;
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no checkpoint");
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read checkpoint {}", path.display()));
        }
    };
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    if checkpoint.context.project_id != project_id {
        bail!(
            "checkpoint {} belongs to project '{}'",
            path.display(),
            checkpoint.context.project_id
        );
    }
    info!(
        project_id,
        step = checkpoint.context.current_step,
        saved_at = %checkpoint.saved_at,
        "checkpoint restored"
    );
    Ok(Some(checkpoint.context))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies save then load reproduces every field.
    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut context = PipelineContext::new("proj-1");
        context.spec_raw = "Build a \"fleet\" tracker.\n\tWith tabs.".to_string();
        context.product_spec = "# Product".to_string();
        context.charter = "charter".to_string();
        context.add_artifact("apps/src/index.ts", "console.log(\"hi\");\n");
        context.add_completed_task("TSK-1");
        context.current_step = 4;

        save_checkpoint(temp.path(), &context).expect("save");
        let loaded = load_checkpoint(temp.path(), "proj-1")
            .expect("load")
            .expect("present");
        assert_eq!(loaded, context);
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = load_checkpoint(temp.path(), "never-saved").expect("load");
        assert_eq!(loaded, None);
    }

    #[test]
    fn saving_twice_keeps_latest_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut context = PipelineContext::new("p2");
        save_checkpoint(temp.path(), &context).expect("first");
        context.current_step = 2;
        let path = save_checkpoint(temp.path(), &context).expect("second");
        let loaded = load_checkpoint(temp.path(), "p2")
            .expect("load")
            .expect("present");
        assert_eq!(loaded.current_step, 2);
        let raw = fs::read_to_string(path).expect("read");
        assert!(raw.contains("\"saved_at\""));
    }

    #[test]
    fn project_ids_cannot_escape_the_state_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(checkpoint_path(temp.path(), "../other").is_err());
        assert!(checkpoint_path(temp.path(), "").is_err());
        assert!(load_checkpoint(temp.path(), "a/b").is_err());
    }
}
