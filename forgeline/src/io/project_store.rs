//! On-disk artifact store under `<state_dir>/<project_id>/artifacts/`.
//!
//! Writers for the same project serialize on a per-project lock; different
//! projects never contend.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::Artifact;
use crate::core::validator::filter_artifacts;
use crate::io::atomic::write_atomic;
use crate::io::checkpoint::project_dir;

pub const STOP_FILE: &str = "STOP";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug)]
pub struct ProjectStore {
    state_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(project_id.to_string()).or_default())
    }

    pub fn artifacts_dir(&self, project_id: &str) -> Result<PathBuf> {
        Ok(project_dir(&self.state_dir, project_id)?.join(ARTIFACTS_DIR))
    }

    /// Presence of this file asks the monitor loop to stop.
    pub fn stop_file(&self, project_id: &str) -> Result<PathBuf> {
        Ok(project_dir(&self.state_dir, project_id)?.join(STOP_FILE))
    }

    /// Write artifacts whose paths pass the path policy; returns the stored paths.
    #[instrument(skip_all, fields(project_id = %project_id, count = artifacts.len()))]
    pub fn write_artifacts(&self, project_id: &str, artifacts: &[Artifact]) -> Result<Vec<String>> {
        let root = self.artifacts_dir(project_id)?;
        let accepted = filter_artifacts(artifacts);
        if accepted.len() < artifacts.len() {
            warn!(
                dropped = artifacts.len() - accepted.len(),
                "artifacts dropped before write"
            );
        }
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = Vec::with_capacity(accepted.len());
        for artifact in &accepted {
            let target = root.join(&artifact.path);
            write_atomic(&target, artifact.content_str().as_bytes())
                .with_context(|| format!("store artifact {}", artifact.path))?;
            debug!(path = %artifact.path, bytes = artifact.content_str().len(), "artifact stored");
            written.push(artifact.path.clone());
        }
        Ok(written)
    }

    /// Contents of a stored artifact, if present.
    pub fn read_artifact(&self, project_id: &str, path: &str) -> Result<Option<String>> {
        let Some(clean) = crate::core::path::sanitize_path(path) else {
            return Ok(None);
        };
        let target = self.artifacts_dir(project_id)?.join(clean);
        if !target.exists() {
            return Ok(None);
        }
        fs::read_to_string(&target)
            .map(Some)
            .with_context(|| format!("read artifact {}", target.display()))
    }
}
