//! Project pipeline: context accumulation, backlog seeding, and the phase driver.

pub mod backlog;
pub mod context;
pub mod phases;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::types::{
    AgentRole, Limits, MessageEnvelope, Mode, ResponseEnvelope, ValidatedResponse,
};
use crate::core::validator::filter_artifacts;
use crate::io::checkpoint::save_checkpoint;
use crate::io::config::ForgeConfig;
use crate::io::project_store::ProjectStore;
use crate::io::task_board::{ProjectPatch, TaskBoard};
use crate::runtime::AgentInvoker;

use context::PipelineContext;

/// Collaborators shared by the phase driver and the monitor loop.
pub struct Services<'a> {
    pub invoker: &'a dyn AgentInvoker,
    pub board: &'a dyn TaskBoard,
    pub store: &'a ProjectStore,
    pub config: &'a ForgeConfig,
}

impl Services<'_> {
    pub fn limits(&self, round: u32) -> Limits {
        Limits {
            round,
            max_rounds: self.config.pipeline.max_negotiation_rounds,
            max_rework: self.config.monitor.max_qa_rework,
            timeout_secs: self.config.generator.timeout_secs,
        }
    }

    pub fn request(
        &self,
        ctx: &PipelineContext,
        role: AgentRole,
        mode: Mode,
        task: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> MessageEnvelope {
        MessageEnvelope::new(&ctx.project_id, role, mode, task)
            .with_inputs(inputs)
            .with_limits(self.limits(1))
    }

    pub fn call(&self, request: &MessageEnvelope) -> Result<ValidatedResponse> {
        self.invoker.dispatch(request)
    }

    /// Store the envelope's artifacts in the context and on disk. Returns the
    /// stored paths.
    pub fn absorb(
        &self,
        ctx: &mut PipelineContext,
        envelope: &ResponseEnvelope,
    ) -> Result<Vec<String>> {
        let accepted = filter_artifacts(&envelope.artifacts);
        for artifact in &accepted {
            ctx.add_artifact(&artifact.path, artifact.content_str());
        }
        self.store.write_artifacts(&ctx.project_id, &accepted)
    }

    pub fn checkpoint(&self, ctx: &PipelineContext) -> Result<()> {
        save_checkpoint(self.store.state_dir(), ctx)?;
        Ok(())
    }

    /// Patch the project on the board. Board outages are logged, not fatal.
    pub fn patch_project(&self, ctx: &PipelineContext, patch: &ProjectPatch) {
        if let Err(err) = self.board.patch_project(&ctx.project_id, patch) {
            warn!(
                project_id = %ctx.project_id,
                status = ?patch.status,
                error = %format!("{err:#}"),
                "project patch failed"
            );
        }
    }
}
