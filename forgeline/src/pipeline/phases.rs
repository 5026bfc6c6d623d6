//! Sequential project phases ahead of the monitor loop.
//!
//! Each phase saves a checkpoint when it completes; a restarted driver skips
//! every phase at or below the checkpoint's cursor.

use std::sync::Arc;

use anyhow::{Result, bail};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::types::{AgentRole, Mode, ResponseEnvelope, Status, ValidatedResponse};
use crate::io::checkpoint::load_checkpoint;
use crate::io::task_board::{ProjectPatch, ProjectStatus};
use crate::monitor::{LoopStop, MonitorLoop, ShutdownSignal};
use crate::runtime::retry::{Sleeper, ThreadSleeper};

use super::Services;
use super::backlog::{MAX_FILES_PER_TASK, backlog_text, check_task_file_limits, extract_tasks};
use super::context::{Phase, PipelineContext};

/// A mandatory phase ended without a usable result.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{} failed: {reason}", .phase.as_str())]
    Rejected { phase: Phase, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Finished(LoopStop),
    Failed { phase: Phase, reason: String },
}

enum Verdict {
    Approved,
    Revise(String),
    Rejected(String),
}

fn verdict(envelope: &ResponseEnvelope) -> Verdict {
    match envelope.status {
        Status::Ok => Verdict::Approved,
        Status::Revision | Status::NeedsInfo => Verdict::Revise(feedback_text(envelope)),
        ref other => Verdict::Rejected(format!("{other}: {}", envelope.summary_str())),
    }
}

/// Summary followed by the open questions, one per line.
fn feedback_text(envelope: &ResponseEnvelope) -> String {
    let mut text = envelope.summary_str().trim().to_string();
    for question in &envelope.next_actions.questions {
        text.push_str("\n- ");
        text.push_str(question.trim());
    }
    text
}

/// Feedback for a PM round whose artifacts carried no parseable tasks.
const EMPTY_BACKLOG_FEEDBACK: &str = "The backlog declares no tasks. Include a JSON array of \
    tasks with task_id, title, description, acceptance_criteria, and depends_on_files.";

fn require_ok(
    phase: Phase,
    role: AgentRole,
    response: &ValidatedResponse,
) -> Result<(), PhaseError> {
    let envelope = &response.envelope;
    if envelope.status == Status::Ok {
        return Ok(());
    }
    Err(PhaseError::Rejected {
        phase,
        reason: format!(
            "{role} returned {}: {}",
            envelope.status,
            envelope.summary_str()
        ),
    })
}

/// Concatenated contents of the artifacts under `prefix`.
fn docs_under(envelope: &ResponseEnvelope, prefix: &str) -> String {
    envelope
        .produced_artifacts()
        .filter(|artifact| artifact.path.starts_with(prefix))
        .map(|artifact| format!("## {}\n\n{}", artifact.path, artifact.content_str().trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct PhaseDriver<'a> {
    services: &'a Services<'a>,
    shutdown: ShutdownSignal,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> PhaseDriver<'a> {
    pub fn new(services: &'a Services<'a>) -> Self {
        Self {
            services,
            shutdown: ShutdownSignal::new(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Resume or start `project_id`, then hand over to the monitor loop.
    ///
    /// `spec_text` is required unless a checkpoint already holds the spec.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub fn run(&self, project_id: &str, spec_text: Option<&str>) -> Result<PipelineOutcome> {
        let mut ctx = match load_checkpoint(self.services.store.state_dir(), project_id)? {
            Some(ctx) => {
                info!(current_step = ctx.current_step, "resuming from checkpoint");
                ctx
            }
            None => PipelineContext::new(project_id),
        };
        if ctx.spec_raw.is_empty() {
            match spec_text.map(str::trim).filter(|text| !text.is_empty()) {
                Some(text) => ctx.spec_raw = text.to_string(),
                None if !ctx.has_completed(Phase::SpecNormalized) => {
                    bail!("project {project_id} has no checkpointed spec; pass the spec text")
                }
                None => {}
            }
        }

        match self.prepare(&mut ctx) {
            Ok(()) => {}
            Err(PhaseError::Rejected { phase, reason }) => {
                warn!(phase = phase.as_str(), reason = %reason, "pipeline failed");
                self.services
                    .patch_project(&ctx, &ProjectPatch::status(ProjectStatus::Failed));
                self.services.checkpoint(&ctx)?;
                return Ok(PipelineOutcome::Failed { phase, reason });
            }
            Err(PhaseError::Other(err)) => {
                self.services.checkpoint(&ctx)?;
                return Err(err);
            }
        }

        let stop = self.monitor(&mut ctx)?;
        Ok(PipelineOutcome::Finished(stop))
    }

    /// Only the monitor loop, for projects whose tasks are already seeded.
    pub fn monitor(&self, ctx: &mut PipelineContext) -> Result<LoopStop> {
        MonitorLoop::new(self.services, self.shutdown.clone())
            .with_sleeper(self.sleeper.clone())
            .run(ctx)
    }

    /// Phases 1 to 5, skipping what the checkpoint already covers.
    pub fn prepare(&self, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        if !ctx.has_completed(Phase::SpecNormalized) {
            self.services.patch_project(
                ctx,
                &ProjectPatch::status(ProjectStatus::CtoCharter).started(),
            );
            self.normalize_spec(ctx)?;
        }
        if !ctx.has_completed(Phase::ProposalDrafted) {
            self.draft_proposal(ctx, None)?;
            ctx.mark_phase(Phase::ProposalDrafted);
            self.services.checkpoint(ctx)?;
        }
        if !ctx.has_completed(Phase::CharterAgreed) {
            self.negotiate_charter(ctx)?;
        }
        if !ctx.has_completed(Phase::BacklogApproved) {
            self.negotiate_backlog(ctx)?;
        }
        if !ctx.has_completed(Phase::TasksSeeded) {
            self.seed_tasks(ctx)?;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn normalize_spec(&self, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        let request = self.services.request(
            ctx,
            AgentRole::Cto,
            Mode::SpecIntakeAndNormalize,
            "Normalize the raw product specification into docs/spec/PRODUCT_SPEC.md",
            ctx.build_inputs_for_cto(None),
        );
        let response = self.services.call(&request)?;
        require_ok(Phase::SpecNormalized, AgentRole::Cto, &response)?;
        self.services.absorb(ctx, &response.envelope)?;

        let product_spec = response
            .envelope
            .produced_artifacts()
            .find(|artifact| artifact.path.ends_with("PRODUCT_SPEC.md"))
            .map(|artifact| artifact.content_str().to_string())
            .unwrap_or_else(|| docs_under(&response.envelope, "docs/spec/"));
        if product_spec.trim().is_empty() {
            return Err(PhaseError::Rejected {
                phase: Phase::SpecNormalized,
                reason: "CTO returned no product spec".to_string(),
            });
        }
        ctx.product_spec = product_spec;
        ctx.mark_phase(Phase::SpecNormalized);
        self.services.checkpoint(ctx)?;
        Ok(())
    }

    #[instrument(skip_all, fields(revision = cto_feedback.is_some()))]
    fn draft_proposal(
        &self,
        ctx: &mut PipelineContext,
        cto_feedback: Option<&str>,
    ) -> Result<(), PhaseError> {
        let task = match cto_feedback {
            Some(_) => "Revise the engineering proposal to address the CTO feedback",
            None => "Draft the engineering proposal, architecture, and dependency documents",
        };
        let request = self.services.request(
            ctx,
            AgentRole::Engineer,
            Mode::GenerateEngineeringDocs,
            task,
            ctx.build_inputs_for_engineer(cto_feedback),
        );
        let response = self.services.call(&request)?;
        require_ok(Phase::ProposalDrafted, AgentRole::Engineer, &response)?;
        self.services.absorb(ctx, &response.envelope)?;
        ctx.engineer_proposal = docs_under(&response.envelope, "docs/engineer/");
        Ok(())
    }

    /// CTO reviews the proposal; revisions go back to the engineer. Running out
    /// of rounds accepts the last draft.
    #[instrument(skip_all)]
    fn negotiate_charter(&self, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        let rounds = self.services.config.pipeline.max_negotiation_rounds.max(1);
        for round in 1..=rounds {
            let request = self
                .services
                .request(
                    ctx,
                    AgentRole::Cto,
                    Mode::CharterAndProposal,
                    "Review the engineering proposal and write the project charter",
                    ctx.build_inputs_for_cto(None),
                )
                .with_limits(self.services.limits(round));
            let response = self.services.call(&request)?;
            let envelope = &response.envelope;
            self.services.absorb(ctx, envelope)?;
            let charter = docs_under(envelope, "docs/cto/");
            if !charter.is_empty() {
                ctx.charter = charter;
            }

            match verdict(envelope) {
                Verdict::Approved => {
                    info!(round, "charter approved");
                    break;
                }
                Verdict::Revise(feedback) if round < rounds => {
                    info!(round, "CTO requested a proposal revision");
                    self.draft_proposal(ctx, Some(&feedback))?;
                }
                Verdict::Revise(_) => {
                    warn!(
                        rounds,
                        "charter negotiation out of rounds; accepting the last draft"
                    );
                }
                Verdict::Rejected(reason) => {
                    return Err(PhaseError::Rejected {
                        phase: Phase::CharterAgreed,
                        reason,
                    });
                }
            }
        }
        ctx.mark_phase(Phase::CharterAgreed);
        self.services
            .patch_project(ctx, &ProjectPatch::status(ProjectStatus::PmBacklog));
        self.services.checkpoint(ctx)?;
        Ok(())
    }

    /// PM drafts the backlog; the CTO validates it against the charter.
    #[instrument(skip_all)]
    fn negotiate_backlog(&self, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        let rounds = self.services.config.pipeline.max_negotiation_rounds.max(1);
        let mut feedback: Option<String> = None;
        for round in 1..=rounds {
            let request = self
                .services
                .request(
                    ctx,
                    AgentRole::Pm,
                    Mode::GenerateBacklog,
                    "Break the charter into a task backlog under docs/pm/",
                    ctx.build_inputs_for_pm(feedback.as_deref()),
                )
                .with_limits(self.services.limits(round));
            let response = self.services.call(&request)?;
            require_ok(Phase::BacklogApproved, AgentRole::Pm, &response)?;
            self.services.absorb(ctx, &response.envelope)?;
            ctx.backlog = backlog_text(&response.envelope.artifacts);

            let tasks = extract_tasks(&response.envelope.artifacts);
            for problem in check_task_file_limits(&tasks, MAX_FILES_PER_TASK) {
                warn!(problem = %problem, "oversized task in backlog");
            }
            if tasks.is_empty() {
                if round == rounds {
                    return Err(PhaseError::Rejected {
                        phase: Phase::BacklogApproved,
                        reason: "backlog declares no tasks".to_string(),
                    });
                }
                feedback = Some(EMPTY_BACKLOG_FEEDBACK.to_string());
                continue;
            }

            let review = self
                .services
                .request(
                    ctx,
                    AgentRole::Cto,
                    Mode::ValidateBacklog,
                    "Validate the backlog against the charter",
                    ctx.build_inputs_for_cto(Some(ctx.backlog_view())),
                )
                .with_limits(self.services.limits(round));
            let review = self.services.call(&review)?;
            self.services.absorb(ctx, &review.envelope)?;
            match verdict(&review.envelope) {
                Verdict::Approved => {
                    info!(round, tasks = tasks.len(), "backlog approved");
                    ctx.approved_tasks = tasks;
                    break;
                }
                Verdict::Revise(text) if round < rounds => {
                    info!(round, "CTO requested a backlog revision");
                    feedback = Some(text);
                }
                Verdict::Revise(_) => {
                    warn!(
                        rounds,
                        "backlog negotiation out of rounds; accepting the last draft"
                    );
                    ctx.approved_tasks = tasks;
                }
                Verdict::Rejected(reason) => {
                    return Err(PhaseError::Rejected {
                        phase: Phase::BacklogApproved,
                        reason,
                    });
                }
            }
        }
        ctx.mark_phase(Phase::BacklogApproved);
        self.services.checkpoint(ctx)?;
        Ok(())
    }

    /// Seed the board with the tasks of the accepted backlog round.
    #[instrument(skip_all)]
    fn seed_tasks(&self, ctx: &mut PipelineContext) -> Result<(), PhaseError> {
        let tasks = &ctx.approved_tasks;
        if tasks.is_empty() {
            return Err(PhaseError::Rejected {
                phase: Phase::TasksSeeded,
                reason: "approved backlog declares no tasks".to_string(),
            });
        }
        self.services.board.seed_tasks(&ctx.project_id, tasks)?;
        info!(tasks = tasks.len(), "tasks seeded");
        ctx.mark_phase(Phase::TasksSeeded);
        self.services
            .patch_project(ctx, &ProjectPatch::status(ProjectStatus::DevQa));
        self.services.checkpoint(ctx)?;
        Ok(())
    }
}
