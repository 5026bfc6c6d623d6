//! Polling loop that drives seeded tasks through DEV and QA until the project
//! is accepted, stopped, or shut down.
//!
//! One agent call per iteration, in priority order:
//! 1. a task waiting for review gets a QA `validate_task` call;
//! 2. otherwise the first dispatchable task gets a DEV `implement_task` call;
//! 3. otherwise, once every task is done, DEVOPS provisions the delivery once;
//! 4. otherwise the loop sleeps for the poll interval.
//!
//! Board statuses are mirrored into a [`TaskStateMachine`] per task and only
//! PATCHed when the machine accepts the move.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::task_state::{TaskStateMachine, TaskStatus};
use crate::core::types::{AgentRole, Artifact, ArtifactRef, Mode, ResponseEnvelope, Status};
use crate::core::validator::filter_artifacts;
use crate::io::task_board::{BoardTask, ProjectPatch, ProjectStatus, TaskUpdate};
use crate::pipeline::Services;
use crate::pipeline::context::{Phase, PipelineContext};
use crate::runtime::retry::{Sleeper, ThreadSleeper};

/// Statuses the DEV agent may pick up.
const DISPATCHABLE: [TaskStatus; 4] = [
    TaskStatus::Assigned,
    TaskStatus::InProgress,
    TaskStatus::QaFail,
    TaskStatus::Blocked,
];

/// Cooperative cancellation, checked once per iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat the presence of `path` as a shutdown request.
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stop_file = Some(path.into());
        self
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.stop_file.as_ref().is_some_and(|path| path.exists())
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Accepted,
    Stopped,
    Shutdown,
    MaxIterations,
}

impl LoopStop {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStop::Accepted => "accepted",
            LoopStop::Stopped => "stopped",
            LoopStop::Shutdown => "shutdown",
            LoopStop::MaxIterations => "max_iterations",
        }
    }
}

enum Tick {
    Acted,
    Idle,
    Finished(LoopStop),
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskCounters {
    rework: u32,
    no_artifact: u32,
    no_verdict: u32,
}

pub struct MonitorLoop<'a> {
    services: &'a Services<'a>,
    shutdown: ShutdownSignal,
    sleeper: Arc<dyn Sleeper>,
    counters: HashMap<String, TaskCounters>,
    gave_up: HashSet<String>,
    machines: HashMap<String, TaskStateMachine>,
    /// DEV output awaiting a QA verdict, keyed by task.
    pending: HashMap<String, Vec<Artifact>>,
    /// QA feedback forwarded to the next DEV attempt, keyed by task.
    feedback: HashMap<String, Value>,
    provisioned: bool,
}

impl<'a> MonitorLoop<'a> {
    pub fn new(services: &'a Services<'a>, shutdown: ShutdownSignal) -> Self {
        Self {
            services,
            shutdown,
            sleeper: Arc::new(ThreadSleeper),
            counters: HashMap::new(),
            gave_up: HashSet::new(),
            machines: HashMap::new(),
            pending: HashMap::new(),
            feedback: HashMap::new(),
            provisioned: false,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Tasks the loop stopped dispatching.
    pub fn gave_up(&self) -> &HashSet<String> {
        &self.gave_up
    }

    #[instrument(skip_all, fields(project_id = %ctx.project_id))]
    pub fn run(&mut self, ctx: &mut PipelineContext) -> Result<LoopStop> {
        ctx.mark_phase(Phase::Monitoring);
        self.services.checkpoint(ctx)?;

        let services = self.services;
        let config = &services.config.monitor;
        for iteration in 1..=config.max_iterations {
            if self.shutdown.is_triggered() {
                info!(iteration, "shutdown requested; leaving monitor loop");
                return Ok(LoopStop::Shutdown);
            }
            match self.tick(ctx) {
                Ok(Tick::Finished(stop)) => {
                    info!(iteration, stop = stop.as_str(), "monitor loop finished");
                    return Ok(stop);
                }
                Ok(Tick::Acted) => {}
                Ok(Tick::Idle) => self.sleeper.sleep(config.poll_interval()),
                Err(err) => {
                    warn!(iteration, error = %format!("{err:#}"), "monitor iteration failed");
                    self.sleeper.sleep(config.poll_interval());
                }
            }
        }
        warn!(
            max_iterations = config.max_iterations,
            "monitor loop hit its iteration cap"
        );
        Ok(LoopStop::MaxIterations)
    }

    fn tick(&mut self, ctx: &mut PipelineContext) -> Result<Tick> {
        let board = self.services.board;
        let project = board.project(&ctx.project_id)?;
        match project.status {
            ProjectStatus::Accepted => return Ok(Tick::Finished(LoopStop::Accepted)),
            ProjectStatus::Stopped => return Ok(Tick::Finished(LoopStop::Stopped)),
            ProjectStatus::Completed => self.provisioned = true,
            _ => {}
        }

        let tasks = board.tasks(&ctx.project_id)?;
        self.sync(&tasks);

        if let Some(task) = tasks.iter().find(|task| {
            task.status == TaskStatus::InReview && !self.gave_up.contains(&task.task_id)
        }) {
            return self.review(ctx, task);
        }
        if let Some(task) = tasks.iter().find(|task| {
            DISPATCHABLE.contains(&task.status) && !self.gave_up.contains(&task.task_id)
        }) {
            return self.implement(ctx, task);
        }
        if !self.provisioned
            && !tasks.is_empty()
            && tasks.iter().all(|task| task.status == TaskStatus::Done)
        {
            return self.provision(ctx);
        }
        Ok(Tick::Idle)
    }

    /// Mirror board statuses into the local machines. A status the machine
    /// cannot reach in one move (an external edit) replaces the machine.
    fn sync(&mut self, tasks: &[BoardTask]) {
        let max_rework = self.services.config.monitor.max_qa_rework;
        for task in tasks {
            let machine = self.machines.entry(task.task_id.clone()).or_insert_with(|| {
                TaskStateMachine::new(&task.task_id, task.status).with_max_rework(max_rework)
            });
            if machine.state() == task.status {
                continue;
            }
            if machine.can_transition(task.status) {
                machine.transition(task.status, "board sync");
            } else {
                debug!(
                    task_id = %task.task_id,
                    local = %machine.state(),
                    board = %task.status,
                    "resetting mirrored task state"
                );
                *machine =
                    TaskStateMachine::new(&task.task_id, task.status).with_max_rework(max_rework);
            }
        }
    }

    /// Walk the mirrored machine to `target` and PATCH the board with where it
    /// landed. Returns false when the machine refused the move.
    fn advance(
        &mut self,
        ctx: &PipelineContext,
        task_id: &str,
        target: TaskStatus,
        note: Option<&str>,
    ) -> Result<bool> {
        let Some(machine) = self.machines.get_mut(task_id) else {
            warn!(task_id, "no mirrored state for task");
            return Ok(false);
        };
        let Some(route) = machine.route_to(target) else {
            warn!(task_id, from = %machine.state(), to = %target, "task status unreachable");
            return Ok(false);
        };
        if route.is_empty() {
            return Ok(true);
        }
        for step in route {
            if !machine.transition(step, note.unwrap_or("monitor")) {
                return Ok(false);
            }
        }
        let landed = machine.state();
        let mut update = TaskUpdate::status(landed);
        if let Some(note) = note {
            update = update.with_note(note);
        }
        self.services
            .board
            .update_task(&ctx.project_id, task_id, &update)?;
        Ok(landed == target)
    }

    #[instrument(skip_all, fields(task_id = %task.task_id))]
    fn review(&mut self, ctx: &mut PipelineContext, task: &BoardTask) -> Result<Tick> {
        let pending = self.pending.get(&task.task_id).cloned().unwrap_or_default();
        if pending.is_empty() {
            debug!("no DEV output held for review; QA sees the board state only");
        }
        let existing = pending
            .iter()
            .map(|artifact| ArtifactRef {
                path: artifact.path.clone(),
                content: artifact.content_str().to_string(),
            })
            .collect();
        let request = self
            .services
            .request(
                ctx,
                AgentRole::Qa,
                Mode::ValidateTask,
                format!("Validate task {}: {}", task.task_id, task.title),
                ctx.build_inputs_for_qa(task),
            )
            .with_task_id(&task.task_id)
            .with_existing_artifacts(existing);
        let response = self.services.call(&request)?;
        let envelope = &response.envelope;

        match envelope.status {
            Status::QaPass => {
                for artifact in &pending {
                    ctx.register_artifact(
                        &artifact.path,
                        artifact.content_str(),
                        Some(&task.task_id),
                    );
                }
                self.services
                    .store
                    .write_artifacts(&ctx.project_id, &pending)?;
                self.services.absorb(ctx, envelope)?;
                ctx.add_completed_task(&task.task_id);
                self.advance(ctx, &task.task_id, TaskStatus::Done, Some("QA passed"))?;
                self.pending.remove(&task.task_id);
                self.feedback.remove(&task.task_id);
                self.services.checkpoint(ctx)?;
                info!(artifacts = pending.len(), "task accepted by QA");
            }
            Status::QaFail => {
                self.services.absorb(ctx, envelope)?;
                let cap = self.services.config.monitor.max_qa_rework;
                let counters = self.counters.entry(task.task_id.clone()).or_default();
                counters.rework += 1;
                let rework = counters.rework;
                self.pending.remove(&task.task_id);
                if rework > cap {
                    self.force_done(ctx, &task.task_id, rework)?;
                } else {
                    self.feedback.insert(
                        task.task_id.clone(),
                        json!({
                            "qa_feedback": envelope.summary_str(),
                            "qa_issues": qa_issues(envelope),
                        }),
                    );
                    self.advance(
                        ctx,
                        &task.task_id,
                        TaskStatus::QaFail,
                        Some(envelope.summary_str()),
                    )?;
                    info!(rework, cap, "task sent back for rework");
                }
            }
            ref other => {
                let cap = self.services.config.monitor.max_qa_no_verdict;
                let counters = self.counters.entry(task.task_id.clone()).or_default();
                counters.no_verdict += 1;
                let misses = counters.no_verdict;
                if response.is_circuit_open() {
                    warn!(
                        misses,
                        cap,
                        summary = envelope.summary_str(),
                        "QA circuit open; review skipped"
                    );
                } else {
                    warn!(
                        status = %other,
                        misses,
                        cap,
                        summary = envelope.summary_str(),
                        "QA returned no verdict"
                    );
                }
                if misses < cap {
                    return Ok(Tick::Idle);
                }
                self.abandon_review(ctx, &task.task_id, misses)?;
            }
        }
        Ok(Tick::Acted)
    }

    /// Block a task QA keeps failing to judge. Bypasses the mirrored machine,
    /// which has no WAITING_REVIEW to BLOCKED move.
    fn abandon_review(&mut self, ctx: &PipelineContext, task_id: &str, misses: u32) -> Result<()> {
        let note = format!("QA returned no verdict {misses} times");
        warn!(task_id, misses, "abandoning review; blocking task");
        let update = TaskUpdate::status(TaskStatus::Blocked).with_note(&note);
        self.services
            .board
            .update_task(&ctx.project_id, task_id, &update)?;
        self.machines.insert(
            task_id.to_string(),
            TaskStateMachine::new(task_id, TaskStatus::Blocked),
        );
        self.gave_up.insert(task_id.to_string());
        self.pending.remove(task_id);
        Ok(())
    }

    /// Close a task the QA cap gave up on. Bypasses the mirrored machine.
    fn force_done(&mut self, ctx: &mut PipelineContext, task_id: &str, rework: u32) -> Result<()> {
        let note = format!("closed without QA approval after {rework} rejections");
        warn!(
            task_id,
            rework,
            "QA rework cap exceeded; forcing task to DONE"
        );
        let update = TaskUpdate::status(TaskStatus::Done).with_note(&note);
        self.services
            .board
            .update_task(&ctx.project_id, task_id, &update)?;
        self.machines.insert(
            task_id.to_string(),
            TaskStateMachine::new(task_id, TaskStatus::Done),
        );
        self.gave_up.insert(task_id.to_string());
        self.feedback.remove(task_id);
        ctx.add_completed_task(task_id);
        self.services.checkpoint(ctx)
    }

    #[instrument(skip_all, fields(task_id = %task.task_id))]
    fn implement(&mut self, ctx: &mut PipelineContext, task: &BoardTask) -> Result<Tick> {
        if !self.advance(
            ctx,
            &task.task_id,
            TaskStatus::InProgress,
            Some("picked up by DEV"),
        )? {
            warn!(status = %task.status, "task cannot move to IN_PROGRESS; giving up on it");
            self.gave_up.insert(task.task_id.clone());
            return Ok(Tick::Acted);
        }

        let inputs = ctx.build_inputs_for_dev(task, self.feedback.get(&task.task_id));
        let request = self
            .services
            .request(
                ctx,
                AgentRole::Dev,
                Mode::ImplementTask,
                format!("Implement task {}: {}", task.task_id, task.title),
                inputs,
            )
            .with_task_id(&task.task_id);
        let response = self.services.call(&request)?;
        let envelope = &response.envelope;
        let produced: Vec<Artifact> = envelope.produced_artifacts().cloned().collect();
        let produced = filter_artifacts(&produced);

        if envelope.status == Status::Ok && !produced.is_empty() {
            debug!(artifacts = produced.len(), "DEV produced artifacts");
            self.pending.insert(task.task_id.clone(), produced);
            self.advance(
                ctx,
                &task.task_id,
                TaskStatus::InReview,
                Some("artifacts produced"),
            )?;
            return Ok(Tick::Acted);
        }

        let cap = self.services.config.monitor.max_dev_no_artifact;
        let counters = self.counters.entry(task.task_id.clone()).or_default();
        counters.no_artifact += 1;
        let misses = counters.no_artifact;
        warn!(
            status = %envelope.status,
            misses,
            cap,
            summary = envelope.summary_str(),
            "DEV produced no artifacts"
        );
        if misses >= cap {
            let note = format!("no artifacts after {misses} attempts");
            self.advance(ctx, &task.task_id, TaskStatus::Blocked, Some(&note))?;
            self.gave_up.insert(task.task_id.clone());
        }
        Ok(Tick::Acted)
    }

    #[instrument(skip_all)]
    fn provision(&mut self, ctx: &mut PipelineContext) -> Result<Tick> {
        self.provisioned = true;
        self.services
            .patch_project(ctx, &ProjectPatch::status(ProjectStatus::Devops));
        let request = self.services.request(
            ctx,
            AgentRole::Devops,
            Mode::ProvisionArtifacts,
            "Provision build, run, and deployment artifacts for the delivered project",
            ctx.build_inputs_for_cto(None),
        );
        let response = self.services.call(&request)?;
        if response.envelope.status == Status::Ok {
            self.services.absorb(ctx, &response.envelope)?;
            self.services.checkpoint(ctx)?;
            self.services.patch_project(
                ctx,
                &ProjectPatch::status(ProjectStatus::Completed).completed(),
            );
            info!(
                completed_tasks = ctx.completed_tasks.len(),
                "project provisioned"
            );
        } else {
            warn!(
                status = %response.envelope.status,
                summary = response.envelope.summary_str(),
                "provisioning failed"
            );
            self.services
                .patch_project(ctx, &ProjectPatch::status(ProjectStatus::Failed));
        }
        Ok(Tick::Acted)
    }
}

/// QA's concrete issues: `next_actions.items` first, then its questions.
fn qa_issues(envelope: &ResponseEnvelope) -> Vec<Value> {
    let mut issues = envelope.next_actions.items.clone();
    issues.extend(
        envelope
            .next_actions
            .questions
            .iter()
            .map(|q| Value::String(q.clone())),
    );
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::types::{CIRCUIT_OPEN, ValidatedResponse};
    use crate::io::config::ForgeConfig;
    use crate::io::project_store::ProjectStore;
    use crate::test_support::{
        InMemoryTaskBoard, RecordingSleeper, ScriptedInvoker, board_task, envelope, long_doc,
    };

    struct Fixture {
        invoker: ScriptedInvoker,
        board: InMemoryTaskBoard,
        store: ProjectStore,
        config: ForgeConfig,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(tasks: Vec<BoardTask>) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut config = ForgeConfig::default();
            config.monitor.max_iterations = 20;
            Self {
                invoker: ScriptedInvoker::new(),
                board: InMemoryTaskBoard::with_tasks(tasks),
                store: ProjectStore::new(dir.path()),
                config,
                _dir: dir,
            }
        }

        fn services(&self) -> Services<'_> {
            Services {
                invoker: &self.invoker,
                board: &self.board,
                store: &self.store,
                config: &self.config,
            }
        }
    }

    fn dev_ok(task_id: &str) -> ResponseEnvelope {
        let code_path = format!("apps/api/{task_id}.ts");
        let code = format!("export function handler() {{ return '{task_id}'; }}\n");
        let report_path = format!("docs/dev/dev_implementation_{task_id}.md");
        let report = long_doc(&format!("Implementation notes for {task_id}"));
        envelope(
            "OK",
            "implemented",
            &[(code_path.as_str(), code.as_str()), (report_path.as_str(), report.as_str())],
        )
    }

    fn qa(status: &str, task_id: &str) -> ResponseEnvelope {
        let report_path = format!("docs/qa/qa_report_{task_id}.md");
        envelope(status, "reviewed", &[(report_path.as_str(), "report")])
    }

    fn run_loop(
        fixture: &Fixture,
        ctx: &mut PipelineContext,
        sleeper: Arc<RecordingSleeper>,
    ) -> (LoopStop, HashSet<String>) {
        let services = fixture.services();
        let mut monitor = MonitorLoop::new(&services, ShutdownSignal::new()).with_sleeper(sleeper);
        let stop = monitor.run(ctx).expect("loop runs");
        (stop, monitor.gave_up().clone())
    }

    #[test]
    fn qa_without_verdict_blocks_task_after_cap() {
        let mut fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::InReview, &[])]);
        fixture.config.monitor.max_qa_no_verdict = 2;
        let circuit_open = ValidatedResponse::new(
            ResponseEnvelope::terminal("", Status::Blocked, "circuit breaker open"),
            vec!["circuit open".to_string()],
        )
        .with_failure_kind(CIRCUIT_OPEN);
        fixture.invoker.push_response(AgentRole::Qa, circuit_open);
        fixture
            .invoker
            .push(AgentRole::Qa, envelope("BLOCKED", "repairs exhausted", &[]));
        let mut ctx = PipelineContext::new("p1");
        let sleeper = Arc::new(RecordingSleeper::new());

        let (stop, gave_up) = run_loop(&fixture, &mut ctx, sleeper.clone());

        assert_eq!(stop, LoopStop::MaxIterations);
        assert!(gave_up.contains("TSK-1"));
        assert_eq!(fixture.invoker.requests_for(AgentRole::Qa).len(), 2);
        assert!(fixture.invoker.requests_for(AgentRole::Dev).is_empty());
        let updates = fixture.board.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, TaskStatus::Blocked);
        assert_eq!(
            updates[0].1.note.as_deref(),
            Some("QA returned no verdict 2 times")
        );
        // One idle wait after the first miss, then one per remaining iteration.
        assert_eq!(sleeper.waits().len(), 19);
    }

    /// Verifies a task goes DEV -> QA -> DONE and DEVOPS runs exactly once.
    #[test]
    fn task_flows_to_done_then_provisions_once() {
        let fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::Assigned, &[])]);
        fixture.invoker.push(AgentRole::Dev, dev_ok("TSK-1"));
        fixture.invoker.push(AgentRole::Qa, qa("QA_PASS", "TSK-1"));
        fixture.invoker.push(
            AgentRole::Devops,
            envelope(
                "OK",
                "provisioned",
                &[("project/Dockerfile", "FROM node:20\n")],
            ),
        );
        let mut ctx = PipelineContext::new("p1");

        let (stop, _) = run_loop(&fixture, &mut ctx, Arc::new(RecordingSleeper::new()));

        assert_eq!(stop, LoopStop::MaxIterations);
        assert_eq!(
            fixture.board.task("TSK-1").map(|t| t.status),
            Some(TaskStatus::Done)
        );
        assert_eq!(fixture.invoker.requests_for(AgentRole::Devops).len(), 1);
        assert!(ctx.artifacts.contains_key("apps/api/TSK-1.ts"));
        assert_eq!(ctx.completed_tasks, vec!["TSK-1".to_string()]);
        assert!(
            fixture
                .store
                .read_artifact("p1", "apps/api/TSK-1.ts")
                .expect("read")
                .is_some()
        );
        assert_eq!(
            fixture.board.status_history(),
            vec![ProjectStatus::Devops, ProjectStatus::Completed]
        );
        let qa_request = &fixture.invoker.requests_for(AgentRole::Qa)[0];
        assert_eq!(qa_request.task_id.as_deref(), Some("TSK-1"));
        assert_eq!(qa_request.existing_artifacts.len(), 2);
    }

    #[test]
    fn qa_failure_feeds_back_then_cap_forces_done() {
        let mut fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::Assigned, &[])]);
        fixture.config.monitor.max_qa_rework = 2;
        for _ in 0..3 {
            fixture.invoker.push(AgentRole::Dev, dev_ok("TSK-1"));
            fixture.invoker.push(AgentRole::Qa, qa("QA_FAIL", "TSK-1"));
        }
        let mut ctx = PipelineContext::new("p1");

        let (_, gave_up) = run_loop(&fixture, &mut ctx, Arc::new(RecordingSleeper::new()));

        assert!(gave_up.contains("TSK-1"));
        assert_eq!(
            fixture.board.task("TSK-1").map(|t| t.status),
            Some(TaskStatus::Done)
        );
        let dev_requests = fixture.invoker.requests_for(AgentRole::Dev);
        // Two reworks are allowed; the third rejection exceeds the cap.
        assert_eq!(dev_requests.len(), 3);
        assert!(!dev_requests[0].inputs.contains_key("previous_attempt"));
        for request in &dev_requests[1..] {
            let previous = &request.inputs["previous_attempt"];
            assert_eq!(previous["qa_feedback"], "reviewed");
        }
        let statuses: Vec<TaskStatus> = fixture
            .board
            .updates()
            .into_iter()
            .map(|(_, update)| update.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::QaFail,
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::QaFail,
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::Done,
            ]
        );
        assert!(!ctx.artifacts.contains_key("apps/api/TSK-1.ts"));
    }

    #[test]
    fn repeated_empty_dev_output_blocks_and_gives_up() {
        let fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::Assigned, &[])]);
        for _ in 0..3 {
            fixture
                .invoker
                .push(AgentRole::Dev, envelope("BLOCKED", "missing input", &[]));
        }
        let mut ctx = PipelineContext::new("p1");

        let (_, gave_up) = run_loop(&fixture, &mut ctx, Arc::new(RecordingSleeper::new()));

        assert!(gave_up.contains("TSK-1"));
        assert_eq!(
            fixture.board.task("TSK-1").map(|t| t.status),
            Some(TaskStatus::Blocked)
        );
        assert_eq!(fixture.invoker.requests_for(AgentRole::Dev).len(), 3);
        assert!(fixture.invoker.requests_for(AgentRole::Devops).is_empty());
    }

    #[test]
    fn accepted_project_ends_loop() {
        let fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::Assigned, &[])]);
        fixture.board.set_project_status(ProjectStatus::Accepted);
        let mut ctx = PipelineContext::new("p1");

        let (stop, _) = run_loop(&fixture, &mut ctx, Arc::new(RecordingSleeper::new()));

        assert_eq!(stop, LoopStop::Accepted);
        assert!(fixture.invoker.requests().is_empty());
        assert_eq!(ctx.current_step, Phase::Monitoring.step());
    }

    #[test]
    fn idle_iterations_sleep_for_poll_interval() {
        let fixture = Fixture::new(Vec::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut ctx = PipelineContext::new("p1");

        let (stop, _) = run_loop(&fixture, &mut ctx, sleeper.clone());

        assert_eq!(stop, LoopStop::MaxIterations);
        let waits = sleeper.waits();
        assert_eq!(waits.len(), 20);
        assert!(waits.iter().all(|wait| *wait == Duration::from_secs(10)));
    }

    #[test]
    fn stop_file_shuts_loop_down() {
        let fixture = Fixture::new(vec![board_task("TSK-1", TaskStatus::Assigned, &[])]);
        let stop_file = fixture.store.stop_file("p1").expect("stop path");
        std::fs::create_dir_all(stop_file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&stop_file, "").expect("touch");
        let services = fixture.services();
        let shutdown = ShutdownSignal::new().with_stop_file(&stop_file);
        let mut monitor = MonitorLoop::new(&services, shutdown)
            .with_sleeper(Arc::new(RecordingSleeper::new()));

        let mut ctx = PipelineContext::new("p1");
        let stop = monitor.run(&mut ctx).expect("loop runs");

        assert_eq!(stop, LoopStop::Shutdown);
        assert!(fixture.invoker.requests().is_empty());
    }

    #[test]
    fn triggered_signal_is_seen_by_clones() {
        let signal = ShutdownSignal::new();
        let handle = signal.clone();
        handle.trigger();
        assert!(signal.is_triggered());
    }
}
