//! Per-task lifecycle.
//!
//! | from | to |
//! |---|---|
//! | PENDING | ASSIGNED, IN_PROGRESS |
//! | ASSIGNED | IN_PROGRESS |
//! | IN_PROGRESS | WAITING_REVIEW, BLOCKED |
//! | WAITING_REVIEW | DONE, QA_FAIL |
//! | QA_FAIL | IN_PROGRESS, BLOCKED |
//! | DONE | (terminal) |
//! | BLOCKED | PENDING, ASSIGNED |
//!
//! Every accepted move appends a history entry. A move into `QA_FAIL` bumps the
//! rework counter; past the cap the machine lands in `BLOCKED` instead.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::core::types::UnknownTag;

/// QA rejections tolerated before a task is blocked.
pub const MAX_REWORK_BEFORE_BLOCKED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    #[serde(rename = "WAITING_REVIEW", alias = "IN_REVIEW")]
    InReview,
    QaFail,
    Done,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::QaFail,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::InReview => "WAITING_REVIEW",
            TaskStatus::QaFail => "QA_FAIL",
            TaskStatus::Done => "DONE",
            TaskStatus::Blocked => "BLOCKED",
        }
    }

    /// Declared successors.
    pub fn allowed_next(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Assigned, TaskStatus::InProgress],
            TaskStatus::Assigned => &[TaskStatus::InProgress],
            TaskStatus::InProgress => &[TaskStatus::InReview, TaskStatus::Blocked],
            TaskStatus::InReview => &[TaskStatus::Done, TaskStatus::QaFail],
            TaskStatus::QaFail => &[TaskStatus::InProgress, TaskStatus::Blocked],
            TaskStatus::Done => &[],
            TaskStatus::Blocked => &[TaskStatus::Pending, TaskStatus::Assigned],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        if normalized == "IN_REVIEW" {
            return Ok(TaskStatus::InReview);
        }
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownTag {
                kind: "task status",
                value: s.to_string(),
            })
    }
}

/// One accepted move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task {task_id}: {from} -> {to} is not an allowed transition")]
    NotAllowed {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateMachine {
    task_id: String,
    state: TaskStatus,
    rework_count: u32,
    max_rework: u32,
    history: Vec<Transition>,
}

impl TaskStateMachine {
    pub fn new(task_id: impl Into<String>, initial: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            state: initial,
            rework_count: 0,
            max_rework: MAX_REWORK_BEFORE_BLOCKED,
            history: Vec::new(),
        }
    }

    pub fn with_max_rework(mut self, max_rework: u32) -> Self {
        self.max_rework = max_rework;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskStatus {
        self.state
    }

    pub fn rework_count(&self) -> u32 {
        self.rework_count
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Pure precondition check against the transition table.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        self.state.allowed_next().contains(&to)
    }

    /// Apply a move, returning the state the machine ended in.
    ///
    /// A rejected move leaves state and history untouched.
    pub fn try_transition(
        &mut self,
        to: TaskStatus,
        reason: impl Into<String>,
    ) -> Result<TaskStatus, TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError::NotAllowed {
                task_id: self.task_id.clone(),
                from: self.state,
                to,
            });
        }
        self.record(to, reason.into());

        if to == TaskStatus::QaFail {
            self.rework_count += 1;
            if self.rework_count > self.max_rework {
                warn!(
                    task_id = %self.task_id,
                    rework_count = self.rework_count,
                    "rework cap exceeded; blocking task"
                );
                let reason = format!("rework cap exceeded ({} QA failures)", self.rework_count);
                self.record(TaskStatus::Blocked, reason);
            }
        }
        Ok(self.state)
    }

    /// Boolean form of [`try_transition`](Self::try_transition); rejections are logged.
    pub fn transition(&mut self, to: TaskStatus, reason: impl Into<String>) -> bool {
        match self.try_transition(to, reason) {
            Ok(_) => true,
            Err(err) => {
                error!(
                    error = %err,
                    allowed = ?self.state.allowed_next(),
                    "rejected task transition"
                );
                false
            }
        }
    }

    /// Shortest sequence of moves from the current state to `target`.
    ///
    /// Empty when already there; `None` when unreachable.
    pub fn route_to(&self, target: TaskStatus) -> Option<Vec<TaskStatus>> {
        let mut queue = VecDeque::from([(self.state, Vec::new())]);
        let mut seen = HashSet::from([self.state]);
        while let Some((state, path)) = queue.pop_front() {
            if state == target {
                return Some(path);
            }
            for next in state.allowed_next() {
                if seen.insert(*next) {
                    let mut extended = path.clone();
                    extended.push(*next);
                    queue.push_back((*next, extended));
                }
            }
        }
        None
    }

    fn record(&mut self, to: TaskStatus, reason: String) {
        self.history.push(Transition {
            from: self.state,
            to,
            reason,
            timestamp: Utc::now(),
        });
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_records_three_entries() {
        let mut machine = TaskStateMachine::new("t1", TaskStatus::Pending);
        assert!(machine.transition(TaskStatus::InProgress, "dev picked up"));
        assert!(machine.transition(TaskStatus::InReview, "artifacts produced"));
        assert!(machine.transition(TaskStatus::Done, "QA_PASS"));
        assert_eq!(machine.state(), TaskStatus::Done);
        assert_eq!(machine.history().len(), 3);
        assert_eq!(machine.history()[0].from, TaskStatus::Pending);
        assert_eq!(machine.history()[2].to, TaskStatus::Done);
    }

    #[test]
    fn undeclared_move_is_rejected_without_side_effects() {
        let mut machine = TaskStateMachine::new("t1", TaskStatus::Pending);
        assert!(!machine.transition(TaskStatus::Done, "skip ahead"));
        assert_eq!(machine.state(), TaskStatus::Pending);
        assert!(machine.history().is_empty());

        let err = machine
            .try_transition(TaskStatus::InReview, "skip")
            .expect_err("rejected");
        assert_eq!(
            err,
            TransitionError::NotAllowed {
                task_id: "t1".to_string(),
                from: TaskStatus::Pending,
                to: TaskStatus::InReview,
            }
        );
    }

    #[test]
    fn done_is_terminal() {
        let mut machine = TaskStateMachine::new("t1", TaskStatus::Done);
        for status in TaskStatus::ALL {
            assert!(!machine.can_transition(status));
            assert!(!machine.transition(status, "retry"));
        }
        assert!(TaskStatus::Done.is_terminal());
    }

    #[test]
    fn blocked_returns_only_to_pending_or_assigned() {
        let machine = TaskStateMachine::new("t1", TaskStatus::Blocked);
        let allowed: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(|status| machine.can_transition(*status))
            .collect();
        assert_eq!(allowed, vec![TaskStatus::Pending, TaskStatus::Assigned]);
    }

    #[test]
    fn repeated_qa_failures_past_the_cap_block_the_task() {
        let mut machine = TaskStateMachine::new("t1", TaskStatus::InProgress);
        for round in 1..=MAX_REWORK_BEFORE_BLOCKED {
            assert!(machine.transition(TaskStatus::InReview, "submitted"));
            assert_eq!(
                machine.try_transition(TaskStatus::QaFail, "rejected"),
                Ok(TaskStatus::QaFail)
            );
            assert_eq!(machine.rework_count(), round);
            assert!(machine.transition(TaskStatus::InProgress, "rework"));
        }
        assert!(machine.transition(TaskStatus::InReview, "submitted"));
        assert_eq!(
            machine.try_transition(TaskStatus::QaFail, "rejected"),
            Ok(TaskStatus::Blocked)
        );
        let last = machine.history().last().expect("history");
        assert_eq!(last.from, TaskStatus::QaFail);
        assert_eq!(last.to, TaskStatus::Blocked);
        assert!(last.reason.contains("rework cap"));
    }

    #[test]
    fn route_finds_shortest_legal_path() {
        let machine = TaskStateMachine::new("t1", TaskStatus::Blocked);
        let path = vec![
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::InReview,
        ];
        assert_eq!(machine.route_to(TaskStatus::InReview), Some(path));
        assert_eq!(machine.route_to(TaskStatus::Blocked), Some(Vec::new()));
        let done = TaskStateMachine::new("t2", TaskStatus::Done);
        assert_eq!(done.route_to(TaskStatus::Pending), None);
    }

    #[test]
    fn status_tags_accept_both_review_spellings() {
        assert_eq!("in_review".parse::<TaskStatus>(), Ok(TaskStatus::InReview));
        assert_eq!(
            "WAITING_REVIEW".parse::<TaskStatus>(),
            Ok(TaskStatus::InReview)
        );
        let decoded: TaskStatus = serde_json::from_str("\"IN_REVIEW\"").expect("decode");
        assert_eq!(decoded, TaskStatus::InReview);
        let encoded = serde_json::to_string(&TaskStatus::InReview).expect("encode");
        assert_eq!(encoded, "\"WAITING_REVIEW\"");
    }
}
