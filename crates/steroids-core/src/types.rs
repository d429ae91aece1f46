//! Shared status enums and the task lifecycle state machine.
//!
//! All statuses round-trip through `as_str`/`FromStr` because every store
//! persists them as TEXT columns.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role of an LLM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Out-of-band coordinator pass.
    Orchestrator,
    /// Implements the task.
    Coder,
    /// Reviews submitted work.
    Reviewer,
}

impl Role {
    /// String form used in prompts, logs, and invocation rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Authored, not yet picked up.
    Pending,
    /// A coder is working on it (or it is resumable).
    InProgress,
    /// Submitted, awaiting reviewer verdict.
    Review,
    /// Approved and done.
    Completed,
    /// Escalated to a human via a dispute.
    Disputed,
    /// Hard failure (error or rejection limit).
    Failed,
    /// Skipped by reviewer or operator.
    Skipped,
    /// Partially complete, not worth further iteration.
    Partial,
}

impl TaskStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Partial => "partial",
        }
    }

    /// Terminal statuses never re-enter scheduling.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Disputed | Self::Failed | Self::Skipped | Self::Partial
        )
    }

    /// All statuses this one may legally transition to.
    ///
    /// Single source of truth for the lifecycle machine; `review ->
    /// in_progress` is the reject edge and the only transition that bumps
    /// the rejection counter.
    #[must_use]
    pub fn valid_next_states(self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::InProgress],
            Self::InProgress => vec![
                Self::InProgress,
                Self::Review,
                Self::Failed,
                Self::Skipped,
                Self::Partial,
            ],
            Self::Review => vec![
                Self::Review,
                Self::Completed,
                Self::InProgress,
                Self::Disputed,
                Self::Failed,
                Self::Skipped,
                Self::Partial,
            ],
            Self::Completed | Self::Disputed | Self::Failed | Self::Skipped | Self::Partial => {
                Vec::new()
            }
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_next_states().contains(&next)
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "disputed" => Ok(Self::Disputed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "partial" => Ok(Self::Partial),
            _ => Err(Error::Parse(format!("invalid task status: {s}"))),
        }
    }
}

/// Status of a parallel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Workstreams executing.
    Running,
    /// Merge engine holds the session.
    Merging,
    /// Cleanup in progress, workstreams draining.
    CleanupDraining,
    /// Cleanup queued.
    CleanupPending,
    /// Merged and finished.
    Completed,
    /// Unrecoverable failure.
    Failed,
    /// Operator abort.
    Aborted,
    /// Validation gate failed, awaiting a human.
    BlockedValidation,
    /// Conflict attempt limit reached, awaiting a human.
    BlockedConflict,
}

impl SessionStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Merging => "merging",
            Self::CleanupDraining => "cleanup_draining",
            Self::CleanupPending => "cleanup_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::BlockedValidation => "blocked_validation",
            Self::BlockedConflict => "blocked_conflict",
        }
    }

    /// A terminal session no longer blocks new sessions for its repo.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "merging" => Ok(Self::Merging),
            "cleanup_draining" => Ok(Self::CleanupDraining),
            "cleanup_pending" => Ok(Self::CleanupPending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "blocked_validation" => Ok(Self::BlockedValidation),
            "blocked_conflict" => Ok(Self::BlockedConflict),
            _ => Err(Error::Parse(format!("invalid session status: {s}"))),
        }
    }
}

/// Status of a workstream lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkstreamStatus {
    /// Tasks still executing.
    Running,
    /// All sections done, ready to merge.
    Completed,
    /// Lane failed.
    Failed,
}

impl WorkstreamStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for WorkstreamStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::Parse(format!("invalid workstream status: {s}"))),
        }
    }
}

/// Status of a runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Spawned, registering.
    Starting,
    /// Executing tasks.
    Running,
    /// Stopped (cooperatively or detected dead).
    Stopped,
}

impl RunnerStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for RunnerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            _ => Err(Error::Parse(format!("invalid runner status: {s}"))),
        }
    }
}

/// Durable state of one cherry-pick checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Commit applied to the integration branch.
    Applied,
    /// Conflict pending resolution.
    Conflict,
    /// Commit intentionally skipped.
    Skipped,
}

impl ProgressStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Conflict => "conflict",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for ProgressStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "applied" => Ok(Self::Applied),
            "conflict" => Ok(Self::Conflict),
            "skipped" => Ok(Self::Skipped),
            _ => Err(Error::Parse(format!("invalid progress status: {s}"))),
        }
    }
}

/// Terminal status of a provider invocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Provider exited zero.
    Completed,
    /// Provider exited non-zero or could not spawn.
    Failed,
    /// Provider hit the invocation timeout.
    Timeout,
}

impl InvocationStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for InvocationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(Error::Parse(format!("invalid invocation status: {s}"))),
        }
    }
}

/// Category of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeKind {
    /// Blocks the task until resolved.
    Major,
    /// Advisory only; does not mutate task status.
    Minor,
    /// Raised by the coder against review feedback.
    Coder,
    /// Raised by the reviewer against a submission.
    Reviewer,
    /// Raised automatically by the engine.
    System,
}

impl DisputeKind {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::System => "system",
        }
    }

    /// Minor disputes never block the task.
    #[must_use]
    pub const fn blocks_task(self) -> bool {
        !matches!(self, Self::Minor)
    }
}

impl FromStr for DisputeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "system" => Ok(Self::System),
            _ => Err(Error::Parse(format!("invalid dispute kind: {s}"))),
        }
    }
}

/// Open/resolved state of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    /// Awaiting resolution.
    Open,
    /// Resolved with a decision.
    Resolved,
}

impl DisputeStatus {
    /// Persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for DisputeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            _ => Err(Error::Parse(format!("invalid dispute status: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() -> Result<()> {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Completed,
            TaskStatus::Disputed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Partial,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>()?, status);
        }
        Ok(())
    }

    #[test]
    fn test_terminal_statuses_have_no_successors() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Disputed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Partial,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_next_states().is_empty());
        }
    }

    #[test]
    fn test_reject_edge_is_legal() {
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Review));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Review));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_session_terminality() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::BlockedValidation.is_terminal());
        assert!(!SessionStatus::Merging.is_terminal());
    }

    #[test]
    fn test_invalid_status_string_rejected() {
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert!("bogus".parse::<SessionStatus>().is_err());
        assert!("bogus".parse::<ProgressStatus>().is_err());
    }
}
