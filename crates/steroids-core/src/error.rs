//! Engine-wide error type and result alias.
//!
//! Every failure the engine can produce maps to one variant with a stable
//! code string for the JSON envelope and an exit code for the CLI surface.

use thiserror::Error;

use crate::provider::ProviderError;

/// The result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the execution engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Integration workspace has uncommitted changes and no cherry-pick in
    /// progress.
    #[error("working tree is dirty: {0}")]
    DirtyWorktree(String),

    /// A remote workstream ref could not be resolved.
    #[error("remote branch missing: {0}")]
    RemoteBranchMissing(String),

    /// Sealed head no longer matches the remote ref on resume.
    #[error("sealed head for workstream {workstream_id} moved: sealed {sealed}, remote {remote}")]
    SealedHeadMoved {
        /// Workstream whose seal is stale.
        workstream_id: String,
        /// The SHA captured at seal time.
        sealed: String,
        /// The SHA the remote ref resolves to now.
        remote: String,
    },

    /// `git pull --ff-only` failed.
    #[error("pull failed: {0}")]
    PullFailed(String),

    /// Mainline diverged from the remote.
    #[error("non-fast-forward: {0}")]
    NonFastForward(String),

    /// `git push` reported an error.
    #[error("push failed: {0}")]
    PushFailed(String),

    /// `git fetch` failed fatally.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A git subprocess failed in a way no more specific variant covers.
    #[error("git error: {0}")]
    Git(String),

    /// `git log base..head` could not produce a commit list.
    #[error("commit list failed: {0}")]
    CommitListFailed(String),

    /// A fenced merge-state mutation observed zero changed rows.
    #[error("merge lock fence lost for session {0}")]
    MergeLockFenceLost(String),

    /// The held lock epoch does not match the stored epoch.
    #[error("merge lock epoch mismatch for session {0}")]
    MergeLockEpochMismatch(String),

    /// The merge lock expired while held.
    #[error("merge lock expired for session {0}")]
    MergeLockExpired(String),

    /// No merge lock row exists for the session.
    #[error("merge lock not found for session {0}")]
    MergeLockNotFound(String),

    /// Another runner holds a non-expired merge lock.
    #[error("could not acquire merge lock for session {session_id}: held by {holder}")]
    MergeLockHeld {
        /// Session whose lock was contended.
        session_id: String,
        /// Runner currently holding the lock.
        holder: String,
    },

    /// A fenced workstream mutation observed zero changed rows.
    #[error("lease fence failed for workstream {0}")]
    LeaseFenceFailed(String),

    /// The validation gate failed.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The conflict sub-loop exhausted its attempt budget.
    #[error("conflict attempt limit reached for commit {0}")]
    ConflictAttemptLimit(String),

    /// Provider invocation failure, already classified.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Section dependency insertion would create a cycle.
    #[error("cyclic section dependency: {0}")]
    CyclicDependency(String),

    /// No task with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No section with the given id or name.
    #[error("section not found: {0}")]
    SectionNotFound(String),

    /// A section prefix matched more than one section.
    #[error("ambiguous section prefix '{prefix}': matches {matches:?}")]
    AmbiguousSection {
        /// The prefix that was looked up.
        prefix: String,
        /// Every section name the prefix matched.
        matches: Vec<String>,
    },

    /// The task is owned by another runner.
    #[error("task locked: {0}")]
    TaskLocked(String),

    /// The project has no `.steroids` store.
    #[error("project not initialized: {0}")]
    NotInitialized(String),

    /// The store schema is older than the engine supports.
    #[error("migration required: {0}")]
    MigrationRequired(String),

    /// A status transition the state machine forbids.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Status before the attempted transition.
        from: String,
        /// Status the caller asked for.
        to: String,
    },

    /// A non-terminal parallel session already exists for the repo.
    #[error("parallel session already active for project: {0}")]
    SessionActive(String),

    /// Database failure.
    #[error("database error: {0}")]
    Database(String),

    /// Malformed persisted data.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// Invalid or unsafe configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A domain invariant was violated by caller input.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Stable machine-readable code for the JSON error envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DirtyWorktree(_) => "DIRTY_WORKTREE",
            Self::RemoteBranchMissing(_) => "REMOTE_BRANCH_MISSING",
            Self::SealedHeadMoved { .. } => "SEALED_HEAD_MOVED",
            Self::PullFailed(_) => "PULL_FAILED",
            Self::NonFastForward(_) => "NON_FAST_FORWARD",
            Self::PushFailed(_) => "PUSH_FAILED",
            Self::FetchFailed(_) => "FETCH_FAILED",
            Self::Git(_) => "GIT_ERROR",
            Self::CommitListFailed(_) => "COMMIT_LIST_FAILED",
            Self::MergeLockFenceLost(_) => "MERGE_LOCK_FENCE_LOST",
            Self::MergeLockEpochMismatch(_) => "MERGE_LOCK_EPOCH_MISMATCH",
            Self::MergeLockExpired(_) => "MERGE_LOCK_EXPIRED",
            Self::MergeLockNotFound(_) => "MERGE_LOCK_NOT_FOUND",
            Self::MergeLockHeld { .. } => "MERGE_LOCK_HELD",
            Self::LeaseFenceFailed(_) => "LEASE_FENCE_FAILED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::ConflictAttemptLimit(_) => "CONFLICT_ATTEMPT_LIMIT",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::CyclicDependency(_) => "CYCLIC_DEPENDENCY",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::SectionNotFound(_) => "SECTION_NOT_FOUND",
            Self::AmbiguousSection { .. } => "AMBIGUOUS_SECTION",
            Self::TaskLocked(_) => "TASK_LOCKED",
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::MigrationRequired(_) => "MIGRATION_REQUIRED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::SessionActive(_) => "SESSION_ACTIVE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 1 general, 2 invalid args, 3 config/not-initialized,
    /// 4 not found, 5 permission, 6 resource locked, 7 health failed.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) | Self::NotInitialized(_) | Self::MigrationRequired(_) => 3,
            Self::TaskNotFound(_) | Self::SectionNotFound(_) | Self::RemoteBranchMissing(_) => 4,
            Self::TaskLocked(_)
            | Self::MergeLockHeld { .. }
            | Self::SessionActive(_)
            | Self::LeaseFenceFailed(_)
            | Self::MergeLockFenceLost(_)
            | Self::MergeLockEpochMismatch(_)
            | Self::MergeLockExpired(_)
            | Self::MergeLockNotFound(_) => 6,
            Self::ValidationFailed(_) => 7,
            Self::Validation(_) | Self::AmbiguousSection { .. } | Self::InvalidTransition { .. } => 2,
            _ => 1,
        }
    }

    /// True when retrying the same operation may succeed without
    /// operator intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.retryable,
            Self::Database(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(Error::NotInitialized("/p".into()).exit_code(), 3);
        assert_eq!(Error::TaskNotFound("t1".into()).exit_code(), 4);
        assert_eq!(
            Error::MergeLockHeld {
                session_id: "s".into(),
                holder: "r".into()
            }
            .exit_code(),
            6
        );
        assert_eq!(Error::ValidationFailed("cmd".into()).exit_code(), 7);
        assert_eq!(Error::PushFailed("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(Error::DirtyWorktree("x".into()).code(), "DIRTY_WORKTREE");
        assert_eq!(
            Error::MergeLockFenceLost("s".into()).code(),
            "MERGE_LOCK_FENCE_LOST"
        );
        assert_eq!(
            Error::ConflictAttemptLimit("abc".into()).code(),
            "CONFLICT_ATTEMPT_LIMIT"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::AmbiguousSection {
            prefix: "auth".into(),
            matches: vec!["auth-api".into(), "auth-ui".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("auth"));
        assert!(msg.contains("auth-api"));
    }
}
