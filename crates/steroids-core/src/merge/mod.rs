//! Parallel merge engine: crash-safe cherry-pick integration of workstream
//! branches into mainline.

mod conflict;
mod engine;

pub use conflict::ConflictOutcome;
pub use engine::MergeEngine;

use std::path::PathBuf;
use std::time::Duration;

use crate::types::SessionStatus;

/// Default merge lock lifetime.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120 * 60);

/// Default merge lock heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Entry conditions for one merge run.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Session being merged.
    pub session_id: String,
    /// Runner performing the merge.
    pub runner_id: String,
    /// Ordered workstream ids to integrate.
    pub workstream_ids: Vec<String>,
    /// Git remote.
    pub remote: String,
    /// Mainline branch.
    pub main_branch: String,
    /// Merge lock lifetime.
    pub lock_timeout: Duration,
    /// Merge lock heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Integration branch name; defaults to
    /// `steroids/integration-<session-prefix>`.
    pub integration_branch: Option<String>,
    /// Validation command run before push.
    pub validation_command: Option<String>,
    /// Remove workstream workspaces after a successful merge.
    pub cleanup_workspaces: bool,
    /// Mark the session completed at the end. `false` when merging a
    /// subset of workstreams; the session returns to `running`.
    pub complete_session: bool,
    /// Existing integration workspace to resume in; a fresh clone is
    /// created when absent.
    pub integration_workspace: Option<PathBuf>,
}

impl MergeOptions {
    /// Options with spec defaults.
    #[must_use]
    pub fn new(session_id: String, runner_id: String, workstream_ids: Vec<String>) -> Self {
        Self {
            session_id,
            runner_id,
            workstream_ids,
            remote: "origin".into(),
            main_branch: "main".into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            integration_branch: None,
            validation_command: None,
            cleanup_workspaces: false,
            complete_session: true,
            integration_workspace: None,
        }
    }

    /// The effective integration branch name.
    #[must_use]
    pub fn integration_branch_name(&self) -> String {
        self.integration_branch.clone().unwrap_or_else(|| {
            let prefix: String = self.session_id.chars().take(8).collect();
            format!("steroids/integration-{prefix}")
        })
    }
}

/// What one merge run produced.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Whether the mainline was pushed and the session finalized.
    pub success: bool,
    /// Commits confirmed applied (including ones found already
    /// integrated on resume).
    pub completed_commits: usize,
    /// Conflicts resolved through the sub-loop this run.
    pub conflicts: usize,
    /// Commits skipped (honored skips and empty picks).
    pub skipped_commits: usize,
    /// Human-readable failures.
    pub errors: Vec<String>,
    /// Escalation recorded by a failed validation gate.
    pub validation_escalation_id: Option<String>,
    /// Session status at the end of the run.
    pub session_status: SessionStatus,
}
