//! Conflict sub-loop: coder resolves, reviewer gates, the engine
//! continues the cherry-pick.

use std::path::Path;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::git::{Git, GitRunner};
use crate::global::{GlobalStore, MergeProgress};
use crate::orchestrator::{
    conflict_coder_prompt, conflict_reviewer_prompt, parse_review_decision,
};
use crate::provider::{InvokeOptions, ProviderRegistry};
use crate::types::{ProgressStatus, Role};
use crate::{Error, Result};

/// How the sub-loop ended for one commit.
#[derive(Debug, Clone)]
pub enum ConflictOutcome {
    /// Resolution approved and the cherry-pick continued; carries the new
    /// commit id.
    Resolved(String),
    /// Attempt budget exhausted; the session must block.
    AttemptLimit,
}

/// Run the conflict sub-loop for a conflicted cherry-pick.
///
/// Each iteration invokes the coder to edit and stage the conflicted
/// files (no commit), then the reviewer to gate the staged resolution.
/// An approval runs `cherry-pick --continue`; a rejection burns one
/// attempt. The cherry-pick is left in place on attempt exhaustion so a
/// later run (or a human) can resume.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_conflict<R: GitRunner>(
    git: &Git<R>,
    global: &GlobalStore,
    registry: &ProviderRegistry,
    config: &Config,
    workspace: &Path,
    session_id: &str,
    workstream_id: &str,
    branch: &str,
    position: i64,
    source_sha: &str,
    attempt_limit: u32,
) -> Result<ConflictOutcome> {
    let provider = registry.get(&config.provider.default_provider)?;
    let commit_message = git.commit_message(workspace, source_sha).await?;
    let patch = git.show_patch(workspace, source_sha).await?;

    loop {
        let conflicted = git.conflicted_files(workspace).await?;
        let coder_prompt = conflict_coder_prompt(
            workstream_id,
            branch,
            source_sha,
            &commit_message,
            &conflicted,
            &patch,
        );

        let mut options = InvokeOptions::new(Role::Coder, workspace.to_path_buf());
        options.model.clone_from(&config.provider.coder_model);
        options.timeout = Duration::from_secs(config.provider.timeout_secs);
        let coder_result = provider.invoke(&coder_prompt, &options).await?;
        if let Some(err) = provider.classify_result(&coder_result) {
            if !err.retryable {
                return Err(Error::Provider(err));
            }
            tracing::warn!(
                workstream_id,
                error = %err,
                "transient provider failure during conflict resolution; retrying"
            );
            continue;
        }

        // The coder must leave zero unmerged files behind.
        let remaining = git.conflicted_files(workspace).await?;
        if remaining.is_empty() {
            let staged_diff = git.staged_diff(workspace).await?;
            let staged_files = git.staged_files(workspace).await?;

            let reviewer_prompt = conflict_reviewer_prompt(&staged_files, &staged_diff);
            let mut options = InvokeOptions::new(Role::Reviewer, workspace.to_path_buf());
            options.model.clone_from(&config.provider.reviewer_model);
            options.timeout = Duration::from_secs(config.provider.timeout_secs);
            let review_result = provider.invoke(&reviewer_prompt, &options).await?;
            if let Some(err) = provider.classify_result(&review_result) {
                if !err.retryable {
                    return Err(Error::Provider(err));
                }
                tracing::warn!(
                    workstream_id,
                    error = %err,
                    "transient provider failure during conflict review; retrying"
                );
                continue;
            }

            let verdict = parse_review_decision(&review_result.stdout);
            if verdict.approve {
                git.cherry_pick_continue(workspace).await?;
                let applied_sha = git.head_sha(workspace).await?;
                global
                    .record_progress(&MergeProgress {
                        session_id: session_id.to_string(),
                        workstream_id: workstream_id.to_string(),
                        position,
                        source_sha: source_sha.to_string(),
                        status: ProgressStatus::Applied,
                        applied_sha: Some(applied_sha.clone()),
                        conflict_task_id: None,
                        notes: Some(verdict.notes),
                    })
                    .await?;
                tracing::info!(
                    workstream_id,
                    position,
                    source_sha,
                    applied_sha = %applied_sha,
                    "conflict resolved and applied"
                );
                return Ok(ConflictOutcome::Resolved(applied_sha));
            }

            // Rejected: checkpoint the conflict with the feedback.
            let conflict_task_id = Uuid::new_v4().to_string();
            global
                .record_progress(&MergeProgress {
                    session_id: session_id.to_string(),
                    workstream_id: workstream_id.to_string(),
                    position,
                    source_sha: source_sha.to_string(),
                    status: ProgressStatus::Conflict,
                    applied_sha: None,
                    conflict_task_id: Some(conflict_task_id),
                    notes: Some(verdict.notes),
                })
                .await?;
        } else {
            tracing::warn!(
                workstream_id,
                position,
                remaining = remaining.len(),
                "coder left unmerged files; burning an attempt"
            );
            global
                .record_progress(&MergeProgress {
                    session_id: session_id.to_string(),
                    workstream_id: workstream_id.to_string(),
                    position,
                    source_sha: source_sha.to_string(),
                    status: ProgressStatus::Conflict,
                    applied_sha: None,
                    conflict_task_id: None,
                    notes: Some(format!("{} files still unmerged", remaining.len())),
                })
                .await?;
        }

        let attempts = global.bump_conflict_attempts(workstream_id).await?;
        if attempts >= i64::from(attempt_limit) {
            tracing::error!(
                workstream_id,
                position,
                attempts,
                "conflict attempt limit reached"
            );
            return Ok(ConflictOutcome::AttemptLimit);
        }
    }
}
