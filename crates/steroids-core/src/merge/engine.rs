//! The merge engine procedure: lock, seal, cherry-pick, validate, push.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::conflict::{resolve_conflict, ConflictOutcome};
use super::{MergeOptions, MergeOutcome};
use crate::config::Config;
use crate::git::{CherryPickOutcome, Git, GitRunner};
use crate::global::{GlobalStore, MergeProgress, Workstream, WorkstreamSeal};
use crate::provider::ProviderRegistry;
use crate::types::{ProgressStatus, SessionStatus};
use crate::workspace;
use crate::{Error, Result};

/// Integrates workstream branches into mainline via cherry-pick.
///
/// Every step checkpoints into the merge-progress table, so a crashed run
/// re-executed with the same session id resumes where it stopped.
pub struct MergeEngine<'a, R: GitRunner> {
    global: &'a GlobalStore,
    git: Git<R>,
    registry: &'a ProviderRegistry,
    config: &'a Config,
    project_root: PathBuf,
    workspace_root: PathBuf,
}

impl<'a, R: GitRunner> MergeEngine<'a, R> {
    /// Build a merge engine.
    #[must_use]
    pub fn new(
        global: &'a GlobalStore,
        git: Git<R>,
        registry: &'a ProviderRegistry,
        config: &'a Config,
        project_root: PathBuf,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            global,
            git,
            registry,
            config,
            project_root,
            workspace_root,
        }
    }

    /// Run the merge procedure.
    ///
    /// Gated failures (validation, conflict limit, push) finalize the
    /// session status and come back as an unsuccessful [`MergeOutcome`];
    /// precondition and lease violations abort with an error and leave
    /// the session resumable.
    pub async fn run(&self, options: &MergeOptions) -> Result<MergeOutcome> {
        let lock_timeout = chrono::Duration::from_std(options.lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(120));

        // Acquire the merge lock; the epoch fences every subsequent
        // mutation.
        let epoch = self
            .global
            .acquire_merge_lock(&options.session_id, &options.runner_id, lock_timeout)
            .await?;

        self.global
            .set_session_status(&options.session_id, SessionStatus::Merging)
            .await?;

        let heartbeat = HeartbeatTask::spawn(
            self.global.clone(),
            options.session_id.clone(),
            options.runner_id.clone(),
            epoch,
            options.heartbeat_interval,
            lock_timeout,
        );

        let result = self.run_locked(options, epoch, lock_timeout).await;
        heartbeat.stop().await;

        // Best-effort release; an expired or taken-over lock is fine to
        // leave behind.
        let _ = self
            .global
            .release_merge_lock(&options.session_id, &options.runner_id, epoch)
            .await;

        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_locked(
        &self,
        options: &MergeOptions,
        epoch: i64,
        lock_timeout: chrono::Duration,
    ) -> Result<MergeOutcome> {
        // Integration workspace.
        let workspace_dir = self.integration_workspace(options).await?;

        // Working-tree sanity.
        let resuming_dirty = if self.git.is_dirty(&workspace_dir).await? {
            if self.git.cherry_pick_in_progress(&workspace_dir).await? {
                true
            } else {
                return Err(Error::DirtyWorktree(workspace_dir.display().to_string()));
            }
        } else {
            false
        };

        // Fetch workstream branches and seal commit lists.
        let workstreams = self.seal_workstreams(options).await?;

        // Fast-forward mainline unless resuming mid-pick.
        if !resuming_dirty {
            self.git.pull_ff_only(&workspace_dir).await?;
        }

        let mut outcome = MergeOutcome {
            success: false,
            completed_commits: 0,
            conflicts: 0,
            skipped_commits: 0,
            errors: Vec::new(),
            validation_escalation_id: None,
            session_status: SessionStatus::Merging,
        };

        // Cherry-pick loop in completion order.
        for workstream in &workstreams {
            for (position, source_sha) in workstream.sealed_commits.iter().enumerate() {
                let position = i64::try_from(position).unwrap_or(i64::MAX);
                if !self
                    .apply_commit(
                        options,
                        &workspace_dir,
                        workstream,
                        position,
                        source_sha,
                        &mut outcome,
                    )
                    .await?
                {
                    // Session blocked; outcome already finalized.
                    return Ok(outcome);
                }

                // Heartbeat under the fence after every commit.
                self.global
                    .heartbeat_merge_lock(
                        &options.session_id,
                        &options.runner_id,
                        epoch,
                        lock_timeout,
                    )
                    .await?;
            }
        }

        // Validation gate.
        if let Some(command) = &options.validation_command {
            let gate = workspace::run_shell(
                &workspace_dir,
                command,
                workspace::VALIDATION_OUTPUT_CAP,
            )
            .await?;
            if !gate.success() {
                let message = if gate.truncated {
                    format!("validation output exceeded buffer (ENOBUFS): `{command}`")
                } else {
                    format!("validation command `{command}` exited {}", gate.status)
                };
                let escalation_id = self
                    .global
                    .record_validation_escalation(
                        &options.session_id,
                        &self.project_root.display().to_string(),
                        &workspace_dir.display().to_string(),
                        command,
                        &message,
                        &gate.stdout,
                        &gate.stderr,
                    )
                    .await?;
                self.global
                    .set_session_status(&options.session_id, SessionStatus::BlockedValidation)
                    .await?;
                tracing::error!(
                    session_id = %options.session_id,
                    escalation_id = %escalation_id,
                    workspace = %workspace_dir.display(),
                    "validation gate failed; workspace preserved"
                );
                outcome.errors.push("Validation failed.".into());
                outcome.validation_escalation_id = Some(escalation_id);
                outcome.session_status = SessionStatus::BlockedValidation;
                return Ok(outcome);
            }
        }

        // Push mainline.
        if let Err(err) = self
            .git
            .push(&workspace_dir, &options.remote, &options.main_branch)
            .await
        {
            tracing::error!(session_id = %options.session_id, error = %err, "push failed");
            self.global
                .set_session_status(&options.session_id, SessionStatus::Failed)
                .await?;
            outcome
                .errors
                .push(format!("Push to {} failed.", options.main_branch));
            outcome.session_status = SessionStatus::Failed;
            return Ok(outcome);
        }

        // Cleanup: delete merged branches, prune, reap workspaces.
        for workstream in &workstreams {
            let deleted = self
                .git
                .push_delete(&workspace_dir, &options.remote, &workstream.branch)
                .await
                .unwrap_or(false);
            if !deleted {
                tracing::warn!(branch = %workstream.branch, "remote branch delete failed");
            }
        }
        self.git
            .remote_prune(&workspace_dir, &options.remote)
            .await?;
        if options.cleanup_workspaces {
            for workstream in &workstreams {
                let path = PathBuf::from(&workstream.workspace_path);
                let _ = workspace::remove_workspace(
                    &self.workspace_root,
                    &self.project_root,
                    &path,
                )
                .await?;
            }
            let _ = workspace::remove_workspace(
                &self.workspace_root,
                &self.project_root,
                &workspace_dir,
            )
            .await?;
        }

        // Terminal session status.
        if options.complete_session {
            self.global
                .set_session_status(&options.session_id, SessionStatus::Completed)
                .await?;
            self.global
                .resolve_session_escalations(&options.session_id)
                .await?;
            outcome.session_status = SessionStatus::Completed;
        } else {
            self.global
                .set_session_status(&options.session_id, SessionStatus::Running)
                .await?;
            outcome.session_status = SessionStatus::Running;
        }

        outcome.success = true;
        Ok(outcome)
    }

    /// Apply (or skip) one sealed commit. Returns `false` when the session
    /// blocked and the run must stop.
    async fn apply_commit(
        &self,
        options: &MergeOptions,
        workspace_dir: &Path,
        workstream: &Workstream,
        position: i64,
        source_sha: &str,
        outcome: &mut MergeOutcome,
    ) -> Result<bool> {
        let prior = self
            .global
            .get_progress(&options.session_id, &workstream.id, position)
            .await?;

        if let Some(row) = prior {
            match row.status {
                ProgressStatus::Applied => {
                    if let Some(applied) = &row.applied_sha {
                        if self.git.is_integrated(workspace_dir, applied).await? {
                            outcome.completed_commits += 1;
                            return Ok(true);
                        }
                    }
                    // Rollback detected: the applied commit vanished from
                    // the branch. Clear and re-apply.
                    tracing::warn!(
                        workstream_id = %workstream.id,
                        position,
                        "applied commit no longer integrated; retrying"
                    );
                    self.global
                        .clear_progress(&options.session_id, &workstream.id, position)
                        .await?;
                }
                ProgressStatus::Skipped if row.source_sha == source_sha => {
                    outcome.skipped_commits += 1;
                    return Ok(true);
                }
                ProgressStatus::Skipped => {
                    self.global
                        .clear_progress(&options.session_id, &workstream.id, position)
                        .await?;
                }
                ProgressStatus::Conflict => {
                    if row.source_sha == source_sha
                        && self.git.cherry_pick_in_progress(workspace_dir).await?
                    {
                        // Resume the resolution loop in place.
                        return self
                            .run_conflict_loop(
                                options,
                                workspace_dir,
                                workstream,
                                position,
                                source_sha,
                                outcome,
                            )
                            .await;
                    }
                    self.global
                        .clear_progress(&options.session_id, &workstream.id, position)
                        .await?;
                }
            }
        }

        match self.git.cherry_pick(workspace_dir, source_sha).await? {
            CherryPickOutcome::Applied => {
                let applied_sha = self.git.head_sha(workspace_dir).await?;
                self.global
                    .record_progress(&MergeProgress {
                        session_id: options.session_id.clone(),
                        workstream_id: workstream.id.clone(),
                        position,
                        source_sha: source_sha.to_string(),
                        status: ProgressStatus::Applied,
                        applied_sha: Some(applied_sha),
                        conflict_task_id: None,
                        notes: None,
                    })
                    .await?;
                outcome.completed_commits += 1;
                Ok(true)
            }
            CherryPickOutcome::Empty => {
                self.global
                    .record_progress(&MergeProgress {
                        session_id: options.session_id.clone(),
                        workstream_id: workstream.id.clone(),
                        position,
                        source_sha: source_sha.to_string(),
                        status: ProgressStatus::Skipped,
                        applied_sha: None,
                        conflict_task_id: None,
                        notes: Some("empty cherry-pick; already integrated".into()),
                    })
                    .await?;
                outcome.skipped_commits += 1;
                Ok(true)
            }
            CherryPickOutcome::Conflict => {
                self.run_conflict_loop(
                    options,
                    workspace_dir,
                    workstream,
                    position,
                    source_sha,
                    outcome,
                )
                .await
            }
        }
    }

    async fn run_conflict_loop(
        &self,
        options: &MergeOptions,
        workspace_dir: &Path,
        workstream: &Workstream,
        position: i64,
        source_sha: &str,
        outcome: &mut MergeOutcome,
    ) -> Result<bool> {
        let resolution = resolve_conflict(
            &self.git,
            self.global,
            self.registry,
            self.config,
            workspace_dir,
            &options.session_id,
            &workstream.id,
            &workstream.branch,
            position,
            source_sha,
            self.config.merge.conflict_attempt_limit,
        )
        .await?;

        match resolution {
            ConflictOutcome::Resolved(_) => {
                outcome.completed_commits += 1;
                outcome.conflicts += 1;
                Ok(true)
            }
            ConflictOutcome::AttemptLimit => {
                self.global
                    .set_session_status(&options.session_id, SessionStatus::BlockedConflict)
                    .await?;
                outcome
                    .errors
                    .push(format!("Conflict attempt limit reached for {source_sha}."));
                outcome.session_status = SessionStatus::BlockedConflict;
                Ok(false)
            }
        }
    }

    /// Reuse or create the integration workspace.
    async fn integration_workspace(&self, options: &MergeOptions) -> Result<PathBuf> {
        if let Some(existing) = &options.integration_workspace {
            if existing.exists() {
                return Ok(existing.clone());
            }
        }
        let branch = options.integration_branch_name();
        let prefix: String = options.session_id.chars().take(8).collect();
        let dir = crate::paths::workstream_workspace_dir(
            &self.workspace_root,
            &self.project_root,
            &format!("integration-{prefix}"),
        )?;
        workspace::create_clone(&self.git, &self.project_root, &dir, &branch).await?;
        Ok(dir)
    }

    /// Fetch each workstream branch and seal commit lists in a
    /// single fenced transaction. Already-sealed workstreams are verified
    /// against the remote instead: a moved head aborts the merge.
    async fn seal_workstreams(&self, options: &MergeOptions) -> Result<Vec<Workstream>> {
        let workspace_dir = match &options.integration_workspace {
            Some(dir) if dir.exists() => dir.clone(),
            _ => {
                let prefix: String = options.session_id.chars().take(8).collect();
                crate::paths::workstream_workspace_dir(
                    &self.workspace_root,
                    &self.project_root,
                    &format!("integration-{prefix}"),
                )?
            }
        };

        let mut seals = Vec::new();
        let mut sealed: Vec<Workstream> = Vec::new();

        for (order, workstream_id) in options.workstream_ids.iter().enumerate() {
            let workstream = self.global.get_workstream(workstream_id).await?;
            let remote_ref = format!("{}/{}", options.remote, workstream.branch);

            let fetched = self
                .git
                .fetch_prune(&workspace_dir, &options.remote, Some(&workstream.branch))
                .await?;

            if let Some(sealed_head) = &workstream.sealed_head {
                // Resume: the seal is immutable. A head that moved since
                // sealing is a safety violation.
                if fetched {
                    if let Ok(current) = self.git.rev_parse(&workspace_dir, &remote_ref).await {
                        if &current != sealed_head {
                            return Err(Error::SealedHeadMoved {
                                workstream_id: workstream.id.clone(),
                                sealed: sealed_head.clone(),
                                remote: current,
                            });
                        }
                    }
                }
                sealed.push(workstream);
                continue;
            }

            if !fetched {
                return Err(Error::RemoteBranchMissing(remote_ref));
            }

            let commits = self
                .git
                .commit_list(&workspace_dir, &options.main_branch, &remote_ref)
                .await?;
            let head = self.git.rev_parse(&workspace_dir, &remote_ref).await?;
            let base = self
                .git
                .merge_base(
                    &workspace_dir,
                    &format!("{}/{}", options.remote, options.main_branch),
                    &remote_ref,
                )
                .await?;

            seals.push(WorkstreamSeal {
                workstream_id: workstream.id.clone(),
                claim_generation: workstream.claim_generation,
                base,
                head,
                commits,
                completion_order: i64::try_from(order).unwrap_or(i64::MAX),
            });
            sealed.push(workstream);
        }

        if !seals.is_empty() {
            self.global.seal_workstreams(&seals).await?;
            // Re-read so sealed_commits reflect the transaction.
            let mut refreshed = Vec::new();
            for workstream in sealed {
                refreshed.push(self.global.get_workstream(&workstream.id).await?);
            }
            return Ok(refreshed);
        }
        Ok(sealed)
    }
}

/// Background heartbeat refreshing the merge lock while provider
/// invocations run. Cancelled on merge completion.
struct HeartbeatTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    fn spawn(
        global: GlobalStore,
        session_id: String,
        runner_id: String,
        epoch: i64,
        interval: std::time::Duration,
        lock_timeout: chrono::Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, the lock was
            // just acquired.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = global
                            .heartbeat_merge_lock(&session_id, &runner_id, epoch, lock_timeout)
                            .await
                        {
                            tracing::warn!(
                                session_id = %session_id,
                                error = %e,
                                "merge lock heartbeat failed; stopping heartbeat task"
                            );
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        Self { stop_tx, handle }
    }

    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
