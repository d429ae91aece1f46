//! Per-task orchestration: the coder/reviewer state machine.
//!
//! One call to [`Orchestrator::run_next`] advances at most one task by one
//! phase. The host loop re-invokes between phases, which is also where
//! cooperative stop requests and pause alerts are honored.

mod coordinator;
mod decision;
mod prompts;

pub use coordinator::{
    is_checkpoint, parse_coordinator_output, CoordinatorAction, CoordinatorGuidance,
    COORDINATOR_CHECKPOINTS, REJECTION_LIMIT,
};
pub use decision::{
    classify_coder_outcome, classify_review_output, parse_review_decision, CoderAction,
    CoderDecision, CoderErrorKind, ConflictVerdict, GitDelta, ReviewAction, ReviewDecision,
};
pub use prompts::{
    coder_prompt, conflict_coder_prompt, conflict_reviewer_prompt, coordinator_prompt,
    file_scope_hints, reviewer_prompt, truncate_chars, AGENTS_MD_LIMIT, SPEC_LIMIT,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Config;
use crate::git::{Git, GitRunner};
use crate::global::GlobalStore;
use crate::paths::ProjectPaths;
use crate::provider::{
    ErrorKind, InvokeOptions, InvokeResult, PauseAlert, PauseResolution, ProviderError,
    ProviderRegistry,
};
use crate::store::{NextTask, Task, TaskStore};
use crate::types::{DisputeKind, InvocationStatus, Role, TaskStatus};
use crate::{Error, Result};

/// Actor string for engine-driven transitions.
const ORCHESTRATOR_ACTOR: &str = "orchestrator";

/// What one `run_next` call did.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// A task advanced one phase.
    Worked {
        /// The task.
        task_id: String,
        /// Its status after the phase.
        status: TaskStatus,
    },
    /// A transient provider failure; run the same task again after the
    /// suggested delay.
    Retry {
        /// The task.
        task_id: String,
        /// Suggested delay in seconds.
        retry_after: Option<u64>,
    },
    /// No eligible work.
    Idle,
    /// Credit exhaustion; the host loop must resolve.
    Pause(PauseAlert),
}

/// Summary returned by [`Orchestrator::run_loop`].
#[derive(Debug, Clone, Default)]
pub struct LoopSummary {
    /// Phases executed.
    pub phases: u64,
    /// Tasks that reached `completed`.
    pub completed: u64,
    /// Tasks that reached `failed`.
    pub failed: u64,
    /// Set when the loop ended on a pause alert.
    pub paused: Option<PauseAlert>,
    /// How the pause was resolved, when one happened.
    pub pause_resolution: Option<PauseResolution>,
}

/// Drives tasks through the coder/reviewer lifecycle.
pub struct Orchestrator<R: GitRunner> {
    project_root: PathBuf,
    paths: ProjectPaths,
    store: TaskStore,
    git: Git<R>,
    registry: ProviderRegistry,
    config: Config,
    guidance: Mutex<HashMap<String, CoordinatorGuidance>>,
}

impl<R: GitRunner> Orchestrator<R> {
    /// Build an orchestrator for a project.
    #[must_use]
    pub fn new(
        project_root: PathBuf,
        store: TaskStore,
        git: Git<R>,
        registry: ProviderRegistry,
        config: Config,
    ) -> Self {
        let paths = ProjectPaths::new(&project_root);
        Self {
            project_root,
            paths,
            store,
            git,
            registry,
            config,
            guidance: Mutex::new(HashMap::new()),
        }
    }

    /// The task store.
    #[must_use]
    pub const fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Advance the highest-precedence eligible task by one phase.
    pub async fn run_next(&self, section: Option<&str>) -> Result<TaskOutcome> {
        let task = match self.store.next_task(section).await? {
            NextTask::Task(task) => task,
            NextTask::Idle => return Ok(TaskOutcome::Idle),
        };

        match task.status {
            TaskStatus::Pending => {
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::InProgress,
                        ORCHESTRATOR_ACTOR,
                        None,
                        None,
                    )
                    .await?;
                self.coder_phase(task).await
            }
            TaskStatus::InProgress => self.coder_phase(task).await,
            TaskStatus::Review => self.reviewer_phase(task).await,
            other => Err(Error::Validation(format!(
                "next_task returned terminal task {} in {}",
                task.id,
                other.as_str()
            ))),
        }
    }

    /// Run phases until idle, stopped, or paused.
    pub async fn run_loop<F>(
        &self,
        global: &GlobalStore,
        runner_id: &str,
        once: bool,
        section: Option<&str>,
        on_pause: F,
    ) -> Result<LoopSummary>
    where
        F: Fn(&PauseAlert) -> PauseResolution,
    {
        let mut summary = LoopSummary::default();
        loop {
            if global.runner_stop_requested(runner_id).await? {
                tracing::info!(runner_id, "stop requested; leaving task loop");
                break;
            }
            global.heartbeat_runner(runner_id).await?;

            match self.run_next(section).await? {
                TaskOutcome::Idle => break,
                TaskOutcome::Retry {
                    task_id,
                    retry_after,
                } => {
                    summary.phases += 1;
                    let delay = retry_after.unwrap_or(5);
                    tracing::warn!(task_id = %task_id, delay, "transient provider failure; backing off");
                    if once {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                TaskOutcome::Worked { task_id, status } => {
                    summary.phases += 1;
                    global.set_runner_task(runner_id, Some(&task_id)).await?;
                    match status {
                        TaskStatus::Completed => summary.completed += 1,
                        TaskStatus::Failed => summary.failed += 1,
                        _ => {}
                    }
                    if once && status.is_terminal() {
                        break;
                    }
                }
                TaskOutcome::Pause(alert) => {
                    // In --once mode a pause always resolves as an
                    // immediate failure.
                    let resolution = if once {
                        PauseResolution::ImmediateFail
                    } else {
                        on_pause(&alert)
                    };
                    summary.paused = Some(alert);
                    summary.pause_resolution = Some(resolution);
                    match resolution {
                        PauseResolution::ConfigChanged => continue,
                        PauseResolution::Stopped | PauseResolution::ImmediateFail => break,
                    }
                }
            }
        }
        global.set_runner_task(runner_id, None).await?;
        Ok(summary)
    }

    fn guidance_for(&self, task_id: &str) -> Option<String> {
        self.guidance
            .lock()
            .ok()
            .and_then(|map| map.get(task_id).map(|g| g.guidance.clone()))
    }

    async fn load_agents_md(&self) -> Option<String> {
        tokio::fs::read_to_string(self.project_root.join("AGENTS.md"))
            .await
            .ok()
    }

    async fn load_spec(&self, task: &Task) -> Option<String> {
        let rel = task.spec_path.as_deref()?;
        let path = self.project_root.join(rel);
        tokio::fs::read_to_string(path).await.ok()
    }

    /// Invoke a role's provider with full audit plumbing.
    async fn invoke_role(
        &self,
        role: Role,
        prompt: &str,
        task_id: Option<&str>,
    ) -> Result<(InvokeResult, Option<ProviderError>, String, Option<String>)> {
        let provider = self.registry.get(&self.config.provider.default_provider)?;
        let model = match role {
            Role::Coder => self.config.provider.coder_model.clone(),
            Role::Reviewer => self.config.provider.reviewer_model.clone(),
            Role::Orchestrator => self.config.provider.orchestrator_model.clone(),
        };

        let invocation_id = self
            .store
            .start_invocation(task_id, role, provider.name(), model.as_deref())
            .await?;

        let mut options = InvokeOptions::new(role, self.project_root.clone());
        options.model.clone_from(&model);
        options.timeout = Duration::from_secs(self.config.provider.timeout_secs);
        options.activity_log = Some(self.paths.invocation_log(&invocation_id));
        options.invocation_id = Some(invocation_id.clone());
        options.sandbox_home = self.config.provider.sandbox_home;

        let result = provider.invoke(prompt, &options).await?;
        let classified = provider.classify_result(&result);

        let status = if result.timed_out {
            InvocationStatus::Timeout
        } else if result.success {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };
        self.store
            .complete_invocation(
                &invocation_id,
                status,
                Some(&result.stdout),
                (!result.stderr.is_empty()).then_some(result.stderr.as_str()),
                result.success,
                result.timed_out,
            )
            .await?;

        Ok((result, classified, provider.name().to_string(), model))
    }

    fn pause_alert(
        provider: &str,
        model: Option<String>,
        role: Role,
        err: &ProviderError,
    ) -> PauseAlert {
        PauseAlert {
            provider: provider.to_string(),
            model,
            role,
            message: err.message.clone(),
        }
    }

    async fn coder_phase(&self, task: Task) -> Result<TaskOutcome> {
        let rejections = self.store.rejection_history(&task.id).await?;
        let guidance = self.guidance_for(&task.id);
        let agents_md = self.load_agents_md().await;
        let spec_text = self.load_spec(&task).await;

        let prompt = coder_prompt(
            &task,
            &rejections,
            guidance.as_deref(),
            agents_md.as_deref(),
            spec_text.as_deref(),
        );

        let head_before = self.git.head_sha(&self.project_root).await.ok();

        let (result, classified, provider, model) =
            self.invoke_role(Role::Coder, &prompt, Some(&task.id)).await?;

        if let Some(err) = &classified {
            if err.kind == ErrorKind::CreditExhaustion {
                return Ok(TaskOutcome::Pause(Self::pause_alert(
                    &provider,
                    model,
                    Role::Coder,
                    err,
                )));
            }
        }

        let new_commits = match &head_before {
            Some(head) => self
                .git
                .commit_list(&self.project_root, head, "HEAD")
                .await
                .map(|l| l.len())
                .unwrap_or(0),
            None => self
                .git
                .recent_commits(&self.project_root, 5)
                .await
                .map(|l| l.len())
                .unwrap_or(0),
        };
        let uncommitted_changes = self.git.is_dirty(&self.project_root).await.unwrap_or(false);

        let delta = GitDelta {
            new_commits,
            uncommitted_changes,
        };
        let decision = classify_coder_outcome(&result, delta, classified.as_ref());
        tracing::debug!(
            task_id = %task.id,
            action = ?decision.action,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "coder decision"
        );

        match decision.action {
            CoderAction::Submit => {
                let head = self.git.head_sha(&self.project_root).await.ok();
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::Review,
                        "coder",
                        None,
                        head.as_deref(),
                    )
                    .await?;
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: task.status,
                })
            }
            CoderAction::StageCommitSubmit => {
                self.git.stage_all(&self.project_root).await?;
                self.git
                    .commit(&self.project_root, &format!("feat: {}", task.title))
                    .await?;
                let head = self.git.head_sha(&self.project_root).await.ok();
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::Review,
                        "coder",
                        Some("auto-committed uncommitted changes"),
                        head.as_deref(),
                    )
                    .await?;
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: task.status,
                })
            }
            CoderAction::Retry => Ok(TaskOutcome::Retry {
                task_id: task.id,
                retry_after: classified.and_then(|e| e.retry_after),
            }),
            CoderAction::Error => match decision.error_kind {
                // A timeout never auto-advances status; the task stays
                // in progress for resumption.
                Some(CoderErrorKind::Timeout) => {
                    tracing::warn!(task_id = %task.id, "coder invocation timed out");
                    Ok(TaskOutcome::Worked {
                        task_id: task.id,
                        status: TaskStatus::InProgress,
                    })
                }
                _ => {
                    let notes = format!(
                        "{}; stderr: {}",
                        decision.reasoning,
                        truncate_chars(&result.stderr, 500)
                    );
                    let task = self
                        .store
                        .transition_task(
                            &task.id,
                            TaskStatus::Failed,
                            ORCHESTRATOR_ACTOR,
                            Some(&notes),
                            None,
                        )
                        .await?;
                    Ok(TaskOutcome::Worked {
                        task_id: task.id,
                        status: task.status,
                    })
                }
            },
        }
    }

    async fn reviewer_phase(&self, task: Task) -> Result<TaskOutcome> {
        let spec_text = self.load_spec(&task).await;
        let guidance = self.guidance_for(&task.id);

        let commit_sha = self.git.head_sha(&self.project_root).await?;
        let diff = self.git.show_patch(&self.project_root, &commit_sha).await?;

        let prompt = reviewer_prompt(
            &task,
            spec_text.as_deref(),
            guidance.as_deref(),
            &commit_sha,
            &diff,
        );

        let (result, classified, provider, model) = self
            .invoke_role(Role::Reviewer, &prompt, Some(&task.id))
            .await?;

        if let Some(err) = &classified {
            if err.kind == ErrorKind::CreditExhaustion {
                return Ok(TaskOutcome::Pause(Self::pause_alert(
                    &provider,
                    model,
                    Role::Reviewer,
                    err,
                )));
            }
            if err.retryable {
                return Ok(TaskOutcome::Retry {
                    task_id: task.id,
                    retry_after: err.retry_after,
                });
            }
        }

        let decision = classify_review_output(&result.stdout, task.rejection_count);
        tracing::debug!(
            task_id = %task.id,
            action = ?decision.action,
            confidence = decision.confidence,
            "review decision"
        );

        match decision.action {
            ReviewAction::Approve => {
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::Completed,
                        "reviewer",
                        None,
                        Some(&commit_sha),
                    )
                    .await?;
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: task.status,
                })
            }
            ReviewAction::Reject => self.handle_rejection(task, &decision, &commit_sha).await,
            ReviewAction::Skip => {
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::Skipped,
                        "reviewer",
                        Some("reviewer requested skip"),
                        Some(&commit_sha),
                    )
                    .await?;
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: task.status,
                })
            }
            ReviewAction::Dispute => {
                self.store
                    .create_dispute(
                        &task.id,
                        DisputeKind::Reviewer,
                        Some("reviewer_dispute"),
                        None,
                        Some(&result.stdout),
                        "reviewer",
                    )
                    .await?;
                let task = self
                    .store
                    .transition_task(
                        &task.id,
                        TaskStatus::Disputed,
                        "reviewer",
                        Some("reviewer opened a dispute"),
                        Some(&commit_sha),
                    )
                    .await?;
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: task.status,
                })
            }
            // Stay in review; the next loop iteration re-invokes the
            // reviewer.
            ReviewAction::Ambiguous => {
                tracing::warn!(task_id = %task.id, "ambiguous review output; retrying reviewer");
                Ok(TaskOutcome::Worked {
                    task_id: task.id,
                    status: TaskStatus::Review,
                })
            }
        }
    }

    async fn handle_rejection(
        &self,
        task: Task,
        decision: &ReviewDecision,
        commit_sha: &str,
    ) -> Result<TaskOutcome> {
        let notes = if decision.feedback.is_empty() {
            "rejected without specific feedback".to_string()
        } else {
            decision.feedback.join("\n")
        };

        let task = self
            .store
            .transition_task(
                &task.id,
                TaskStatus::InProgress,
                "reviewer",
                Some(&notes),
                Some(commit_sha),
            )
            .await?;

        if task.rejection_count >= REJECTION_LIMIT {
            self.store
                .create_dispute(
                    &task.id,
                    DisputeKind::System,
                    Some("rejection_limit"),
                    None,
                    Some(&notes),
                    "system",
                )
                .await?;
            let task = self
                .store
                .transition_task(
                    &task.id,
                    TaskStatus::Failed,
                    "system",
                    Some(&format!(
                        "failed after {REJECTION_LIMIT} rejections; system dispute opened"
                    )),
                    None,
                )
                .await?;
            return Ok(TaskOutcome::Worked {
                task_id: task.id,
                status: task.status,
            });
        }

        if is_checkpoint(task.rejection_count) {
            if let Err(e) = self.coordinator_pass(&task).await {
                // Coordinator guidance is best-effort; the reject already
                // landed.
                tracing::warn!(task_id = %task.id, error = %e, "coordinator pass failed");
            }
        }

        Ok(TaskOutcome::Worked {
            task_id: task.id,
            status: task.status,
        })
    }

    async fn coordinator_pass(&self, task: &Task) -> Result<()> {
        let rejections = self.store.rejection_history(&task.id).await?;
        let prompt = coordinator_prompt(task, &rejections);
        let (result, classified, _, _) = self
            .invoke_role(Role::Orchestrator, &prompt, Some(&task.id))
            .await?;

        if let Some(err) = classified {
            return Err(Error::Provider(err));
        }

        let parsed = parse_coordinator_output(&result.stdout);
        tracing::info!(
            task_id = %task.id,
            action = parsed.action.as_str(),
            "coordinator guidance recorded"
        );
        if let Ok(mut map) = self.guidance.lock() {
            map.insert(task.id.clone(), parsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{ScriptedCall, ScriptedGit};
    use crate::provider::Provider;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Provider stub replaying queued results.
    struct StubProvider {
        results: Mutex<Vec<InvokeResult>>,
    }

    impl StubProvider {
        fn new(mut results: Vec<InvokeResult>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
            }
        }

        fn ok(stdout: &str) -> InvokeResult {
            InvokeResult {
                success: true,
                exit_code: 0,
                stdout: stdout.into(),
                stderr: String::new(),
                duration: Duration::from_secs(1),
                timed_out: false,
                session_id: None,
                token_usage: None,
            }
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, _prompt: &str, _options: &InvokeOptions) -> Result<InvokeResult> {
            self.results
                .lock()
                .map_err(|_| Error::Validation("poisoned".into()))?
                .pop()
                .ok_or_else(|| Error::Validation("stub exhausted".into()))
        }

        async fn resume(
            &self,
            _session_id: &str,
            prompt: &str,
            options: &InvokeOptions,
        ) -> Result<InvokeResult> {
            self.invoke(prompt, options).await
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec!["stub-1".into()])
        }

        fn default_model(&self, _role: Role) -> &str {
            "stub-1"
        }

        fn classify_error(&self, exit_code: i32, stderr: &str) -> ProviderError {
            crate::provider::ErrorClassifier::new().classify(exit_code, stderr, "")
        }

        fn classify_result(&self, result: &InvokeResult) -> Option<ProviderError> {
            if result.success {
                None
            } else {
                Some(
                    crate::provider::ErrorClassifier::new().classify(
                        result.exit_code,
                        &result.stderr,
                        &result.stdout,
                    ),
                )
            }
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    async fn orchestrator(
        plan: Vec<ScriptedCall>,
        results: Vec<InvokeResult>,
    ) -> (Orchestrator<ScriptedGit>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store = TaskStore::open_in_memory()
            .await
            .unwrap_or_else(|e| panic!("store: {e}"));
        let git = Git::new(Arc::new(ScriptedGit::new(plan)));
        let mut registry = ProviderRegistry::new("stub");
        registry.register(Arc::new(StubProvider::new(results)));
        let mut config = Config::default();
        config.provider.default_provider = "stub".into();
        let orch = Orchestrator::new(dir.path().to_path_buf(), store, git, registry, config);
        (orch, dir)
    }

    #[tokio::test]
    async fn test_coder_submit_flow() -> Result<()> {
        let plan = vec![
            // head before invocation
            ScriptedCall::ok(&["rev-parse", "HEAD"], "aaa"),
            // commits created during invocation
            ScriptedCall::ok(&["log", "aaa..HEAD", "--format=%H", "--reverse"], "bbb"),
            // working tree clean
            ScriptedCall::ok(&["status", "--porcelain"], ""),
            // head for the audit entry
            ScriptedCall::ok(&["rev-parse", "HEAD"], "bbb"),
        ];
        let (orch, _dir) = orchestrator(plan, vec![StubProvider::ok("implemented")]).await;

        let task = orch.store().create_task("t", None, None, "h").await?;
        match orch.run_next(None).await? {
            TaskOutcome::Worked { task_id, status } => {
                assert_eq!(task_id, task.id);
                assert_eq!(status, TaskStatus::Review);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let task = orch.store().get_task(&task.id).await?;
        assert_eq!(task.status, TaskStatus::Review);
        let invocations = orch.store().list_invocations(&task.id).await?;
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].success);
        Ok(())
    }

    #[tokio::test]
    async fn test_reviewer_approves() -> Result<()> {
        let plan = vec![
            ScriptedCall::ok(&["rev-parse", "HEAD"], "bbb"),
            ScriptedCall::ok(&["show", "bbb"], "diff body"),
        ];
        let (orch, _dir) = orchestrator(plan, vec![StubProvider::ok("APPROVED - solid work")]).await;

        let task = orch.store().create_task("t", None, None, "h").await?;
        orch.store()
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        orch.store()
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;

        match orch.run_next(None).await? {
            TaskOutcome::Worked { status, .. } => assert_eq!(status, TaskStatus::Completed),
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_reviewer_reject_bumps_count() -> Result<()> {
        let plan = vec![
            ScriptedCall::ok(&["rev-parse", "HEAD"], "bbb"),
            ScriptedCall::ok(&["show", "bbb"], "diff body"),
        ];
        let (orch, _dir) = orchestrator(
            plan,
            vec![StubProvider::ok("REJECTED\n- [ ] handle empty input")],
        )
        .await;

        let task = orch.store().create_task("t", None, None, "h").await?;
        orch.store()
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        orch.store()
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;

        match orch.run_next(None).await? {
            TaskOutcome::Worked { status, .. } => assert_eq!(status, TaskStatus::InProgress),
            other => panic!("unexpected outcome {other:?}"),
        }
        let task = orch.store().get_task(&task.id).await?;
        assert_eq!(task.rejection_count, 1);
        assert!(task.notes.unwrap_or_default().contains("handle empty input"));
        Ok(())
    }

    #[tokio::test]
    async fn test_credit_exhaustion_pauses() -> Result<()> {
        let plan = vec![ScriptedCall::ok(&["rev-parse", "HEAD"], "aaa")];
        let failing = InvokeResult {
            success: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: r#"{"error":{"code":"insufficient_quota"}}"#.into(),
            duration: Duration::from_secs(1),
            timed_out: false,
            session_id: None,
            token_usage: None,
        };
        let (orch, _dir) = orchestrator(plan, vec![failing]).await;

        orch.store().create_task("t", None, None, "h").await?;
        match orch.run_next(None).await? {
            TaskOutcome::Pause(alert) => {
                assert_eq!(alert.provider, "stub");
                assert_eq!(alert.role, Role::Coder);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rejection_limit_fails_task_with_system_dispute() -> Result<()> {
        // Reviewer phase on a task already at 14 rejections.
        let plan = vec![
            ScriptedCall::ok(&["rev-parse", "HEAD"], "bbb"),
            ScriptedCall::ok(&["show", "bbb"], "diff body"),
        ];
        let (orch, _dir) = orchestrator(plan, vec![StubProvider::ok("REJECTED again")]).await;

        let task = orch.store().create_task("t", None, None, "h").await?;
        orch.store()
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        // Drive 14 reject rounds through the store directly.
        for _ in 0..14 {
            orch.store()
                .transition_task(&task.id, TaskStatus::Review, "c", None, None)
                .await?;
            orch.store()
                .transition_task(&task.id, TaskStatus::InProgress, "r", Some("no"), None)
                .await?;
        }
        orch.store()
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;

        match orch.run_next(None).await? {
            TaskOutcome::Worked { status, .. } => assert_eq!(status, TaskStatus::Failed),
            other => panic!("unexpected outcome {other:?}"),
        }

        let task = orch.store().get_task(&task.id).await?;
        assert_eq!(task.rejection_count, 15);
        let disputes = orch.store().list_disputes(&task.id).await?;
        assert_eq!(disputes.len(), 1);
        assert_eq!(disputes[0].kind, DisputeKind::System);
        Ok(())
    }
}
