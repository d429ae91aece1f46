//! End-to-end merge engine scenarios driven by a scripted git responder
//! and a scripted provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use steroids_core::config::Config;
use steroids_core::git::{Git, ScriptedCall, ScriptedGit};
use steroids_core::global::{GlobalStore, MergeProgress, WorkstreamSeal};
use steroids_core::merge::{MergeEngine, MergeOptions};
use steroids_core::provider::{
    ErrorClassifier, InvokeOptions, InvokeResult, Provider, ProviderError, ProviderRegistry,
};
use steroids_core::scheduler::partition_components;
use steroids_core::store::Section;
use steroids_core::types::{ProgressStatus, Role, SessionStatus};
use steroids_core::{Error, Result};

/// Provider stub replaying queued stdout payloads.
struct ScriptedProvider {
    outputs: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(mut outputs: Vec<String>) -> Self {
        outputs.reverse();
        Self {
            outputs: Mutex::new(outputs),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, _prompt: &str, _options: &InvokeOptions) -> Result<InvokeResult> {
        let stdout = self
            .outputs
            .lock()
            .map_err(|_| Error::Validation("poisoned".into()))?
            .pop()
            .ok_or_else(|| Error::Validation("scripted provider exhausted".into()))?;
        Ok(InvokeResult {
            success: true,
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration: Duration::from_secs(1),
            timed_out: false,
            session_id: None,
            token_usage: None,
        })
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
        Ok(vec!["scripted-1".into()])
    }

    fn default_model(&self, _role: Role) -> &str {
        "scripted-1"
    }

    fn classify_error(&self, exit_code: i32, stderr: &str) -> ProviderError {
        ErrorClassifier::new().classify(exit_code, stderr, "")
    }

    fn classify_result(&self, result: &InvokeResult) -> Option<ProviderError> {
        if result.success {
            None
        } else {
            Some(ErrorClassifier::new().classify(result.exit_code, &result.stderr, &result.stdout))
        }
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct Fixture {
    global: GlobalStore,
    registry: ProviderRegistry,
    config: Config,
    project: tempfile::TempDir,
    workspace_root: tempfile::TempDir,
    integration: tempfile::TempDir,
    session_id: String,
}

impl Fixture {
    async fn new(provider_outputs: Vec<String>) -> Result<Self> {
        let global = GlobalStore::open_in_memory().await?;
        let project = tempfile::TempDir::new()?;
        let workspace_root = tempfile::TempDir::new()?;
        let integration = tempfile::TempDir::new()?;

        let session = global
            .create_session(&project.path().display().to_string(), "repo-1")
            .await?;
        global
            .insert_workstream(
                "alpha",
                &session.id,
                "steroids/ws-alpha",
                &["sec-1".to_string()],
                &workspace_root.path().join("clone-alpha").display().to_string(),
            )
            .await?;

        let mut registry = ProviderRegistry::new("scripted");
        registry.register(Arc::new(ScriptedProvider::new(provider_outputs)));
        let mut config = Config::default();
        config.provider.default_provider = "scripted".into();

        Ok(Self {
            global,
            registry,
            config,
            project,
            workspace_root,
            integration,
            session_id: session.id,
        })
    }

    fn options(&self) -> MergeOptions {
        let mut options = MergeOptions::new(
            self.session_id.clone(),
            "runner-1".into(),
            vec!["alpha".into()],
        );
        options.integration_workspace = Some(self.integration.path().to_path_buf());
        options
    }

    fn engine<'a>(&'a self, git: &Git<Arc<ScriptedGit>>) -> MergeEngine<'a, Arc<ScriptedGit>> {
        MergeEngine::new(
            &self.global,
            git.clone(),
            &self.registry,
            &self.config,
            self.project.path().to_path_buf(),
            self.workspace_root.path().to_path_buf(),
        )
    }

    async fn seal_alpha(&self, commits: &[&str], head: &str, base: &str) -> Result<()> {
        self.global
            .seal_workstreams(&[WorkstreamSeal {
                workstream_id: "alpha".into(),
                claim_generation: 0,
                base: base.into(),
                head: head.into(),
                commits: commits.iter().map(ToString::to_string).collect(),
                completion_order: 0,
            }])
            .await
    }
}

fn scripted(plan: Vec<ScriptedCall>) -> (Git<Arc<ScriptedGit>>, Arc<ScriptedGit>) {
    let runner = Arc::new(ScriptedGit::new(plan));
    (Git::new(Arc::new(Arc::clone(&runner))), runner)
}

/// S1: happy path, one workstream, two commits.
#[tokio::test]
async fn s1_happy_path_two_commits() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(
            &["log", "main..origin/steroids/ws-alpha", "--format=%H", "--reverse"],
            "A\nB",
        ),
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(
            &["merge-base", "origin/main", "origin/steroids/ws-alpha"],
            "B0",
        ),
        ScriptedCall::ok(&["pull", "--ff-only"], "Already up to date."),
        ScriptedCall::ok(&["cherry-pick", "A"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "A1"),
        ScriptedCall::ok(&["cherry-pick", "B"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "B1"),
        ScriptedCall::ok(&["push", "origin", "main"], ""),
        ScriptedCall::ok(&["push", "origin", "--delete", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(&["remote", "prune", "origin"], ""),
    ];
    let (git, runner) = scripted(plan);

    let outcome = fixture.engine(&git).run(&fixture.options()).await?;
    assert!(outcome.success);
    assert_eq!(outcome.completed_commits, 2);
    assert_eq!(outcome.conflicts, 0);
    assert!(outcome.errors.is_empty());
    assert_eq!(runner.remaining(), 0);

    let session = fixture.global.get_session(&fixture.session_id).await?;
    assert_eq!(session.status, SessionStatus::Completed);

    let rows = fixture
        .global
        .list_progress(&fixture.session_id, "alpha")
        .await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == ProgressStatus::Applied));
    assert_eq!(rows[0].applied_sha.as_deref(), Some("A1"));
    assert_eq!(rows[1].applied_sha.as_deref(), Some("B1"));

    // The sealed list was persisted under the lease fence.
    let ws = fixture.global.get_workstream("alpha").await?;
    assert_eq!(ws.sealed_head.as_deref(), Some("H"));
    assert_eq!(ws.sealed_base.as_deref(), Some("B0"));
    assert_eq!(ws.sealed_commits, vec!["A".to_string(), "B".to_string()]);
    Ok(())
}

/// S2: resume after a crash with position 0 already applied.
#[tokio::test]
async fn s2_resume_skips_applied_commit() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    fixture.seal_alpha(&["A", "B"], "H", "B0").await?;
    fixture
        .global
        .record_progress(&MergeProgress {
            session_id: fixture.session_id.clone(),
            workstream_id: "alpha".into(),
            position: 0,
            source_sha: "A".into(),
            status: ProgressStatus::Applied,
            applied_sha: Some("A1".into()),
            conflict_task_id: None,
            notes: None,
        })
        .await?;

    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        // Sealed head still matches the remote.
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(&["pull", "--ff-only"], ""),
        // Position 0 is already integrated.
        ScriptedCall::ok(&["branch", "--contains", "A1"], "* steroids/integration-x"),
        ScriptedCall::ok(&["cherry-pick", "B"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "B1"),
        ScriptedCall::ok(&["push", "origin", "main"], ""),
        ScriptedCall::ok(&["push", "origin", "--delete", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(&["remote", "prune", "origin"], ""),
    ];
    let (git, runner) = scripted(plan);

    let outcome = fixture.engine(&git).run(&fixture.options()).await?;
    assert!(outcome.success);
    assert_eq!(outcome.completed_commits, 2);
    assert_eq!(runner.remaining(), 0);

    let rows = fixture
        .global
        .list_progress(&fixture.session_id, "alpha")
        .await?;
    assert_eq!(rows.len(), 2);
    Ok(())
}

/// S3: conflict resolved by the coder and approved by the reviewer.
#[tokio::test]
async fn s3_conflict_resolved_and_approved() -> Result<()> {
    let fixture = Fixture::new(vec![
        "resolved the markers and staged the files".into(),
        "APPROVE - conflict resolved".into(),
    ])
    .await?;

    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(
            &["log", "main..origin/steroids/ws-alpha", "--format=%H", "--reverse"],
            "C",
        ),
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(
            &["merge-base", "origin/main", "origin/steroids/ws-alpha"],
            "B0",
        ),
        ScriptedCall::ok(&["pull", "--ff-only"], ""),
        ScriptedCall::fail(
            &["cherry-pick", "C"],
            1,
            "error: could not apply C... CONFLICT (content): Merge conflict in src/x.rs",
        ),
        ScriptedCall::ok(&["show", "-s", "--format=%B", "C"], "feat: add x"),
        ScriptedCall::ok(&["show", "C"], "patch body"),
        ScriptedCall::ok(&["diff", "--name-only", "--diff-filter=U"], "src/x.rs"),
        // After the coder runs, nothing is unmerged and the fix is staged.
        ScriptedCall::ok(&["diff", "--name-only", "--diff-filter=U"], ""),
        ScriptedCall::ok(&["diff", "--cached"], "resolved diff"),
        ScriptedCall::ok(&["diff", "--cached", "--name-only"], "src/x.rs"),
        ScriptedCall::ok(
            &["-c", "core.editor=true", "cherry-pick", "--continue"],
            "",
        ),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "C1"),
        ScriptedCall::ok(&["push", "origin", "main"], ""),
        ScriptedCall::ok(&["push", "origin", "--delete", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(&["remote", "prune", "origin"], ""),
    ];
    let (git, runner) = scripted(plan);

    let outcome = fixture.engine(&git).run(&fixture.options()).await?;
    assert!(outcome.success);
    assert_eq!(outcome.conflicts, 1);
    assert_eq!(outcome.completed_commits, 1);
    assert_eq!(runner.remaining(), 0);

    let row = fixture
        .global
        .get_progress(&fixture.session_id, "alpha", 0)
        .await?
        .ok_or_else(|| Error::Validation("missing progress row".into()))?;
    assert_eq!(row.status, ProgressStatus::Applied);
    assert_eq!(row.applied_sha.as_deref(), Some("C1"));
    Ok(())
}

/// S4: push failure marks the session failed.
#[tokio::test]
async fn s4_push_failure() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(
            &["log", "main..origin/steroids/ws-alpha", "--format=%H", "--reverse"],
            "A",
        ),
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(
            &["merge-base", "origin/main", "origin/steroids/ws-alpha"],
            "B0",
        ),
        ScriptedCall::ok(&["pull", "--ff-only"], ""),
        ScriptedCall::ok(&["cherry-pick", "A"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "A1"),
        // Push reports an error marker on a zero exit.
        ScriptedCall::ok(&["push", "origin", "main"], "error: failed to push some refs"),
    ];
    let (git, runner) = scripted(plan);

    let outcome = fixture.engine(&git).run(&fixture.options()).await?;
    assert!(!outcome.success);
    assert!(outcome.errors.contains(&"Push to main failed.".to_string()));
    assert_eq!(runner.remaining(), 0);

    let session = fixture.global.get_session(&fixture.session_id).await?;
    assert_eq!(session.status, SessionStatus::Failed);
    Ok(())
}

/// S5: validation gate failure blocks the session and preserves the
/// workspace; no push is attempted.
#[tokio::test]
async fn s5_validation_gate_blocks() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(
            &["log", "main..origin/steroids/ws-alpha", "--format=%H", "--reverse"],
            "A",
        ),
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(
            &["merge-base", "origin/main", "origin/steroids/ws-alpha"],
            "B0",
        ),
        ScriptedCall::ok(&["pull", "--ff-only"], ""),
        ScriptedCall::ok(&["cherry-pick", "A"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "A1"),
        // No push call is planned: reaching one would fail the test.
    ];
    let (git, runner) = scripted(plan);

    let mut options = fixture.options();
    options.validation_command = Some("echo broken >&2; exit 3".into());

    let outcome = fixture.engine(&git).run(&options).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.session_status, SessionStatus::BlockedValidation);
    let escalation_id = outcome
        .validation_escalation_id
        .ok_or_else(|| Error::Validation("expected an escalation id".into()))?;
    assert_eq!(runner.remaining(), 0);

    // Workspace preserved on disk, escalation recorded with the output.
    assert!(fixture.integration.path().exists());
    let open = fixture
        .global
        .list_open_escalations(&fixture.session_id)
        .await?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, escalation_id);
    assert!(open[0]
        .stderr_snippet
        .as_deref()
        .unwrap_or_default()
        .contains("broken"));

    let session = fixture.global.get_session(&fixture.session_id).await?;
    assert_eq!(session.status, SessionStatus::BlockedValidation);
    Ok(())
}

/// S6: a cyclic section graph fails partitioning before any session
/// exists.
#[tokio::test]
async fn s6_cyclic_dependency_rejected_at_partition() -> Result<()> {
    let sections = vec![
        Section {
            id: "a".into(),
            name: "a".into(),
            position: 0,
            priority: 50,
            skipped: false,
        },
        Section {
            id: "b".into(),
            name: "b".into(),
            position: 1,
            priority: 50,
            skipped: false,
        },
    ];
    let mut edges = std::collections::HashMap::new();
    edges.insert("a".to_string(), vec!["b".to_string()]);
    edges.insert("b".to_string(), vec!["a".to_string()]);

    let result = partition_components(&sections, &edges);
    assert!(matches!(result, Err(Error::CyclicDependency(_))));
    Ok(())
}

/// A merge lock held by another live runner refuses the merge.
#[tokio::test]
async fn merge_lock_contention_aborts() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    fixture
        .global
        .acquire_merge_lock(&fixture.session_id, "other-runner", chrono::Duration::minutes(30))
        .await?;

    let (git, _runner) = scripted(vec![]);
    let result = fixture.engine(&git).run(&fixture.options()).await;
    assert!(matches!(result, Err(Error::MergeLockHeld { .. })));
    Ok(())
}

/// Resume against a force-pushed workstream head aborts without touching
/// progress.
#[tokio::test]
async fn sealed_head_moved_aborts() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    fixture.seal_alpha(&["A"], "H", "B0").await?;

    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        // The remote branch now points somewhere else.
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H2"),
    ];
    let (git, _runner) = scripted(plan);

    let result = fixture.engine(&git).run(&fixture.options()).await;
    assert!(matches!(result, Err(Error::SealedHeadMoved { .. })));
    Ok(())
}

/// Path safety: cleanup never deletes a workspace outside the hashed
/// project root, even when the row points there explicitly.
#[tokio::test]
async fn cleanup_never_deletes_unmanaged_paths() -> Result<()> {
    let fixture = Fixture::new(vec![]).await?;
    let victim = tempfile::TempDir::new()?;

    // Point the workstream's workspace at an unmanaged directory.
    sqlx::query("UPDATE workstreams SET workspace_path = ?1 WHERE id = 'alpha'")
        .bind(victim.path().display().to_string())
        .execute(fixture.global.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

    let plan = vec![
        ScriptedCall::ok(&["status", "--porcelain"], ""),
        ScriptedCall::ok(&["fetch", "--prune", "origin", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(
            &["log", "main..origin/steroids/ws-alpha", "--format=%H", "--reverse"],
            "A",
        ),
        ScriptedCall::ok(&["rev-parse", "origin/steroids/ws-alpha"], "H"),
        ScriptedCall::ok(
            &["merge-base", "origin/main", "origin/steroids/ws-alpha"],
            "B0",
        ),
        ScriptedCall::ok(&["pull", "--ff-only"], ""),
        ScriptedCall::ok(&["cherry-pick", "A"], ""),
        ScriptedCall::ok(&["rev-parse", "HEAD"], "A1"),
        ScriptedCall::ok(&["push", "origin", "main"], ""),
        ScriptedCall::ok(&["push", "origin", "--delete", "steroids/ws-alpha"], ""),
        ScriptedCall::ok(&["remote", "prune", "origin"], ""),
    ];
    let (git, _runner) = scripted(plan);

    let mut options = fixture.options();
    options.cleanup_workspaces = true;

    let outcome = fixture.engine(&git).run(&options).await?;
    assert!(outcome.success);
    // The unmanaged directory survived cleanup.
    assert!(victim.path().exists());
    Ok(())
}
