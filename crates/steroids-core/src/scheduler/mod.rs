//! Workstream scheduler: partitions sections into workstreams, provisions
//! clones, claims leases, and spawns detached workstream runners.

mod partition;

pub use partition::{
    clip_to_max, partition_components, partition_per_section, PartitionStrategy, WorkstreamPlan,
};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use uuid::Uuid;

use crate::config::Config;
use crate::git::{Git, GitRunner};
use crate::global::GlobalStore;
use crate::paths;
use crate::store::TaskStore;
use crate::workspace;
use crate::{Error, Result};

/// Branch namespace for workstream branches.
pub const BRANCH_PREFIX: &str = "steroids/";

/// Everything a spawned workstream runner needs to know.
#[derive(Debug, Clone)]
pub struct RunnerSpawnSpec {
    /// Clone the runner works in.
    pub project_path: PathBuf,
    /// Parallel session id.
    pub session_id: String,
    /// Workstream id.
    pub workstream_id: String,
    /// Branch the runner commits to.
    pub branch: String,
    /// Sections assigned to the lane.
    pub section_ids: Vec<String>,
    /// Daemon log file, when daemon logs are enabled.
    pub log_file: Option<PathBuf>,
}

/// Spawns detached runner processes. The scheduler and wakeup controller
/// never call back into the orchestrator in-process; new runners are
/// always separate processes.
pub trait Spawner: Send + Sync {
    /// Spawn a detached workstream runner; returns its pid.
    fn spawn_workstream_runner(&self, spec: &RunnerSpawnSpec) -> Result<u32>;

    /// Spawn a detached foreground runner for a project; returns its pid.
    fn spawn_project_runner(&self, project: &Path) -> Result<u32>;
}

/// Spawner backed by the current executable.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    binary: PathBuf,
}

impl ProcessSpawner {
    /// Spawner using the running binary.
    pub fn from_current_exe() -> Result<Self> {
        let binary = std::env::current_exe()
            .map_err(|e| Error::Io(format!("cannot resolve current executable: {e}")))?;
        Ok(Self { binary })
    }

    /// Spawner using an explicit binary path.
    #[must_use]
    pub const fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn detach(command: &mut std::process::Command) {
        command.stdin(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
    }

    fn stdio_for(log_file: Option<&Path>) -> Result<(Stdio, Stdio)> {
        match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Io(format!("cannot create {}: {e}", parent.display())))?;
                }
                let out = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| Error::Io(format!("cannot open {}: {e}", path.display())))?;
                let err = out
                    .try_clone()
                    .map_err(|e| Error::Io(format!("cannot clone log handle: {e}")))?;
                Ok((Stdio::from(out), Stdio::from(err)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn_workstream_runner(&self, spec: &RunnerSpawnSpec) -> Result<u32> {
        let (stdout, stderr) = Self::stdio_for(spec.log_file.as_deref())?;
        let mut command = std::process::Command::new(&self.binary);
        command
            .arg("runners")
            .arg("start")
            .arg("--project")
            .arg(&spec.project_path)
            .arg("--parallel")
            .arg("--parallel-session-id")
            .arg(&spec.session_id)
            .arg("--workstream-id")
            .arg(&spec.workstream_id)
            .arg("--branch")
            .arg(&spec.branch)
            .arg("--section-ids")
            .arg(spec.section_ids.join(","))
            .stdout(stdout)
            .stderr(stderr);
        Self::detach(&mut command);
        let child = command
            .spawn()
            .map_err(|e| Error::Io(format!("failed to spawn workstream runner: {e}")))?;
        Ok(child.id())
    }

    fn spawn_project_runner(&self, project: &Path) -> Result<u32> {
        // The child is already detached via stdio and process group; the
        // argv carries no --detach so it runs the loop directly.
        let mut command = std::process::Command::new(&self.binary);
        command
            .arg("runners")
            .arg("start")
            .arg("--project")
            .arg(project)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Self::detach(&mut command);
        let child = command
            .spawn()
            .map_err(|e| Error::Io(format!("failed to spawn project runner: {e}")))?;
        Ok(child.id())
    }
}

/// One launched workstream lane.
#[derive(Debug, Clone)]
pub struct LaunchedWorkstream {
    /// Workstream id.
    pub id: String,
    /// Branch name.
    pub branch: String,
    /// Clone directory.
    pub workspace_path: PathBuf,
    /// Spawned runner pid.
    pub pid: u32,
    /// Claim generation after the initial lease claim.
    pub claim_generation: i64,
}

/// Result of launching a parallel session.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    /// The created session.
    pub session_id: String,
    /// Launched lanes, in section order.
    pub workstreams: Vec<LaunchedWorkstream>,
}

/// Provisions and launches parallel sessions.
pub struct Scheduler<'a, R: GitRunner, S: Spawner> {
    project_root: PathBuf,
    store: &'a TaskStore,
    global: &'a GlobalStore,
    git: Git<R>,
    config: Config,
    spawner: &'a S,
    runner_id: String,
}

impl<'a, R: GitRunner, S: Spawner> Scheduler<'a, R, S> {
    /// Build a scheduler.
    #[must_use]
    pub fn new(
        project_root: PathBuf,
        store: &'a TaskStore,
        global: &'a GlobalStore,
        git: Git<R>,
        config: Config,
        spawner: &'a S,
        runner_id: String,
    ) -> Self {
        Self {
            project_root,
            store,
            global,
            git,
            config,
            spawner,
            runner_id,
        }
    }

    /// Compute the workstream plans for the current backlog.
    pub async fn plan(&self, strategy: PartitionStrategy) -> Result<Vec<WorkstreamPlan>> {
        let sections = self.store.list_sections().await?;

        // Only sections that still have open work participate.
        let mut open_sections = Vec::new();
        for section in sections {
            let open = self
                .store
                .list_tasks(None, Some(&section.id))
                .await?
                .iter()
                .filter(|t| !t.status.is_terminal())
                .count();
            if open > 0 {
                open_sections.push(section);
            }
        }

        let plans = match strategy {
            PartitionStrategy::PerSection => {
                let mut met = HashSet::new();
                for section in &open_sections {
                    if self.store.dependencies_met(&section.id).await? {
                        met.insert(section.id.clone());
                    }
                }
                partition_per_section(&open_sections, &met)
            }
            PartitionStrategy::Components => {
                let edges = self.store.dependency_edges().await?;
                partition_components(&open_sections, &edges)?
            }
        };
        Ok(plans)
    }

    /// Launch a parallel session: create the session row, provision one
    /// clone per plan, claim each lease, and spawn detached runners.
    pub async fn launch(
        &self,
        strategy: PartitionStrategy,
        max_clones_override: Option<usize>,
    ) -> Result<LaunchResult> {
        // The isolation contract is checked before any clone exists.
        self.config.validate()?;

        let plans = self.plan(strategy).await?;
        if plans.is_empty() {
            return Err(Error::Validation(
                "no dependency-met sections with open work".into(),
            ));
        }
        let max = max_clones_override.unwrap_or(self.config.max_clones);
        let plans = clip_to_max(plans, max);

        let repo_id = self
            .project_root
            .canonicalize()
            .map_err(|e| Error::Io(format!("cannot canonicalize project root: {e}")))?
            .display()
            .to_string();
        let session = self
            .global
            .create_session(&self.project_root.display().to_string(), &repo_id)
            .await?;

        let global_paths = crate::paths::GlobalPaths::resolve()?;
        let workspace_root = self.config.workspace_root_path(&global_paths);

        let mut launched = Vec::new();
        for plan in &plans {
            let workstream_id = format!("ws-{}", short_id());
            let branch = format!("{BRANCH_PREFIX}{workstream_id}");
            let clone_path = paths::workstream_workspace_dir(
                &workspace_root,
                &self.project_root,
                &workstream_id,
            )?;

            workspace::create_clone(&self.git, &self.project_root, &clone_path, &branch).await?;
            if let Some(command) = &self.config.hydration_command {
                workspace::hydrate(&clone_path, command).await?;
            }

            self.global
                .insert_workstream(
                    &workstream_id,
                    &session.id,
                    &branch,
                    &plan.section_ids(),
                    &clone_path.display().to_string(),
                )
                .await?;
            let claim_generation = self
                .global
                .claim_workstream(&workstream_id, &self.runner_id, 0)
                .await?;

            let log_file = self.config.daemon_logs.then(|| {
                crate::paths::ProjectPaths::new(&self.project_root)
                    .daemon_log_dir()
                    .join(format!("{workstream_id}.log"))
            });
            let spec = RunnerSpawnSpec {
                project_path: clone_path.clone(),
                session_id: session.id.clone(),
                workstream_id: workstream_id.clone(),
                branch: branch.clone(),
                section_ids: plan.section_ids(),
                log_file,
            };
            let pid = self.spawner.spawn_workstream_runner(&spec)?;
            tracing::info!(
                session_id = %session.id,
                workstream_id = %workstream_id,
                pid,
                "launched workstream runner"
            );

            launched.push(LaunchedWorkstream {
                id: workstream_id,
                branch,
                workspace_path: clone_path,
                pid,
                claim_generation,
            });
        }

        Ok(LaunchResult {
            session_id: session.id,
            workstreams: launched,
        })
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{ScriptedCall, ScriptedGit};
    use std::sync::Mutex;

    struct RecordingSpawner {
        specs: Mutex<Vec<RunnerSpawnSpec>>,
    }

    impl RecordingSpawner {
        fn new() -> Self {
            Self {
                specs: Mutex::new(Vec::new()),
            }
        }
    }

    impl Spawner for RecordingSpawner {
        fn spawn_workstream_runner(&self, spec: &RunnerSpawnSpec) -> Result<u32> {
            if let Ok(mut specs) = self.specs.lock() {
                specs.push(spec.clone());
            }
            Ok(12345)
        }

        fn spawn_project_runner(&self, _project: &Path) -> Result<u32> {
            Ok(54321)
        }
    }

    #[tokio::test]
    async fn test_plan_per_section_skips_unmet() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = TaskStore::open_in_memory().await?;
        let global = GlobalStore::open_in_memory().await?;

        let base = store.create_section("base", 0, 50).await?;
        let top = store.create_section("top", 1, 50).await?;
        store.add_section_dependency(&top.id, &base.id).await?;
        store.create_task("t1", Some(&base.id), None, "h").await?;
        store.create_task("t2", Some(&top.id), None, "h").await?;

        let spawner = RecordingSpawner::new();
        let git = Git::new(std::sync::Arc::new(ScriptedGit::new(vec![])));
        let scheduler = Scheduler::new(
            dir.path().to_path_buf(),
            &store,
            &global,
            git,
            Config::default(),
            &spawner,
            "runner-1".into(),
        );

        let plans = scheduler.plan(PartitionStrategy::PerSection).await?;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].sections[0].id, base.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_components_detects_cycle_in_stored_graph() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = TaskStore::open_in_memory().await?;
        let global = GlobalStore::open_in_memory().await?;

        let a = store.create_section("a", 0, 50).await?;
        let b = store.create_section("b", 1, 50).await?;
        store.create_task("t1", Some(&a.id), None, "h").await?;
        store.create_task("t2", Some(&b.id), None, "h").await?;
        store.add_section_dependency(&a.id, &b.id).await?;
        // Force the closing edge past the store's own guard to model a
        // corrupted graph.
        sqlx::query("INSERT INTO section_dependencies (section_id, depends_on) VALUES (?1, ?2)")
            .bind(&b.id)
            .bind(&a.id)
            .execute(store.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let spawner = RecordingSpawner::new();
        let git = Git::new(std::sync::Arc::new(ScriptedGit::new(vec![])));
        let scheduler = Scheduler::new(
            dir.path().to_path_buf(),
            &store,
            &global,
            git,
            Config::default(),
            &spawner,
            "runner-1".into(),
        );

        let result = scheduler.plan(PartitionStrategy::Components).await;
        assert!(matches!(result, Err(Error::CyclicDependency(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_launch_refuses_shared_dependency_dirs() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = TaskStore::open_in_memory().await?;
        let global = GlobalStore::open_in_memory().await?;
        let section = store.create_section("s", 0, 50).await?;
        store.create_task("t", Some(&section.id), None, "h").await?;

        let config = Config {
            shared_dependency_dirs: vec!["node_modules".into()],
            ..Config::default()
        };
        let spawner = RecordingSpawner::new();
        let git = Git::new(std::sync::Arc::new(ScriptedGit::new(vec![])));
        let scheduler = Scheduler::new(
            dir.path().to_path_buf(),
            &store,
            &global,
            git,
            config,
            &spawner,
            "runner-1".into(),
        );

        let result = scheduler
            .launch(PartitionStrategy::PerSection, None)
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        // Nothing was created.
        assert!(global.find_active_session(&dir.path().display().to_string()).await?.is_none());
        Ok(())
    }
}
