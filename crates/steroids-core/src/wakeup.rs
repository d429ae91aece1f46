//! Wakeup controller: cross-project liveness scanning.
//!
//! Enumerates registered projects and spawns a detached runner for any
//! project that exists, is initialized, has no active runner, and still
//! has open work. Stale runner rows are cleaned up before the scan.

use std::path::Path;

use crate::global::GlobalStore;
use crate::paths::ProjectPaths;
use crate::scheduler::Spawner;
use crate::store::TaskStore;
use crate::Result;

/// Why a project was skipped, or what was done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeupAction {
    /// Project directory no longer exists.
    SkippedMissing,
    /// Project has no `.steroids` store.
    SkippedNotInitialized,
    /// A live runner already serves the project.
    SkippedActiveRunner,
    /// No open tasks remain.
    SkippedNoWork,
    /// Dry run: a runner would have been spawned.
    WouldStart,
    /// A detached runner was spawned with this pid.
    Started(u32),
}

/// One project's scan outcome.
#[derive(Debug, Clone)]
pub struct ProjectWakeup {
    /// Project path.
    pub project: String,
    /// What happened.
    pub action: WakeupAction,
}

/// Full report of one wakeup pass.
#[derive(Debug, Clone, Default)]
pub struct WakeupReport {
    /// Stale runner rows marked stopped before the scan.
    pub cleaned_runners: u64,
    /// Per-project outcomes.
    pub projects: Vec<ProjectWakeup>,
}

impl WakeupReport {
    /// Count of runners actually started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.projects
            .iter()
            .filter(|p| matches!(p.action, WakeupAction::Started(_)))
            .count()
    }
}

/// Run one wakeup pass over every registered project.
pub async fn run_wakeup<S: Spawner>(
    global: &GlobalStore,
    spawner: &S,
    dry_run: bool,
) -> Result<WakeupReport> {
    let mut report = WakeupReport {
        cleaned_runners: global.cleanup_stale_runners().await?,
        projects: Vec::new(),
    };

    for project in global.list_projects().await? {
        let action = scan_project(global, spawner, &project, dry_run).await?;
        tracing::debug!(project = %project, action = ?action, "wakeup scan");
        report.projects.push(ProjectWakeup { project, action });
    }

    tracing::info!(
        cleaned = report.cleaned_runners,
        started = report.started(),
        scanned = report.projects.len(),
        "wakeup pass complete"
    );
    Ok(report)
}

async fn scan_project<S: Spawner>(
    global: &GlobalStore,
    spawner: &S,
    project: &str,
    dry_run: bool,
) -> Result<WakeupAction> {
    let path = Path::new(project);
    if !path.is_dir() {
        return Ok(WakeupAction::SkippedMissing);
    }
    if !ProjectPaths::new(path).is_initialized() {
        return Ok(WakeupAction::SkippedNotInitialized);
    }
    if global.has_active_runner(project).await? {
        return Ok(WakeupAction::SkippedActiveRunner);
    }

    let store = TaskStore::open(path).await?;
    if store.count_open_tasks().await? == 0 {
        return Ok(WakeupAction::SkippedNoWork);
    }

    if dry_run {
        return Ok(WakeupAction::WouldStart);
    }
    let pid = spawner.spawn_project_runner(path)?;
    Ok(WakeupAction::Started(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RunnerSpawnSpec;
    use crate::types::TaskStatus;
    use std::sync::Mutex;

    struct CountingSpawner {
        spawned: Mutex<Vec<String>>,
    }

    impl CountingSpawner {
        fn new() -> Self {
            Self {
                spawned: Mutex::new(Vec::new()),
            }
        }
    }

    impl Spawner for CountingSpawner {
        fn spawn_workstream_runner(&self, _spec: &RunnerSpawnSpec) -> Result<u32> {
            Ok(1)
        }

        fn spawn_project_runner(&self, project: &Path) -> Result<u32> {
            if let Ok(mut spawned) = self.spawned.lock() {
                spawned.push(project.display().to_string());
            }
            Ok(777)
        }
    }

    #[tokio::test]
    async fn test_wakeup_skips_and_starts() -> Result<()> {
        let global = GlobalStore::open_in_memory().await?;
        let spawner = CountingSpawner::new();

        // Missing directory.
        global.register_project("/definitely/not/a/dir").await?;

        // Initialized project with open work.
        let with_work = tempfile::TempDir::new()?;
        let store = TaskStore::open(with_work.path()).await?;
        store.create_task("open task", None, None, "h").await?;
        global
            .register_project(&with_work.path().display().to_string())
            .await?;

        // Initialized project with all work done.
        let done = tempfile::TempDir::new()?;
        let store = TaskStore::open(done.path()).await?;
        let task = store.create_task("t", None, None, "h").await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::Completed, "r", None, None)
            .await?;
        global
            .register_project(&done.path().display().to_string())
            .await?;

        // Uninitialized directory.
        let bare = tempfile::TempDir::new()?;
        global
            .register_project(&bare.path().display().to_string())
            .await?;

        let report = run_wakeup(&global, &spawner, false).await?;
        assert_eq!(report.projects.len(), 4);
        assert_eq!(report.started(), 1);

        let by_project: std::collections::HashMap<_, _> = report
            .projects
            .iter()
            .map(|p| (p.project.clone(), p.action.clone()))
            .collect();
        assert_eq!(
            by_project.get("/definitely/not/a/dir"),
            Some(&WakeupAction::SkippedMissing)
        );
        assert_eq!(
            by_project.get(&with_work.path().display().to_string()),
            Some(&WakeupAction::Started(777))
        );
        assert_eq!(
            by_project.get(&done.path().display().to_string()),
            Some(&WakeupAction::SkippedNoWork)
        );
        assert_eq!(
            by_project.get(&bare.path().display().to_string()),
            Some(&WakeupAction::SkippedNotInitialized)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() -> Result<()> {
        let global = GlobalStore::open_in_memory().await?;
        let spawner = CountingSpawner::new();

        let project = tempfile::TempDir::new()?;
        let store = TaskStore::open(project.path()).await?;
        store.create_task("t", None, None, "h").await?;
        global
            .register_project(&project.path().display().to_string())
            .await?;

        let report = run_wakeup(&global, &spawner, true).await?;
        assert_eq!(report.started(), 0);
        assert!(report
            .projects
            .iter()
            .any(|p| p.action == WakeupAction::WouldStart));
        assert!(spawner.spawned.lock().map(|s| s.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn test_active_runner_skips() -> Result<()> {
        let global = GlobalStore::open_in_memory().await?;
        let spawner = CountingSpawner::new();

        let project = tempfile::TempDir::new()?;
        let store = TaskStore::open(project.path()).await?;
        store.create_task("t", None, None, "h").await?;
        let path = project.path().display().to_string();
        global.register_project(&path).await?;
        global.register_runner(&path, 42).await?;

        let report = run_wakeup(&global, &spawner, false).await?;
        assert!(report
            .projects
            .iter()
            .any(|p| p.action == WakeupAction::SkippedActiveRunner));
        Ok(())
    }
}
