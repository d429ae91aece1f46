//! Runner registry with heartbeat-based liveness.
//!
//! A runner is *active* while its status is not `stopped` and its
//! heartbeat is within the last five minutes.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::GlobalStore;
use crate::timefmt::{now_str, parse_utc};
use crate::types::RunnerStatus;
use crate::{Error, Result};

/// Heartbeat window after which a runner counts as dead.
pub const RUNNER_ACTIVE_WINDOW_SECS: i64 = 300;

/// A live runner process.
#[derive(Debug, Clone)]
pub struct Runner {
    /// Identifier.
    pub id: String,
    /// OS process id.
    pub pid: u32,
    /// Project checkout the runner serves.
    pub project_path: String,
    /// Lifecycle status.
    pub status: RunnerStatus,
    /// Task currently being driven, if any.
    pub current_task_id: Option<String>,
    /// When the process registered.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat.
    pub heartbeat_at: DateTime<Utc>,
}

fn runner_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Runner> {
    let pid: i64 = row
        .try_get("pid")
        .map_err(|e| Error::Database(format!("field 'pid': {e}")))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let started_at: String = row
        .try_get("started_at")
        .map_err(|e| Error::Database(format!("field 'started_at': {e}")))?;
    let heartbeat_at: String = row
        .try_get("heartbeat_at")
        .map_err(|e| Error::Database(format!("field 'heartbeat_at': {e}")))?;

    Ok(Runner {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        pid: u32::try_from(pid).unwrap_or(0),
        project_path: row
            .try_get("project_path")
            .map_err(|e| Error::Database(format!("field 'project_path': {e}")))?,
        status: status.parse()?,
        current_task_id: row
            .try_get("current_task_id")
            .map_err(|e| Error::Database(format!("field 'current_task_id': {e}")))?,
        started_at: parse_utc(&started_at)?,
        heartbeat_at: parse_utc(&heartbeat_at)?,
    })
}

impl GlobalStore {
    /// Register a project path for wakeup scanning.
    pub async fn register_project(&self, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (path, registered_at) VALUES (?1, ?2)
             ON CONFLICT(path) DO NOTHING",
        )
        .bind(path)
        .bind(now_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to register project: {e}")))?;
        Ok(())
    }

    /// Every registered project path.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT path FROM projects ORDER BY path ASC")
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to list projects: {e}")))?;
        rows.iter()
            .map(|row| {
                row.try_get("path")
                    .map_err(|e| Error::Database(format!("field 'path': {e}")))
            })
            .collect()
    }

    /// Register a new runner for a project.
    pub async fn register_runner(&self, project_path: &str, pid: u32) -> Result<Runner> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        sqlx::query(
            "INSERT INTO runners (id, pid, project_path, status, started_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&id)
        .bind(i64::from(pid))
        .bind(project_path)
        .bind(RunnerStatus::Starting.as_str())
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to register runner: {e}")))?;
        self.get_runner(&id).await
    }

    /// Fetch a runner by id.
    pub async fn get_runner(&self, id: &str) -> Result<Runner> {
        let row = sqlx::query(
            "SELECT id, pid, project_path, status, current_task_id, started_at, heartbeat_at
             FROM runners WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to fetch runner: {e}")))?
        .ok_or_else(|| Error::Validation(format!("runner not found: {id}")))?;
        runner_from_row(&row)
    }

    /// Update a runner's status, heartbeating at the same time.
    pub async fn set_runner_status(&self, id: &str, status: RunnerStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE runners SET status = ?1, heartbeat_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now_str())
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(|e| Error::Database(format!("failed to update runner: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("runner not found: {id}")));
        }
        Ok(())
    }

    /// Record the task a runner is currently driving.
    pub async fn set_runner_task(&self, id: &str, task_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE runners SET current_task_id = ?1, heartbeat_at = ?2 WHERE id = ?3")
            .bind(task_id)
            .bind(now_str())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to update runner task: {e}")))?;
        Ok(())
    }

    /// Refresh a runner's heartbeat.
    pub async fn heartbeat_runner(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE runners SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(now_str())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to heartbeat runner: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("runner not found: {id}")));
        }
        Ok(())
    }

    /// Whether the runner has been cooperatively stopped.
    pub async fn runner_stop_requested(&self, id: &str) -> Result<bool> {
        let runner = self.get_runner(id).await?;
        Ok(runner.status == RunnerStatus::Stopped)
    }

    /// Whether any runner for the project is active: status not `stopped`
    /// and heartbeat within the window.
    pub async fn has_active_runner(&self, project_path: &str) -> Result<bool> {
        let cutoff = (Utc::now() - Duration::seconds(RUNNER_ACTIVE_WINDOW_SECS)).to_rfc3339();
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM runners
             WHERE project_path = ?1 AND status != 'stopped' AND heartbeat_at >= ?2",
        )
        .bind(project_path)
        .bind(&cutoff)
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to count active runners: {e}")))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| Error::Database(format!("field 'n': {e}")))?;
        Ok(n > 0)
    }

    /// Mark runners whose heartbeat lapsed as stopped. Returns how many
    /// rows were cleaned up.
    pub async fn cleanup_stale_runners(&self) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::seconds(RUNNER_ACTIVE_WINDOW_SECS)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE runners SET status = 'stopped'
             WHERE status != 'stopped' AND heartbeat_at < ?1",
        )
        .bind(&cutoff)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to clean up stale runners: {e}")))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_activity() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        store.register_project("/p1").await?;
        store.register_project("/p1").await?;
        assert_eq!(store.list_projects().await?, vec!["/p1".to_string()]);

        let runner = store.register_runner("/p1", 4242).await?;
        assert_eq!(runner.status, RunnerStatus::Starting);
        assert!(store.has_active_runner("/p1").await?);
        assert!(!store.has_active_runner("/p2").await?);

        store.set_runner_status(&runner.id, RunnerStatus::Stopped).await?;
        assert!(!store.has_active_runner("/p1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_runner_cleanup() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let runner = store.register_runner("/p1", 1).await?;

        // Age the heartbeat beyond the window by writing a stale value.
        let stale = (Utc::now() - Duration::seconds(RUNNER_ACTIVE_WINDOW_SECS + 60)).to_rfc3339();
        sqlx::query("UPDATE runners SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(&stale)
            .bind(&runner.id)
            .execute(store.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        assert!(!store.has_active_runner("/p1").await?);
        assert_eq!(store.cleanup_stale_runners().await?, 1);
        let runner = store.get_runner(&runner.id).await?;
        assert_eq!(runner.status, RunnerStatus::Stopped);
        Ok(())
    }
}
