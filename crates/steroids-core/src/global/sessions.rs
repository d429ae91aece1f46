//! Parallel sessions: groups of workstreams launched together.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::GlobalStore;
use crate::timefmt::{now_str, parse_utc, parse_utc_opt};
use crate::types::SessionStatus;
use crate::{Error, Result};

/// A parallel session.
#[derive(Debug, Clone)]
pub struct ParallelSession {
    /// Identifier.
    pub id: String,
    /// Project checkout path.
    pub project_path: String,
    /// Canonicalized repo identity (realpath); the uniqueness key.
    pub project_repo_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ParallelSession> {
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| Error::Database(format!("field 'created_at': {e}")))?;
    let completed_at: Option<String> = row
        .try_get("completed_at")
        .map_err(|e| Error::Database(format!("field 'completed_at': {e}")))?;

    Ok(ParallelSession {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        project_path: row
            .try_get("project_path")
            .map_err(|e| Error::Database(format!("field 'project_path': {e}")))?,
        project_repo_id: row
            .try_get("project_repo_id")
            .map_err(|e| Error::Database(format!("field 'project_repo_id': {e}")))?,
        status: status.parse()?,
        created_at: parse_utc(&created_at)?,
        completed_at: parse_utc_opt(completed_at)?,
    })
}

const TERMINAL_STATUSES: &str = "'completed', 'failed', 'aborted'";

impl GlobalStore {
    /// Create a session, enforcing the one-non-terminal-session invariant
    /// per repo id inside a single transaction.
    pub async fn create_session(
        &self,
        project_path: &str,
        project_repo_id: &str,
    ) -> Result<ParallelSession> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS live FROM sessions
             WHERE project_repo_id = ?1 AND status NOT IN ({TERMINAL_STATUSES})"
        ))
        .bind(project_repo_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to count live sessions: {e}")))?;
        let live: i64 = row
            .try_get("live")
            .map_err(|e| Error::Database(format!("field 'live': {e}")))?;
        if live > 0 {
            return Err(Error::SessionActive(project_repo_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, project_path, project_repo_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(project_path)
        .bind(project_repo_id)
        .bind(SessionStatus::Running.as_str())
        .bind(now_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to insert session: {e}")))?;
        tx.commit().await?;

        self.get_session(&id).await
    }

    /// Fetch a session by id.
    pub async fn get_session(&self, id: &str) -> Result<ParallelSession> {
        let row = sqlx::query(
            "SELECT id, project_path, project_repo_id, status, created_at, completed_at
             FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to fetch session: {e}")))?
        .ok_or_else(|| Error::Validation(format!("session not found: {id}")))?;
        session_from_row(&row)
    }

    /// The non-terminal session for a repo, if one exists.
    pub async fn find_active_session(
        &self,
        project_repo_id: &str,
    ) -> Result<Option<ParallelSession>> {
        let row = sqlx::query(&format!(
            "SELECT id, project_path, project_repo_id, status, created_at, completed_at
             FROM sessions
             WHERE project_repo_id = ?1 AND status NOT IN ({TERMINAL_STATUSES})
             LIMIT 1"
        ))
        .bind(project_repo_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to find active session: {e}")))?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Unconditionally set a session's status. Terminal statuses also
    /// stamp `completed_at`.
    pub async fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let completed_at = status.is_terminal().then(now_str);
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to update session: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("session not found: {id}")));
        }
        Ok(())
    }

    /// Fenced status transition: only succeeds if the session is still in
    /// `expected`.
    pub async fn transition_session(
        &self,
        id: &str,
        expected: SessionStatus,
        to: SessionStatus,
    ) -> Result<()> {
        let completed_at = to.is_terminal().then(now_str);
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(completed_at)
        .bind(id)
        .bind(expected.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to transition session: {e}")))?;
        if result.rows_affected() != 1 {
            return Err(Error::Validation(format!(
                "session {id} is no longer {}",
                expected.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_terminal_uniqueness() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let session = store.create_session("/p", "repo-1").await?;
        assert_eq!(session.status, SessionStatus::Running);

        // Same repo: refused while the first session lives.
        let result = store.create_session("/p", "repo-1").await;
        assert!(matches!(result, Err(Error::SessionActive(_))));

        // Blocked sessions are still non-terminal.
        store
            .set_session_status(&session.id, SessionStatus::BlockedValidation)
            .await?;
        assert!(matches!(
            store.create_session("/p", "repo-1").await,
            Err(Error::SessionActive(_))
        ));

        // A different repo is unaffected.
        store.create_session("/q", "repo-2").await?;

        // Terminal frees the slot.
        store
            .set_session_status(&session.id, SessionStatus::Completed)
            .await?;
        store.create_session("/p", "repo-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_status_stamps_completed_at() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let session = store.create_session("/p", "repo-1").await?;
        store
            .set_session_status(&session.id, SessionStatus::Failed)
            .await?;
        let session = store.get_session(&session.id).await?;
        assert!(session.completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_fenced_transition() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let session = store.create_session("/p", "repo-1").await?;
        store
            .transition_session(&session.id, SessionStatus::Running, SessionStatus::Merging)
            .await?;
        // Stale expectation loses.
        let result = store
            .transition_session(&session.id, SessionStatus::Running, SessionStatus::Merging)
            .await;
        assert!(result.is_err());
        Ok(())
    }
}
