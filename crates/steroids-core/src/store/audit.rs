//! Append-only audit log and the derived rejection history.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::TaskStore;
use crate::timefmt::parse_utc;
use crate::{Error, Result};

/// One immutable audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Row id; insertion order is the total order per task.
    pub id: i64,
    /// Task this entry belongs to.
    pub task_id: String,
    /// Status before the transition; `None` for creation.
    pub from_status: Option<String>,
    /// Status after the transition.
    pub to_status: String,
    /// Human or model identifier that caused the transition.
    pub actor: String,
    /// Free-text notes (review feedback, error text).
    pub notes: Option<String>,
    /// Commit under review, when applicable.
    pub commit_sha: Option<String>,
    /// When the transition happened.
    pub created_at: DateTime<Utc>,
}

/// A rejection: the projection of `review -> in_progress` audit entries.
#[derive(Debug, Clone)]
pub struct RejectionEntry {
    /// 1-based rejection ordinal.
    pub ordinal: u32,
    /// Commit that was rejected, if recorded.
    pub commit_sha: Option<String>,
    /// Reviewer feedback.
    pub notes: Option<String>,
    /// Who rejected.
    pub actor: String,
    /// When.
    pub created_at: DateTime<Utc>,
}

fn audit_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| Error::Database(format!("field 'created_at': {e}")))?;
    Ok(AuditEntry {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        task_id: row
            .try_get("task_id")
            .map_err(|e| Error::Database(format!("field 'task_id': {e}")))?,
        from_status: row
            .try_get("from_status")
            .map_err(|e| Error::Database(format!("field 'from_status': {e}")))?,
        to_status: row
            .try_get("to_status")
            .map_err(|e| Error::Database(format!("field 'to_status': {e}")))?,
        actor: row
            .try_get("actor")
            .map_err(|e| Error::Database(format!("field 'actor': {e}")))?,
        notes: row
            .try_get("notes")
            .map_err(|e| Error::Database(format!("field 'notes': {e}")))?,
        commit_sha: row
            .try_get("commit_sha")
            .map_err(|e| Error::Database(format!("field 'commit_sha': {e}")))?,
        created_at: parse_utc(&created_at)?,
    })
}

impl TaskStore {
    /// Full audit history for a task, oldest first.
    pub async fn audit_history(&self, task_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, task_id, from_status, to_status, actor, notes, commit_sha, created_at
             FROM audit_log WHERE task_id = ?1 ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to fetch audit history: {e}")))?;
        rows.iter().map(audit_from_row).collect()
    }

    /// Rejection history: every `review -> in_progress` audit entry with a
    /// 1-based ordinal.
    pub async fn rejection_history(&self, task_id: &str) -> Result<Vec<RejectionEntry>> {
        let rows = sqlx::query(
            "SELECT id, task_id, from_status, to_status, actor, notes, commit_sha, created_at
             FROM audit_log
             WHERE task_id = ?1 AND from_status = 'review' AND to_status = 'in_progress'
             ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to fetch rejection history: {e}")))?;

        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let entry = audit_from_row(row)?;
                Ok(RejectionEntry {
                    ordinal: u32::try_from(i + 1).unwrap_or(u32::MAX),
                    commit_sha: entry.commit_sha,
                    notes: entry.notes,
                    actor: entry.actor,
                    created_at: entry.created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    #[tokio::test]
    async fn test_rejection_count_matches_audit_projection() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let task = store.create_task("t", None, None, "h").await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "r", Some("no"), None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "r", Some("still no"), None)
            .await?;

        let task = store.get_task(&task.id).await?;
        let rejections = store.rejection_history(&task.id).await?;
        assert_eq!(task.rejection_count as usize, rejections.len());
        assert_eq!(rejections[1].notes.as_deref(), Some("still no"));
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_is_ordered_by_insertion() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let task = store.create_task("t", None, None, "h").await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        let audit = store.audit_history(&task.id).await?;
        assert_eq!(audit[0].to_status, "pending");
        assert_eq!(audit[1].from_status.as_deref(), Some("pending"));
        assert!(audit[0].id < audit[1].id);
        Ok(())
    }
}
