//! Merge progress: one durable checkpoint per cherry-pick.

use sqlx::Row;

use super::GlobalStore;
use crate::timefmt::now_str;
use crate::types::ProgressStatus;
use crate::{Error, Result};

/// Checkpoint row for `(session, workstream, position)`.
#[derive(Debug, Clone)]
pub struct MergeProgress {
    /// Owning session.
    pub session_id: String,
    /// Workstream whose commit this is.
    pub workstream_id: String,
    /// Zero-based position in the sealed commit list.
    pub position: i64,
    /// Source commit being cherry-picked.
    pub source_sha: String,
    /// Checkpoint status.
    pub status: ProgressStatus,
    /// Commit id produced by a successful apply.
    pub applied_sha: Option<String>,
    /// Task opened for an unresolved conflict.
    pub conflict_task_id: Option<String>,
    /// Reviewer feedback or skip reason.
    pub notes: Option<String>,
}

fn progress_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MergeProgress> {
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    Ok(MergeProgress {
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::Database(format!("field 'session_id': {e}")))?,
        workstream_id: row
            .try_get("workstream_id")
            .map_err(|e| Error::Database(format!("field 'workstream_id': {e}")))?,
        position: row
            .try_get("position")
            .map_err(|e| Error::Database(format!("field 'position': {e}")))?,
        source_sha: row
            .try_get("source_sha")
            .map_err(|e| Error::Database(format!("field 'source_sha': {e}")))?,
        status: status.parse()?,
        applied_sha: row
            .try_get("applied_sha")
            .map_err(|e| Error::Database(format!("field 'applied_sha': {e}")))?,
        conflict_task_id: row
            .try_get("conflict_task_id")
            .map_err(|e| Error::Database(format!("field 'conflict_task_id': {e}")))?,
        notes: row
            .try_get("notes")
            .map_err(|e| Error::Database(format!("field 'notes': {e}")))?,
    })
}

impl GlobalStore {
    /// Write (or overwrite) a checkpoint.
    pub async fn record_progress(&self, progress: &MergeProgress) -> Result<()> {
        sqlx::query(
            "INSERT INTO merge_progress
                 (session_id, workstream_id, position, source_sha, status, applied_sha,
                  conflict_task_id, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id, workstream_id, position) DO UPDATE SET
                 source_sha = ?4, status = ?5, applied_sha = ?6,
                 conflict_task_id = ?7, notes = ?8, updated_at = ?9",
        )
        .bind(&progress.session_id)
        .bind(&progress.workstream_id)
        .bind(progress.position)
        .bind(&progress.source_sha)
        .bind(progress.status.as_str())
        .bind(&progress.applied_sha)
        .bind(&progress.conflict_task_id)
        .bind(&progress.notes)
        .bind(now_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to record progress: {e}")))?;
        Ok(())
    }

    /// Read one checkpoint.
    pub async fn get_progress(
        &self,
        session_id: &str,
        workstream_id: &str,
        position: i64,
    ) -> Result<Option<MergeProgress>> {
        let row = sqlx::query(
            "SELECT session_id, workstream_id, position, source_sha, status, applied_sha,
                    conflict_task_id, notes
             FROM merge_progress
             WHERE session_id = ?1 AND workstream_id = ?2 AND position = ?3",
        )
        .bind(session_id)
        .bind(workstream_id)
        .bind(position)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to read progress: {e}")))?;
        row.as_ref().map(progress_from_row).transpose()
    }

    /// All checkpoints for a workstream, by position.
    pub async fn list_progress(
        &self,
        session_id: &str,
        workstream_id: &str,
    ) -> Result<Vec<MergeProgress>> {
        let rows = sqlx::query(
            "SELECT session_id, workstream_id, position, source_sha, status, applied_sha,
                    conflict_task_id, notes
             FROM merge_progress
             WHERE session_id = ?1 AND workstream_id = ?2
             ORDER BY position ASC",
        )
        .bind(session_id)
        .bind(workstream_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to list progress: {e}")))?;
        rows.iter().map(progress_from_row).collect()
    }

    /// Drop a checkpoint (rollback detected, retry from scratch).
    pub async fn clear_progress(
        &self,
        session_id: &str,
        workstream_id: &str,
        position: i64,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM merge_progress
             WHERE session_id = ?1 AND workstream_id = ?2 AND position = ?3",
        )
        .bind(session_id)
        .bind(workstream_id)
        .bind(position)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to clear progress: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_read_back() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let progress = MergeProgress {
            session_id: "s".into(),
            workstream_id: "ws".into(),
            position: 0,
            source_sha: "abc".into(),
            status: ProgressStatus::Conflict,
            applied_sha: None,
            conflict_task_id: Some("task-9".into()),
            notes: Some("needs manual look".into()),
        };
        store.record_progress(&progress).await?;

        // Conflict resolved: the same key flips to applied.
        let progress = MergeProgress {
            status: ProgressStatus::Applied,
            applied_sha: Some("def".into()),
            conflict_task_id: None,
            notes: None,
            ..progress
        };
        store.record_progress(&progress).await?;

        let row = store
            .get_progress("s", "ws", 0)
            .await?
            .ok_or_else(|| Error::Validation("missing row".into()))?;
        assert_eq!(row.status, ProgressStatus::Applied);
        assert_eq!(row.applied_sha.as_deref(), Some("def"));

        assert_eq!(store.list_progress("s", "ws").await?.len(), 1);
        store.clear_progress("s", "ws", 0).await?;
        assert!(store.get_progress("s", "ws", 0).await?.is_none());
        Ok(())
    }
}
