//! Disputes: recorded disagreements between coder, reviewer, and system.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::TaskStore;
use crate::timefmt::{now_str, parse_utc, parse_utc_opt};
use crate::types::{DisputeKind, DisputeStatus};
use crate::{Error, Result};

/// A recorded disagreement on a task.
#[derive(Debug, Clone)]
pub struct Dispute {
    /// Identifier.
    pub id: String,
    /// Task under dispute.
    pub task_id: String,
    /// Category.
    pub kind: DisputeKind,
    /// Open or resolved.
    pub status: DisputeStatus,
    /// Machine-readable reason.
    pub reason_code: Option<String>,
    /// The coder's stated position.
    pub coder_position: Option<String>,
    /// The reviewer's stated position.
    pub reviewer_position: Option<String>,
    /// Decision recorded at resolution.
    pub resolution_decision: Option<String>,
    /// Resolution notes.
    pub resolution_notes: Option<String>,
    /// Who opened the dispute.
    pub created_by: String,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// When opened.
    pub created_at: DateTime<Utc>,
    /// When resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

fn dispute_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Dispute> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| Error::Database(format!("field 'kind': {e}")))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| Error::Database(format!("field 'created_at': {e}")))?;
    let resolved_at: Option<String> = row
        .try_get("resolved_at")
        .map_err(|e| Error::Database(format!("field 'resolved_at': {e}")))?;

    Ok(Dispute {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        task_id: row
            .try_get("task_id")
            .map_err(|e| Error::Database(format!("field 'task_id': {e}")))?,
        kind: kind.parse()?,
        status: status.parse()?,
        reason_code: row
            .try_get("reason_code")
            .map_err(|e| Error::Database(format!("field 'reason_code': {e}")))?,
        coder_position: row
            .try_get("coder_position")
            .map_err(|e| Error::Database(format!("field 'coder_position': {e}")))?,
        reviewer_position: row
            .try_get("reviewer_position")
            .map_err(|e| Error::Database(format!("field 'reviewer_position': {e}")))?,
        resolution_decision: row
            .try_get("resolution_decision")
            .map_err(|e| Error::Database(format!("field 'resolution_decision': {e}")))?,
        resolution_notes: row
            .try_get("resolution_notes")
            .map_err(|e| Error::Database(format!("field 'resolution_notes': {e}")))?,
        created_by: row
            .try_get("created_by")
            .map_err(|e| Error::Database(format!("field 'created_by': {e}")))?,
        resolved_by: row
            .try_get("resolved_by")
            .map_err(|e| Error::Database(format!("field 'resolved_by': {e}")))?,
        created_at: parse_utc(&created_at)?,
        resolved_at: parse_utc_opt(resolved_at)?,
    })
}

const DISPUTE_COLUMNS: &str = "id, task_id, kind, status, reason_code, coder_position, \
                               reviewer_position, resolution_decision, resolution_notes, \
                               created_by, resolved_by, created_at, resolved_at";

impl TaskStore {
    /// Open a dispute. At most one open non-minor dispute may exist per
    /// task; the check and the insert share a transaction.
    pub async fn create_dispute(
        &self,
        task_id: &str,
        kind: DisputeKind,
        reason_code: Option<&str>,
        coder_position: Option<&str>,
        reviewer_position: Option<&str>,
        created_by: &str,
    ) -> Result<Dispute> {
        self.get_task(task_id).await?;

        let mut tx = self.pool().begin().await?;
        if kind.blocks_task() {
            let row = sqlx::query(
                "SELECT COUNT(*) AS open FROM disputes
                 WHERE task_id = ?1 AND status = 'open' AND kind != 'minor'",
            )
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to count open disputes: {e}")))?;
            let open: i64 = row
                .try_get("open")
                .map_err(|e| Error::Database(format!("field 'open': {e}")))?;
            if open > 0 {
                return Err(Error::Validation(format!(
                    "task {task_id} already has an open dispute"
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO disputes (id, task_id, kind, status, reason_code, coder_position,
                                   reviewer_position, created_by, created_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(kind.as_str())
        .bind(reason_code)
        .bind(coder_position)
        .bind(reviewer_position)
        .bind(created_by)
        .bind(now_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to insert dispute: {e}")))?;
        tx.commit().await?;

        self.get_dispute(&id).await
    }

    /// Fetch a dispute by id.
    pub async fn get_dispute(&self, id: &str) -> Result<Dispute> {
        let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to fetch dispute: {e}")))?
            .ok_or_else(|| Error::Validation(format!("dispute not found: {id}")))?;
        dispute_from_row(&row)
    }

    /// List disputes for a task, newest first.
    pub async fn list_disputes(&self, task_id: &str) -> Result<Vec<Dispute>> {
        let sql = format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE task_id = ?1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to list disputes: {e}")))?;
        rows.iter().map(dispute_from_row).collect()
    }

    /// Resolve an open dispute.
    pub async fn resolve_dispute(
        &self,
        id: &str,
        decision: &str,
        notes: Option<&str>,
        resolved_by: &str,
    ) -> Result<Dispute> {
        let result = sqlx::query(
            "UPDATE disputes
             SET status = 'resolved', resolution_decision = ?1, resolution_notes = ?2,
                 resolved_by = ?3, resolved_at = ?4
             WHERE id = ?5 AND status = 'open'",
        )
        .bind(decision)
        .bind(notes)
        .bind(resolved_by)
        .bind(now_str())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to resolve dispute: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!(
                "dispute {id} is not open or does not exist"
            )));
        }
        self.get_dispute(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_open_blocking_dispute() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let task = store.create_task("t", None, None, "h").await?;

        store
            .create_dispute(&task.id, DisputeKind::Major, None, None, None, "reviewer")
            .await?;

        // A second blocking dispute is refused while the first is open.
        let result = store
            .create_dispute(&task.id, DisputeKind::System, None, None, None, "system")
            .await;
        assert!(result.is_err());

        // Minor disputes are advisory and always allowed.
        store
            .create_dispute(&task.id, DisputeKind::Minor, None, None, None, "reviewer")
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_closes_dispute() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let task = store.create_task("t", None, None, "h").await?;
        let dispute = store
            .create_dispute(&task.id, DisputeKind::Coder, None, Some("works"), None, "coder")
            .await?;

        let resolved = store
            .resolve_dispute(&dispute.id, "coder_upheld", Some("verified"), "human")
            .await?;
        assert_eq!(resolved.status, DisputeStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        // After resolution a new blocking dispute may open.
        store
            .create_dispute(&task.id, DisputeKind::Major, None, None, None, "reviewer")
            .await?;
        Ok(())
    }
}
