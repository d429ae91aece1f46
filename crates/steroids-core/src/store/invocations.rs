//! Per-invocation audit records.
//!
//! Each provider invocation gets one row plus a companion NDJSON activity
//! log at `.steroids/invocations/<invocation-id>.log`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::TaskStore;
use crate::timefmt::{now_str, parse_utc, parse_utc_opt};
use crate::types::{InvocationStatus, Role};
use crate::{Error, Result};

/// One provider invocation, for the audit trail.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// Identifier; names the activity log file.
    pub id: String,
    /// Task the invocation worked on, if any.
    pub task_id: Option<String>,
    /// Role of the invocation.
    pub role: Role,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: Option<String>,
    /// Terminal status.
    pub status: InvocationStatus,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Captured response text.
    pub response: Option<String>,
    /// Captured error text.
    pub error: Option<String>,
    /// Whether the provider exited zero.
    pub success: bool,
    /// Whether the timeout fired.
    pub timed_out: bool,
}

fn role_from_str(s: &str) -> Result<Role> {
    match s {
        "orchestrator" => Ok(Role::Orchestrator),
        "coder" => Ok(Role::Coder),
        "reviewer" => Ok(Role::Reviewer),
        _ => Err(Error::Parse(format!("invalid role: {s}"))),
    }
}

fn invocation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskInvocation> {
    let role: String = row
        .try_get("role")
        .map_err(|e| Error::Database(format!("field 'role': {e}")))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let started_at: String = row
        .try_get("started_at")
        .map_err(|e| Error::Database(format!("field 'started_at': {e}")))?;
    let completed_at: Option<String> = row
        .try_get("completed_at")
        .map_err(|e| Error::Database(format!("field 'completed_at': {e}")))?;
    let success: i64 = row
        .try_get("success")
        .map_err(|e| Error::Database(format!("field 'success': {e}")))?;
    let timed_out: i64 = row
        .try_get("timed_out")
        .map_err(|e| Error::Database(format!("field 'timed_out': {e}")))?;

    Ok(TaskInvocation {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        task_id: row
            .try_get("task_id")
            .map_err(|e| Error::Database(format!("field 'task_id': {e}")))?,
        role: role_from_str(&role)?,
        provider: row
            .try_get("provider")
            .map_err(|e| Error::Database(format!("field 'provider': {e}")))?,
        model: row
            .try_get("model")
            .map_err(|e| Error::Database(format!("field 'model': {e}")))?,
        status: status.parse()?,
        started_at: parse_utc(&started_at)?,
        completed_at: parse_utc_opt(completed_at)?,
        response: row
            .try_get("response")
            .map_err(|e| Error::Database(format!("field 'response': {e}")))?,
        error: row
            .try_get("error")
            .map_err(|e| Error::Database(format!("field 'error': {e}")))?,
        success: success != 0,
        timed_out: timed_out != 0,
    })
}

impl TaskStore {
    /// Record the start of an invocation. Status stays `failed` until the
    /// terminal update lands, so a crash leaves an honest row behind.
    pub async fn start_invocation(
        &self,
        task_id: Option<&str>,
        role: Role,
        provider: &str,
        model: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO invocations (id, task_id, role, provider, model, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'failed', ?6)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(role.as_str())
        .bind(provider)
        .bind(model)
        .bind(now_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to insert invocation: {e}")))?;
        Ok(id)
    }

    /// Record an invocation's terminal state.
    pub async fn complete_invocation(
        &self,
        id: &str,
        status: InvocationStatus,
        response: Option<&str>,
        error: Option<&str>,
        success: bool,
        timed_out: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE invocations
             SET status = ?1, completed_at = ?2, response = ?3, error = ?4,
                 success = ?5, timed_out = ?6
             WHERE id = ?7",
        )
        .bind(status.as_str())
        .bind(now_str())
        .bind(response)
        .bind(error)
        .bind(i64::from(success))
        .bind(i64::from(timed_out))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to complete invocation: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("invocation not found: {id}")));
        }
        Ok(())
    }

    /// List a task's invocations, oldest first.
    pub async fn list_invocations(&self, task_id: &str) -> Result<Vec<TaskInvocation>> {
        let rows = sqlx::query(
            "SELECT id, task_id, role, provider, model, status, started_at, completed_at,
                    response, error, success, timed_out
             FROM invocations WHERE task_id = ?1 ORDER BY started_at ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to list invocations: {e}")))?;
        rows.iter().map(invocation_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invocation_lifecycle() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let task = store.create_task("t", None, None, "h").await?;

        let id = store
            .start_invocation(Some(&task.id), Role::Coder, "claude", Some("opus"))
            .await?;
        store
            .complete_invocation(
                &id,
                InvocationStatus::Completed,
                Some("done"),
                None,
                true,
                false,
            )
            .await?;

        let invocations = store.list_invocations(&task.id).await?;
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].status, InvocationStatus::Completed);
        assert!(invocations[0].success);
        assert!(!invocations[0].timed_out);
        assert!(invocations[0].completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_recorded() -> Result<()> {
        let store = TaskStore::open_in_memory().await?;
        let id = store
            .start_invocation(None, Role::Reviewer, "codex", None)
            .await?;
        store
            .complete_invocation(&id, InvocationStatus::Timeout, None, Some("timed out"), false, true)
            .await?;
        Ok(())
    }
}
