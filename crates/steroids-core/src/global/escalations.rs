//! Validation escalations: failed gates preserved for human review.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::GlobalStore;
use crate::timefmt::{now_str, parse_utc, parse_utc_opt};
use crate::{Error, Result};

/// Snippet cap for preserved stdout/stderr.
pub const ESCALATION_SNIPPET_CHARS: usize = 8_000;

/// A recorded validation failure.
#[derive(Debug, Clone)]
pub struct ValidationEscalation {
    /// Identifier.
    pub id: String,
    /// Session whose merge was gated.
    pub session_id: String,
    /// Project checkout path.
    pub project_path: String,
    /// Preserved integration workspace.
    pub workspace_path: String,
    /// The validation command that failed.
    pub command: String,
    /// Failure summary.
    pub error_message: String,
    /// Captured stdout, truncated.
    pub stdout_snippet: Option<String>,
    /// Captured stderr, truncated.
    pub stderr_snippet: Option<String>,
    /// `open` or `resolved`.
    pub status: String,
    /// When recorded.
    pub created_at: DateTime<Utc>,
    /// When resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

fn truncate_snippet(s: &str) -> String {
    if s.len() <= ESCALATION_SNIPPET_CHARS {
        return s.to_string();
    }
    let mut end = ESCALATION_SNIPPET_CHARS;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn escalation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ValidationEscalation> {
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| Error::Database(format!("field 'created_at': {e}")))?;
    let resolved_at: Option<String> = row
        .try_get("resolved_at")
        .map_err(|e| Error::Database(format!("field 'resolved_at': {e}")))?;
    Ok(ValidationEscalation {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::Database(format!("field 'session_id': {e}")))?,
        project_path: row
            .try_get("project_path")
            .map_err(|e| Error::Database(format!("field 'project_path': {e}")))?,
        workspace_path: row
            .try_get("workspace_path")
            .map_err(|e| Error::Database(format!("field 'workspace_path': {e}")))?,
        command: row
            .try_get("command")
            .map_err(|e| Error::Database(format!("field 'command': {e}")))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| Error::Database(format!("field 'error_message': {e}")))?,
        stdout_snippet: row
            .try_get("stdout_snippet")
            .map_err(|e| Error::Database(format!("field 'stdout_snippet': {e}")))?,
        stderr_snippet: row
            .try_get("stderr_snippet")
            .map_err(|e| Error::Database(format!("field 'stderr_snippet': {e}")))?,
        status: row
            .try_get("status")
            .map_err(|e| Error::Database(format!("field 'status': {e}")))?,
        created_at: parse_utc(&created_at)?,
        resolved_at: parse_utc_opt(resolved_at)?,
    })
}

impl GlobalStore {
    /// Record a failed validation gate. Output snippets are truncated to
    /// [`ESCALATION_SNIPPET_CHARS`].
    pub async fn record_validation_escalation(
        &self,
        session_id: &str,
        project_path: &str,
        workspace_path: &str,
        command: &str,
        error_message: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO validation_escalations
                 (id, session_id, project_path, workspace_path, command, error_message,
                  stdout_snippet, stderr_snippet, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(project_path)
        .bind(workspace_path)
        .bind(command)
        .bind(error_message)
        .bind(truncate_snippet(stdout))
        .bind(truncate_snippet(stderr))
        .bind(now_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to record escalation: {e}")))?;
        Ok(id)
    }

    /// Open escalations for a session.
    pub async fn list_open_escalations(
        &self,
        session_id: &str,
    ) -> Result<Vec<ValidationEscalation>> {
        let rows = sqlx::query(
            "SELECT id, session_id, project_path, workspace_path, command, error_message,
                    stdout_snippet, stderr_snippet, status, created_at, resolved_at
             FROM validation_escalations
             WHERE session_id = ?1 AND status = 'open'
             ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to list escalations: {e}")))?;
        rows.iter().map(escalation_from_row).collect()
    }

    /// Resolve every open escalation for a session (merge completed).
    pub async fn resolve_session_escalations(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE validation_escalations SET status = 'resolved', resolved_at = ?1
             WHERE session_id = ?2 AND status = 'open'",
        )
        .bind(now_str())
        .bind(session_id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to resolve escalations: {e}")))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_truncates_and_resolves() -> Result<()> {
        let store = GlobalStore::open_in_memory().await?;
        let long = "x".repeat(ESCALATION_SNIPPET_CHARS + 500);
        let id = store
            .record_validation_escalation(
                "s1",
                "/p",
                "/ws/integration",
                "cargo test",
                "validation command exited 1",
                &long,
                "",
            )
            .await?;

        let open = store.list_open_escalations("s1").await?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(
            open[0].stdout_snippet.as_ref().map(String::len),
            Some(ESCALATION_SNIPPET_CHARS)
        );

        assert_eq!(store.resolve_session_escalations("s1").await?, 1);
        assert!(store.list_open_escalations("s1").await?.is_empty());
        Ok(())
    }
}
