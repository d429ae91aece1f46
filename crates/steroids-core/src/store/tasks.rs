//! Task records, lifecycle transitions, and next-task selection.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::TaskStore;
use crate::timefmt::{now_str, parse_utc};
use crate::types::TaskStatus;
use crate::{Error, Result};

/// A unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Opaque identifier.
    pub id: String,
    /// Human title.
    pub title: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Owning section, if any.
    pub section_id: Option<String>,
    /// Path to the linked specification file.
    pub spec_path: Option<String>,
    /// Latest free-text note.
    pub notes: Option<String>,
    /// Number of review rejections so far.
    pub rejection_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Result of next-task selection.
#[derive(Debug, Clone)]
pub enum NextTask {
    /// The task to work on.
    Task(Task),
    /// No eligible work right now.
    Idle,
}

const TASK_COLUMNS: &str = "id, title, status, section_id, spec_path, notes, \
                            rejection_count, created_at, updated_at";

pub(super) fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| Error::Database(format!("field 'created_at': {e}")))?;
    let updated_at: String = row
        .try_get("updated_at")
        .map_err(|e| Error::Database(format!("field 'updated_at': {e}")))?;
    let rejection_count: i64 = row
        .try_get("rejection_count")
        .map_err(|e| Error::Database(format!("field 'rejection_count': {e}")))?;

    Ok(Task {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        title: row
            .try_get("title")
            .map_err(|e| Error::Database(format!("field 'title': {e}")))?,
        status: status_str.parse()?,
        section_id: row
            .try_get("section_id")
            .map_err(|e| Error::Database(format!("field 'section_id': {e}")))?,
        spec_path: row
            .try_get("spec_path")
            .map_err(|e| Error::Database(format!("field 'spec_path': {e}")))?,
        notes: row
            .try_get("notes")
            .map_err(|e| Error::Database(format!("field 'notes': {e}")))?,
        rejection_count: u32::try_from(rejection_count).unwrap_or(0),
        created_at: parse_utc(&created_at)?,
        updated_at: parse_utc(&updated_at)?,
    })
}

impl TaskStore {
    /// Create a task. The creation audit entry lands in the same
    /// transaction.
    pub async fn create_task(
        &self,
        title: &str,
        section_id: Option<&str>,
        spec_path: Option<&str>,
        actor: &str,
    ) -> Result<Task> {
        if title.trim().is_empty() {
            return Err(Error::Validation("task title cannot be empty".into()));
        }
        if let Some(section) = section_id {
            // Fails early with SECTION_NOT_FOUND instead of a raw FK error.
            self.get_section(section).await?;
        }

        let id = Uuid::new_v4().to_string();
        let now = now_str();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO tasks (id, title, status, section_id, spec_path, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
        )
        .bind(&id)
        .bind(title)
        .bind(section_id)
        .bind(spec_path)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to insert task: {e}")))?;

        sqlx::query(
            "INSERT INTO audit_log (task_id, from_status, to_status, actor, created_at)
             VALUES (?1, NULL, 'pending', ?2, ?3)",
        )
        .bind(&id)
        .bind(actor)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to insert audit entry: {e}")))?;
        tx.commit().await?;

        self.get_task(&id).await
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to fetch task: {e}")))?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task_from_row(&row)
    }

    /// List tasks, optionally filtered by status and/or section.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        section_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        if status.is_some() {
            sql.push_str(" AND status = ?1");
        }
        if section_id.is_some() {
            sql.push_str(if status.is_some() {
                " AND section_id = ?2"
            } else {
                " AND section_id = ?1"
            });
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(section) = section_id {
            query = query.bind(section);
        }

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to list tasks: {e}")))?;
        rows.iter().map(task_from_row).collect()
    }

    /// Transition a task to a new status, appending the audit entry in the
    /// same transaction. The reject edge (`review -> in_progress`) bumps
    /// the rejection counter atomically.
    pub async fn transition_task(
        &self,
        id: &str,
        to: TaskStatus,
        actor: &str,
        notes: Option<&str>,
        commit_sha: Option<&str>,
    ) -> Result<Task> {
        let current = self.get_task(id).await?;
        if !current.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let is_rejection = current.status == TaskStatus::Review && to == TaskStatus::InProgress;
        let now = now_str();

        let mut tx = self.pool().begin().await?;
        let sql = if is_rejection {
            "UPDATE tasks SET status = ?1, updated_at = ?2, notes = COALESCE(?3, notes),
                    rejection_count = rejection_count + 1
             WHERE id = ?4 AND status = ?5"
        } else {
            "UPDATE tasks SET status = ?1, updated_at = ?2, notes = COALESCE(?3, notes)
             WHERE id = ?4 AND status = ?5"
        };
        let result = sqlx::query(sql)
            .bind(to.as_str())
            .bind(&now)
            .bind(notes)
            .bind(id)
            .bind(current.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to transition task: {e}")))?;

        // Zero rows means another runner moved the task first.
        if result.rows_affected() != 1 {
            return Err(Error::TaskLocked(id.to_string()));
        }

        sqlx::query(
            "INSERT INTO audit_log (task_id, from_status, to_status, actor, notes, commit_sha, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id)
        .bind(current.status.as_str())
        .bind(to.as_str())
        .bind(actor)
        .bind(notes)
        .bind(commit_sha)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to insert audit entry: {e}")))?;
        tx.commit().await?;

        self.get_task(id).await
    }

    /// Delete a task with its audit trail and disputes.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM audit_log WHERE task_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to delete audit entries: {e}")))?;
        sqlx::query("DELETE FROM disputes WHERE task_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to delete disputes: {e}")))?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to delete task: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Count tasks that still represent pending work (not completed,
    /// skipped, or failed). The wakeup controller keys off this.
    pub async fn count_open_tasks(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks
             WHERE status NOT IN ('completed', 'skipped', 'failed')",
        )
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to count open tasks: {e}")))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| Error::Database(format!("field 'n': {e}")))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Select the next eligible task.
    ///
    /// Precedence: `review` first (finish the handshake), then
    /// `in_progress` (resume), then `pending`. Within a tier the lowest
    /// section position wins (sectionless tasks sort last), then the
    /// earliest creation time. Tasks in sections whose dependencies are
    /// unmet are invisible.
    pub async fn next_task(&self, section_filter: Option<&str>) -> Result<NextTask> {
        let rows = sqlx::query(
            "SELECT t.id, t.title, t.status, t.section_id, t.spec_path, t.notes,
                    t.rejection_count, t.created_at, t.updated_at,
                    s.position AS section_position, s.skipped AS section_skipped
             FROM tasks t
             LEFT JOIN sections s ON s.id = t.section_id
             WHERE t.status IN ('review', 'in_progress', 'pending')
             ORDER BY CASE t.status
                        WHEN 'review' THEN 0
                        WHEN 'in_progress' THEN 1
                        ELSE 2
                      END,
                      CASE WHEN t.section_id IS NULL THEN 1 ELSE 0 END,
                      s.position ASC,
                      t.created_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to select next task: {e}")))?;

        for row in &rows {
            let task = task_from_row(row)?;

            if let Some(filter) = section_filter {
                if task.section_id.as_deref() != Some(filter) {
                    continue;
                }
            }

            if let Some(section_id) = &task.section_id {
                let skipped: i64 = row
                    .try_get("section_skipped")
                    .map_err(|e| Error::Database(format!("field 'section_skipped': {e}")))?;
                if skipped != 0 {
                    continue;
                }
                if !self.dependencies_met(section_id).await? {
                    continue;
                }
            }

            return Ok(NextTask::Task(task));
        }

        Ok(NextTask::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        TaskStore::open_in_memory()
            .await
            .unwrap_or_else(|e| panic!("in-memory store: {e}"))
    }

    #[tokio::test]
    async fn test_create_and_get() -> Result<()> {
        let store = store().await;
        let task = store.create_task("Add login", None, None, "human").await?;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.rejection_count, 0);

        let fetched = store.get_task(&task.id).await?;
        assert_eq!(fetched.title, "Add login");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let store = store().await;
        let result = store.get_task("nope").await;
        assert!(matches!(result, Err(Error::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_appends_audit() -> Result<()> {
        let store = store().await;
        let task = store.create_task("t", None, None, "human").await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "coder", None, None)
            .await?;
        let task = store
            .transition_task(&task.id, TaskStatus::Review, "coder", None, Some("abc123"))
            .await?;
        assert_eq!(task.status, TaskStatus::Review);

        let audit = store.audit_history(&task.id).await?;
        // create + start + submit
        assert_eq!(audit.len(), 3);
        assert_eq!(audit[2].commit_sha.as_deref(), Some("abc123"));
        Ok(())
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() -> Result<()> {
        let store = store().await;
        let task = store.create_task("t", None, None, "human").await?;
        let result = store
            .transition_task(&task.id, TaskStatus::Completed, "human", None, None)
            .await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejection_count_tracks_reject_edges() -> Result<()> {
        let store = store().await;
        let task = store.create_task("t", None, None, "human").await?;
        store
            .transition_task(&task.id, TaskStatus::InProgress, "coder", None, None)
            .await?;

        for round in 1..=3u32 {
            store
                .transition_task(&task.id, TaskStatus::Review, "coder", None, None)
                .await?;
            let task = store
                .transition_task(
                    &task.id,
                    TaskStatus::InProgress,
                    "reviewer",
                    Some("needs work"),
                    None,
                )
                .await?;
            assert_eq!(task.rejection_count, round);
        }

        let rejections = store.rejection_history(&task.id).await?;
        assert_eq!(rejections.len(), 3);
        assert_eq!(rejections[0].ordinal, 1);
        assert_eq!(rejections[2].ordinal, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_next_task_priority_tiers() -> Result<()> {
        let store = store().await;
        let pending = store.create_task("pending", None, None, "h").await?;
        let in_progress = store.create_task("wip", None, None, "h").await?;
        store
            .transition_task(&in_progress.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        let review = store.create_task("review", None, None, "h").await?;
        store
            .transition_task(&review.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        store
            .transition_task(&review.id, TaskStatus::Review, "c", None, None)
            .await?;

        match store.next_task(None).await? {
            NextTask::Task(task) => assert_eq!(task.id, review.id),
            NextTask::Idle => panic!("expected a task"),
        }

        store
            .transition_task(&review.id, TaskStatus::Completed, "r", None, None)
            .await?;
        match store.next_task(None).await? {
            NextTask::Task(task) => assert_eq!(task.id, in_progress.id),
            NextTask::Idle => panic!("expected a task"),
        }

        store
            .transition_task(&in_progress.id, TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&in_progress.id, TaskStatus::Completed, "r", None, None)
            .await?;
        match store.next_task(None).await? {
            NextTask::Task(task) => assert_eq!(task.id, pending.id),
            NextTask::Idle => panic!("expected a task"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_next_task_respects_unmet_dependencies() -> Result<()> {
        let store = store().await;
        let base = store.create_section("base", 0, 50).await?;
        let dependent = store.create_section("dependent", 1, 50).await?;
        store.add_section_dependency(&dependent.id, &base.id).await?;

        store
            .create_task("base work", Some(&base.id), None, "h")
            .await?;
        store
            .create_task("dependent work", Some(&dependent.id), None, "h")
            .await?;

        // Only the base section's task is eligible.
        match store.next_task(None).await? {
            NextTask::Task(task) => assert_eq!(task.title, "base work"),
            NextTask::Idle => panic!("expected a task"),
        }

        // Filtering to the blocked section yields idle, not the blocked task.
        match store.next_task(Some(&dependent.id)).await? {
            NextTask::Task(task) => panic!("unexpected task {}", task.title),
            NextTask::Idle => {}
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_next_task_orders_by_section_position() -> Result<()> {
        let store = store().await;
        let late = store.create_section("late", 10, 50).await?;
        let early = store.create_section("early", 1, 50).await?;
        store.create_task("b", Some(&late.id), None, "h").await?;
        store.create_task("a", Some(&early.id), None, "h").await?;
        store.create_task("unsectioned", None, None, "h").await?;

        match store.next_task(None).await? {
            NextTask::Task(task) => assert_eq!(task.title, "a"),
            NextTask::Idle => panic!("expected a task"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_count_open_tasks() -> Result<()> {
        let store = store().await;
        let a = store.create_task("a", None, None, "h").await?;
        store.create_task("b", None, None, "h").await?;
        store
            .transition_task(&a.id, TaskStatus::InProgress, "c", None, None)
            .await?;
        store
            .transition_task(&a.id, TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&a.id, TaskStatus::Completed, "r", None, None)
            .await?;
        assert_eq!(store.count_open_tasks().await?, 1);
        Ok(())
    }
}
