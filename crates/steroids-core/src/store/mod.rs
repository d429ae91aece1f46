//! Project-local task store.
//!
//! One WAL-mode sqlite database per project checkout at
//! `<project>/.steroids/steroids.db`. Owns tasks, sections and their
//! dependency graph, the append-only audit log, disputes, and per-invocation
//! records. Every status transition appends its audit entry in the same
//! transaction.

mod audit;
mod disputes;
mod invocations;
mod sections;
mod tasks;

pub use audit::{AuditEntry, RejectionEntry};
pub use disputes::Dispute;
pub use invocations::TaskInvocation;
pub use sections::Section;
pub use tasks::{NextTask, Task};

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::paths::ProjectPaths;
use crate::{Error, Result};

/// Handle to a project's task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if necessary) the store for a project checkout.
    pub async fn open(project_root: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(project_root);
        tokio::fs::create_dir_all(paths.state_dir())
            .await
            .map_err(|e| {
                Error::Io(format!(
                    "cannot create {}: {e}",
                    paths.state_dir().display()
                ))
            })?;

        let db_path = paths.db_path();
        let path_str = db_path
            .to_str()
            .ok_or_else(|| Error::Database("db path contains invalid UTF-8".into()))?;
        let url = format!("sqlite://{path_str}?mode=rwc");

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| Error::Database(format!("failed to open task store: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open the store only if the project is already initialized.
    pub async fn open_existing(project_root: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(project_root);
        if !paths.is_initialized() {
            return Err(Error::NotInitialized(
                project_root.display().to_string(),
            ));
        }
        Self::open(project_root).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Database(format!("failed to open in-memory store: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to enable WAL mode: {e}")))?;
        sqlx::query("PRAGMA foreign_keys=ON;")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to enable foreign keys: {e}")))?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS sections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                position INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 50,
                skipped INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS section_dependencies (
                section_id TEXT NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
                depends_on TEXT NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
                PRIMARY KEY (section_id, depends_on)
            )",
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                section_id TEXT REFERENCES sections(id),
                spec_path TEXT,
                notes TEXT,
                rejection_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_section ON tasks(section_id)",
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                from_status TEXT,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                notes TEXT,
                commit_sha TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log(task_id)",
            "CREATE TABLE IF NOT EXISTS disputes (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                reason_code TEXT,
                coder_position TEXT,
                reviewer_position TEXT,
                resolution_decision TEXT,
                resolution_notes TEXT,
                created_by TEXT NOT NULL,
                resolved_by TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_disputes_task ON disputes(task_id)",
            "CREATE TABLE IF NOT EXISTS invocations (
                id TEXT PRIMARY KEY,
                task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
                role TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                response TEXT,
                error TEXT,
                success INTEGER NOT NULL DEFAULT 0,
                timed_out INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_invocations_task ON invocations(task_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("failed to initialize schema: {e}")))?;
        }
        Ok(())
    }
}
