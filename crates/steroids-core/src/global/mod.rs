//! Global control plane.
//!
//! One WAL-mode sqlite database per host at `~/.steroids/steroids.db`,
//! shared by every runner on the machine. Registered projects, live
//! runners, parallel sessions, workstream leases, merge locks, merge
//! progress, and validation escalations all live here. Concurrent runners
//! coordinate exclusively through conditional updates on this store: any
//! ownership-dependent mutation carries a fence in its WHERE clause and
//! must observe exactly one changed row.

mod escalations;
mod merge_locks;
mod progress;
mod runners;
mod sessions;
mod workstreams;

pub use escalations::ValidationEscalation;
pub use merge_locks::MergeLock;
pub use progress::MergeProgress;
pub use runners::Runner;
pub use sessions::ParallelSession;
pub use workstreams::{Workstream, WorkstreamSeal};

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::paths::GlobalPaths;
use crate::{Error, Result};

/// Handle to the host-wide control plane.
#[derive(Debug, Clone)]
pub struct GlobalStore {
    pool: SqlitePool,
}

impl GlobalStore {
    /// Open the control plane under the user's home directory.
    pub async fn open_default() -> Result<Self> {
        let paths = GlobalPaths::resolve()?;
        Self::open(&paths.db_path()).await
    }

    /// Open (creating if necessary) the control plane at an explicit path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("cannot create {}: {e}", parent.display())))?;
        }
        let path_str = db_path
            .to_str()
            .ok_or_else(|| Error::Database("db path contains invalid UTF-8".into()))?;
        let url = format!("sqlite://{path_str}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| Error::Database(format!("failed to open global store: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
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

        let statements = [
            "CREATE TABLE IF NOT EXISTS projects (
                path TEXT PRIMARY KEY,
                registered_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS runners (
                id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                project_path TEXT NOT NULL,
                status TEXT NOT NULL,
                current_task_id TEXT,
                started_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_runners_project ON runners(project_path)",
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project_path TEXT NOT NULL,
                project_repo_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_sessions_repo ON sessions(project_repo_id)",
            "CREATE TABLE IF NOT EXISTS workstreams (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                branch TEXT NOT NULL,
                section_ids TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                status TEXT NOT NULL,
                runner_id TEXT,
                claim_generation INTEGER NOT NULL DEFAULT 0,
                lease_expires_at TEXT,
                sealed_base TEXT,
                sealed_head TEXT,
                sealed_commits TEXT,
                completion_order INTEGER,
                conflict_attempts INTEGER NOT NULL DEFAULT 0,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                reconcile_notes TEXT,
                completed_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_workstreams_session ON workstreams(session_id)",
            "CREATE TABLE IF NOT EXISTS merge_locks (
                session_id TEXT PRIMARY KEY,
                runner_id TEXT NOT NULL,
                lock_epoch INTEGER NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS merge_progress (
                session_id TEXT NOT NULL,
                workstream_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                source_sha TEXT NOT NULL,
                status TEXT NOT NULL,
                applied_sha TEXT,
                conflict_task_id TEXT,
                notes TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, workstream_id, position)
            )",
            "CREATE TABLE IF NOT EXISTS validation_escalations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                project_path TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                command TEXT NOT NULL,
                error_message TEXT NOT NULL,
                stdout_snippet TEXT,
                stderr_snippet TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_escalations_session
                 ON validation_escalations(session_id)",
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
