//! Workstream rows and the claim-generation lease discipline.
//!
//! Every mutation of a workstream carries the three-column fence
//! `(id, status, claim_generation)`. Zero changed rows means the caller's
//! lease is stale and the operation must abort.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::GlobalStore;
use crate::timefmt::{now_str, parse_utc, parse_utc_opt};
use crate::types::WorkstreamStatus;
use crate::{Error, Result};

/// Default lease lifetime granted on claim and refresh.
pub const LEASE_TTL_SECS: i64 = 120;

/// A concurrent lane of execution.
#[derive(Debug, Clone)]
pub struct Workstream {
    /// Identifier; also names the branch and the clone directory.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Branch the lane commits to (`steroids/<id>`).
    pub branch: String,
    /// Ordered section ids assigned to this lane.
    pub section_ids: Vec<String>,
    /// Clone directory.
    pub workspace_path: String,
    /// Lane status.
    pub status: WorkstreamStatus,
    /// Runner holding the current lease.
    pub runner_id: Option<String>,
    /// Monotonic ownership counter; bumped on every transfer.
    pub claim_generation: i64,
    /// When the current lease expires.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Merge base captured at seal time.
    pub sealed_base: Option<String>,
    /// Branch head captured at seal time.
    pub sealed_head: Option<String>,
    /// Ordered source commits captured at seal time.
    pub sealed_commits: Vec<String>,
    /// Merge order among the session's workstreams.
    pub completion_order: Option<i64>,
    /// Conflict-resolution attempts consumed.
    pub conflict_attempts: i64,
    /// Crash-recovery attempts consumed.
    pub recovery_attempts: i64,
    /// Reconciliation notes left by recovery.
    pub reconcile_notes: Option<String>,
    /// When the lane finished its last task.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Sealed SHAs for one workstream, persisted in a single transaction.
#[derive(Debug, Clone)]
pub struct WorkstreamSeal {
    /// Workstream being sealed.
    pub workstream_id: String,
    /// Claim generation the caller read; the fence.
    pub claim_generation: i64,
    /// `merge-base(remote/main, remote/branch)`.
    pub base: String,
    /// `rev-parse(remote/branch)`.
    pub head: String,
    /// `log base..head --reverse`.
    pub commits: Vec<String>,
    /// Merge order.
    pub completion_order: i64,
}

fn workstream_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Workstream> {
    let status: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("field 'status': {e}")))?;
    let section_ids: String = row
        .try_get("section_ids")
        .map_err(|e| Error::Database(format!("field 'section_ids': {e}")))?;
    let sealed_commits: Option<String> = row
        .try_get("sealed_commits")
        .map_err(|e| Error::Database(format!("field 'sealed_commits': {e}")))?;
    let lease_expires_at: Option<String> = row
        .try_get("lease_expires_at")
        .map_err(|e| Error::Database(format!("field 'lease_expires_at': {e}")))?;
    let completed_at: Option<String> = row
        .try_get("completed_at")
        .map_err(|e| Error::Database(format!("field 'completed_at': {e}")))?;

    Ok(Workstream {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::Database(format!("field 'session_id': {e}")))?,
        branch: row
            .try_get("branch")
            .map_err(|e| Error::Database(format!("field 'branch': {e}")))?,
        section_ids: serde_json::from_str(&section_ids)
            .map_err(|e| Error::Parse(format!("invalid section_ids: {e}")))?,
        workspace_path: row
            .try_get("workspace_path")
            .map_err(|e| Error::Database(format!("field 'workspace_path': {e}")))?,
        status: status.parse()?,
        runner_id: row
            .try_get("runner_id")
            .map_err(|e| Error::Database(format!("field 'runner_id': {e}")))?,
        claim_generation: row
            .try_get("claim_generation")
            .map_err(|e| Error::Database(format!("field 'claim_generation': {e}")))?,
        lease_expires_at: parse_utc_opt(lease_expires_at)?,
        sealed_base: row
            .try_get("sealed_base")
            .map_err(|e| Error::Database(format!("field 'sealed_base': {e}")))?,
        sealed_head: row
            .try_get("sealed_head")
            .map_err(|e| Error::Database(format!("field 'sealed_head': {e}")))?,
        sealed_commits: sealed_commits
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| Error::Parse(format!("invalid sealed_commits: {e}")))?
            .unwrap_or_default(),
        completion_order: row
            .try_get("completion_order")
            .map_err(|e| Error::Database(format!("field 'completion_order': {e}")))?,
        conflict_attempts: row
            .try_get("conflict_attempts")
            .map_err(|e| Error::Database(format!("field 'conflict_attempts': {e}")))?,
        recovery_attempts: row
            .try_get("recovery_attempts")
            .map_err(|e| Error::Database(format!("field 'recovery_attempts': {e}")))?,
        reconcile_notes: row
            .try_get("reconcile_notes")
            .map_err(|e| Error::Database(format!("field 'reconcile_notes': {e}")))?,
        completed_at: parse_utc_opt(completed_at)?,
    })
}

const WS_COLUMNS: &str = "id, session_id, branch, section_ids, workspace_path, status, \
                          runner_id, claim_generation, lease_expires_at, sealed_base, \
                          sealed_head, sealed_commits, completion_order, conflict_attempts, \
                          recovery_attempts, reconcile_notes, completed_at";

impl GlobalStore {
    /// Insert a workstream row with claim generation 0 (unclaimed).
    pub async fn insert_workstream(
        &self,
        id: &str,
        session_id: &str,
        branch: &str,
        section_ids: &[String],
        workspace_path: &str,
    ) -> Result<Workstream> {
        let sections = serde_json::to_string(section_ids)?;
        sqlx::query(
            "INSERT INTO workstreams (id, session_id, branch, section_ids, workspace_path, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id)
        .bind(session_id)
        .bind(branch)
        .bind(&sections)
        .bind(workspace_path)
        .bind(WorkstreamStatus::Running.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to insert workstream: {e}")))?;
        self.get_workstream(id).await
    }

    /// Fetch a workstream by id.
    pub async fn get_workstream(&self, id: &str) -> Result<Workstream> {
        let sql = format!("SELECT {WS_COLUMNS} FROM workstreams WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to fetch workstream: {e}")))?
            .ok_or_else(|| Error::Validation(format!("workstream not found: {id}")))?;
        workstream_from_row(&row)
    }

    /// All workstreams of a session, in completion order where sealed.
    pub async fn list_session_workstreams(&self, session_id: &str) -> Result<Vec<Workstream>> {
        let sql = format!(
            "SELECT {WS_COLUMNS} FROM workstreams WHERE session_id = ?1
             ORDER BY completion_order IS NULL, completion_order ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to list workstreams: {e}")))?;
        rows.iter().map(workstream_from_row).collect()
    }

    /// Claim the lease, bumping the claim generation.
    ///
    /// Succeeds when the caller's `expected_generation` still matches and
    /// the lease is either unclaimed, already owned by this runner, or
    /// expired. Returns the new generation.
    pub async fn claim_workstream(
        &self,
        id: &str,
        runner_id: &str,
        expected_generation: i64,
    ) -> Result<i64> {
        let now = Utc::now();
        let expires = (now + Duration::seconds(LEASE_TTL_SECS)).to_rfc3339();
        let now_s = now.to_rfc3339();

        let result = sqlx::query(
            "UPDATE workstreams
             SET runner_id = ?1, claim_generation = claim_generation + 1, lease_expires_at = ?2
             WHERE id = ?3 AND status = 'running' AND claim_generation = ?4
               AND (runner_id IS NULL OR runner_id = ?1 OR lease_expires_at < ?5)",
        )
        .bind(runner_id)
        .bind(&expires)
        .bind(id)
        .bind(expected_generation)
        .bind(&now_s)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to claim workstream: {e}")))?;

        if result.rows_affected() != 1 {
            return Err(Error::LeaseFenceFailed(id.to_string()));
        }
        Ok(expected_generation + 1)
    }

    /// Heartbeat: advance lease expiry under the full fence.
    pub async fn refresh_lease(
        &self,
        id: &str,
        runner_id: &str,
        claim_generation: i64,
    ) -> Result<()> {
        let expires = (Utc::now() + Duration::seconds(LEASE_TTL_SECS)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE workstreams SET lease_expires_at = ?1
             WHERE id = ?2 AND status = 'running' AND claim_generation = ?3 AND runner_id = ?4",
        )
        .bind(&expires)
        .bind(id)
        .bind(claim_generation)
        .bind(runner_id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to refresh lease: {e}")))?;
        if result.rows_affected() != 1 {
            return Err(Error::LeaseFenceFailed(id.to_string()));
        }
        Ok(())
    }

    /// Fenced status change for a workstream.
    pub async fn set_workstream_status(
        &self,
        id: &str,
        expected_status: WorkstreamStatus,
        claim_generation: i64,
        to: WorkstreamStatus,
    ) -> Result<()> {
        let completed_at = matches!(to, WorkstreamStatus::Completed).then(now_str);
        let result = sqlx::query(
            "UPDATE workstreams
             SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3 AND status = ?4 AND claim_generation = ?5",
        )
        .bind(to.as_str())
        .bind(completed_at)
        .bind(id)
        .bind(expected_status.as_str())
        .bind(claim_generation)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to update workstream: {e}")))?;
        if result.rows_affected() != 1 {
            return Err(Error::LeaseFenceFailed(id.to_string()));
        }
        Ok(())
    }

    /// Seal every workstream's commit list in one transaction, each update
    /// gated by its own claim-generation fence. Any stale fence rolls the
    /// whole seal back.
    pub async fn seal_workstreams(&self, seals: &[WorkstreamSeal]) -> Result<()> {
        let now = now_str();
        let mut tx = self.pool().begin().await?;
        for seal in seals {
            let commits = serde_json::to_string(&seal.commits)?;
            let result = sqlx::query(
                "UPDATE workstreams
                 SET sealed_base = ?1, sealed_head = ?2, sealed_commits = ?3,
                     completion_order = ?4, completed_at = COALESCE(completed_at, ?5)
                 WHERE id = ?6 AND claim_generation = ?7",
            )
            .bind(&seal.base)
            .bind(&seal.head)
            .bind(&commits)
            .bind(seal.completion_order)
            .bind(&now)
            .bind(&seal.workstream_id)
            .bind(seal.claim_generation)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("failed to seal workstream: {e}")))?;
            if result.rows_affected() != 1 {
                return Err(Error::LeaseFenceFailed(seal.workstream_id.clone()));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Bump the conflict-attempt counter and return the new value.
    pub async fn bump_conflict_attempts(&self, id: &str) -> Result<i64> {
        sqlx::query("UPDATE workstreams SET conflict_attempts = conflict_attempts + 1 WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to bump conflict attempts: {e}")))?;
        Ok(self.get_workstream(id).await?.conflict_attempts)
    }

    /// Bump the recovery-attempt counter and return the new value.
    pub async fn bump_recovery_attempts(&self, id: &str) -> Result<i64> {
        sqlx::query(
            "UPDATE workstreams SET recovery_attempts = recovery_attempts + 1 WHERE id = ?1",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to bump recovery attempts: {e}")))?;
        Ok(self.get_workstream(id).await?.recovery_attempts)
    }
}
