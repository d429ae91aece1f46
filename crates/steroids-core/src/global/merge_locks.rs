//! Session-scoped merge locks with epoch fencing.
//!
//! One lock row per session. Every grant bumps the monotonic `lock_epoch`;
//! the holder passes its epoch to every merge-state mutation as a fence.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::GlobalStore;
use crate::timefmt::parse_utc;
use crate::{Error, Result};

/// The mutual-exclusion token for a session's merge.
#[derive(Debug, Clone)]
pub struct MergeLock {
    /// Session the lock covers.
    pub session_id: String,
    /// Holding runner.
    pub runner_id: String,
    /// Monotonic epoch; the fence value.
    pub lock_epoch: i64,
    /// When the current grant happened.
    pub acquired_at: DateTime<Utc>,
    /// When the grant lapses.
    pub expires_at: DateTime<Utc>,
    /// Last heartbeat.
    pub heartbeat_at: DateTime<Utc>,
}

fn lock_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MergeLock> {
    let acquired_at: String = row
        .try_get("acquired_at")
        .map_err(|e| Error::Database(format!("field 'acquired_at': {e}")))?;
    let expires_at: String = row
        .try_get("expires_at")
        .map_err(|e| Error::Database(format!("field 'expires_at': {e}")))?;
    let heartbeat_at: String = row
        .try_get("heartbeat_at")
        .map_err(|e| Error::Database(format!("field 'heartbeat_at': {e}")))?;

    Ok(MergeLock {
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::Database(format!("field 'session_id': {e}")))?,
        runner_id: row
            .try_get("runner_id")
            .map_err(|e| Error::Database(format!("field 'runner_id': {e}")))?,
        lock_epoch: row
            .try_get("lock_epoch")
            .map_err(|e| Error::Database(format!("field 'lock_epoch': {e}")))?,
        acquired_at: parse_utc(&acquired_at)?,
        expires_at: parse_utc(&expires_at)?,
        heartbeat_at: parse_utc(&heartbeat_at)?,
    })
}

impl GlobalStore {
    /// Acquire (or re-acquire) the merge lock for a session.
    ///
    /// Grants when no lock exists, when the existing lock belongs to this
    /// runner (refresh, epoch retained), or when the existing lock has
    /// expired (takeover, epoch bumped). A live lock under another runner
    /// is a `MERGE_LOCK_HELD` failure.
    pub async fn acquire_merge_lock(
        &self,
        session_id: &str,
        runner_id: &str,
        timeout: Duration,
    ) -> Result<i64> {
        let now = Utc::now();
        let expires = (now + timeout).to_rfc3339();
        let now_s = now.to_rfc3339();

        let mut tx = self.pool().begin().await?;
        let existing = sqlx::query(
            "SELECT session_id, runner_id, lock_epoch, acquired_at, expires_at, heartbeat_at
             FROM merge_locks WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("failed to read merge lock: {e}")))?;

        let epoch = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO merge_locks
                         (session_id, runner_id, lock_epoch, acquired_at, expires_at, heartbeat_at)
                     VALUES (?1, ?2, 1, ?3, ?4, ?3)",
                )
                .bind(session_id)
                .bind(runner_id)
                .bind(&now_s)
                .bind(&expires)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("failed to insert merge lock: {e}")))?;
                1
            }
            Some(row) => {
                let lock = lock_from_row(&row)?;
                if lock.runner_id == runner_id {
                    // Same holder: refresh, epoch retained.
                    let result = sqlx::query(
                        "UPDATE merge_locks SET expires_at = ?1, heartbeat_at = ?2
                         WHERE session_id = ?3 AND runner_id = ?4 AND lock_epoch = ?5",
                    )
                    .bind(&expires)
                    .bind(&now_s)
                    .bind(session_id)
                    .bind(runner_id)
                    .bind(lock.lock_epoch)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::Database(format!("failed to refresh merge lock: {e}")))?;
                    if result.rows_affected() != 1 {
                        return Err(Error::MergeLockFenceLost(session_id.to_string()));
                    }
                    lock.lock_epoch
                } else if lock.expires_at < now {
                    // Expired: take over under a new epoch.
                    let new_epoch = lock.lock_epoch + 1;
                    let result = sqlx::query(
                        "UPDATE merge_locks
                         SET runner_id = ?1, lock_epoch = ?2, acquired_at = ?3,
                             expires_at = ?4, heartbeat_at = ?3
                         WHERE session_id = ?5 AND lock_epoch = ?6",
                    )
                    .bind(runner_id)
                    .bind(new_epoch)
                    .bind(&now_s)
                    .bind(&expires)
                    .bind(session_id)
                    .bind(lock.lock_epoch)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::Database(format!("failed to take over merge lock: {e}")))?;
                    if result.rows_affected() != 1 {
                        return Err(Error::MergeLockFenceLost(session_id.to_string()));
                    }
                    new_epoch
                } else {
                    return Err(Error::MergeLockHeld {
                        session_id: session_id.to_string(),
                        holder: lock.runner_id,
                    });
                }
            }
        };
        tx.commit().await?;
        Ok(epoch)
    }

    /// Heartbeat the lock under the epoch fence.
    pub async fn heartbeat_merge_lock(
        &self,
        session_id: &str,
        runner_id: &str,
        lock_epoch: i64,
        timeout: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE merge_locks SET heartbeat_at = ?1, expires_at = ?2
             WHERE session_id = ?3 AND runner_id = ?4 AND lock_epoch = ?5",
        )
        .bind(now.to_rfc3339())
        .bind((now + timeout).to_rfc3339())
        .bind(session_id)
        .bind(runner_id)
        .bind(lock_epoch)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to heartbeat merge lock: {e}")))?;
        if result.rows_affected() != 1 {
            return Err(Error::MergeLockFenceLost(session_id.to_string()));
        }
        Ok(())
    }

    /// Verify the caller still holds the lock under its epoch.
    pub async fn verify_merge_lock(
        &self,
        session_id: &str,
        runner_id: &str,
        lock_epoch: i64,
    ) -> Result<()> {
        let lock = self
            .get_merge_lock(session_id)
            .await?
            .ok_or_else(|| Error::MergeLockNotFound(session_id.to_string()))?;
        if lock.runner_id != runner_id || lock.lock_epoch != lock_epoch {
            return Err(Error::MergeLockEpochMismatch(session_id.to_string()));
        }
        if lock.expires_at < Utc::now() {
            return Err(Error::MergeLockExpired(session_id.to_string()));
        }
        Ok(())
    }

    /// Read the lock row, if any.
    pub async fn get_merge_lock(&self, session_id: &str) -> Result<Option<MergeLock>> {
        let row = sqlx::query(
            "SELECT session_id, runner_id, lock_epoch, acquired_at, expires_at, heartbeat_at
             FROM merge_locks WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to read merge lock: {e}")))?;
        row.as_ref().map(lock_from_row).transpose()
    }

    /// Release the lock under the epoch fence.
    pub async fn release_merge_lock(
        &self,
        session_id: &str,
        runner_id: &str,
        lock_epoch: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM merge_locks
             WHERE session_id = ?1 AND runner_id = ?2 AND lock_epoch = ?3",
        )
        .bind(session_id)
        .bind(runner_id)
        .bind(lock_epoch)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to release merge lock: {e}")))?;
        if result.rows_affected() != 1 {
            return Err(Error::MergeLockFenceLost(session_id.to_string()));
        }
        Ok(())
    }
}
