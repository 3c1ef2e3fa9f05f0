//! Listener heartbeat and lease lock rows.
//!
//! The listener process writes these; the orchestrator only reads them.
//! Timestamps are stored as unix seconds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use inbox_sync_core::{ListenerLock, ListenerState};

use crate::{Database, DbResult};

/// Lock type used by the real-time listener.
pub const LISTENER_LOCK_TYPE: &str = "listener";

type StateRow = (
    String,
    Option<i64>,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    i64,
);

fn from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl Database {
    /// Read the listener state row, if the listener ever wrote one.
    pub async fn get_listener_state(&self) -> DbResult<Option<ListenerState>> {
        let row: Option<StateRow> = sqlx::query_as(
            r#"SELECT status, process_id, hostname, started_at, last_heartbeat,
                      last_message_at, messages_received
               FROM listener_state WHERE id = 1"#,
        )
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(
            |(status, pid, hostname, started, heartbeat, last_message, received)| ListenerState {
                status,
                process_id: pid.and_then(|p| u32::try_from(p).ok()),
                hostname,
                started_at: from_unix(started),
                last_heartbeat: from_unix(heartbeat),
                last_message_at: from_unix(last_message),
                messages_received: received.max(0) as u64,
            },
        ))
    }

    /// Read the lock row of `lock_type`, expired or not.
    pub async fn get_listener_lock(&self, lock_type: &str) -> DbResult<Option<ListenerLock>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT lock_type, acquired_at, expires_at FROM listener_locks WHERE lock_type = ?",
        )
        .bind(lock_type)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.and_then(|(lock_type, acquired, expires)| {
            Some(ListenerLock {
                lock_type,
                acquired_at: DateTime::from_timestamp(acquired, 0)?,
                expires_at: DateTime::from_timestamp(expires, 0)?,
            })
        }))
    }

    /// Upsert the listener state row.
    pub async fn record_listener_heartbeat(&self, state: &ListenerState) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO listener_state
                   (id, status, process_id, hostname, started_at, last_heartbeat,
                    last_message_at, messages_received)
               VALUES (1, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   process_id = excluded.process_id,
                   hostname = excluded.hostname,
                   started_at = excluded.started_at,
                   last_heartbeat = excluded.last_heartbeat,
                   last_message_at = excluded.last_message_at,
                   messages_received = excluded.messages_received"#,
        )
        .bind(&state.status)
        .bind(state.process_id.map(i64::from))
        .bind(&state.hostname)
        .bind(state.started_at.map(|t| t.timestamp()))
        .bind(state.last_heartbeat.map(|t| t.timestamp()))
        .bind(state.last_message_at.map(|t| t.timestamp()))
        .bind(state.messages_received as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Take or renew the `lock_type` lease for `pid` until `now + lease`.
    ///
    /// Succeeds when the lock is free, expired, or already held by `pid`
    /// (a renewal keeps the original `acquired_at`). Returns whether the
    /// caller now holds the lease.
    pub async fn acquire_listener_lock(
        &self,
        lock_type: &str,
        pid: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let acquired_at = now.timestamp();
        let expires_at = acquired_at + lease.as_secs() as i64;
        let result = sqlx::query(
            r#"INSERT INTO listener_locks (lock_type, holder_pid, acquired_at, expires_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(lock_type) DO UPDATE SET
                   acquired_at = CASE WHEN listener_locks.holder_pid = excluded.holder_pid
                                      THEN listener_locks.acquired_at
                                      ELSE excluded.acquired_at END,
                   holder_pid = excluded.holder_pid,
                   expires_at = excluded.expires_at
               WHERE listener_locks.holder_pid = excluded.holder_pid
                  OR listener_locks.expires_at <= excluded.acquired_at"#,
        )
        .bind(lock_type)
        .bind(i64::from(pid))
        .bind(acquired_at)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the `lock_type` lease if `pid` holds it.
    pub async fn release_listener_lock(&self, lock_type: &str, pid: u32) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM listener_locks WHERE lock_type = ? AND holder_pid = ?")
            .bind(lock_type)
            .bind(i64::from(pid))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
