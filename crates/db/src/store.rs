//! SQLite-backed [`StateStore`] for the sync lock and job records.
//!
//! Each compare-and-swap is a single conditional statement, so concurrent
//! orchestrator processes sharing the database file serialize on SQLite's
//! write lock instead of on an in-process mutex.

use async_trait::async_trait;
use chrono::Utc;
use inbox_sync_core::{StateLocation, StateStore, StoreError};

use crate::Database;

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StateStore for Database {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let result = match (expected, new) {
            (None, None) => return Ok(self.get(key).await?.is_none()),
            (None, Some(value)) => {
                sqlx::query(
                    r#"INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
                       ON CONFLICT(key) DO NOTHING"#,
                )
                .bind(key)
                .bind(value)
                .bind(now)
                .execute(self.pool())
                .await
            }
            (Some(current), Some(value)) => {
                sqlx::query(
                    "UPDATE sync_state SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
                )
                .bind(value)
                .bind(now)
                .bind(key)
                .bind(current)
                .execute(self.pool())
                .await
            }
            (Some(current), None) => {
                sqlx::query("DELETE FROM sync_state WHERE key = ? AND value = ?")
                    .bind(key)
                    .bind(current)
                    .execute(self.pool())
                    .await
            }
        };
        Ok(result.map_err(backend)?.rows_affected() == 1)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_state WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// In-memory databases are private to this process.
    fn location(&self, key: &str) -> Option<StateLocation> {
        if self.db_path().as_os_str().is_empty() {
            return None;
        }
        Some(StateLocation::Sqlite {
            db: self.db_path().to_path_buf(),
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_sync_core::{LockManager, SyncError, SyncKind, DEFAULT_LOCK_TTL};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_if_absent_only_once() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(db.compare_and_swap("k", None, Some("a")).await.unwrap());
        assert!(!db.compare_and_swap("k", None, Some("b")).await.unwrap());
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_swap_requires_exact_current_value() {
        let db = Database::new_in_memory().await.unwrap();
        db.set("k", "a").await.unwrap();

        assert!(!db.compare_and_swap("k", Some("stale"), Some("b")).await.unwrap());
        assert!(db.compare_and_swap("k", Some("a"), Some("b")).await.unwrap());
        assert!(!db.compare_and_swap("k", Some("a"), None).await.unwrap());
        assert!(db.compare_and_swap("k", Some("b"), None).await.unwrap());
        assert!(db.get("k").await.unwrap().is_none());
        assert!(db.compare_and_swap("k", None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_absent_key_succeeds() {
        let db = Database::new_in_memory().await.unwrap();
        db.remove("missing").await.unwrap();
        assert!(db.location("missing").is_none());
    }

    #[tokio::test]
    async fn test_file_database_exposes_record_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox-sync.db");
        let db = Database::new(&path).await.unwrap();
        assert_eq!(
            db.location("global-sync-state"),
            Some(StateLocation::Sqlite {
                db: path,
                key: "global-sync-state".to_string(),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_on_sqlite_admits_one() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("inbox-sync.db")).await.unwrap();
        let locks = LockManager::new(Arc::new(db), DEFAULT_LOCK_TTL);

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    locks
                        .try_acquire(SyncKind::Global, None, &format!("job-{i}"))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(matches!(err, SyncError::Busy { .. }), "{err:?}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sync_lock_on_sqlite_is_exclusive() {
        let db = Database::new_in_memory().await.unwrap();
        let locks = LockManager::new(Arc::new(db), DEFAULT_LOCK_TTL);

        let handle = locks.try_acquire(SyncKind::Global, None, "job-a").await.unwrap();
        let err = tokio_test::assert_err!(
            locks.try_acquire(SyncKind::Single, Some("c-1"), "job-b").await
        );
        assert!(matches!(err, SyncError::Busy { .. }));

        assert!(locks.release_if_held(&handle).await.unwrap());
        locks.try_acquire(SyncKind::Single, Some("c-1"), "job-b").await.unwrap();
    }
}
