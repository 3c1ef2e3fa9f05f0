// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use inbox_sync_core::{
    FileStore, JobStateStore, Launcher, LockManager, ProcessLauncher, StateStore,
    StatusAggregator, SyncSupervisor,
};
use inbox_sync_db::Database;

use crate::config::{Config, LockBackend};

/// Shared application state accessible from all route handlers.
///
/// Holds handles only: every sync decision is made against the persisted
/// lock and job records, never against in-process state.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Starts and cancels sync workers.
    pub supervisor: SyncSupervisor,
    /// Read-only view over the lock and job records.
    pub status: StatusAggregator,
    /// Listener heartbeat and lock rows.
    pub db: Database,
    /// Whether start and cancel requests are accepted.
    pub sync_enabled: bool,
}

impl AppState {
    /// Wire up state over an existing record store and launcher.
    pub fn new(
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn Launcher>,
        db: Database,
        lock_ttl: Duration,
        sync_enabled: bool,
    ) -> Arc<Self> {
        let locks = LockManager::new(store.clone(), lock_ttl);
        let jobs = JobStateStore::new(store);
        Arc::new(Self {
            start_time: Instant::now(),
            supervisor: SyncSupervisor::new(locks.clone(), jobs.clone(), launcher),
            status: StatusAggregator::new(locks, jobs),
            db,
            sync_enabled,
        })
    }

    /// Open the configured database and record store.
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let db = Database::new(&config.db_path()?).await?;
        let store: Arc<dyn StateStore> = match config.lock_backend {
            LockBackend::File => Arc::new(FileStore::new(config.state_dir()?)?),
            LockBackend::Sqlite => Arc::new(db.clone()),
        };
        let launcher = Arc::new(ProcessLauncher::new(config.worker_command()));
        tracing::info!(
            backend = ?config.lock_backend,
            worker = %config.worker.display(),
            sync_enabled = config.sync_enabled,
            "Sync state initialized"
        );
        Ok(Self::new(
            store,
            launcher,
            db,
            config.lock_ttl(),
            config.sync_enabled,
        ))
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
