//! Persisted mutual exclusion between global and single-conversation syncs.
//!
//! At most one lock record exists. A record older than the TTL is stale: it is
//! treated as absent for acquisition and inspection, but only disappears when
//! the next successful acquire overwrites it. All writes go through
//! compare-and-swap against the exact text that was read, which closes the
//! check-then-act window between reading a stale record and replacing it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LockHolder, StoreError, SyncError, SyncResult};
use crate::store::StateStore;
use crate::types::SyncKind;

/// Store key of the single lock record.
pub const LOCK_KEY: &str = "sync-lock";

/// Age after which a lock no longer blocks new syncs.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// The persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub kind: SyncKind,
    /// Orchestrator pid until the worker is spawned, then the worker pid.
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub job_id: String,
}

impl LockRecord {
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.acquired_at) > ttl
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder {
            kind: self.kind,
            owner_pid: self.owner_pid,
            conversation_id: self.conversation_id.clone(),
        }
    }

    /// Decode a stored record. Unparseable text yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// A lock record together with the exact stored text, so it can be replaced
/// or released only if nobody else has touched it since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    record: LockRecord,
    raw: String,
}

impl LockHandle {
    fn encode(record: LockRecord) -> Result<Self, StoreError> {
        let raw = serde_json::to_string(&record)?;
        Ok(Self { record, raw })
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn kind(&self) -> SyncKind {
        self.record.kind
    }

    pub fn job_id(&self) -> &str {
        &self.record.job_id
    }
}

/// Read-only view of the lock, staleness already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInspection {
    held: Option<LockHandle>,
}

impl LockInspection {
    pub fn locked(&self) -> bool {
        self.held.is_some()
    }

    pub fn record(&self) -> Option<&LockRecord> {
        self.held.as_ref().map(LockHandle::record)
    }

    pub fn kind(&self) -> Option<SyncKind> {
        self.record().map(|r| r.kind)
    }

    pub fn owner_pid(&self) -> Option<u32> {
        self.record().map(|r| r.owner_pid)
    }

    pub fn is_held_by(&self, kind: SyncKind) -> bool {
        self.kind() == Some(kind)
    }

    pub fn into_handle(self) -> Option<LockHandle> {
        self.held
    }
}

/// What is currently stored under [`LOCK_KEY`].
enum Stored {
    Absent,
    Live(LockHandle),
    /// Stale or unparseable; carries the raw text to swap against.
    Reclaimable { raw: String, previous: Option<LockRecord> },
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn load(&self) -> Result<Stored, StoreError> {
        let Some(raw) = self.store.get(LOCK_KEY).await? else {
            return Ok(Stored::Absent);
        };
        match LockRecord::parse(&raw) {
            Some(record) if !record.is_stale(Utc::now(), self.ttl) => {
                Ok(Stored::Live(LockHandle { record, raw }))
            }
            Some(record) => Ok(Stored::Reclaimable {
                raw,
                previous: Some(record),
            }),
            None => {
                tracing::warn!(key = LOCK_KEY, "Unparseable lock record, treating as absent");
                Ok(Stored::Reclaimable {
                    raw,
                    previous: None,
                })
            }
        }
    }

    /// Current lock state. Never writes.
    pub async fn inspect(&self) -> Result<LockInspection, StoreError> {
        Ok(match self.load().await? {
            Stored::Live(handle) => LockInspection { held: Some(handle) },
            Stored::Absent | Stored::Reclaimable { .. } => LockInspection::default(),
        })
    }

    /// Take the lock for a new job, or report who holds it.
    ///
    /// The record is written with this process's pid; call [`Self::reassign`]
    /// once the worker pid is known.
    pub async fn try_acquire(
        &self,
        kind: SyncKind,
        conversation_id: Option<&str>,
        job_id: &str,
    ) -> SyncResult<LockHandle> {
        let handle = LockHandle::encode(LockRecord {
            kind,
            owner_pid: std::process::id(),
            acquired_at: Utc::now(),
            conversation_id: conversation_id.map(str::to_owned),
            job_id: job_id.to_owned(),
        })?;

        let expected = match self.load().await? {
            Stored::Absent => None,
            Stored::Live(existing) => {
                return Err(SyncError::Busy {
                    holder: Some(existing.record.holder()),
                })
            }
            Stored::Reclaimable { raw, previous } => {
                if let Some(previous) = previous {
                    tracing::warn!(
                        stale_kind = %previous.kind,
                        stale_job_id = %previous.job_id,
                        stale_pid = previous.owner_pid,
                        acquired_at = %previous.acquired_at,
                        "Reclaiming stale sync lock"
                    );
                }
                Some(raw)
            }
        };

        let swapped = self
            .store
            .compare_and_swap(LOCK_KEY, expected.as_deref(), Some(&handle.raw))
            .await?;
        if !swapped {
            // Lost a race with a concurrent acquirer.
            let holder = self.inspect().await?.record().map(LockRecord::holder);
            return Err(SyncError::Busy { holder });
        }

        tracing::info!(
            kind = %kind,
            job_id = %job_id,
            conversation_id = ?conversation_id,
            "Sync lock acquired"
        );
        Ok(handle)
    }

    /// Record the worker pid on a held lock.
    ///
    /// Returns `None` if the lock changed hands since `handle` was taken
    /// (for example, cancelled during launch).
    pub async fn reassign(
        &self,
        handle: &LockHandle,
        owner_pid: u32,
    ) -> Result<Option<LockHandle>, StoreError> {
        let updated = LockHandle::encode(LockRecord {
            owner_pid,
            ..handle.record.clone()
        })?;
        let swapped = self
            .store
            .compare_and_swap(LOCK_KEY, Some(&handle.raw), Some(&updated.raw))
            .await?;
        Ok(swapped.then_some(updated))
    }

    /// Delete the lock only if it is still exactly `handle`.
    ///
    /// Returns whether this call released it; `false` means it was already
    /// released or now belongs to another job.
    pub async fn release_if_held(&self, handle: &LockHandle) -> Result<bool, StoreError> {
        let released = self
            .store
            .compare_and_swap(LOCK_KEY, Some(&handle.raw), None)
            .await?;
        if released {
            tracing::info!(kind = %handle.kind(), job_id = %handle.job_id(), "Sync lock released");
        }
        Ok(released)
    }

    /// Delete whatever lock exists. Absence is not an error.
    pub async fn release(&self) -> Result<(), StoreError> {
        self.store.remove(LOCK_KEY).await
    }
}
