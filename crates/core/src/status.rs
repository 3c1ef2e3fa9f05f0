//! Read-only status views for polling clients.
//!
//! "Running" always comes from the lock, never from the stored status: a
//! worker that crashed without writing a terminal status leaves its record
//! at `running` forever, and only the lock going stale reclassifies it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::job_state::{GlobalJobState, GlobalProgress, JobErrorEntry, JobStateStore, SingleJobState};
use crate::lock::{LockInspection, LockManager};
use crate::types::SyncKind;

/// Status label reported when no record applies.
pub const IDLE: &str = "idle";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSyncView {
    pub is_running: bool,
    pub status: &'static str,
    pub job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: GlobalProgress,
    pub current_conversation_id: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion of the last finished run.
    pub last_duration: Option<i64>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub errors: Vec<JobErrorEntry>,
}

impl GlobalSyncView {
    fn build(state: Option<GlobalJobState>, is_running: bool) -> Self {
        let Some(state) = state else {
            return Self {
                is_running,
                status: IDLE,
                job_id: None,
                started_at: None,
                progress: GlobalProgress::default(),
                current_conversation_id: None,
                last_completed_at: None,
                last_duration: None,
                cancelled_at: None,
                exit_code: None,
                errors: Vec::new(),
            };
        };
        let last_duration = state
            .completed_at
            .map(|done| done.signed_duration_since(state.started_at).num_seconds());
        Self {
            is_running,
            status: state.status.as_str(),
            job_id: Some(state.job_id),
            started_at: Some(state.started_at),
            progress: state.progress,
            current_conversation_id: state.current_item,
            last_completed_at: state.completed_at,
            last_duration,
            cancelled_at: state.cancelled_at,
            exit_code: state.exit_code,
            errors: state.errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSyncView {
    pub is_running: bool,
    pub status: &'static str,
    pub conversation_id: Option<String>,
    pub job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub messages_synced: u64,
    pub error: Option<String>,
}

impl SingleSyncView {
    fn build(state: Option<SingleJobState>, is_running: bool) -> Self {
        match state {
            Some(state) => Self {
                is_running,
                status: state.status.as_str(),
                conversation_id: Some(state.conversation_id),
                job_id: Some(state.job_id),
                started_at: Some(state.started_at),
                completed_at: state.completed_at,
                messages_synced: state.messages_synced,
                error: state.error,
            },
            None => Self {
                is_running,
                status: IDLE,
                conversation_id: None,
                job_id: None,
                started_at: None,
                completed_at: None,
                messages_synced: 0,
                error: None,
            },
        }
    }
}

/// Combined view of both job kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(rename = "globalSync")]
    pub global: GlobalSyncView,
    #[serde(rename = "singleSync")]
    pub single: SingleSyncView,
    /// Both flags are false while a live lock of either kind exists.
    #[serde(rename = "canStartGlobalSync")]
    pub can_start_global: bool,
    #[serde(rename = "canStartSingleSync")]
    pub can_start_single: bool,
}

/// Aggregates lock and job records. Never blocks on a job, never writes.
#[derive(Clone)]
pub struct StatusAggregator {
    locks: LockManager,
    jobs: JobStateStore,
}

impl StatusAggregator {
    pub fn new(locks: LockManager, jobs: JobStateStore) -> Self {
        Self { locks, jobs }
    }

    pub async fn status(&self) -> Result<SyncStatus, StoreError> {
        let inspection = self.locks.inspect().await?;
        let global = self.jobs.read::<GlobalJobState>().await?;
        let single = self.jobs.read::<SingleJobState>().await?;
        Ok(Self::combine(&inspection, global, single))
    }

    fn combine(
        inspection: &LockInspection,
        global: Option<GlobalJobState>,
        single: Option<SingleJobState>,
    ) -> SyncStatus {
        let free = !inspection.locked();
        SyncStatus {
            global: GlobalSyncView::build(global, inspection.is_held_by(SyncKind::Global)),
            single: SingleSyncView::build(single, inspection.is_held_by(SyncKind::Single)),
            can_start_global: free,
            can_start_single: free,
        }
    }

    /// Status of one conversation: its last or current single sync, or idle
    /// if the stored record is for a different conversation.
    pub async fn conversation(&self, conversation_id: &str) -> Result<SingleSyncView, StoreError> {
        let inspection = self.locks.inspect().await?;
        let is_running = inspection.record().is_some_and(|r| {
            r.kind == SyncKind::Single && r.conversation_id.as_deref() == Some(conversation_id)
        });
        let state = self
            .jobs
            .read::<SingleJobState>()
            .await?
            .filter(|s| s.conversation_id == conversation_id);
        let mut view = SingleSyncView::build(state, is_running);
        view.conversation_id = Some(conversation_id.to_string());
        Ok(view)
    }
}
