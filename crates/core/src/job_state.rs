//! Progress and result records for sync jobs.
//!
//! Two writers share each record: the worker updates progress fields while
//! it runs, and the supervisor applies the terminal transition when the
//! worker exits. The supervisor never replaces the whole record; it re-reads
//! the latest text, patches only its own fields and swaps against what it
//! read, retrying if the worker wrote in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{StateLocation, StateStore};
use crate::types::{JobStatus, SyncKind, SyncTarget};

/// Oldest entries are dropped beyond this many recorded errors.
pub const MAX_RECORDED_ERRORS: usize = 50;

/// Attempts at the read-patch-swap cycle before giving up.
const MERGE_ATTEMPTS: usize = 5;

/// Item label used for errors the supervisor records about the worker itself.
pub const WORKER_ERROR_ITEM: &str = "worker";

pub fn state_key(kind: SyncKind) -> &'static str {
    match kind {
        SyncKind::Global => "global-sync-state",
        SyncKind::Single => "single-sync-state",
    }
}

/// One failure recorded during a global sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorEntry {
    pub item: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalProgress {
    pub conversations_processed: u64,
    pub conversations_skipped: u64,
    pub conversations_total: u64,
    pub messages_synced: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalJobState {
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: GlobalProgress,
    /// Conversation the worker is processing right now.
    #[serde(default)]
    pub current_item: Option<String>,
    #[serde(default)]
    pub errors: Vec<JobErrorEntry>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl GlobalJobState {
    pub fn new(job_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Running,
            started_at,
            completed_at: None,
            cancelled_at: None,
            progress: GlobalProgress::default(),
            current_item: None,
            errors: Vec::new(),
            exit_code: None,
        }
    }

    /// Append an error, keeping at most [`MAX_RECORDED_ERRORS`].
    pub fn push_error(&mut self, item: impl Into<String>, message: impl Into<String>, at: DateTime<Utc>) {
        self.errors.push(JobErrorEntry {
            item: item.into(),
            message: message.into(),
            timestamp: at,
        });
        if self.errors.len() > MAX_RECORDED_ERRORS {
            let excess = self.errors.len() - MAX_RECORDED_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleJobState {
    pub job_id: String,
    pub conversation_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages_synced: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SingleJobState {
    pub fn new(
        job_id: impl Into<String>,
        conversation_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            conversation_id: conversation_id.into(),
            status: JobStatus::Starting,
            started_at,
            completed_at: None,
            messages_synced: 0,
            error: None,
            exit_code: None,
        }
    }
}

/// Fields the supervisor owns at the end of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalPatch {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl TerminalPatch {
    pub fn completed(at: DateTime<Utc>, exit_code: i32) -> Self {
        Self {
            status: JobStatus::Completed,
            at,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            at,
            exit_code,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Cancelled,
            at,
            exit_code: None,
            error: None,
        }
    }
}

/// A job record stored under its kind's key.
pub trait JobRecord: Serialize + DeserializeOwned + Send + Sync {
    const KIND: SyncKind;

    fn job_id(&self) -> &str;

    fn status(&self) -> JobStatus;

    /// Apply the supervisor's terminal fields, leaving progress untouched.
    ///
    /// A cancelled record stays cancelled; only a missing exit code is filled
    /// in. Any other status, including one the worker wrote itself, yields to
    /// the status derived from the exit code.
    fn apply_terminal(&mut self, patch: &TerminalPatch);
}

impl JobRecord for GlobalJobState {
    const KIND: SyncKind = SyncKind::Global;

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn apply_terminal(&mut self, patch: &TerminalPatch) {
        if self.status == JobStatus::Cancelled {
            self.exit_code = self.exit_code.or(patch.exit_code);
            return;
        }
        self.status = patch.status;
        match patch.status {
            JobStatus::Cancelled => self.cancelled_at = Some(patch.at),
            _ => self.completed_at = Some(patch.at),
        }
        self.exit_code = patch.exit_code.or(self.exit_code);
        self.current_item = None;
        if let Some(message) = &patch.error {
            self.push_error(WORKER_ERROR_ITEM, message.clone(), patch.at);
        }
    }
}

impl JobRecord for SingleJobState {
    const KIND: SyncKind = SyncKind::Single;

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn apply_terminal(&mut self, patch: &TerminalPatch) {
        if self.status == JobStatus::Cancelled {
            self.exit_code = self.exit_code.or(patch.exit_code);
            return;
        }
        self.status = patch.status;
        self.completed_at = Some(patch.at);
        self.exit_code = patch.exit_code.or(self.exit_code);
        if self.error.as_deref().map_or(true, |e| e.trim().is_empty()) {
            self.error = patch.error.clone();
        }
    }
}

/// Outcome of a terminal merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The stored record belongs to another job, or is missing/corrupt.
    NotOurs,
    /// The worker kept rewriting the record; the patch was not applied.
    Contended,
}

#[derive(Clone)]
pub struct JobStateStore {
    store: Arc<dyn StateStore>,
}

impl JobStateStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Where the worker finds the record for `kind`.
    pub fn location(&self, kind: SyncKind) -> Option<StateLocation> {
        self.store.location(state_key(kind))
    }

    /// Write the starting record for `target`, replacing any previous job's.
    pub async fn init(&self, target: &SyncTarget, job_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        match target {
            SyncTarget::Global => self.write(&GlobalJobState::new(job_id, now)).await,
            SyncTarget::Conversation(id) => {
                self.write(&SingleJobState::new(job_id, id.clone(), now)).await
            }
        }
    }

    pub async fn write<R: JobRecord>(&self, record: &R) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(record)?;
        self.store.set(state_key(R::KIND), &raw).await
    }

    /// Latest record, or `None` if absent or unparseable.
    pub async fn read<R: JobRecord>(&self) -> Result<Option<R>, StoreError> {
        Ok(self.read_raw::<R>().await?.map(|(_, record)| record))
    }

    async fn read_raw<R: JobRecord>(&self) -> Result<Option<(String, R)>, StoreError> {
        let key = state_key(R::KIND);
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<R>(&raw) {
            Ok(record) => Ok(Some((raw, record))),
            Err(e) => {
                tracing::warn!(key, error = %e, "Unparseable job state, treating as absent");
                Ok(None)
            }
        }
    }

    /// Apply `patch` to the record of `job_id`, preserving worker-owned fields.
    pub async fn merge_terminal<R: JobRecord>(
        &self,
        job_id: &str,
        patch: &TerminalPatch,
    ) -> Result<MergeOutcome, StoreError> {
        let key = state_key(R::KIND);
        for _ in 0..MERGE_ATTEMPTS {
            let Some((raw, mut record)) = self.read_raw::<R>().await? else {
                return Ok(MergeOutcome::NotOurs);
            };
            if record.job_id() != job_id {
                tracing::debug!(
                    key,
                    job_id,
                    stored_job_id = record.job_id(),
                    "Job state belongs to another job, skipping terminal merge"
                );
                return Ok(MergeOutcome::NotOurs);
            }
            record.apply_terminal(patch);
            let updated = serde_json::to_string_pretty(&record)?;
            if self
                .store
                .compare_and_swap(key, Some(&raw), Some(&updated))
                .await?
            {
                return Ok(MergeOutcome::Applied);
            }
        }
        tracing::warn!(key, job_id, "Job state kept changing, terminal merge abandoned");
        Ok(MergeOutcome::Contended)
    }

    /// Last-resort terminal write once [`Self::merge_terminal`] gave up:
    /// re-read, patch and overwrite without a compare-and-swap. A worker
    /// write racing with this one may be lost.
    pub async fn force_terminal<R: JobRecord>(
        &self,
        job_id: &str,
        patch: &TerminalPatch,
    ) -> Result<MergeOutcome, StoreError> {
        let Some(mut record) = self.read::<R>().await? else {
            return Ok(MergeOutcome::NotOurs);
        };
        if record.job_id() != job_id {
            return Ok(MergeOutcome::NotOurs);
        }
        record.apply_terminal(patch);
        self.write(&record).await?;
        tracing::warn!(key = state_key(R::KIND), job_id, "Job state finalized by overwrite");
        Ok(MergeOutcome::Applied)
    }

    /// [`Self::force_terminal`] dispatched on a runtime kind.
    pub async fn force_terminal_for(
        &self,
        kind: SyncKind,
        job_id: &str,
        patch: &TerminalPatch,
    ) -> Result<MergeOutcome, StoreError> {
        match kind {
            SyncKind::Global => self.force_terminal::<GlobalJobState>(job_id, patch).await,
            SyncKind::Single => self.force_terminal::<SingleJobState>(job_id, patch).await,
        }
    }

    /// [`Self::merge_terminal`] dispatched on a runtime kind.
    pub async fn merge_terminal_for(
        &self,
        kind: SyncKind,
        job_id: &str,
        patch: &TerminalPatch,
    ) -> Result<MergeOutcome, StoreError> {
        match kind {
            SyncKind::Global => self.merge_terminal::<GlobalJobState>(job_id, patch).await,
            SyncKind::Single => self.merge_terminal::<SingleJobState>(job_id, patch).await,
        }
    }
}
