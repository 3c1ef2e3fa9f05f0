//! Starting, finishing and cancelling sync workers.
//!
//! Ordering per job:
//! lock acquired -> job record initialized -> worker spawned -> (worker runs)
//! -> job record finalized -> lock released.
//! The record is always finalized before the lock is released, so a poller
//! never sees a free lock next to a record still marked running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{StoreError, SyncError, SyncResult};
use crate::job_state::{JobStateStore, MergeOutcome, TerminalPatch};
use crate::launcher::{Launcher, WorkerExit, WorkerSpec};
use crate::lock::{LockHandle, LockManager};
use crate::signal;
use crate::types::{SyncKind, SyncTarget};

/// Re-inspections allowed while a cancelled lock changes under us.
const CANCEL_ATTEMPTS: usize = 3;

/// A successfully launched job.
#[derive(Debug)]
pub struct StartedSync {
    pub job_id: String,
    pub pid: u32,
    /// Resolves once the job has been finalized and its lock released.
    /// Dropping it does not affect the job.
    pub finalized: JoinHandle<()>,
}

#[derive(Clone)]
pub struct SyncSupervisor {
    locks: LockManager,
    jobs: JobStateStore,
    launcher: Arc<dyn Launcher>,
}

impl SyncSupervisor {
    pub fn new(locks: LockManager, jobs: JobStateStore, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            locks,
            jobs,
            launcher,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn jobs(&self) -> &JobStateStore {
        &self.jobs
    }

    /// Launch a worker for `target`. Returns as soon as the worker is running.
    pub async fn start(&self, target: SyncTarget) -> SyncResult<StartedSync> {
        let kind = target.kind();
        let job_id = ulid::Ulid::new().to_string();

        let handle = match self
            .locks
            .try_acquire(kind, target.conversation_id(), &job_id)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                if matches!(err, SyncError::Busy { .. }) {
                    counter!("sync_conflicts_total", "kind" => kind.as_str()).increment(1);
                }
                return Err(err);
            }
        };

        if let Err(e) = self.jobs.init(&target, &job_id).await {
            tracing::error!(kind = %kind, job_id = %job_id, error = %e, "Failed to initialize job state");
            if let Err(release_err) = self.locks.release_if_held(&handle).await {
                tracing::error!(error = %release_err, "Failed to release lock after init failure");
            }
            return Err(e.into());
        }

        let spec = WorkerSpec {
            kind,
            job_id: job_id.clone(),
            conversation_id: target.conversation_id().map(str::to_owned),
            state: self.jobs.location(kind),
        };
        let launched = match self.launcher.spawn(&spec) {
            Ok(launched) => launched,
            Err(e) => {
                let message = e.to_string();
                self.abort_launch(&handle, &message).await;
                return Err(SyncError::SpawnFailed(message));
            }
        };
        let pid = launched.pid;

        let handle = match self.locks.reassign(&handle, pid).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, pid, "Lock changed during launch, worker pid not recorded");
                handle
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, pid, error = %e, "Failed to record worker pid on lock");
                handle
            }
        };

        counter!("sync_starts_total", "kind" => kind.as_str()).increment(1);
        tracing::info!(kind = %kind, job_id = %job_id, pid, "Sync started");

        let this = self.clone();
        let started_at = Instant::now();
        let finalized = tokio::spawn(async move {
            this.finish(handle, launched.exit, started_at).await;
        });

        Ok(StartedSync {
            job_id,
            pid,
            finalized,
        })
    }

    /// Record the worker's exit, then release the lock. Runs once per job.
    async fn finish(self, handle: LockHandle, exit: oneshot::Receiver<WorkerExit>, started_at: Instant) {
        let exit = exit.await.unwrap_or_else(|_| WorkerExit {
            code: None,
            stderr_tail: "worker monitor dropped before reporting exit".to_string(),
        });
        let kind = handle.kind();
        let job_id = handle.job_id();
        let now = Utc::now();

        let patch = if exit.success() {
            tracing::info!(kind = %kind, job_id = %job_id, "Sync worker completed");
            TerminalPatch::completed(now, 0)
        } else {
            let message = exit.failure_message();
            tracing::warn!(
                kind = %kind,
                job_id = %job_id,
                exit_code = ?exit.code,
                error = %message,
                "Sync worker failed"
            );
            TerminalPatch::failed(now, exit.code, message)
        };

        if let Err(e) = self.finalize(kind, job_id, &patch).await {
            // Never free the lock next to an active record; the TTL reclaims it.
            tracing::error!(
                kind = %kind,
                job_id = %job_id,
                error = %e,
                "Job state not finalized, leaving sync lock for TTL expiry"
            );
            record_finished(kind, patch.status.as_str(), started_at.elapsed());
            return;
        }

        match self.locks.release_if_held(&handle).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id = %job_id, "Lock already released or taken over"),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to release sync lock"),
        }

        record_finished(kind, patch.status.as_str(), started_at.elapsed());
    }

    /// Write the terminal patch, overwriting if the worker keeps contending.
    /// On error the record may still show the job as active.
    async fn finalize(
        &self,
        kind: SyncKind,
        job_id: &str,
        patch: &TerminalPatch,
    ) -> Result<(), StoreError> {
        match self.jobs.merge_terminal_for(kind, job_id, patch).await {
            Ok(MergeOutcome::Applied | MergeOutcome::NotOurs) => return Ok(()),
            Ok(MergeOutcome::Contended) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to merge terminal job state"),
        }
        self.jobs.force_terminal_for(kind, job_id, patch).await?;
        Ok(())
    }

    /// The worker never started: no exit event will follow.
    async fn abort_launch(&self, handle: &LockHandle, message: &str) {
        let kind = handle.kind();
        let job_id = handle.job_id();
        tracing::error!(kind = %kind, job_id = %job_id, error = %message, "Failed to spawn sync worker");

        let patch = TerminalPatch::failed(Utc::now(), None, message);
        if let Err(e) = self.finalize(kind, job_id, &patch).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed after spawn error");
        }
        if let Err(e) = self.locks.release_if_held(handle).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to release lock after spawn error");
        }
        record_finished(kind, "failed", Duration::ZERO);
    }

    /// Cancel the running job of `kind`.
    ///
    /// Optimistic: the worker is signalled but not waited for, and the job is
    /// marked cancelled and the lock released regardless of whether it stops.
    pub async fn cancel(&self, kind: SyncKind) -> SyncResult<()> {
        let mut cancelled_job: Option<String> = None;

        for _ in 0..CANCEL_ATTEMPTS {
            let held = self
                .locks
                .inspect()
                .await?
                .into_handle()
                .filter(|h| h.kind() == kind);
            let handle = match (held, cancelled_job.as_deref()) {
                (None, None) => return Err(SyncError::NotFound(kind)),
                // Released by the exit handler, or replaced by a newer job.
                (None, Some(_)) => return Ok(()),
                (Some(h), Some(job)) if h.job_id() != job => return Ok(()),
                (Some(h), _) => h,
            };
            let job_id = handle.job_id().to_owned();

            signal::terminate(handle.record().owner_pid);
            self.finalize(kind, &job_id, &TerminalPatch::cancelled(Utc::now()))
                .await?;

            if self.locks.release_if_held(&handle).await? {
                counter!("sync_cancellations_total", "kind" => kind.as_str()).increment(1);
                tracing::info!(kind = %kind, job_id = %job_id, "Sync cancelled");
                return Ok(());
            }
            // The launch path recorded the worker pid meanwhile; retry with the new record.
            cancelled_job = Some(job_id);
        }

        tracing::warn!(kind = %kind, "Lock kept changing during cancel, releasing unconditionally");
        self.locks.release().await?;
        Ok(())
    }
}

fn record_finished(kind: SyncKind, status: &'static str, duration: Duration) {
    counter!("sync_finished_total", "kind" => kind.as_str(), "status" => status).increment(1);
    histogram!("sync_duration_seconds", "kind" => kind.as_str()).record(duration.as_secs_f64());
}
