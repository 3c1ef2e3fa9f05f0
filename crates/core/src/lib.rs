//! Sync orchestration for the inbox mirror.
//!
//! Launches external sync workers, serializes them behind one lock shared by
//! both job kinds, finalizes their job records on exit, and aggregates
//! status for polling clients.

pub mod error;
pub mod job_state;
pub mod launcher;
pub mod listener;
pub mod lock;
pub mod signal;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod types;

pub use error::{LockHolder, StoreError, SyncError, SyncResult};
pub use job_state::{GlobalJobState, JobStateStore, SingleJobState, TerminalPatch};
pub use launcher::{Launcher, ProcessLauncher, WorkerCommand, WorkerSpec};
pub use listener::{ListenerHealth, ListenerLock, ListenerReport, ListenerState};
pub use lock::{LockManager, LockRecord, DEFAULT_LOCK_TTL};
pub use status::{StatusAggregator, SyncStatus};
pub use store::{FileStore, MemoryStore, StateLocation, StateStore};
pub use supervisor::{StartedSync, SyncSupervisor};
pub use types::{JobStatus, SyncKind, SyncTarget};
