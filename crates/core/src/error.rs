use std::path::PathBuf;
use thiserror::Error;

use crate::types::SyncKind;

/// Errors raised by a [`crate::store::StateStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode state record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("State backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Who holds the sync lock, as reported to a blocked caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub kind: SyncKind,
    pub owner_pid: u32,
    pub conversation_id: Option<String>,
}

/// Domain errors of the sync orchestrator.
///
/// `Busy` and `NotFound` are expected outcomes that callers surface with a
/// specific status; everything else is unexpected.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{}", busy_message(.holder.as_ref()))]
    Busy { holder: Option<LockHolder> },

    #[error("No active {0} sync")]
    NotFound(SyncKind),

    #[error("Failed to spawn sync worker: {0}")]
    SpawnFailed(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

fn busy_message(holder: Option<&LockHolder>) -> String {
    match holder {
        Some(LockHolder {
            kind: SyncKind::Global,
            ..
        }) => "Global sync already in progress".to_string(),
        Some(LockHolder {
            kind: SyncKind::Single,
            conversation_id: Some(id),
            ..
        }) => format!("Single sync running for conversation {id}"),
        Some(LockHolder {
            kind: SyncKind::Single,
            conversation_id: None,
            ..
        }) => "Single sync already in progress".to_string(),
        None => "Another sync is in progress".to_string(),
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
