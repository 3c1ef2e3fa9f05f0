//! Shared vocabulary for sync jobs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of sync job a lock or job record belongs to.
///
/// Both kinds share one exclusion domain: a live lock of either kind blocks
/// starting the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// Full history sync across every conversation.
    Global,
    /// Sync scoped to a single conversation.
    Single,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Single => "single",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a start request asks to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Global,
    Conversation(String),
}

impl SyncTarget {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::Global => SyncKind::Global,
            Self::Conversation(_) => SyncKind::Single,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Conversation(id) => Some(id),
        }
    }
}

/// Lifecycle status stored in a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Single-conversation job written before the worker reports in.
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are never overwritten by a later transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}
