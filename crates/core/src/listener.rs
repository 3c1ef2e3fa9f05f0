//! Health of the external real-time listener.
//!
//! The listener is a separate long-running process. It writes a state row
//! with a heartbeat and holds a lease-style lock; this module only reads
//! those records and classifies them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A heartbeat at least this old marks a running listener as stale.
pub const HEARTBEAT_FRESHNESS: Duration = Duration::from_secs(2 * 60);

/// Listener-reported state row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerState {
    pub status: String,
    pub process_id: Option<u32>,
    pub hostname: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_received: u64,
}

/// Lease held by the listener. Live while `expires_at` is in the future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerLock {
    pub lock_type: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ListenerLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerHealth {
    /// Lock is live but there is no state row or no heartbeat yet.
    Unknown,
    RunningHealthy,
    RunningStale,
    Offline,
}

impl ListenerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerHealth::Unknown => "unknown",
            ListenerHealth::RunningHealthy => "running-healthy",
            ListenerHealth::RunningStale => "running-stale",
            ListenerHealth::Offline => "offline",
        }
    }

    pub fn is_running(self) -> bool {
        !matches!(self, ListenerHealth::Offline)
    }
}

/// Classify listener health.
///
/// Without a live lock the listener is offline, whatever its state row
/// says. With one, the heartbeat decides between healthy and stale.
pub fn evaluate(
    state: Option<&ListenerState>,
    lock: Option<&ListenerLock>,
    now: DateTime<Utc>,
) -> ListenerHealth {
    if !lock.is_some_and(|l| l.is_live(now)) {
        return ListenerHealth::Offline;
    }
    let Some(heartbeat) = state.and_then(|s| s.last_heartbeat) else {
        return ListenerHealth::Unknown;
    };
    let age = now.signed_duration_since(heartbeat);
    match age.to_std() {
        Ok(age) if age >= HEARTBEAT_FRESHNESS => ListenerHealth::RunningStale,
        // Negative age means a heartbeat from a clock slightly ahead of ours.
        _ => ListenerHealth::RunningHealthy,
    }
}

/// Lock details exposed alongside the health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerLockInfo {
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Listener status as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerReport {
    pub is_running: bool,
    pub is_healthy: bool,
    pub status: ListenerHealth,
    pub process_id: Option<u32>,
    pub hostname: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_received: u64,
    pub lock_info: Option<ListenerLockInfo>,
}

impl ListenerReport {
    pub fn build(
        state: Option<&ListenerState>,
        lock: Option<&ListenerLock>,
        now: DateTime<Utc>,
    ) -> Self {
        let health = evaluate(state, lock, now);
        Self {
            is_running: health.is_running(),
            is_healthy: health == ListenerHealth::RunningHealthy,
            status: health,
            process_id: state.and_then(|s| s.process_id),
            hostname: state.and_then(|s| s.hostname.clone()),
            last_heartbeat: state.and_then(|s| s.last_heartbeat),
            last_message_at: state.and_then(|s| s.last_message_at),
            messages_received: state.map_or(0, |s| s.messages_received),
            lock_info: lock.filter(|l| l.is_live(now)).map(|l| ListenerLockInfo {
                acquired_at: l.acquired_at,
                expires_at: l.expires_at,
            }),
        }
    }
}
