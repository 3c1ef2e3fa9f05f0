/// Inline SQL migrations for the inbox-sync database.
///
/// Applied in order, once each, tracked by the `_migrations` table.

pub const MIGRATIONS: &[&str] = &[
    // Migration 1: listener state (single row, written by the listener process)
    r#"
CREATE TABLE IF NOT EXISTS listener_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    status TEXT NOT NULL DEFAULT 'stopped',
    process_id INTEGER,
    hostname TEXT,
    started_at INTEGER,
    last_heartbeat INTEGER,
    last_message_at INTEGER,
    messages_received INTEGER NOT NULL DEFAULT 0
);
"#,
    // Migration 2: listener lease locks
    r#"
CREATE TABLE IF NOT EXISTS listener_locks (
    lock_type TEXT PRIMARY KEY,
    holder_pid INTEGER,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#,
    // Migration 3: key-value records for the sync lock and job state
    r#"
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#,
];
