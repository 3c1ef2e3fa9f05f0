// crates/server/src/config.rs
//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, ValueEnum};
use inbox_sync_core::WorkerCommand;

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 47900;

/// Where the sync lock and job records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockBackend {
    /// JSON files in the state directory, readable by the worker.
    File,
    /// Rows in the SQLite database.
    Sqlite,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "inbox-sync", version, about = "Sync orchestrator for the inbox mirror")]
pub struct Config {
    /// Port to listen on (loopback only).
    #[arg(long, env = "INBOX_SYNC_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory for lock and job state files.
    #[arg(long, env = "INBOX_SYNC_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// SQLite database path. Defaults to `<state_dir>/inbox-sync.db`.
    #[arg(long = "db", env = "INBOX_SYNC_DB")]
    pub db_path: Option<PathBuf>,

    /// Sync worker executable.
    #[arg(long, env = "INBOX_SYNC_WORKER", default_value = "inbox-sync-worker")]
    pub worker: PathBuf,

    /// Extra leading arguments for the worker, before the job arguments.
    #[arg(
        long = "worker-arg",
        env = "INBOX_SYNC_WORKER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub worker_args: Vec<String>,

    /// Accept start and cancel requests. Status stays readable when off.
    #[arg(long, env = "INBOX_SYNC_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub sync_enabled: bool,

    /// Age after which a lock is considered abandoned.
    #[arg(long, env = "INBOX_SYNC_LOCK_TTL_SECS", default_value_t = 1800)]
    pub lock_ttl_secs: u64,

    #[arg(long, value_enum, env = "INBOX_SYNC_LOCK_BACKEND", default_value_t = LockBackend::File)]
    pub lock_backend: LockBackend,
}

impl Config {
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::cache_dir()
                .ok_or_else(|| anyhow!("Could not determine cache directory"))?
                .join("inbox-sync")),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.state_dir()?.join("inbox-sync.db")),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand::new(&self.worker).with_args(self.worker_args.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["inbox-sync"]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.sync_enabled);
        assert_eq!(config.lock_ttl(), Duration::from_secs(30 * 60));
        assert_eq!(config.lock_backend, LockBackend::File);
        assert_eq!(config.worker, PathBuf::from("inbox-sync-worker"));
    }

    #[test]
    fn test_db_defaults_into_state_dir() {
        let config =
            Config::try_parse_from(["inbox-sync", "--state-dir", "/tmp/inbox-state"]).unwrap();
        assert_eq!(
            config.db_path().unwrap(),
            PathBuf::from("/tmp/inbox-state/inbox-sync.db")
        );
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "inbox-sync",
            "--port",
            "9000",
            "--sync-enabled",
            "false",
            "--lock-backend",
            "sqlite",
            "--worker",
            "/usr/bin/env",
            "--worker-arg",
            "node --max-old-space-size=512",
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert!(!config.sync_enabled);
        assert_eq!(config.lock_backend, LockBackend::Sqlite);

        let command = config.worker_command();
        assert_eq!(command.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(command.args, vec!["node", "--max-old-space-size=512"]);
    }
}
