//! Spawning the external sync worker.
//!
//! The worker is an opaque program: it is told which job it runs through
//! arguments and environment, writes progress into the job record, and
//! reports success through its exit code. A launched worker is exposed as a
//! pid plus a oneshot that resolves once the process has exited, so the
//! supervisor can react to completion independently of any request.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::store::StateLocation;
use crate::types::SyncKind;

/// Bytes of worker stderr kept for failure reports.
pub const STDERR_TAIL_BYTES: usize = 500;

/// Everything a worker needs to know about the job it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub kind: SyncKind,
    pub job_id: String,
    pub conversation_id: Option<String>,
    /// Job record the worker should update, when the store is reachable
    /// from another process.
    pub state: Option<StateLocation>,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the process was killed by a signal or could not be waited on.
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable failure summary: the stderr excerpt if there is one.
    pub fn failure_message(&self) -> String {
        let tail = self.stderr_tail.trim();
        if !tail.is_empty() {
            return tail.to_string();
        }
        match self.code {
            Some(code) => format!("Worker exited with code {code}"),
            None => "Worker terminated without an exit code".to_string(),
        }
    }
}

/// A running worker.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub pid: u32,
    pub exit: oneshot::Receiver<WorkerExit>,
}

/// Starts workers. Implementations must not block on the worker finishing.
pub trait Launcher: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<LaunchedWorker>;
}

/// Program and leading arguments of the worker executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Launches the worker as a detached OS process.
///
/// The child gets its own process group and is not killed when its handle is
/// dropped, so it keeps running if the orchestrator goes away. Invocation:
/// `<program> <args..> global` or `<program> <args..> single <conversation_id>`,
/// with `SYNC_JOB_ID`, `SYNC_JOB_KIND` and `SYNC_CONVERSATION_ID` set as
/// applicable. The job record is passed as `SYNC_STATE_FILE` for file stores,
/// or `SYNC_STATE_DB` plus `SYNC_STATE_KEY` for SQLite.
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    fn build(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(spec.kind.as_str())
            .env("SYNC_JOB_ID", &spec.job_id)
            .env("SYNC_JOB_KIND", spec.kind.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(conversation_id) = &spec.conversation_id {
            cmd.arg(conversation_id)
                .env("SYNC_CONVERSATION_ID", conversation_id);
        }
        if let Some(state) = &spec.state {
            cmd.envs(state.env_vars());
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<LaunchedWorker> {
        let mut child = self.build(spec).spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                "worker exited before its pid was observed",
            )
        })?;
        tracing::info!(
            pid,
            kind = %spec.kind,
            job_id = %spec.job_id,
            program = %self.command.program.display(),
            "Sync worker spawned"
        );

        let stderr = child.stderr.take();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // Drain stderr concurrently so a chatty worker never blocks on a full pipe.
            let tail = stderr.map(|s| tokio::spawn(read_tail(s, STDERR_TAIL_BYTES)));
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for sync worker");
                    None
                }
            };
            let stderr_tail = match tail {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let _ = tx.send(WorkerExit { code, stderr_tail });
        });

        Ok(LaunchedWorker { pid, exit: rx })
    }
}

/// Keep only the last `max_bytes` of `reader`, cut on a UTF-8 boundary.
async fn read_tail<R>(mut reader: R, max_bytes: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                // Let the buffer grow to 2x before trimming to avoid churn.
                if buffer.len() > max_bytes * 2 {
                    buffer.drain(..buffer.len() - max_bytes);
                }
            }
        }
    }
    truncate_tail(&buffer, max_bytes)
}

fn truncate_tail(data: &[u8], max_bytes: usize) -> String {
    if data.len() <= max_bytes {
        return String::from_utf8_lossy(data).into_owned();
    }
    let keep_from = data.len() - max_bytes;
    // Skip UTF-8 continuation bytes (0b10xxxxxx).
    let start = (keep_from..data.len())
        .find(|&i| (data[i] as i8) >= -64)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_tail_keeps_short_input() {
        assert_eq!(truncate_tail(b"short", 10), "short");
    }

    #[test]
    fn test_truncate_tail_respects_utf8_boundary() {
        let text = "ééééé"; // 2 bytes each
        let tail = truncate_tail(text.as_bytes(), 5);
        assert_eq!(tail, "éé");
    }

    #[tokio::test]
    async fn test_read_tail_bounds_output() {
        let data = "x".repeat(5000) + "END";
        let tail = read_tail(data.as_bytes(), 10).await;
        assert_eq!(tail.len(), 10);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn test_failure_message_prefers_stderr() {
        let exit = WorkerExit {
            code: Some(3),
            stderr_tail: "  auth expired\n".to_string(),
        };
        assert!(!exit.success());
        assert_eq!(exit.failure_message(), "auth expired");

        let exit = WorkerExit {
            code: Some(3),
            stderr_tail: String::new(),
        };
        assert_eq!(exit.failure_message(), "Worker exited with code 3");

        let exit = WorkerExit {
            code: None,
            stderr_tail: String::new(),
        };
        assert_eq!(exit.failure_message(), "Worker terminated without an exit code");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_reports_exit_and_stderr() {
        let launcher = ProcessLauncher::new(
            WorkerCommand::new("sh").with_args(["-c", "echo \"$SYNC_JOB_KIND $1 failed\" >&2; exit 4"]),
        );
        let spec = WorkerSpec {
            kind: SyncKind::Single,
            job_id: "job-1".to_string(),
            conversation_id: Some("conv-9".to_string()),
            state: None,
        };
        let launched = launcher.spawn(&spec).unwrap();
        assert!(launched.pid > 0);

        let exit = launched.exit.await.unwrap();
        assert_eq!(exit.code, Some(4));
        assert_eq!(exit.stderr_tail.trim(), "single conv-9 failed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_passes_sqlite_record_location() {
        let launcher = ProcessLauncher::new(WorkerCommand::new("sh").with_args([
            "-c",
            r#"test -z "$SYNC_STATE_FILE" || exit 9; echo "$SYNC_STATE_DB $SYNC_STATE_KEY" >&2"#,
        ]));
        let spec = WorkerSpec {
            kind: SyncKind::Global,
            job_id: "job-1".to_string(),
            conversation_id: None,
            state: Some(StateLocation::Sqlite {
                db: PathBuf::from("/var/lib/inbox-sync/inbox-sync.db"),
                key: "global-sync-state".to_string(),
            }),
        };
        let exit = launcher.spawn(&spec).unwrap().exit.await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert_eq!(
            exit.stderr_tail.trim(),
            "/var/lib/inbox-sync/inbox-sync.db global-sync-state"
        );
    }

    #[tokio::test]
    async fn test_process_launcher_missing_program_fails_to_spawn() {
        let launcher = ProcessLauncher::new(WorkerCommand::new("/nonexistent/inbox-sync-worker"));
        let spec = WorkerSpec {
            kind: SyncKind::Global,
            job_id: "job-1".to_string(),
            conversation_id: None,
            state: None,
        };
        assert!(launcher.spawn(&spec).is_err());
    }
}
