//! Best-effort termination of a worker by pid.

/// Ask process `pid` to terminate. Returns whether a signal was delivered.
///
/// On unix the whole process group led by `pid` is signalled, so children of
/// a wrapper worker (`sh -c`, `npm run`) stop with it. A pid that leads no
/// group is signalled alone. Delivery failures (the process already exited,
/// permission denied) are logged and swallowed. The orchestrator's own pid is
/// never signalled: it owns the lock only during the launch window, before
/// the worker pid is recorded.
pub fn terminate(pid: u32) -> bool {
    if pid == std::process::id() {
        tracing::debug!(pid, "Lock still owned by orchestrator, no worker to signal");
        return false;
    }
    deliver(pid)
}

#[cfg(unix)]
fn deliver(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        tracing::debug!(pid, "Pid out of range, not signalling");
        return false;
    };
    let target = Pid::from_raw(raw);
    let result = match killpg(target, Signal::SIGTERM) {
        Err(Errno::ESRCH) => kill(target, Signal::SIGTERM),
        other => other,
    };
    match result {
        Ok(()) => {
            tracing::info!(pid, "Sent SIGTERM to sync worker");
            true
        }
        Err(errno) => {
            tracing::debug!(pid, error = %errno, "Could not signal sync worker, ignoring");
            false
        }
    }
}

#[cfg(not(unix))]
fn deliver(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) => {
            let killed = process.kill();
            tracing::info!(pid, killed, "Terminated sync worker");
            killed
        }
        None => {
            tracing::debug!(pid, "Sync worker not found, ignoring");
            false
        }
    }
}
