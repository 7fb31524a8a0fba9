//! Helpers for the process-control commands (`status`, `stop`, `restart`).
//! They talk to a running daemon only through its lock record and snapshot.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::error::{EngineError, Result};
use crate::lockfile::PidLock;
use crate::monitor::{Monitor, Snapshot};

/// A daemon is running iff its lock record exists.
pub fn is_running(pid_file: impl AsRef<Path>) -> bool {
    PidLock::is_held(pid_file)
}

/// Pid of the running daemon.
pub fn owner(pid_file: impl AsRef<Path>) -> Result<u32> {
    PidLock::owner(pid_file)?.ok_or(EngineError::NotRunning)
}

/// Latest snapshot of a running daemon.
pub fn status(pid_file: impl AsRef<Path>, monitor_file: impl AsRef<Path>) -> Result<Snapshot> {
    if !is_running(pid_file) {
        return Err(EngineError::NotRunning);
    }
    Monitor::read(monitor_file)
}

/// Send SIGTERM to the daemon and wait until its lock record disappears.
///
/// Running jobs are drained first, so this can take as long as the slowest
/// job. Returns the pid that was stopped.
pub async fn stop(pid_file: impl AsRef<Path>, poll: Duration) -> Result<u32> {
    let pid_file = pid_file.as_ref();
    let pid = owner(pid_file)?;
    send_signal(pid, libc::SIGTERM)?;
    info!(pid, "stop requested, waiting for workers to drain");

    while is_running(pid_file) {
        tokio::time::sleep(poll).await;
    }
    Ok(pid)
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| EngineError::LivenessLockCorrupted(format!("pid {pid} out of range")))?;
    // Safety: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_running_without_lock_record() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("txnd.pid");
        assert!(!is_running(&pid_file));
        assert!(matches!(owner(&pid_file), Err(EngineError::NotRunning)));
        assert!(matches!(
            status(&pid_file, dir.path().join("txnd.status")),
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn stop_without_daemon_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let err = stop(dir.path().join("txnd.pid"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[test]
    fn owner_reads_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("txnd.pid");
        let lock = PidLock::acquire(&pid_file).unwrap();
        assert!(is_running(&pid_file));
        assert_eq!(owner(&pid_file).unwrap(), lock.pid());
    }

    #[test]
    fn signal_zero_detects_a_live_process() {
        assert!(send_signal(std::process::id(), 0).is_ok());
    }
}
