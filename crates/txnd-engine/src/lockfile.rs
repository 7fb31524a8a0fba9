use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// The daemon's liveness lock: a file holding the owner's pid.
///
/// Its existence means a daemon is running. The owner checks it before
/// every dispatch, rewrites it every refresh interval and stops dispatching
/// as soon as it is missing or names another pid.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
    refreshed_at: Instant,
}

impl PidLock {
    /// Create the lock record for this process.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dir(&path)?;

        let pid = std::process::id();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EngineError::AlreadyRunning {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(pid.to_string().as_bytes())?;

        info!(path = %path.display(), pid, "liveness lock acquired");
        Ok(Self {
            path,
            pid,
            refreshed_at: Instant::now(),
        })
    }

    pub fn is_held(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Pid recorded in the lock, `None` when there is no lock.
    pub fn owner(path: impl AsRef<Path>) -> Result<Option<u32>> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                EngineError::LivenessLockCorrupted(format!(
                    "unreadable lock record {}",
                    path.display()
                ))
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Confirm the record still exists and names this process.
    pub fn verify(&self) -> Result<()> {
        match Self::owner(&self.path)? {
            Some(pid) if pid == self.pid => Ok(()),
            Some(pid) => Err(EngineError::LivenessLockCorrupted(format!(
                "lock record now owned by pid {pid}"
            ))),
            None => Err(EngineError::LivenessLockCorrupted(
                "lock record removed".to_string(),
            )),
        }
    }

    /// Verify the record on every call; rewrite it once `interval` has
    /// elapsed since the last rewrite. Returns whether a rewrite happened.
    pub fn refresh(&mut self, interval: Duration) -> Result<bool> {
        self.verify()?;
        if self.refreshed_at.elapsed() < interval {
            return Ok(false);
        }
        write_atomic(&self.path, self.pid.to_string().as_bytes())?;
        self.refreshed_at = Instant::now();
        debug!(path = %self.path.display(), "liveness lock refreshed");
        Ok(true)
    }

    /// Remove the record. Only the owner calls this, on clean shutdown.
    pub fn release(self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path.display(), "liveness lock released");
        Ok(())
    }
}

/// Write through a temp file and rename, so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txnd.pid");

        let lock = PidLock::acquire(&path).unwrap();
        assert!(PidLock::is_held(&path));
        assert_eq!(PidLock::owner(&path).unwrap(), Some(std::process::id()));

        let err = PidLock::acquire(&path).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        lock.release().unwrap();
        assert!(!PidLock::is_held(&path));
        assert_eq!(PidLock::owner(&path).unwrap(), None);
    }

    #[test]
    fn acquire_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/nested/txnd.pid");
        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn refresh_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = PidLock::acquire(dir.path().join("txnd.pid")).unwrap();
        assert!(!lock.refresh(Duration::from_secs(60)).unwrap());
        assert!(lock.refresh(Duration::ZERO).unwrap());
    }

    #[test]
    fn refresh_detects_removed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txnd.pid");
        let mut lock = PidLock::acquire(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = lock.refresh(Duration::ZERO).unwrap_err();
        assert!(matches!(err, EngineError::LivenessLockCorrupted(_)));
    }

    #[test]
    fn refresh_detects_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txnd.pid");
        let mut lock = PidLock::acquire(&path).unwrap();
        let other = lock.pid().wrapping_add(1);
        std::fs::write(&path, other.to_string()).unwrap();

        let err = lock.verify().unwrap_err();
        assert!(err.to_string().contains(&format!("pid {other}")));
        assert!(lock.refresh(Duration::ZERO).is_err());
    }

    #[test]
    fn refresh_verifies_before_the_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txnd.pid");
        let mut lock = PidLock::acquire(&path).unwrap();

        std::fs::write(&path, lock.pid().wrapping_add(1).to_string()).unwrap();
        assert!(matches!(
            lock.refresh(Duration::from_secs(60)),
            Err(EngineError::LivenessLockCorrupted(_))
        ));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            lock.refresh(Duration::from_secs(60)),
            Err(EngineError::LivenessLockCorrupted(_))
        ));
    }

    #[test]
    fn garbage_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txnd.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(matches!(
            PidLock::owner(&path),
            Err(EngineError::LivenessLockCorrupted(_))
        ));
    }
}
