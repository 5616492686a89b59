//! OS-visible session lock.
//!
//! An advisory exclusive lock on a file in the runtime directory. The kernel
//! drops the lock when the holding process exits for any reason, so a file
//! left behind by a crashed master is simply locked again by the next
//! process. The file itself is never removed: unlinking it while another
//! process is opening it would let both lock different inodes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to create lock directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open lock file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub enum LockAttempt {
    Acquired(SessionLock),
    /// Someone else holds it. `holder` is the pid they recorded, if readable.
    Held { holder: Option<u32> },
}

/// Held for as long as the value lives.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    _file: File,
}

impl SessionLock {
    pub fn try_acquire(path: &Path) -> Result<LockAttempt, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = match open_lock_file(path) {
            Ok(file) => file,
            Err(err) if is_contended(&err) => return Ok(LockAttempt::Held { holder: None }),
            Err(source) => {
                return Err(LockError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match try_lock_exclusive(&file) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(LockAttempt::Held {
                    holder: read_holder(&mut file),
                });
            }
            Err(source) => {
                return Err(LockError::Lock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let own = std::process::id();
        if let Some(previous) = read_holder(&mut file).filter(|pid| *pid != own) {
            info!(
                target = "livebench::instance",
                previous,
                path = %path.display(),
                "reclaimed session lock left by an exited process"
            );
        }
        if let Err(err) = record_holder(&mut file, own) {
            // Diagnostics only; the lock is what matters.
            debug!(target = "livebench::instance", error = %err, "could not record lock holder");
        }

        Ok(LockAttempt::Acquired(SessionLock {
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        debug!(target = "livebench::instance", path = %self.path.display(), "session lock released");
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn record_holder(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.flush()
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and valid for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn is_contended(_err: &io::Error) -> bool {
    false
}

#[cfg(windows)]
fn open_lock_file(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    // No sharing: a second open fails while the holder keeps the handle.
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .share_mode(0)
        .open(path)
}

#[cfg(windows)]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(windows)]
fn is_contended(err: &io::Error) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    err.raw_os_error() == Some(ERROR_SHARING_VIOLATION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("livebench-lock-{}", Uuid::new_v4()))
            .join("session.lock")
    }

    #[test]
    fn second_attempt_sees_holder_pid() {
        let path = scratch_path();
        let first = match SessionLock::try_acquire(&path).unwrap() {
            LockAttempt::Acquired(lock) => lock,
            other => panic!("expected to acquire, got {other:?}"),
        };
        assert_eq!(first.path(), path);

        match SessionLock::try_acquire(&path).unwrap() {
            LockAttempt::Held { holder } => {
                if cfg!(unix) {
                    assert_eq!(holder, Some(std::process::id()));
                }
            }
            other => panic!("expected contention, got {other:?}"),
        }

        drop(first);
        assert!(matches!(
            SessionLock::try_acquire(&path).unwrap(),
            LockAttempt::Acquired(_)
        ));
        assert!(path.exists(), "lock file must never be unlinked");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn stale_file_from_dead_holder_is_reclaimed() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A pid nobody in this test holds a lock for.
        fs::write(&path, "999999\n").unwrap();

        let lock = match SessionLock::try_acquire(&path).unwrap() {
            LockAttempt::Acquired(lock) => lock,
            other => panic!("stale lock not reclaimed: {other:?}"),
        };
        let recorded = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());
        drop(lock);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unusable_directory_is_an_error() {
        let blocker = std::env::temp_dir().join(format!("livebench-lock-{}", Uuid::new_v4()));
        fs::write(&blocker, b"not a directory").unwrap();
        let err = SessionLock::try_acquire(&blocker.join("session.lock")).unwrap_err();
        assert!(matches!(err, LockError::CreateDir { .. } | LockError::Open { .. }));
        let _ = fs::remove_file(&blocker);
    }
}
