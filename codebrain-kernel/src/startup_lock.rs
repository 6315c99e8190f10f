//! Filesystem startup lock
//!
//! The last-resort guard in the single-owner startup discipline: a file
//! in the config directory holding the PID of the process that is
//! currently bringing a daemon up. Any lock file older than 30 seconds
//! is stale (its owner crashed or hung) and is removed. Release
//! happens on drop, so every exit path (including panic unwind) lets go.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Lock files older than this are considered abandoned
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// A held (or observed) startup lock
pub struct StartupLock {
    path: PathBuf,
    held: bool,
}

/// What `try_acquire` observed
#[derive(Debug, PartialEq, Eq)]
pub enum StartupLockState {
    /// We hold the lock now
    Acquired,
    /// Another process holds a fresh lock; it is bringing a daemon up
    HeldByOther { pid: Option<u32> },
}

impl StartupLock {
    /// Try to take the startup lock at `path`
    ///
    /// A stale file is removed first. Creation is exclusive, so two
    /// racing processes cannot both acquire.
    ///
    /// # Errors
    ///
    /// IO failures other than the exclusive-create race propagate.
    pub fn try_acquire(path: PathBuf) -> Result<(Self, StartupLockState)> {
        if let Ok(metadata) = fs::metadata(&path) {
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok());
            match age {
                Some(age) if age > STALE_AFTER => {
                    warn!(path = %path.display(), age_secs = age.as_secs(), "Removing stale startup lock");
                    let _ = fs::remove_file(&path);
                }
                _ => {
                    let pid = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    return Ok((
                        Self { path, held: false },
                        StartupLockState::HeldByOther { pid },
                    ));
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write as _;
                writeln!(file, "{}", std::process::id())
                    .context("Failed to write startup lock")?;
                debug!(path = %path.display(), "Startup lock acquired");
                Ok((Self { path, held: true }, StartupLockState::Acquired))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the race to another process.
                let pid = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                Ok((
                    Self { path, held: false },
                    StartupLockState::HeldByOther { pid },
                ))
            }
            Err(e) => Err(e).context("Failed to create startup lock"),
        }
    }

    /// Whether this instance holds the lock
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held
    }

    /// Release explicitly (equivalent to dropping)
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(error = %e, "Failed to remove startup lock");
            } else {
                debug!(path = %self.path.display(), "Startup lock released");
            }
            self.held = false;
        }
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release_on_drop() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("daemon-startup.lock");

        {
            let (lock, state) = StartupLock::try_acquire(path.clone()).unwrap();
            assert_eq!(state, StartupLockState::Acquired);
            assert!(lock.is_held());
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_fresh_lock_blocks_second_acquirer() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("daemon-startup.lock");

        let (_first, state) = StartupLock::try_acquire(path.clone()).unwrap();
        assert_eq!(state, StartupLockState::Acquired);

        let (second, state) = StartupLock::try_acquire(path).unwrap();
        assert!(matches!(state, StartupLockState::HeldByOther { pid: Some(_) }));
        assert!(!second.is_held());
    }

    #[test]
    fn test_stale_lock_is_stolen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("daemon-startup.lock");
        fs::write(&path, "12345\n").unwrap();

        // Age the file past the staleness window.
        let old = SystemTime::now() - Duration::from_secs(60);
        let file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let (lock, state) = StartupLock::try_acquire(path).unwrap();
        assert_eq!(state, StartupLockState::Acquired);
        assert!(lock.is_held());
    }

    #[test]
    fn test_released_lock_reacquirable() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("daemon-startup.lock");

        let (first, _) = StartupLock::try_acquire(path.clone()).unwrap();
        first.release();

        let (_, state) = StartupLock::try_acquire(path).unwrap();
        assert_eq!(state, StartupLockState::Acquired);
    }
}
