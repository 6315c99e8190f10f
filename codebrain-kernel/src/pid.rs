//! PID file management
//!
//! Prevents a second daemon instance and lets clients find the running
//! process. Stale files left by dead processes are detected with signal
//! 0 and removed.

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{debug, warn};

/// Manages the daemon's PID file
pub struct PidFile {
    path: PathBuf,
    owns_file: bool,
}

impl PidFile {
    /// Create a manager for the given path; nothing is written yet
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self {
            path,
            owns_file: false,
        }
    }

    /// Write the current process id, exclusively
    ///
    /// # Errors
    ///
    /// Fails if another live instance owns the file, or on IO errors.
    pub fn write(&mut self) -> Result<()> {
        if self.is_running()? {
            bail!("Another daemon instance is already running");
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .or_else(|err| {
                // A file exists: if its process is dead, take it over.
                if let Ok(pid) = self.read_pid() {
                    if Self::process_exists(pid) {
                        return Err(err);
                    }
                    warn!("Removing stale PID file for dead process {pid}");
                    fs::remove_file(&self.path)?;
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&self.path)
                } else {
                    Err(err)
                }
            })
            .context("Failed to create PID file")?;

        let pid = process::id();
        writeln!(file, "{pid}").context("Failed to write PID")?;
        file.sync_all().context("Failed to sync PID file")?;
        debug!("Wrote PID {} to {:?}", pid, self.path);

        self.owns_file = true;
        Ok(())
    }

    /// Read the PID recorded in the file
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or holds garbage.
    pub fn read_pid(&self) -> Result<u32> {
        let mut contents = String::new();
        File::open(&self.path)
            .context("Failed to open PID file")?
            .read_to_string(&mut contents)
            .context("Failed to read PID file")?;
        contents.trim().parse::<u32>().context("Invalid PID in file")
    }

    /// Whether the recorded process is alive
    ///
    /// # Errors
    ///
    /// IO errors reading the file propagate; an unreadable PID counts as
    /// not running.
    pub fn is_running(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        match self.read_pid() {
            Ok(pid) => Ok(Self::process_exists(pid)),
            Err(_) => Ok(false),
        }
    }

    /// Probe a PID with the null signal
    #[must_use]
    pub fn process_exists(pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Remove the file if this instance owns it and it still holds our PID
    ///
    /// # Errors
    ///
    /// Fails on IO errors removing the file.
    pub fn remove(&mut self) -> Result<()> {
        if !self.owns_file {
            return Ok(());
        }
        if let Ok(pid) = self.read_pid() {
            if pid == process::id() {
                fs::remove_file(&self.path).context("Failed to remove PID file")?;
                debug!("Removed PID file at {:?}", self.path);
            } else {
                warn!(
                    "PID file contains different PID ({pid} vs {}), not removing",
                    process::id()
                );
            }
        }
        self.owns_file = false;
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}
