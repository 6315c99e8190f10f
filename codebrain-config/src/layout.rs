//! Per-user filesystem layout
//!
//! Everything the daemon persists outside the graph lives under one
//! directory, `~/.codebrain/` by default. Clients resolve the same paths
//! to find the PID file and logs without talking to the daemon.

use std::path::{Path, PathBuf};

/// Resolved filesystem layout under the user's config directory
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// Resolve the default location (`~/.codebrain/`)
    ///
    /// Falls back to `.codebrain` in the working directory when no home
    /// directory can be determined.
    #[must_use]
    pub fn resolve() -> Self {
        let root = dirs::home_dir()
            .map_or_else(|| PathBuf::from(".codebrain"), |h| h.join(".codebrain"));
        Self { root }
    }

    /// Use an explicit root (tests, alternate profiles)
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// The root directory itself
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append-only daemon log
    #[must_use]
    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("logs").join("daemon.log")
    }

    /// Client-side diagnostic log
    #[must_use]
    pub fn client_log(&self) -> PathBuf {
        self.root.join("logs").join("daemon-client.log")
    }

    /// Current daemon PID
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// Filesystem startup lock (content: PID; stale at mtime + 30 s)
    #[must_use]
    pub fn startup_lock(&self) -> PathBuf {
        self.root.join("daemon-startup.lock")
    }

    /// Root for agent prompt-extraction dumps
    #[must_use]
    pub fn debug_dir(&self) -> PathBuf {
        self.root.join("debug")
    }

    /// A fresh extraction dump directory for the given ISO timestamp
    #[must_use]
    pub fn extract_dir(&self, iso_timestamp: &str) -> PathBuf {
        self.debug_dir().join(format!("extract_{iso_timestamp}"))
    }

    /// Create the directories the daemon writes into
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root.join("logs"))?;
        std::fs::create_dir_all(self.debug_dir())?;
        Ok(())
    }
}
