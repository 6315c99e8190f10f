//! Signal handling for the daemon
//!
//! Handlers only set atomic flags (nothing else is async-signal-safe);
//! the lifecycle watchdog polls them. SIGPIPE is ignored so a closed
//! log pipe or SSE client can never kill the process.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Set when SIGTERM arrives
pub static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);
/// Set when SIGINT arrives
pub static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGTERM => SIGTERM_RECEIVED.store(true, Ordering::SeqCst),
        libc::SIGINT => SIGINT_RECEIVED.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Installs and tracks the daemon's signal handlers
pub struct SignalHandler {
    installed: bool,
}

impl SignalHandler {
    /// Create without installing
    #[must_use]
    pub const fn new() -> Self {
        Self { installed: false }
    }

    /// Install handlers for SIGTERM/SIGINT and ignore SIGPIPE
    ///
    /// # Errors
    ///
    /// Fails if `sigaction` is rejected by the OS.
    pub fn install(&mut self) -> Result<()> {
        if self.installed {
            return Ok(());
        }

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGTERM, &action)
                .context("Failed to install SIGTERM handler")?;
            signal::sigaction(Signal::SIGINT, &action)
                .context("Failed to install SIGINT handler")?;
            signal::sigaction(
                Signal::SIGPIPE,
                &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
            )
            .context("Failed to ignore SIGPIPE")?;
        }

        self.installed = true;
        info!("Signal handlers installed");
        Ok(())
    }

    /// Whether a shutdown signal has arrived
    #[must_use]
    pub fn shutdown_requested() -> bool {
        SIGTERM_RECEIVED.load(Ordering::SeqCst) || SIGINT_RECEIVED.load(Ordering::SeqCst)
    }

    /// Clear the flags (tests)
    pub fn reset() {
        SIGTERM_RECEIVED.store(false, Ordering::SeqCst);
        SIGINT_RECEIVED.store(false, Ordering::SeqCst);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
