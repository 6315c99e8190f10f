//! Daemon entry point
//!
//! Binds the loopback port, serves until a drain trigger fires, then
//! waits (bounded) for the ingestion and embedding locks, tears the
//! watchers down, and exits. Bind failures and schema rejection are
//! fatal: the process exits non-zero so a supervising client can tell
//! "busy port" from "came up".

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::brain_tools;
use crate::http;
use crate::logsink::LogSink;
use crate::pid::PidFile;
use crate::signals::SignalHandler;
use crate::state::DaemonState;
use codebrain_config::{BrainConfig, ConfigDir};
use codebrain_core::{EMBEDDING_LOCK, INGESTION_LOCK};

/// How long each write lock may hold up shutdown
const DRAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Run the daemon to completion
///
/// Blocks until drain finishes. The caller (the `daemon run` subcommand)
/// turns errors into a non-zero exit code.
///
/// # Errors
///
/// Bind failure, PID conflicts, and schema rejection are returned as
/// errors; everything else drains gracefully.
pub async fn run_daemon(
    config: BrainConfig,
    config_dir: ConfigDir,
    log_sink: Arc<LogSink>,
) -> Result<()> {
    config_dir.ensure().context("Failed to create config directories")?;

    let mut pid_file = PidFile::new(config_dir.pid_file());
    pid_file.write().context("PID file conflict")?;

    let mut signals = SignalHandler::new();
    signals.install()?;

    let state = DaemonState::new(config, config_dir, log_sink);
    brain_tools::register_all(&state);

    // Connect and validate schema up front; a rejected schema must exit
    // non-zero rather than limp along.
    state
        .ensure_brain()
        .await
        .context("Brain initialization failed")?;

    // Watch the configured source root from the start.
    let source = state.config.source.clone();
    if source.root.is_dir() {
        if let Err(e) = state
            .register_project(source.root.clone(), source.include, source.exclude)
            .await
        {
            warn!(error = %e, "Source root registration failed; continuing without watcher");
        }
    }

    let port = state.config.daemon.port;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    state.lifecycle.mark_ready();
    let watchdog = Arc::clone(&state.lifecycle).spawn_watchdog();
    info!(port, pid = std::process::id(), "Daemon listening");

    let drain = state.lifecycle.drain_token();
    let app = http::router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // Drain: let writers finish, bounded, then tear everything down.
    info!("HTTP surface closed; draining locks");
    for lock in [INGESTION_LOCK, EMBEDDING_LOCK] {
        if !state.locks.wait_for_unlock(lock, DRAIN_LOCK_TIMEOUT).await {
            error!(lock, "Lock did not drain within {DRAIN_LOCK_TIMEOUT:?}; proceeding");
        }
    }
    state.stop_watchers().await;
    watchdog.abort();

    state.lifecycle.mark_stopped();
    pid_file.remove()?;
    info!("Daemon exited cleanly");
    Ok(())
}
