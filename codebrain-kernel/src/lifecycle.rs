//! Daemon lifecycle state machine
//!
//! `starting → ready → draining → stopped`, driven by three triggers:
//! idle timeout, an explicit `/shutdown`, and Unix signals. Every HTTP
//! request resets the idle clock and bumps the request counter.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::signals::SignalHandler;

/// Daemon lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonPhase {
    Starting,
    Ready,
    Draining,
    Stopped,
}

/// Shared lifecycle state
pub struct Lifecycle {
    phase: RwLock<DaemonPhase>,
    started_at_instant: Instant,
    started_at: DateTime<Utc>,
    last_activity_instant: Mutex<Instant>,
    last_activity: Mutex<DateTime<Utc>>,
    request_count: AtomicU64,
    idle_timeout: Duration,
    drain: CancellationToken,
}

impl Lifecycle {
    /// Create in the `starting` phase
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            phase: RwLock::new(DaemonPhase::Starting),
            started_at_instant: now,
            started_at: Utc::now(),
            last_activity_instant: Mutex::new(now),
            last_activity: Mutex::new(Utc::now()),
            request_count: AtomicU64::new(0),
            idle_timeout,
            drain: CancellationToken::new(),
        })
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> DaemonPhase {
        *self.phase.read()
    }

    /// Enter the `ready` phase (idempotent)
    pub fn mark_ready(&self) {
        *self.phase.write() = DaemonPhase::Ready;
        info!("Daemon ready");
    }

    /// Enter the `stopped` phase
    pub fn mark_stopped(&self) {
        *self.phase.write() = DaemonPhase::Stopped;
        info!("Daemon stopped");
    }

    /// Record HTTP activity: reset the idle clock, count the request
    pub fn touch(&self) {
        *self.last_activity_instant.lock() = Instant::now();
        *self.last_activity.lock() = Utc::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Begin draining; subsequent calls are no-ops
    pub fn trigger_drain(&self, reason: &str) {
        let mut phase = self.phase.write();
        if matches!(*phase, DaemonPhase::Draining | DaemonPhase::Stopped) {
            return;
        }
        *phase = DaemonPhase::Draining;
        drop(phase);
        info!(reason, "Draining");
        self.drain.cancel();
    }

    /// Token cancelled once draining begins
    #[must_use]
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Spawn the watchdog that fires the drain on idle timeout or signal
    pub fn spawn_watchdog(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let lifecycle = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                match lifecycle.phase() {
                    DaemonPhase::Draining | DaemonPhase::Stopped => break,
                    DaemonPhase::Starting => continue,
                    DaemonPhase::Ready => {}
                }
                if SignalHandler::shutdown_requested() {
                    lifecycle.trigger_drain("signal");
                    break;
                }
                let idle = lifecycle.last_activity_instant.lock().elapsed();
                if idle >= lifecycle.idle_timeout {
                    info!(idle_secs = idle.as_secs(), "Idle timeout reached");
                    lifecycle.trigger_drain("idle timeout");
                    break;
                }
            }
        })
    }

    /// Milliseconds since start
    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started_at_instant.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Start time
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last HTTP activity
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Requests served so far
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Configured idle timeout
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// Render an uptime as `2h 3m 4s`
#[must_use]
pub fn human_uptime(ms: u64) -> String {
    let secs = ms / 1000;
    let (hours, rem) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let lifecycle = Lifecycle::new(Duration::from_secs(600));
        assert_eq!(lifecycle.phase(), DaemonPhase::Starting);

        lifecycle.mark_ready();
        assert_eq!(lifecycle.phase(), DaemonPhase::Ready);

        lifecycle.trigger_drain("test");
        assert_eq!(lifecycle.phase(), DaemonPhase::Draining);
        assert!(lifecycle.drain_token().is_cancelled());

        // Stopped is terminal; a second drain is a no-op.
        lifecycle.mark_stopped();
        lifecycle.trigger_drain("again");
        assert_eq!(lifecycle.phase(), DaemonPhase::Stopped);
    }

    #[test]
    fn test_touch_counts_requests() {
        let lifecycle = Lifecycle::new(Duration::from_secs(600));
        lifecycle.touch();
        lifecycle.touch();
        assert_eq!(lifecycle.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watchdog_triggers_drain() {
        let lifecycle = Lifecycle::new(Duration::from_secs(5));
        lifecycle.mark_ready();
        let watchdog = Arc::clone(&lifecycle).spawn_watchdog();

        // No activity: the 5 s timeout fires under auto-advanced time.
        watchdog.await.unwrap();
        assert_eq!(lifecycle.phase(), DaemonPhase::Draining);
    }

    #[test]
    fn test_human_uptime() {
        assert_eq!(human_uptime(5_000), "5s");
        assert_eq!(human_uptime(65_000), "1m 5s");
        assert_eq!(human_uptime(3_725_000), "1h 2m 5s");
    }
}
