//! Daemon client with single-owner startup
//!
//! `ensure_daemon_running` layers three guards, cheapest first: a health
//! probe (it's up), a raw port probe (something is coming up), and the
//! filesystem startup lock (we get to spawn it). Whoever acquires the
//! lock spawns exactly one daemon; everyone else polls health until it
//! answers or the 30 s budget runs out.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::Write as _;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use codebrain_config::ConfigDir;
use codebrain_kernel::startup_lock::{StartupLock, StartupLockState};

/// Budget for a spawned or concurrent daemon to become healthy
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Health poll cadence while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// HTTP client for one daemon port
pub struct DaemonClient {
    port: u16,
    http: reqwest::Client,
    config_dir: ConfigDir,
}

impl DaemonClient {
    /// Create a client; no connection happens yet
    #[must_use]
    pub fn new(port: u16, config_dir: ConfigDir) -> Self {
        Self {
            port,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            config_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    /// Whether `/health` answers `ok`
    pub async fn health(&self) -> bool {
        let request = self
            .http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(2));
        match request.send().await {
            Ok(response) => response
                .json::<Value>()
                .await
                .map(|body| body["status"] == serde_json::json!("ok"))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Full `/status` document
    pub async fn status(&self) -> Result<Value> {
        Ok(self
            .http
            .get(self.url("/status"))
            .send()
            .await
            .context("daemon unreachable")?
            .json()
            .await?)
    }

    /// Invoke a tool via `/tool/:name`
    pub async fn tool(&self, name: &str, args: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(&format!("/tool/{name}")))
            .json(&args)
            .send()
            .await
            .context("daemon unreachable")?;
        let body: Value = response.json().await?;
        if body["success"] == serde_json::json!(false) {
            bail!(
                "tool {name} failed: {}",
                body["error"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }

    /// Trigger a drain
    pub async fn shutdown(&self) -> Result<Value> {
        Ok(self
            .http
            .post(self.url("/shutdown"))
            .send()
            .await
            .context("daemon unreachable")?
            .json()
            .await?)
    }

    /// Recent daemon log lines
    pub async fn logs(&self, lines: usize) -> Result<Value> {
        Ok(self
            .http
            .get(self.url(&format!("/logs?lines={lines}")))
            .send()
            .await
            .context("daemon unreachable")?
            .json()
            .await?)
    }

    /// Make sure a daemon is serving this port, spawning one if needed
    ///
    /// # Errors
    ///
    /// Fails when the port is occupied by something that never becomes
    /// healthy, or a spawned daemon does not come up within 30 s.
    pub async fn ensure_daemon_running(&self) -> Result<()> {
        // Guard 1: cheap and authoritative.
        if self.health().await {
            debug!(port = self.port, "Daemon already healthy");
            return Ok(());
        }

        // Guard 2: port occupied means another daemon is coming up (or
        // something else squats the port; polling distinguishes them).
        if port_in_use(self.port) {
            self.client_log("port in use, waiting for health");
            return self.poll_until_healthy("existing process").await;
        }

        // Guard 3: the filesystem lock decides who spawns.
        let (lock, state) = StartupLock::try_acquire(self.config_dir.startup_lock())?;
        match state {
            StartupLockState::Acquired => {
                self.client_log("acquired startup lock, spawning daemon");
                self.spawn_daemon()?;
                let result = self.poll_until_healthy("spawned daemon").await;
                lock.release();
                result
            }
            StartupLockState::HeldByOther { pid } => {
                self.client_log(&format!(
                    "startup lock held by {}, waiting for health",
                    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                ));
                self.poll_until_healthy("concurrent starter").await
            }
        }
    }

    fn spawn_daemon(&self) -> Result<()> {
        let exe = std::env::current_exe().context("cannot locate own executable")?;
        let child = std::process::Command::new(exe)
            .arg("daemon-run")
            .env("CODEBRAIN_DAEMON_PORT", self.port.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("failed to spawn daemon")?;
        info!(pid = child.id(), "Daemon spawned");
        self.client_log(&format!("spawned daemon pid {}", child.id()));
        Ok(())
    }

    async fn poll_until_healthy(&self, what: &str) -> Result<()> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while Instant::now() < deadline {
            if self.health().await {
                self.client_log("daemon healthy");
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.client_log(&format!("timed out waiting for {what}"));
        bail!("daemon did not become healthy within {STARTUP_TIMEOUT:?} ({what})")
    }

    /// Append to the client diagnostic log; failures are ignored
    fn client_log(&self, message: &str) {
        let path = self.config_dir.client_log();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let _ = writeln!(
                file,
                "[{}] pid={} {message}",
                chrono::Utc::now().to_rfc3339(),
                std::process::id()
            );
        }
    }
}

fn port_in_use(port: u16) -> bool {
    std::net::TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    )
    .is_ok()
}
