//! The daemon kernel
//!
//! One process owns the graph, the watchers, the embedding pipeline, and
//! the agent executor; everything else is a short-lived HTTP client.
//! This crate provides the single-owner startup discipline (PID file +
//! filesystem startup lock), signal handling, the log sink with SSE
//! fan-out, the lifecycle state machine with idle shutdown, and the
//! loopback HTTP surface.

pub mod brain_tools;
pub mod http;
pub mod lifecycle;
pub mod logsink;
pub mod personas;
pub mod pid;
pub mod server;
pub mod signals;
pub mod startup_lock;
pub mod state;

pub use lifecycle::{DaemonPhase, Lifecycle};
pub use logsink::LogSink;
pub use personas::PersonaStore;
pub use pid::PidFile;
pub use server::run_daemon;
pub use startup_lock::StartupLock;
pub use state::DaemonState;
