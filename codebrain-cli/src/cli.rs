//! Command-line definition

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Knowledge-graph daemon for code and document RAG
#[derive(Debug, Parser)]
#[command(name = "codebrain", version, about)]
pub struct Cli {
    /// Daemon port
    #[arg(long, global = true, env = "CODEBRAIN_DAEMON_PORT")]
    pub port: Option<u16>,

    /// Config file (default: ./codebrain.yaml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (also via CODEBRAIN_DAEMON_VERBOSE=1)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon (spawns it detached unless -f)
    Start {
        /// Run in the foreground instead of detaching
        #[arg(short, long)]
        foreground: bool,
    },

    /// Ask the daemon to shut down
    Stop,

    /// Show daemon status
    Status,

    /// Ask the agent a question
    Ask {
        /// The question
        question: String,

        /// Conversation uuid to continue
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Ingest a directory into the knowledge graph
    Ingest {
        /// Directory to ingest
        path: PathBuf,
    },

    /// Print recent daemon log lines
    Logs {
        /// Number of lines
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },

    /// Run the daemon in this process (used by the launcher)
    #[command(hide = true, name = "daemon-run")]
    DaemonRun,
}
