//! The `codebrain` command
//!
//! Every invocation is a short-lived client of the daemon, except
//! `daemon-run`, which IS the daemon (spawned detached by
//! `ensure_daemon_running`, or run in the foreground with `start -f`).

mod cli;
mod client;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::error;

use cli::{Cli, Command};
use client::DaemonClient;
use codebrain_config::{BrainConfig, ConfigDir};
use codebrain_kernel::logsink::LogSinkMakeWriter;
use codebrain_kernel::LogSink;

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let config_dir = ConfigDir::resolve();

    // The daemon path owns the log sink and its own runtime.
    if matches!(
        cli.command,
        Command::DaemonRun | Command::Start { foreground: true }
    ) {
        return run_daemon_process(config, config_dir);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if config.daemon.verbose {
                    "debug".into()
                } else {
                    "warn".into()
                }
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_client_command(cli.command, config, config_dir))
}

fn load_config(cli: &Cli) -> Result<BrainConfig> {
    let mut config = match &cli.config {
        Some(path) => BrainConfig::load(path)?,
        None => {
            let default_path = std::path::Path::new("codebrain.yaml");
            if default_path.exists() {
                BrainConfig::load(default_path)?
            } else {
                let mut config = BrainConfig::default();
                config.apply_env_overrides();
                config
            }
        }
    };
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    if cli.verbose {
        config.daemon.verbose = true;
    }
    Ok(config)
}

/// The daemon process: log sink first, tracing into it, then serve
fn run_daemon_process(config: BrainConfig, config_dir: ConfigDir) -> Result<()> {
    config_dir.ensure()?;
    let log_sink = LogSink::open(config_dir.daemon_log(), config.daemon.verbose)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if config.daemon.verbose {
                    "debug".into()
                } else {
                    "info".into()
                }
            }),
        )
        .with_ansi(false)
        .with_writer(LogSinkMakeWriter(Arc::clone(&log_sink)))
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(codebrain_kernel::run_daemon(config, config_dir, log_sink))
}

async fn run_client_command(
    command: Command,
    config: BrainConfig,
    config_dir: ConfigDir,
) -> Result<()> {
    let client = DaemonClient::new(config.daemon.port, config_dir);

    match command {
        Command::DaemonRun | Command::Start { foreground: true } => {
            unreachable!("handled before the client runtime starts")
        }
        Command::Start { foreground: false } => {
            client.ensure_daemon_running().await?;
            let status = client.status().await?;
            println!("daemon ready (pid {})", status["pid"]);
            Ok(())
        }
        Command::Stop => {
            let response = client.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Ask {
            question,
            conversation,
        } => {
            client.ensure_daemon_running().await?;
            let mut args = serde_json::json!({"question": question});
            if let Some(conversation) = conversation {
                args["conversation_id"] = serde_json::json!(conversation);
            }
            let response = client.tool("ask_agent", args).await?;
            match response["result"]["answer"].as_str() {
                Some(answer) => println!("{answer}"),
                None => println!("{}", serde_json::to_string_pretty(&response)?),
            }
            Ok(())
        }
        Command::Ingest { path } => {
            client.ensure_daemon_running().await?;
            let absolute = std::fs::canonicalize(&path)?;
            let response = client
                .tool(
                    "ingest_path",
                    serde_json::json!({"path": absolute.display().to_string()}),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Command::Logs { lines } => {
            let logs = client.logs(lines).await?;
            for line in logs["logs"].as_array().into_iter().flatten() {
                if let Some(line) = line.as_str() {
                    println!("{line}");
                }
            }
            Ok(())
        }
    }
}
