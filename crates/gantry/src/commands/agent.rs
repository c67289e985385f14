//! Hidden `agent` subcommands: the entrypoints the injected binary runs
//! inside the container.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Run the in-container setup over the stdio tunnel
    Setup(SetupArgs),
    /// Git credential helper bridging to the host over the local tunnel port
    GitCredentials(GitCredentialsArgs),
    /// Inactivity watchdog spawned during setup
    Daemon(DaemonArgs),
}

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Deflate+base64 run result scaffold
    #[arg(long)]
    pub result: String,

    /// Deflate+base64 workspace info payload
    #[arg(long)]
    pub info: String,
}

#[derive(Args, Debug)]
pub struct GitCredentialsArgs {
    /// Local port of the HTTP tunnel bridge
    #[arg(long)]
    pub port: u16,

    /// git-credential action (get, store, erase)
    #[arg(default_value = "get")]
    pub action: String,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Seconds of inactivity after which the container shuts down
    #[arg(long)]
    pub inactivity_timeout: u64,
}

/// File whose mtime marks the last client activity.
const ACTIVITY_FILE: &str = "/var/run/gantry/activity";

pub async fn execute(command: AgentCommand, root: CancellationToken) -> Result<()> {
    match command {
        AgentCommand::Setup(args) => {
            gantry_core::agent::run_setup(&args.result, &args.info, root).await?;
            Ok(())
        }
        AgentCommand::GitCredentials(args) => {
            gantry_core::agent::run_git_credentials_helper(args.port, &args.action).await?;
            Ok(())
        }
        AgentCommand::Daemon(args) => {
            run_daemon(Duration::from_secs(args.inactivity_timeout), root).await
        }
    }
}

/// Watch the activity file; once it goes stale past the timeout, bring the
/// container down by signalling its init process.
async fn run_daemon(timeout: Duration, root: CancellationToken) -> Result<()> {
    let activity = PathBuf::from(ACTIVITY_FILE);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(timeout / 4) => {}
            _ = root.cancelled() => return Ok(()),
        }

        let stale = match std::fs::metadata(&activity).and_then(|m| m.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|elapsed| elapsed >= timeout)
                .unwrap_or(false),
            // No activity recorded yet: treat daemon start as activity.
            Err(_) => false,
        };
        if stale {
            tracing::info!(
                timeout_secs = timeout.as_secs(),
                "inactivity timeout reached, stopping container"
            );
            let _ = tokio::process::Command::new("kill")
                .args(["-TERM", "1"])
                .output()
                .await;
            return Ok(());
        }
    }
}
