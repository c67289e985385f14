use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Dev container orchestrator",
    long_about = "Builds and runs devcontainer.json environments on docker, docker compose, or a remote agent."
)]
pub struct Cli {
    /// Data directory override (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, start, and set up the workspace's container
    Up(commands::up::UpArgs),
    /// Build the workspace's image without starting a container
    Build(commands::build::BuildArgs),
    /// Stop the workspace's container
    Stop(commands::workspace_ops::WorkspaceArgs),
    /// Delete the workspace's container and persisted state
    Delete(commands::workspace_ops::WorkspaceArgs),
    /// Show the workspace's container status (read-only, lock-free)
    Status(commands::workspace_ops::WorkspaceArgs),
    /// In-container agent entrypoints
    #[command(hide = true, subcommand)]
    Agent(commands::agent::AgentCommand),
}

impl Cli {
    pub async fn dispatch(self, root: CancellationToken) -> Result<()> {
        match self.command {
            Command::Up(args) => commands::up::execute(args, self.data_dir, root).await,
            Command::Build(args) => commands::build::execute(args, self.data_dir).await,
            Command::Stop(args) => {
                commands::workspace_ops::execute_stop(args, self.data_dir).await
            }
            Command::Delete(args) => {
                commands::workspace_ops::execute_delete(args, self.data_dir).await
            }
            Command::Status(args) => {
                commands::workspace_ops::execute_status(args, self.data_dir).await
            }
            Command::Agent(command) => commands::agent::execute(command, root).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn up_parses_workspace_and_flags() {
        let cli = Cli::parse_from([
            "gantry",
            "up",
            "/tmp/project",
            "--recreate",
            "--build-arg",
            "A=1",
            "--env",
            "FOO=bar",
        ]);
        match cli.command {
            Command::Up(args) => {
                assert_eq!(args.workspace, PathBuf::from("/tmp/project"));
                assert!(args.recreate);
                assert_eq!(args.build_arg, vec!["A=1".to_string()]);
                assert_eq!(args.env, vec!["FOO=bar".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
