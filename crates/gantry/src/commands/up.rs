//! The `up` command: configuration to running, set-up container.

use anyhow::{Context, Result};
use clap::Args;
use gantry_core::config::ConfigLoader;
use gantry_core::host_requirements::GpuMode;
use gantry_core::run::{RunController, RunOptions};
use gantry_core::setup::{Ide, SetupOptions};
use gantry_core::workspace::CliOverrides;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::shared;

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Workspace folder holding the devcontainer configuration
    pub workspace: PathBuf,

    /// Delete and recreate the container
    #[arg(long)]
    pub recreate: bool,

    /// Recreate and wipe workspace content
    #[arg(long)]
    pub reset: bool,

    /// Override the configured image
    #[arg(long)]
    pub image: Option<String>,

    /// Override the configured Dockerfile path
    #[arg(long)]
    pub dockerfile: Option<PathBuf>,

    /// Additional build arguments (KEY=VALUE, repeatable)
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Environment entries injected into the container (KEY=VALUE, repeatable)
    #[arg(long)]
    pub env: Vec<String>,

    /// Init-env overrides for ${localEnv:...} resolution (KEY=VALUE)
    #[arg(long = "init-env")]
    pub init_env: Vec<String>,

    /// Additional image tags
    #[arg(long)]
    pub tag: Vec<String>,

    /// GPU request handling: all, detect, none
    #[arg(long, default_value = "detect")]
    pub gpu: String,

    /// IDE server to install in the container
    #[arg(long, value_enum)]
    pub ide: Option<IdeArg>,

    /// Stop the container after this many seconds of inactivity
    #[arg(long)]
    pub inactivity_timeout: Option<u64>,

    /// Directory of local feature payloads
    #[arg(long)]
    pub features_dir: Option<PathBuf>,

    /// Host path of the agent binary to inject
    #[arg(long)]
    pub agent_binary: Option<PathBuf>,

    /// Drive docker on a remote host over ssh instead of locally
    #[arg(long)]
    pub remote_host: Option<String>,

    /// Skip the in-container setup phase
    #[arg(long)]
    pub skip_setup: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum IdeArg {
    Vscode,
    Openvscode,
    Jetbrains,
    Jupyter,
    Rstudio,
    Fleet,
}

impl From<IdeArg> for Ide {
    fn from(value: IdeArg) -> Self {
        match value {
            IdeArg::Vscode => Ide::VsCode,
            IdeArg::Openvscode => Ide::OpenVsCode,
            IdeArg::Jetbrains => Ide::JetBrains,
            IdeArg::Jupyter => Ide::Jupyter,
            IdeArg::Rstudio => Ide::RStudio,
            IdeArg::Fleet => Ide::Fleet,
        }
    }
}

pub async fn execute(
    args: UpArgs,
    data_dir: Option<PathBuf>,
    root: CancellationToken,
) -> Result<()> {
    let layout = shared::layout(data_dir)?;
    let config_path = RunController::find_config_path(&args.workspace)?;
    let raw_config = ConfigLoader::load_from_path(&config_path)?;

    let overrides = CliOverrides {
        image: args.image.clone(),
        dockerfile_path: args.dockerfile.clone(),
        build_args: shared::parse_key_values(&args.build_arg),
        recreate: args.recreate || args.reset,
        reset: args.reset,
        env: args.env.clone(),
        init_env: shared::parse_key_values(&args.init_env),
        tags: args.tag.clone(),
    };
    let descriptor = shared::descriptor(&args.workspace, raw_config.is_compose(), overrides)?;
    let driver = shared::driver(
        &raw_config,
        &descriptor,
        &config_path,
        args.remote_host.as_deref(),
    );
    let catalog = shared::catalog(&config_path, args.features_dir.clone());

    let gpu_mode: GpuMode = args
        .gpu
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("parsing --gpu")?;

    let mut setup = SetupOptions::default();
    if let Some(agent_binary) = args.agent_binary {
        setup.agent_binary = agent_binary;
    }

    let options = RunOptions {
        gpu_mode,
        setup,
        ide: args.ide.map(Ide::from),
        daemon_inactivity_timeout: args.inactivity_timeout.map(Duration::from_secs),
        skip_setup: args.skip_setup,
    };

    let controller = RunController::new(&layout, &driver, &catalog);
    let result = controller
        .up(&descriptor, &config_path, &options, root)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "workspaceId": descriptor.id,
            "containerId": result.container.id,
            "workspaceFolder": result.workspace_folder,
            "remoteUser": result.remote_user,
        })
    );
    Ok(())
}
