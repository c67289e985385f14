//! `stop`, `delete`, and `status` commands.

use anyhow::Result;
use clap::Args;
use gantry_core::config::ConfigLoader;
use gantry_core::run::{RunController, WorkspaceStatus};
use gantry_core::workspace::CliOverrides;
use std::path::PathBuf;

use super::shared;

#[derive(Args, Debug)]
pub struct WorkspaceArgs {
    /// Workspace folder holding the devcontainer configuration
    pub workspace: PathBuf,
}

struct Wiring {
    layout: gantry_core::workspace::WorkspaceLayout,
    descriptor: gantry_core::workspace::WorkspaceDescriptor,
    driver: gantry_core::driver::Driver,
    catalog: gantry_core::features::DirectoryCatalog,
}

fn wire(args: &WorkspaceArgs, data_dir: Option<PathBuf>) -> Result<Wiring> {
    let layout = shared::layout(data_dir)?;
    let config_path = RunController::find_config_path(&args.workspace)?;
    let config = ConfigLoader::load_from_path(&config_path)?;
    let descriptor =
        shared::descriptor(&args.workspace, config.is_compose(), CliOverrides::default())?;
    let driver = shared::driver(&config, &descriptor, &config_path, None);
    let catalog = shared::catalog(&config_path, None);
    Ok(Wiring {
        layout,
        descriptor,
        driver,
        catalog,
    })
}

pub async fn execute_stop(args: WorkspaceArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let wiring = wire(&args, data_dir)?;
    let controller = RunController::new(&wiring.layout, &wiring.driver, &wiring.catalog);
    controller.stop(&wiring.descriptor).await?;
    println!("stopped {}", wiring.descriptor.id);
    Ok(())
}

pub async fn execute_delete(args: WorkspaceArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let wiring = wire(&args, data_dir)?;
    let controller = RunController::new(&wiring.layout, &wiring.driver, &wiring.catalog);
    controller.delete(&wiring.descriptor).await?;
    println!("deleted {}", wiring.descriptor.id);
    Ok(())
}

pub async fn execute_status(args: WorkspaceArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let wiring = wire(&args, data_dir)?;
    let controller = RunController::new(&wiring.layout, &wiring.driver, &wiring.catalog);
    let status = controller.status(&wiring.descriptor).await?;

    let rendered = match status {
        WorkspaceStatus::NotFound => serde_json::json!({
            "workspaceId": wiring.descriptor.id,
            "status": "not-found",
        }),
        WorkspaceStatus::Stopped { container_id } => serde_json::json!({
            "workspaceId": wiring.descriptor.id,
            "status": "stopped",
            "containerId": container_id,
        }),
        WorkspaceStatus::Running { container_id } => serde_json::json!({
            "workspaceId": wiring.descriptor.id,
            "status": "running",
            "containerId": container_id,
        }),
    };
    println!("{}", rendered);
    Ok(())
}
