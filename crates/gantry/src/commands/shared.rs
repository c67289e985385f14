//! Shared wiring between subcommands: layout, descriptor, and driver
//! construction.

use anyhow::{Context, Result};
use gantry_core::config::DevContainerConfig;
use gantry_core::driver::{ComposeCli, DockerCli, Driver};
use gantry_core::features::DirectoryCatalog;
use gantry_core::workspace::{
    CliOverrides, DriverKind, WorkspaceDescriptor, WorkspaceLayout, WorkspaceSource,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolve the persisted layout, honoring `--data-dir`.
pub fn layout(data_dir: Option<PathBuf>) -> Result<WorkspaceLayout> {
    match data_dir {
        Some(dir) => Ok(WorkspaceLayout::new(dir)),
        None => WorkspaceLayout::default_location().context("resolving data directory"),
    }
}

/// Build the run descriptor for a local workspace folder.
pub fn descriptor(
    workspace: &Path,
    is_compose: bool,
    overrides: CliOverrides,
) -> Result<WorkspaceDescriptor> {
    let canonical = workspace
        .canonicalize()
        .with_context(|| format!("workspace folder {}", workspace.display()))?;
    let driver = if is_compose {
        DriverKind::Compose
    } else {
        DriverKind::Docker
    };
    Ok(WorkspaceDescriptor::new(
        WorkspaceSource::LocalFolder { path: canonical },
        driver,
    )
    .with_overrides(overrides))
}

/// Build the driver matching the configuration: remote when a host is
/// given, compose when the configuration declares compose files, plain
/// docker otherwise.
pub fn driver(
    config: &DevContainerConfig,
    descriptor: &WorkspaceDescriptor,
    config_path: &Path,
    remote_host: Option<&str>,
) -> Driver {
    if let Some(host) = remote_host {
        return Driver::Remote(gantry_core::driver::RemoteDriver::new(vec![
            "ssh".to_string(),
            host.to_string(),
        ]));
    }

    let docker = DockerCli::new();
    if !config.is_compose() {
        return Driver::Docker(docker);
    }

    let base_dir = config_path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let files: Vec<PathBuf> = config
        .compose_files()
        .iter()
        .map(|file| {
            let path = PathBuf::from(file);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        })
        .collect();

    let project_name = ComposeCli::derive_project_name(&descriptor.id);
    let compose = ComposeCli::new(docker.clone(), project_name).with_files(files);
    Driver::Compose { docker, compose }
}

/// Feature catalog next to the configuration (`<config dir>/features`),
/// overridable with `--features-dir`.
pub fn catalog(config_path: &Path, features_dir: Option<PathBuf>) -> DirectoryCatalog {
    let root = features_dir.unwrap_or_else(|| {
        config_path
            .parent()
            .map(|dir| dir.join("features"))
            .unwrap_or_else(|| PathBuf::from("features"))
    });
    DirectoryCatalog::new(root)
}

/// Parse repeated `KEY=VALUE` flags.
pub fn parse_key_values(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}
