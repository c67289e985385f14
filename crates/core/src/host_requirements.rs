//! Host requirements evaluation
//!
//! Compares the configuration's `hostRequirements` (cpus, memory, storage,
//! gpu) against the actual host. CPU and memory are inspected via sysinfo;
//! storage is checked for the workspace's filesystem. GPU requests feed the
//! compose device reservation and the single-container `--gpus` flag.

use crate::config::HostRequirements;
use crate::errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use sysinfo::System;
use tracing::{debug, instrument, warn};

/// How GPU requests are handled during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    /// Always request GPU resources regardless of host capabilities.
    All,
    /// Probe host GPU capability; request if available, else warn and skip.
    #[default]
    Detect,
    /// Never request GPU resources.
    None,
}

impl fmt::Display for GpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuMode::All => write!(f, "all"),
            GpuMode::Detect => write!(f, "detect"),
            GpuMode::None => write!(f, "none"),
        }
    }
}

impl FromStr for GpuMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(GpuMode::All),
            "detect" => Ok(GpuMode::Detect),
            "none" => Ok(GpuMode::None),
            other => Err(format!("unknown gpu mode '{}'", other)),
        }
    }
}

/// Result of evaluating host requirements.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostCapabilityReport {
    /// CPUs available on the host
    pub cpus: usize,
    /// Total memory in bytes
    pub memory_bytes: u64,
    /// Whether a GPU was detected or assumed
    pub gpu_available: bool,
    /// Whether the run should request GPU resources
    pub request_gpu: bool,
}

/// Evaluate requirements against this host.
///
/// Hard requirements (cpus, memory, storage) fail the run when unmet; a GPU
/// request only fails when it is mandatory (`gpu: true`) and the mode is
/// `detect` with no GPU found.
#[instrument(skip_all)]
pub fn evaluate(
    requirements: Option<&HostRequirements>,
    gpu_mode: GpuMode,
    workspace_path: Option<&Path>,
) -> Result<HostCapabilityReport> {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    let mut report = HostCapabilityReport {
        cpus: system.cpus().len(),
        memory_bytes: system.total_memory(),
        gpu_available: host_has_gpu(),
        request_gpu: false,
    };

    let Some(requirements) = requirements else {
        report.request_gpu = matches!(gpu_mode, GpuMode::All);
        return Ok(report);
    };

    if let Some(required_cpus) = requirements.cpus {
        if report.cpus < required_cpus as usize {
            return Err(ConfigError::Validation {
                message: format!(
                    "host has {} cpus, configuration requires {}",
                    report.cpus, required_cpus
                ),
            }
            .into());
        }
    }

    if let Some(required_memory) = &requirements.memory {
        let required = parse_size(required_memory)?;
        if report.memory_bytes < required {
            return Err(ConfigError::Validation {
                message: format!(
                    "host has {} of memory, configuration requires {}",
                    bytesize::ByteSize(report.memory_bytes),
                    required_memory
                ),
            }
            .into());
        }
    }

    if let Some(required_storage) = &requirements.storage {
        let required = parse_size(required_storage)?;
        if let Some(path) = workspace_path {
            match available_storage(path) {
                Some(available) if available < required => {
                    return Err(ConfigError::Validation {
                        message: format!(
                            "workspace filesystem has {} free, configuration requires {}",
                            bytesize::ByteSize(available),
                            required_storage
                        ),
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    debug!("storage capacity not determinable, skipping check");
                }
            }
        }
    }

    report.request_gpu = match gpu_mode {
        GpuMode::None => false,
        GpuMode::All => true,
        GpuMode::Detect => {
            if !requirements.wants_gpu() {
                false
            } else if report.gpu_available {
                true
            } else if requirements.gpu_optional() {
                warn!("configuration prefers a GPU but none was detected, continuing without");
                false
            } else {
                return Err(ConfigError::Validation {
                    message: "configuration requires a GPU but none was detected".to_string(),
                }
                .into());
            }
        }
    };

    Ok(report)
}

/// Probe for an NVIDIA GPU: a device node or the management CLI on PATH.
pub fn host_has_gpu() -> bool {
    if Path::new("/dev/nvidia0").exists() || Path::new("/dev/nvidiactl").exists() {
        return true;
    }
    which_on_path("nvidia-smi")
}

fn which_on_path(binary: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

fn parse_size(input: &str) -> Result<u64> {
    input
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| {
            ConfigError::Validation {
                message: format!("invalid size '{}': {}", input, e),
            }
            .into()
        })
}

/// Free bytes on the filesystem holding `path`, when determinable.
fn available_storage(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let canonical = path.canonicalize().ok()?;
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
