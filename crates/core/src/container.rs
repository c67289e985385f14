//! Container reflection types
//!
//! [`ContainerDetails`] mirrors what the driver reports about a live
//! container. Every other component treats it as opaque data: produced by
//! `inspect`, carried through the run, persisted into the run result.

use crate::errors::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label holding the workspace id on containers this engine creates.
pub const WORKSPACE_ID_LABEL: &str = "dev.gantry.workspace.id";

/// Container lifecycle status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Static configuration of a container or image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Configured user, empty when the image default applies
    pub user: String,
    /// Environment as KEY=VALUE pairs
    pub env: Vec<String>,
    /// Entrypoint argv
    pub entrypoint: Vec<String>,
    /// Command argv
    pub cmd: Vec<String>,
    /// Image labels
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Environment as a map, later entries winning on duplicate keys.
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

/// A mount attached to a live container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMount {
    /// Mount kind (`bind`, `volume`, `tmpfs`)
    #[serde(rename = "Type", default)]
    pub mount_type: String,
    /// Source path or volume name
    #[serde(rename = "Source", default)]
    pub source: String,
    /// Destination inside the container
    #[serde(rename = "Destination", default)]
    pub destination: String,
    /// Whether the mount is writable
    #[serde(rename = "RW", default)]
    pub rw: bool,
}

/// Reflection of a live container as reported by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    /// Container id
    pub id: String,
    /// Lifecycle status
    pub status: ContainerStatus,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Static configuration
    pub config: ContainerConfig,
    /// Attached mounts
    pub mounts: Vec<ContainerMount>,
}

impl ContainerDetails {
    /// Parse one element of `docker inspect` output.
    pub fn from_inspect_json(value: &serde_json::Value) -> Result<Self> {
        let id = value
            .get("Id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DriverError::UnexpectedOutput {
                message: "inspect output missing Id".to_string(),
            })?
            .to_string();

        let status = value
            .pointer("/State/Status")
            .and_then(|v| v.as_str())
            .map(ContainerStatus::parse)
            .unwrap_or(ContainerStatus::Unknown);

        let config_value = value.get("Config").cloned().unwrap_or_default();
        let labels = string_map(config_value.get("Labels"));

        let config = ContainerConfig {
            user: config_value
                .get("User")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            env: string_list(config_value.get("Env")),
            entrypoint: string_list(config_value.get("Entrypoint")),
            cmd: string_list(config_value.get("Cmd")),
            labels: labels.clone(),
        };

        let mounts = value
            .get("Mounts")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| serde_json::from_value(m.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            status,
            labels,
            config,
            mounts,
        })
    }

    /// The workspace id label, when this container belongs to a workspace.
    pub fn workspace_id(&self) -> Option<&str> {
        self.labels.get(WORKSPACE_ID_LABEL).map(String::as_str)
    }
}

/// Details of an inspected image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDetails {
    /// Image id (digest form)
    pub id: String,
    /// Static configuration baked into the image
    pub config: ContainerConfig,
    /// Architecture the image was built for
    pub architecture: String,
}

impl ImageDetails {
    /// Parse one element of `docker image inspect` output.
    pub fn from_inspect_json(value: &serde_json::Value) -> Result<Self> {
        let id = value
            .get("Id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DriverError::UnexpectedOutput {
                message: "image inspect output missing Id".to_string(),
            })?
            .to_string();

        let config_value = value.get("Config").cloned().unwrap_or_default();
        let config = ContainerConfig {
            user: config_value
                .get("User")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            env: string_list(config_value.get("Env")),
            entrypoint: string_list(config_value.get("Entrypoint")),
            cmd: string_list(config_value.get("Cmd")),
            labels: string_map(config_value.get("Labels")),
        };

        Ok(Self {
            id,
            config,
            architecture: value
                .get("Architecture")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn string_map(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
