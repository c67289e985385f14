//! Mount parsing and validation
//!
//! Parses devcontainer mount declarations into structured values that convert
//! to driver CLI arguments. Two input shapes are accepted:
//!
//! 1. Docker mount syntax: `type=bind,source=/host,target=/container,readonly`
//! 2. Structured objects: `{"type": "volume", "source": "cache", "target": "/cache"}`
//!
//! Supported types are `bind`, `volume`, and `tmpfs`. Volumes may be flagged
//! `external` (pre-existing, never created or deleted by the engine).

use crate::errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Types of mounts supported by dev containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// Bind mount from the host filesystem
    Bind,
    /// Named volume
    Volume,
    /// Temporary in-memory filesystem
    Tmpfs,
}

impl FromStr for MountType {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bind" => Ok(MountType::Bind),
            "volume" => Ok(MountType::Volume),
            "tmpfs" => Ok(MountType::Tmpfs),
            _ => Err(ConfigError::Validation {
                message: format!(
                    "Unsupported mount type: '{}'. Supported types: bind, volume, tmpfs",
                    s
                ),
            }),
        }
    }
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountType::Bind => write!(f, "bind"),
            MountType::Volume => write!(f, "volume"),
            MountType::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// A parsed mount declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type
    #[serde(rename = "type")]
    pub mount_type: MountType,
    /// Source path or volume name; empty for tmpfs
    #[serde(default)]
    pub source: String,
    /// Target path inside the container
    pub target: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
    /// Volume exists outside this workspace's lifecycle
    #[serde(default)]
    pub external: bool,
}

impl Mount {
    /// Parse a mount from either accepted JSON shape.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Self::parse_docker_syntax(s),
            serde_json::Value::Object(_) => {
                let mount: Mount =
                    serde_json::from_value(value.clone()).map_err(|e| ConfigError::Validation {
                        message: format!("Invalid mount object: {}", e),
                    })?;
                mount.validate()?;
                Ok(mount)
            }
            _ => Err(ConfigError::Validation {
                message: "Mount must be a string or an object".to_string(),
            }
            .into()),
        }
    }

    /// Parse docker mount syntax: comma-separated `key=value` pairs plus the
    /// bare `readonly`/`ro` and `external` flags.
    pub fn parse_docker_syntax(spec: &str) -> Result<Self> {
        let mut mount_type: Option<MountType> = None;
        let mut source = String::new();
        let mut target = String::new();
        let mut read_only = false;
        let mut external = false;

        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some(("type", v)) => mount_type = Some(v.parse()?),
                Some(("source" | "src", v)) => source = v.to_string(),
                Some(("target" | "dst" | "destination", v)) => target = v.to_string(),
                Some(("readonly" | "ro", v)) => {
                    read_only = v == "true" || v == "1";
                }
                Some(("external", v)) => {
                    external = v == "true" || v == "1";
                }
                Some((key, _)) => {
                    debug!(option = key, "ignoring unsupported mount option");
                }
                None => match part {
                    "readonly" | "ro" => read_only = true,
                    "external" => external = true,
                    other => {
                        debug!(option = other, "ignoring unsupported mount flag");
                    }
                },
            }
        }

        let mount = Mount {
            mount_type: mount_type.ok_or_else(|| ConfigError::Validation {
                message: format!("Mount '{}' is missing 'type='", spec),
            })?,
            source,
            target,
            read_only,
            external,
        };
        mount.validate()?;
        Ok(mount)
    }

    fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(ConfigError::Validation {
                message: "Mount requires a target".to_string(),
            }
            .into());
        }
        if self.mount_type != MountType::Tmpfs && self.source.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("{} mount requires a source", self.mount_type),
            }
            .into());
        }
        Ok(())
    }

    /// Render as a `--mount` argument for the driver CLI.
    pub fn to_docker_arg(&self) -> String {
        let mut parts = vec![format!("type={}", self.mount_type)];
        if !self.source.is_empty() {
            parts.push(format!("source={}", self.source));
        }
        parts.push(format!("target={}", self.target));
        if self.read_only {
            parts.push("readonly".to_string());
        }
        parts.join(",")
    }

    /// Render as a compose short-form volume entry (`source:target[:ro]`).
    pub fn to_compose_volume(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Parse every mount declaration of a configuration, failing on the first
/// invalid entry.
pub fn parse_mounts(values: &[serde_json::Value]) -> Result<Vec<Mount>> {
    values.iter().map(Mount::from_value).collect()
}
