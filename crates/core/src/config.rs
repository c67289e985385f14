//! Configuration resolution and parsing
//!
//! Handles devcontainer.json parsing with JSON-with-comments tolerance (via
//! the json5 crate) and produces the strongly typed [`DevContainerConfig`].
//! Exactly one of `image`, `build`, or `dockerComposeFile` must be present;
//! everything else is optional with ergonomic defaults.
//!
//! Unknown fields are preserved in [`DevContainerConfig::additional`] and
//! logged at DEBUG level so configurations written for newer tooling load
//! without loss.

use crate::errors::{ConfigError, GantryError, Result};
use crate::variable::{
    SubstitutionContext, SubstitutionOptions, SubstitutionReport, VariableSubstitution,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Fields whose values execute inside the container; `${containerEnv:...}`
/// tokens in these stay unexpanded until the agent resolves them.
const CONTAINER_EXEC_FIELDS: &[&str] = &[
    "remoteEnv",
    "onCreateCommand",
    "updateContentCommand",
    "postCreateCommand",
    "postStartCommand",
    "postAttachCommand",
];

fn default_empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Build configuration used when the container is built from a Dockerfile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Path to the Dockerfile, relative to the configuration file
    pub dockerfile: Option<String>,
    /// Build context path, relative to the configuration file
    pub context: Option<String>,
    /// Build arguments passed to the build
    #[serde(default)]
    pub args: IndexMap<String, String>,
    /// Target stage to build
    pub target: Option<String>,
    /// External cache sources
    #[serde(default)]
    pub cache_from: Vec<String>,
}

/// Host hardware requirements declared by the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequirements {
    /// Minimum number of CPUs
    pub cpus: Option<u32>,
    /// Minimum memory, human-readable (e.g. "4gb")
    pub memory: Option<String>,
    /// Minimum storage, human-readable (e.g. "32gb")
    pub storage: Option<String>,
    /// GPU request: `true`, `"optional"`, or a detail object
    pub gpu: Option<serde_json::Value>,
}

impl HostRequirements {
    /// Whether the configuration asks for a GPU at all.
    pub fn wants_gpu(&self) -> bool {
        match &self.gpu {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(_)) => true,
            Some(serde_json::Value::Object(_)) => true,
            _ => false,
        }
    }

    /// Whether the GPU request is optional ("optional" string form).
    pub fn gpu_optional(&self) -> bool {
        matches!(&self.gpu, Some(serde_json::Value::String(s)) if s == "optional")
    }
}

/// DevContainer configuration following the Development Containers schema.
///
/// Mirrors the subset of fields the engine consumes. Optional arrays default
/// to empty vectors, maps to empty ordered maps. The declared feature map
/// preserves declaration order (it participates in install ordering).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevContainerConfig {
    /// Human-readable name for the development container
    pub name: Option<String>,

    /// Container image to run (image mode)
    pub image: Option<String>,

    /// Build configuration (Dockerfile mode)
    pub build: Option<BuildSpec>,

    /// Docker Compose file(s): single path or array of paths (compose mode)
    #[serde(rename = "dockerComposeFile")]
    pub docker_compose_file: Option<serde_json::Value>,

    /// Compose service acting as the development container
    pub service: Option<String>,

    /// Additional compose services to start alongside the primary one
    pub run_services: Vec<String>,

    /// Declared features: ordered map of feature id to option values
    pub features: IndexMap<String, serde_json::Value>,

    /// Feature ids that should override the automatic install order
    pub override_feature_install_order: Option<Vec<String>>,

    /// Additional mounts (docker mount strings or structured objects)
    pub mounts: Vec<serde_json::Value>,

    /// Application ports published when the container runs
    pub app_port: Option<serde_json::Value>,

    /// Ports forwarded from the container to the host
    pub forward_ports: Vec<serde_json::Value>,

    /// Environment set on the container at create time
    pub container_env: IndexMap<String, String>,

    /// Environment applied to in-container processes; `None` unsets
    pub remote_env: IndexMap<String, Option<String>>,

    /// User the container runs as
    pub container_user: Option<String>,

    /// User in-container commands run as
    pub remote_user: Option<String>,

    /// Align the remote user's UID/GID with the host user
    pub update_remote_user_uid: Option<bool>,

    /// Workspace folder inside the container
    pub workspace_folder: Option<String>,

    /// Explicit workspace mount string
    pub workspace_mount: Option<String>,

    /// Replace the image command with a keep-alive loop
    pub override_command: Option<bool>,

    /// Run an init process inside the container
    pub init: Option<bool>,

    /// Run the container privileged
    pub privileged: Option<bool>,

    /// Capabilities to add
    pub cap_add: Vec<String>,

    /// Security options
    pub security_opt: Vec<String>,

    /// Extra `docker run` arguments (single-container mode)
    pub run_args: Vec<String>,

    /// Host hardware requirements
    pub host_requirements: Option<HostRequirements>,

    /// Lifecycle hook: after the container is created
    pub on_create_command: Option<serde_json::Value>,

    /// Lifecycle hook: after content is updated
    pub update_content_command: Option<serde_json::Value>,

    /// Lifecycle hook: after create, once per container
    pub post_create_command: Option<serde_json::Value>,

    /// Lifecycle hook: every container start
    pub post_start_command: Option<serde_json::Value>,

    /// Lifecycle hook: every client attach
    pub post_attach_command: Option<serde_json::Value>,

    /// Action when the client disconnects
    pub shutdown_action: Option<String>,

    /// Tool-specific customizations, passed through untouched
    #[serde(default = "default_empty_object")]
    pub customizations: serde_json::Value,

    /// Unknown fields, preserved for forward compatibility
    #[serde(flatten)]
    pub additional: IndexMap<String, serde_json::Value>,

    /// Path the configuration was loaded from; not part of the schema
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl DevContainerConfig {
    /// Compose file paths declared by `dockerComposeFile`, in declaration order.
    pub fn compose_files(&self) -> Vec<String> {
        match &self.docker_compose_file {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this configuration is compose-based.
    pub fn is_compose(&self) -> bool {
        self.docker_compose_file.is_some()
    }

    /// Forwarded ports normalized to `port` or `host:port` strings.
    pub fn forward_port_specs(&self) -> Vec<String> {
        self.forward_ports
            .iter()
            .filter_map(|v| match v {
                serde_json::Value::Number(n) => n.as_u64().map(|p| p.to_string()),
                serde_json::Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Application ports normalized to strings.
    pub fn app_port_specs(&self) -> Vec<String> {
        match &self.app_port {
            Some(serde_json::Value::Number(n)) => {
                n.as_u64().map(|p| p.to_string()).into_iter().collect()
            }
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::Number(n) => n.as_u64().map(|p| p.to_string()),
                    serde_json::Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Directory containing the configuration file, when known.
    pub fn config_dir(&self) -> Option<&Path> {
        self.config_path.as_deref().and_then(Path::parent)
    }
}

/// Configuration loader with JSONC support and structural validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate a devcontainer configuration from a file.
    ///
    /// Accepts JSON with comments and trailing commas. Enforces that exactly
    /// one of `image`, `build`, `dockerComposeFile` is present.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<DevContainerConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        let mut config: DevContainerConfig =
            json5::from_str(&content).map_err(|e| ConfigError::Parse {
                message: format!("{}: {}", path.display(), e),
            })?;

        config.config_path = Some(path.to_path_buf());
        Self::validate(&config)?;

        if !config.additional.is_empty() {
            debug!(
                unknown_fields = ?config.additional.keys().collect::<Vec<_>>(),
                "configuration contains unknown fields"
            );
        }

        Ok(config)
    }

    /// Structural validation: the three source modes are mutually exclusive
    /// and exactly one must be chosen.
    pub fn validate(config: &DevContainerConfig) -> Result<()> {
        let mut sources = Vec::new();
        if config.image.is_some() {
            sources.push("image");
        }
        if config.build.is_some() {
            sources.push("build");
        }
        if config.docker_compose_file.is_some() {
            sources.push("dockerComposeFile");
        }

        match sources.len() {
            1 => {}
            0 => {
                return Err(ConfigError::Validation {
                    message: "one of 'image', 'build', or 'dockerComposeFile' is required"
                        .to_string(),
                }
                .into())
            }
            _ => {
                return Err(ConfigError::Validation {
                    message: format!(
                        "'{}' are mutually exclusive; declare exactly one",
                        sources.join("', '")
                    ),
                }
                .into())
            }
        }

        if config.is_compose() && config.service.is_none() {
            return Err(ConfigError::Validation {
                message: "'service' is required when 'dockerComposeFile' is set".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Apply variable substitution to every string leaf of the configuration.
    ///
    /// `${localEnv:...}` resolves first, `${containerEnv:...}` is deferred in
    /// the container-exec fields, and the workspace placeholders resolve in
    /// the same pass. Returns a new configuration; the input is untouched.
    #[instrument(skip_all)]
    pub fn substitute(
        config: &DevContainerConfig,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> Result<DevContainerConfig> {
        let value = serde_json::to_value(config).map_err(|e| GantryError::Internal {
            message: format!("configuration serialization failed: {}", e),
        })?;

        let substituted = match value {
            serde_json::Value::Object(obj) => {
                let mut out = serde_json::Map::with_capacity(obj.len());
                for (key, field) in obj {
                    let options = SubstitutionOptions {
                        defer_container_env: CONTAINER_EXEC_FIELDS.contains(&key.as_str()),
                    };
                    out.insert(
                        key,
                        VariableSubstitution::substitute_json_value(
                            &field, context, options, report,
                        ),
                    );
                }
                serde_json::Value::Object(out)
            }
            other => other,
        };

        let mut result: DevContainerConfig =
            serde_json::from_value(substituted).map_err(|e| ConfigError::Parse {
                message: format!("substituted configuration is invalid: {}", e),
            })?;
        result.config_path = config.config_path.clone();
        Ok(result)
    }

    /// Parse a secondary configuration file and merge it onto `target`.
    ///
    /// Used for `--extra-devcontainer-path`. The extra file does not have to
    /// declare a source mode of its own; merge semantics follow the
    /// [`crate::merge`] rules (lists concatenate, user-level values win).
    #[instrument(skip_all, fields(extra = %extra_path.display()))]
    pub fn add_extra_config(
        extra_path: &Path,
        target: &DevContainerConfig,
    ) -> Result<DevContainerConfig> {
        if !extra_path.exists() {
            return Err(ConfigError::NotFound {
                path: extra_path.display().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(extra_path).map_err(ConfigError::from)?;
        let extra: DevContainerConfig =
            json5::from_str(&content).map_err(|e| ConfigError::Parse {
                message: format!("{}: {}", extra_path.display(), e),
            })?;

        let merged = crate::merge::merge_user_configs(target, &extra);
        Self::validate(&merged)?;
        Ok(merged)
    }
}
