//! Docker Compose build path
//!
//! Extends a compose project with the devcontainer semantics: a build
//! override that points the devcontainer service at the feature-extended
//! Dockerfile, and an up override that injects the runtime entrypoint
//! wrapper, merged environment, capabilities, labels, and (when requested
//! and supported) the GPU device reservation.
//!
//! Generated override files land in the workspace's `.docker-compose`
//! folder named `<prefix>-<nanos>.yml`, files 0600, and are layered onto the
//! user's compose files via `-f`.

use crate::config::DevContainerConfig;
use crate::errors::{BuildError, ConfigError, Result};
use crate::merge::MergedDevContainerConfig;
use crate::mount::Mount;
use crate::overlay::METADATA_LABEL;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Prefix of the generated build override file.
pub const BUILD_OVERRIDE_PREFIX: &str = "docker-compose.devcontainer.build";
/// Prefix of the generated up (runtime) override file.
pub const UP_OVERRIDE_PREFIX: &str = "docker-compose.devcontainer.containerFeatures";

/// Marker line the entrypoint wrapper prints once the container is up.
pub const READY_MARKER: &str = "gantry-container-ready";

/// One service of a loaded compose project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    /// Service name
    pub name: String,
    /// Image reference, when the service runs a prebuilt image
    pub image: Option<String>,
    /// Build definition, when the service builds
    pub build: Option<ComposeBuild>,
}

/// Build definition of a compose service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeBuild {
    /// Build context directory
    pub context: Option<String>,
    /// Dockerfile path relative to the context
    pub dockerfile: Option<String>,
    /// Build target stage
    pub target: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: IndexMap<String, String>,
}

/// A loaded compose project: resolved services plus the file stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeProject {
    /// Deterministic project name derived from the workspace id
    pub name: String,
    /// User compose files in declaration order
    pub files: Vec<PathBuf>,
    /// `.env` files applied to the project
    pub env_files: Vec<PathBuf>,
    /// Services by name
    pub services: IndexMap<String, ComposeService>,
}

impl ComposeProject {
    /// Build the project model from `docker compose config --format json`
    /// output.
    pub fn from_config_json(
        name: impl Into<String>,
        files: Vec<PathBuf>,
        env_files: Vec<PathBuf>,
        config: &serde_json::Value,
    ) -> Result<Self> {
        let mut services = IndexMap::new();
        let Some(service_map) = config.get("services").and_then(|s| s.as_object()) else {
            return Err(ConfigError::Validation {
                message: "compose config has no services".to_string(),
            }
            .into());
        };

        for (service_name, service_value) in service_map {
            let image = service_value
                .get("image")
                .and_then(|v| v.as_str())
                .map(String::from);
            let build = match service_value.get("build") {
                Some(serde_json::Value::String(context)) => Some(ComposeBuild {
                    context: Some(context.clone()),
                    ..Default::default()
                }),
                Some(value @ serde_json::Value::Object(_)) => Some(
                    serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse {
                        message: format!("service '{}' build: {}", service_name, e),
                    })?,
                ),
                _ => None,
            };
            services.insert(
                service_name.clone(),
                ComposeService {
                    name: service_name.clone(),
                    image,
                    build,
                },
            );
        }

        Ok(Self {
            name: name.into(),
            files,
            env_files,
            services,
        })
    }

    /// The devcontainer service named by the configuration.
    pub fn devcontainer_service(&self, config: &DevContainerConfig) -> Result<&ComposeService> {
        let service_name = config.service.as_deref().ok_or_else(|| {
            ConfigError::Validation {
                message: "compose configuration names no service".to_string(),
            }
        })?;
        self.services.get(service_name).ok_or_else(|| {
            ConfigError::Validation {
                message: format!(
                    "service '{}' not found in compose project (services: {})",
                    service_name,
                    self.services
                        .keys()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }
            .into()
        })
    }

    /// Services started by `up`: the devcontainer service plus `runServices`.
    pub fn up_services(&self, config: &DevContainerConfig) -> Vec<String> {
        let mut services = Vec::new();
        if let Some(primary) = &config.service {
            services.push(primary.clone());
        }
        for extra in &config.run_services {
            if !services.contains(extra) {
                services.push(extra.clone());
            }
        }
        services
    }
}

/// The user Dockerfile source for the devcontainer service: either its build
/// definition or a synthesized `FROM <image>`.
pub fn service_dockerfile(
    project_dir: &Path,
    service: &ComposeService,
) -> Result<(String, PathBuf)> {
    if let Some(build) = &service.build {
        let context = project_dir.join(build.context.as_deref().unwrap_or("."));
        let dockerfile = context.join(build.dockerfile.as_deref().unwrap_or("Dockerfile"));
        let content = std::fs::read_to_string(&dockerfile).map_err(|e| BuildError::Failed {
            message: format!("cannot read Dockerfile {}: {}", dockerfile.display(), e),
        })?;
        return Ok((content, context));
    }

    let image = service.image.as_deref().ok_or_else(|| ConfigError::Validation {
        message: format!("service '{}' has neither build nor image", service.name),
    })?;
    Ok((format!("FROM {}\n", image), project_dir.to_path_buf()))
}

/// Generate the build override: point the service at the extended Dockerfile.
pub fn generate_build_override(
    service_name: &str,
    context_dir: &Path,
    overlay_dockerfile: &Path,
    target: &str,
    build_args: &[(String, String)],
) -> String {
    let mut yaml = String::from("services:\n");
    yaml.push_str(&format!("  {}:\n", service_name));
    yaml.push_str("    build:\n");
    yaml.push_str(&format!("      context: {}\n", quote(&context_dir.display().to_string())));
    yaml.push_str(&format!(
        "      dockerfile: {}\n",
        quote(&overlay_dockerfile.display().to_string())
    ));
    yaml.push_str(&format!("      target: {}\n", quote(target)));
    if !build_args.is_empty() {
        yaml.push_str("      args:\n");
        for (key, value) in build_args {
            yaml.push_str(&format!("        {}: {}\n", key, quote(value)));
        }
    }
    yaml
}

/// Inputs for the runtime (up) override.
#[derive(Debug, Clone, Default)]
pub struct UpOverrideSpec {
    /// The devcontainer service name
    pub service: String,
    /// Workspace id recorded as a label and env entry
    pub workspace_id: String,
    /// The merged configuration driving env/caps/user/privileged
    pub merged: MergedDevContainerConfig,
    /// Features metadata label value
    pub metadata_label: Option<String>,
    /// Extra env entries injected by the CLI (KEY=VALUE)
    pub extra_env: Vec<String>,
    /// Attach the GPU device reservation
    pub request_gpu: bool,
}

/// Generate the up override: entrypoint wrapper, merged environment, init,
/// capabilities, security options, user, privileged, volumes, labels, GPU.
#[instrument(skip_all, fields(service = %spec.service))]
pub fn generate_up_override(spec: &UpOverrideSpec) -> Result<String> {
    let mut yaml = String::from("services:\n");
    yaml.push_str(&format!("  {}:\n", spec.service));

    yaml.push_str(&format!(
        "    entrypoint: [\"/bin/sh\", \"-c\", {}, \"-\"]\n",
        quote(&entrypoint_script(&spec.merged))
    ));
    if spec.merged.override_command.unwrap_or(true) {
        // The wrapper keeps the container alive itself; clear the image
        // command so compose does not append it.
        yaml.push_str("    command: []\n");
    }

    let mut env: IndexMap<String, String> = IndexMap::new();
    env.insert("GANTRY_WORKSPACE_ID".to_string(), spec.workspace_id.clone());
    for (key, value) in &spec.merged.container_env {
        env.insert(key.clone(), value.clone());
    }
    for entry in &spec.extra_env {
        if let Some((key, value)) = entry.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    yaml.push_str("    environment:\n");
    for (key, value) in &env {
        yaml.push_str(&format!("      {}: {}\n", key, quote(value)));
    }

    if let Some(user) = &spec.merged.container_user {
        yaml.push_str(&format!("    user: {}\n", quote(user)));
    }
    if spec.merged.init.unwrap_or(false) {
        yaml.push_str("    init: true\n");
    }
    if spec.merged.privileged.unwrap_or(false) {
        yaml.push_str("    privileged: true\n");
    }
    if !spec.merged.cap_add.is_empty() {
        yaml.push_str("    cap_add:\n");
        for cap in &spec.merged.cap_add {
            yaml.push_str(&format!("      - {}\n", quote(cap)));
        }
    }
    if !spec.merged.security_opt.is_empty() {
        yaml.push_str("    security_opt:\n");
        for opt in &spec.merged.security_opt {
            yaml.push_str(&format!("      - {}\n", quote(opt)));
        }
    }

    let volumes: Vec<String> = spec
        .merged
        .mounts
        .iter()
        .map(|value| Mount::from_value(value).map(|m| m.to_compose_volume()))
        .collect::<Result<_>>()?;
    if !volumes.is_empty() {
        yaml.push_str("    volumes:\n");
        for volume in &volumes {
            yaml.push_str(&format!("      - {}\n", quote(volume)));
        }
    }

    yaml.push_str("    labels:\n");
    yaml.push_str(&format!(
        "      {}: {}\n",
        crate::container::WORKSPACE_ID_LABEL,
        quote(&spec.workspace_id)
    ));
    if let Some(metadata) = &spec.metadata_label {
        yaml.push_str(&format!("      {}: {}\n", METADATA_LABEL, quote(metadata)));
    }

    if spec.request_gpu {
        yaml.push_str(
            "    deploy:\n      resources:\n        reservations:\n          devices:\n            - capabilities: [\"gpu\"]\n",
        );
    }

    Ok(yaml)
}

/// The `/bin/sh -c` wrapper: print the ready marker, install an
/// exit-on-SIGTERM trap, run the merged entrypoints in the background, then
/// hand over to the appended argv, or hold the container open when the
/// configuration overrides the command.
fn entrypoint_script(merged: &MergedDevContainerConfig) -> String {
    let mut script = format!("echo {};", READY_MARKER);
    script.push_str(" trap 'exit 0' TERM;");
    for entrypoint in &merged.entrypoints {
        script.push_str(&format!(" {} &", entrypoint));
    }
    if merged.override_command.unwrap_or(true) {
        script.push_str(" while sleep 1 & wait $$!; do :; done");
    } else {
        script.push_str(" exec \"$$@\"");
    }
    script
}

/// Write an override file into the workspace's `.docker-compose` folder as
/// `<prefix>-<nanos>.yml`, mode 0600.
#[instrument(skip(content))]
pub fn write_override_file(dir: &Path, prefix: &str, content: &str) -> Result<PathBuf> {
    crate::build::create_dir_restricted(dir)?;
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let path = dir.join(format!("{}-{}.yml", prefix, nanos));
    crate::build::write_file_restricted(&path, content.as_bytes())?;
    debug!(path = %path.display(), "wrote compose override");
    Ok(path)
}

/// Parse a `.env` file into key/value pairs; comments and blanks skipped.
pub fn parse_env_file(path: &Path) -> Result<IndexMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::from)?;
    let mut env = IndexMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            env.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(env)
}

/// Quote a scalar for the generated YAML. Always double-quoted; YAML special
/// characters escaped.
fn quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t");
    format!("\"{}\"", escaped)
}
