//! Configuration merging
//!
//! Folds feature-contributed metadata onto the user configuration to produce
//! the effective [`MergedDevContainerConfig`]. Merge rules:
//!
//! - List fields (mounts, entrypoints, capAdd, securityOpt, forwardPorts)
//!   concatenate in the order base image metadata → features (dependency
//!   order) → user configuration.
//! - Scalar fields (containerUser, privileged, init, overrideCommand) are
//!   last-writer-wins; the user configuration is applied last and therefore
//!   always wins when it sets a value.
//! - Map fields (containerEnv, remoteEnv) merge by key with the user winning
//!   on conflicts.
//!
//! Lifecycle hooks accumulate per phase in the same order so every
//! contributor's hook runs.

use crate::config::DevContainerConfig;
use crate::errors::{ConfigError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// One contributor's slice of container configuration.
///
/// This is the entry shape of the `devcontainer.metadata` image label: an
/// array of these objects, one per contributor (base image, then features).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigContribution {
    /// Feature id, when the contributor is a feature
    pub id: Option<String>,
    /// User the container runs as
    pub container_user: Option<String>,
    /// User in-container commands run as
    pub remote_user: Option<String>,
    /// Run an init process
    pub init: Option<bool>,
    /// Run privileged
    pub privileged: Option<bool>,
    /// Replace the image command
    pub override_command: Option<bool>,
    /// Entrypoint script to run before the user entrypoint
    pub entrypoint: Option<String>,
    /// Mounts contributed by this entry
    pub mounts: Vec<serde_json::Value>,
    /// Capabilities to add
    pub cap_add: Vec<String>,
    /// Security options
    pub security_opt: Vec<String>,
    /// Forwarded ports
    pub forward_ports: Vec<serde_json::Value>,
    /// Environment set at create time
    pub container_env: IndexMap<String, String>,
    /// Environment for in-container processes
    pub remote_env: IndexMap<String, Option<String>>,
    /// Lifecycle hooks
    pub on_create_command: Option<serde_json::Value>,
    pub update_content_command: Option<serde_json::Value>,
    pub post_create_command: Option<serde_json::Value>,
    pub post_start_command: Option<serde_json::Value>,
    pub post_attach_command: Option<serde_json::Value>,
}

impl ConfigContribution {
    /// Project the mergeable fields of a user configuration into a
    /// contribution so it can be folded as the final writer.
    pub fn from_user_config(config: &DevContainerConfig) -> Self {
        Self {
            id: None,
            container_user: config.container_user.clone(),
            remote_user: config.remote_user.clone(),
            init: config.init,
            privileged: config.privileged,
            override_command: config.override_command,
            entrypoint: None,
            mounts: config.mounts.clone(),
            cap_add: config.cap_add.clone(),
            security_opt: config.security_opt.clone(),
            forward_ports: config.forward_ports.clone(),
            container_env: config.container_env.clone(),
            remote_env: config.remote_env.clone(),
            on_create_command: config.on_create_command.clone(),
            update_content_command: config.update_content_command.clone(),
            post_create_command: config.post_create_command.clone(),
            post_start_command: config.post_start_command.clone(),
            post_attach_command: config.post_attach_command.clone(),
        }
    }
}

/// The effective configuration after folding all contributors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergedDevContainerConfig {
    /// User the container runs as (last writer wins, user last)
    pub container_user: Option<String>,
    /// User in-container commands run as
    pub remote_user: Option<String>,
    /// Run an init process
    pub init: Option<bool>,
    /// Run privileged
    pub privileged: Option<bool>,
    /// Replace the image command
    pub override_command: Option<bool>,
    /// Entrypoint scripts in contribution order
    pub entrypoints: Vec<String>,
    /// Concatenated mounts in contribution order
    pub mounts: Vec<serde_json::Value>,
    /// Concatenated capabilities
    pub cap_add: Vec<String>,
    /// Concatenated security options
    pub security_opt: Vec<String>,
    /// Concatenated forwarded ports
    pub forward_ports: Vec<serde_json::Value>,
    /// Key-merged container environment (user wins)
    pub container_env: IndexMap<String, String>,
    /// Key-merged remote environment (user wins)
    pub remote_env: IndexMap<String, Option<String>>,
    /// Accumulated lifecycle hooks per phase, in contribution order
    pub on_create_commands: Vec<serde_json::Value>,
    pub update_content_commands: Vec<serde_json::Value>,
    pub post_create_commands: Vec<serde_json::Value>,
    pub post_start_commands: Vec<serde_json::Value>,
    pub post_attach_commands: Vec<serde_json::Value>,
}

impl MergedDevContainerConfig {
    fn apply(&mut self, contribution: &ConfigContribution) {
        if contribution.container_user.is_some() {
            self.container_user = contribution.container_user.clone();
        }
        if contribution.remote_user.is_some() {
            self.remote_user = contribution.remote_user.clone();
        }
        if contribution.init.is_some() {
            self.init = contribution.init;
        }
        if contribution.privileged.is_some() {
            self.privileged = contribution.privileged;
        }
        if contribution.override_command.is_some() {
            self.override_command = contribution.override_command;
        }
        if let Some(entrypoint) = &contribution.entrypoint {
            self.entrypoints.push(entrypoint.clone());
        }

        self.mounts.extend(contribution.mounts.iter().cloned());
        self.cap_add.extend(contribution.cap_add.iter().cloned());
        self.security_opt
            .extend(contribution.security_opt.iter().cloned());
        self.forward_ports
            .extend(contribution.forward_ports.iter().cloned());

        for (key, value) in &contribution.container_env {
            self.container_env.insert(key.clone(), value.clone());
        }
        for (key, value) in &contribution.remote_env {
            self.remote_env.insert(key.clone(), value.clone());
        }

        if let Some(cmd) = &contribution.on_create_command {
            self.on_create_commands.push(cmd.clone());
        }
        if let Some(cmd) = &contribution.update_content_command {
            self.update_content_commands.push(cmd.clone());
        }
        if let Some(cmd) = &contribution.post_create_command {
            self.post_create_commands.push(cmd.clone());
        }
        if let Some(cmd) = &contribution.post_start_command {
            self.post_start_commands.push(cmd.clone());
        }
        if let Some(cmd) = &contribution.post_attach_command {
            self.post_attach_commands.push(cmd.clone());
        }
    }
}

/// Fold contributors in order base image metadata → features (dependency
/// order) → user configuration.
#[instrument(skip_all, fields(base = base_metadata.len(), features = feature_contributions.len()))]
pub fn merge_configuration(
    base_metadata: &[ConfigContribution],
    feature_contributions: &[ConfigContribution],
    user_config: &DevContainerConfig,
) -> MergedDevContainerConfig {
    let mut merged = MergedDevContainerConfig::default();
    for contribution in base_metadata {
        merged.apply(contribution);
    }
    for contribution in feature_contributions {
        merged.apply(contribution);
    }
    merged.apply(&ConfigContribution::from_user_config(user_config));
    merged
}

/// Parse a `devcontainer.metadata` label value into contribution entries.
///
/// The label is either a JSON array of contribution objects or a single
/// object; both forms appear in published images.
pub fn parse_metadata_label(label: &str) -> Result<Vec<ConfigContribution>> {
    let value: serde_json::Value =
        serde_json::from_str(label).map_err(|e| ConfigError::Parse {
            message: format!("invalid devcontainer metadata label: {}", e),
        })?;

    let entries = match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        _ => {
            return Err(ConfigError::Parse {
                message: "devcontainer metadata label must be an object or array".to_string(),
            }
            .into())
        }
    };

    entries
        .into_iter()
        .map(|entry| {
            serde_json::from_value(entry).map_err(|e| {
                ConfigError::Parse {
                    message: format!("invalid metadata entry: {}", e),
                }
                .into()
            })
        })
        .collect()
}

/// Merge two user-level configurations (`--extra-devcontainer-path`):
/// lists concatenate base-then-extra, scalars and maps prefer the extra file.
pub fn merge_user_configs(
    base: &DevContainerConfig,
    extra: &DevContainerConfig,
) -> DevContainerConfig {
    let mut merged = base.clone();

    if extra.name.is_some() {
        merged.name = extra.name.clone();
    }
    if extra.image.is_some() {
        merged.image = extra.image.clone();
        merged.build = None;
        merged.docker_compose_file = None;
    }
    if extra.build.is_some() {
        merged.build = extra.build.clone();
        merged.image = None;
        merged.docker_compose_file = None;
    }
    if extra.docker_compose_file.is_some() {
        merged.docker_compose_file = extra.docker_compose_file.clone();
        merged.image = None;
        merged.build = None;
    }
    if extra.service.is_some() {
        merged.service = extra.service.clone();
    }
    if extra.container_user.is_some() {
        merged.container_user = extra.container_user.clone();
    }
    if extra.remote_user.is_some() {
        merged.remote_user = extra.remote_user.clone();
    }
    if extra.update_remote_user_uid.is_some() {
        merged.update_remote_user_uid = extra.update_remote_user_uid;
    }
    if extra.workspace_folder.is_some() {
        merged.workspace_folder = extra.workspace_folder.clone();
    }
    if extra.workspace_mount.is_some() {
        merged.workspace_mount = extra.workspace_mount.clone();
    }
    if extra.override_command.is_some() {
        merged.override_command = extra.override_command;
    }
    if extra.init.is_some() {
        merged.init = extra.init;
    }
    if extra.privileged.is_some() {
        merged.privileged = extra.privileged;
    }
    if extra.shutdown_action.is_some() {
        merged.shutdown_action = extra.shutdown_action.clone();
    }
    if extra.host_requirements.is_some() {
        merged.host_requirements = extra.host_requirements.clone();
    }
    if extra.app_port.is_some() {
        merged.app_port = extra.app_port.clone();
    }

    merged.run_services.extend(extra.run_services.iter().cloned());
    merged.mounts.extend(extra.mounts.iter().cloned());
    merged.cap_add.extend(extra.cap_add.iter().cloned());
    merged
        .security_opt
        .extend(extra.security_opt.iter().cloned());
    merged.run_args.extend(extra.run_args.iter().cloned());
    merged
        .forward_ports
        .extend(extra.forward_ports.iter().cloned());

    for (key, value) in &extra.features {
        merged.features.insert(key.clone(), value.clone());
    }
    for (key, value) in &extra.container_env {
        merged.container_env.insert(key.clone(), value.clone());
    }
    for (key, value) in &extra.remote_env {
        merged.remote_env.insert(key.clone(), value.clone());
    }

    for phase in [
        (&extra.on_create_command, &mut merged.on_create_command),
        (
            &extra.update_content_command,
            &mut merged.update_content_command,
        ),
        (&extra.post_create_command, &mut merged.post_create_command),
        (&extra.post_start_command, &mut merged.post_start_command),
        (&extra.post_attach_command, &mut merged.post_attach_command),
    ] {
        if phase.0.is_some() {
            *phase.1 = phase.0.clone();
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_contribution(id: &str, user: Option<&str>, cap: &str) -> ConfigContribution {
        ConfigContribution {
            id: Some(id.to_string()),
            container_user: user.map(String::from),
            cap_add: vec![cap.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn lists_concatenate_in_contribution_order() {
        let base = vec![ConfigContribution {
            cap_add: vec!["BASE_CAP".to_string()],
            ..Default::default()
        }];
        let features = vec![
            feature_contribution("a", None, "CAP_A"),
            feature_contribution("b", None, "CAP_B"),
        ];
        let user = DevContainerConfig {
            cap_add: vec!["USER_CAP".to_string()],
            ..Default::default()
        };

        let merged = merge_configuration(&base, &features, &user);
        assert_eq!(merged.cap_add, vec!["BASE_CAP", "CAP_A", "CAP_B", "USER_CAP"]);
    }

    #[test]
    fn user_scalar_wins_over_features() {
        let features = vec![feature_contribution("a", Some("featureuser"), "CAP_A")];
        let user = DevContainerConfig {
            container_user: Some("devuser".to_string()),
            ..Default::default()
        };
        let merged = merge_configuration(&[], &features, &user);
        assert_eq!(merged.container_user.as_deref(), Some("devuser"));
    }

    #[test]
    fn feature_scalar_applies_when_user_is_silent() {
        let features = vec![feature_contribution("a", Some("featureuser"), "CAP_A")];
        let user = DevContainerConfig::default();
        let merged = merge_configuration(&[], &features, &user);
        assert_eq!(merged.container_user.as_deref(), Some("featureuser"));
    }

    #[test]
    fn maps_merge_with_user_winning() {
        let mut feature = ConfigContribution::default();
        feature
            .container_env
            .insert("SHARED".to_string(), "feature".to_string());
        feature
            .container_env
            .insert("FEATURE_ONLY".to_string(), "yes".to_string());

        let mut user = DevContainerConfig::default();
        user.container_env
            .insert("SHARED".to_string(), "user".to_string());

        let merged = merge_configuration(&[], &[feature], &user);
        assert_eq!(merged.container_env.get("SHARED").unwrap(), "user");
        assert_eq!(merged.container_env.get("FEATURE_ONLY").unwrap(), "yes");
    }

    #[test]
    fn lifecycle_hooks_accumulate() {
        let mut feature = ConfigContribution::default();
        feature.post_create_command = Some(serde_json::json!("feature-setup.sh"));
        let mut user = DevContainerConfig::default();
        user.post_create_command = Some(serde_json::json!("npm install"));

        let merged = merge_configuration(&[], &[feature], &user);
        assert_eq!(
            merged.post_create_commands,
            vec![
                serde_json::json!("feature-setup.sh"),
                serde_json::json!("npm install")
            ]
        );
    }

    #[test]
    fn metadata_label_accepts_object_and_array() {
        let array = parse_metadata_label(r#"[{"id": "f1"}, {"containerUser": "dev"}]"#).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0].id.as_deref(), Some("f1"));

        let object = parse_metadata_label(r#"{"containerUser": "dev"}"#).unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object[0].container_user.as_deref(), Some("dev"));
    }

    #[test]
    fn merged_config_serde_round_trip() {
        let features = vec![ConfigContribution {
            id: Some("foo".to_string()),
            entrypoint: Some("/usr/local/share/foo-init.sh".to_string()),
            mounts: vec![serde_json::json!("type=volume,source=cache,target=/cache")],
            ..Default::default()
        }];
        let user = DevContainerConfig {
            container_user: Some("devuser".to_string()),
            forward_ports: vec![serde_json::json!(3000)],
            ..Default::default()
        };

        let merged = merge_configuration(&[], &features, &user);
        let json = serde_json::to_string(&merged).unwrap();
        let back: MergedDevContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(merged, back);
    }
}
