//! Feature build overlay generation
//!
//! Turns an ordered feature install plan into the artifacts the build paths
//! consume: a Dockerfile fragment appended after the user's final stage, a
//! staging folder holding each feature's install payload, the override
//! target name that becomes the new final stage, and the metadata label
//! serializing the chosen features on top of the base image metadata.

use crate::errors::{BuildError, Result};
use crate::features::ResolvedFeature;
use crate::merge::ConfigContribution;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Image label carrying the serialized configuration contributions.
pub const METADATA_LABEL: &str = "devcontainer.metadata";

/// Stage name the overlay appends; the build targets this stage.
pub const DEFAULT_OVERRIDE_TARGET: &str = "dev_container_feature_target";

/// In-container folder the feature payloads are copied into.
const FEATURES_INSTALL_ROOT: &str = "/tmp/dev-container-features";

/// Output of feature extension for one build.
#[derive(Debug, Clone)]
pub struct BuildOverlay {
    /// Dockerfile text to append after the user's final stage
    pub dockerfile_fragment: String,
    /// Host folder staged as the overlay build context addition
    pub staging_dir: PathBuf,
    /// Name of the new final stage
    pub override_target: String,
    /// Value for the [`METADATA_LABEL`] image label
    pub metadata_label: String,
}

/// Generates build overlays from resolved features.
#[derive(Debug)]
pub struct OverlayGenerator {
    override_target: String,
}

impl Default for OverlayGenerator {
    fn default() -> Self {
        Self {
            override_target: DEFAULT_OVERRIDE_TARGET.to_string(),
        }
    }
}

impl OverlayGenerator {
    /// Create a generator with a custom override target name.
    pub fn with_target(override_target: impl Into<String>) -> Self {
        Self {
            override_target: override_target.into(),
        }
    }

    /// Compose the overlay for `features` on top of `base_stage`.
    ///
    /// Stages each feature's payload under `staging_root`, emits one
    /// `COPY`+`RUN install.sh` block per feature in dependency order, and
    /// serializes the metadata label from the base metadata plus each
    /// feature's contribution. Staged directories are created 0750, staged
    /// files 0600, matching the other generated build inputs.
    #[instrument(skip_all, fields(features = features.len(), base_stage = base_stage))]
    pub fn generate(
        &self,
        base_stage: &str,
        features: &[ResolvedFeature],
        base_metadata: &[ConfigContribution],
        staging_root: &Path,
    ) -> Result<BuildOverlay> {
        let staging_dir = staging_root.join("features");
        create_dir_restricted(&staging_dir)?;

        let mut fragment = String::new();
        fragment.push_str(&format!(
            "\nFROM {} AS {}\nUSER root\n",
            base_stage, self.override_target
        ));

        for feature in features {
            let short = feature.reference.short_name();
            let staged = staging_dir.join(short);
            copy_payload(&feature.source_dir, &staged)?;

            let install_dir = format!("{}/{}", FEATURES_INSTALL_ROOT, short);
            fragment.push_str(&format!("COPY ./features/{} {}/\n", short, install_dir));

            for (key, value) in &feature.metadata.container_env {
                fragment.push_str(&format!("ENV {}={}\n", key, shell_quote(value)));
            }

            let mut run = format!("RUN cd {} && chmod +x ./install.sh && ", install_dir);
            for (name, value) in feature.option_env() {
                run.push_str(&format!("{}={} ", name, shell_quote(&value)));
            }
            run.push_str("./install.sh");
            fragment.push_str(&run);
            fragment.push('\n');

            debug!(feature = %feature.reference.id, "staged feature payload");
        }

        let metadata_label = serialize_metadata(base_metadata, features)?;
        fragment.push_str(&format!(
            "LABEL {}=\"{}\"\n",
            METADATA_LABEL,
            metadata_label.replace('\\', "\\\\").replace('"', "\\\"")
        ));

        // Hand the stage back to the configured user; the final USER of the
        // user's stages (or the merged containerUser) still wins at runtime.
        if let Some(user) = features.iter().rev().find_map(|f| f.metadata.container_user.clone()) {
            fragment.push_str(&format!("USER {}\n", user));
        }

        Ok(BuildOverlay {
            dockerfile_fragment: fragment,
            staging_dir,
            override_target: self.override_target.clone(),
            metadata_label,
        })
    }
}

/// Serialize base metadata plus feature contributions as the label payload.
fn serialize_metadata(
    base_metadata: &[ConfigContribution],
    features: &[ResolvedFeature],
) -> Result<String> {
    let mut entries: Vec<ConfigContribution> = base_metadata.to_vec();
    entries.extend(features.iter().map(|f| f.to_contribution()));
    serde_json::to_string(&entries).map_err(|e| {
        BuildError::Failed {
            message: format!("metadata label serialization failed: {}", e),
        }
        .into()
    })
}

/// Recursively copy a feature payload into the staging tree.
fn copy_payload(source: &Path, dest: &Path) -> Result<()> {
    create_dir_restricted(dest)?;
    for entry in std::fs::read_dir(source).map_err(BuildError::from)? {
        let entry = entry.map_err(BuildError::from)?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(BuildError::from)?;
        if file_type.is_dir() {
            copy_payload(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(BuildError::from)?;
            restrict_file(&target)?;
        }
    }
    Ok(())
}

fn create_dir_restricted(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(BuildError::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))
            .map_err(BuildError::from)?;
    }
    Ok(())
}

fn restrict_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(BuildError::from)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':'))
        && !value.is_empty()
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureMetadata, FeatureRef, OptionValue};
    use indexmap::IndexMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn feature_with_payload(dir: &Path, id: &str) -> ResolvedFeature {
        let source = dir.join("src").join(id);
        std::fs::create_dir_all(&source).unwrap();
        let mut install = std::fs::File::create(source.join("install.sh")).unwrap();
        install.write_all(b"#!/bin/sh\necho installing\n").unwrap();

        let mut options = IndexMap::new();
        options.insert("version".to_string(), OptionValue::Text("1.0".to_string()));

        ResolvedFeature {
            reference: FeatureRef::parse(&format!("{}@1.0", id)),
            metadata: FeatureMetadata {
                id: id.to_string(),
                ..Default::default()
            },
            options,
            source_dir: source,
        }
    }

    #[test]
    fn fragment_targets_override_stage() {
        let dir = TempDir::new().unwrap();
        let feature = feature_with_payload(dir.path(), "node");
        let overlay = OverlayGenerator::default()
            .generate("user_stage", &[feature], &[], dir.path())
            .unwrap();

        assert!(overlay
            .dockerfile_fragment
            .contains("FROM user_stage AS dev_container_feature_target"));
        assert!(overlay
            .dockerfile_fragment
            .contains("COPY ./features/node /tmp/dev-container-features/node/"));
        assert!(overlay.dockerfile_fragment.contains("VERSION=1.0 ./install.sh"));
        assert_eq!(overlay.override_target, "dev_container_feature_target");
        assert!(overlay.staging_dir.join("node").join("install.sh").exists());
    }

    #[test]
    fn metadata_label_lists_base_then_features() {
        let dir = TempDir::new().unwrap();
        let feature = feature_with_payload(dir.path(), "node");
        let base = vec![ConfigContribution {
            container_user: Some("baseuser".to_string()),
            ..Default::default()
        }];
        let overlay = OverlayGenerator::default()
            .generate("s", &[feature], &base, dir.path())
            .unwrap();

        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&overlay.metadata_label).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["containerUser"], "baseuser");
        assert_eq!(entries[1]["id"], "node");
        assert!(overlay
            .dockerfile_fragment
            .contains(&format!("LABEL {}=", METADATA_LABEL)));
    }

    #[test]
    fn feature_user_contribution_sets_stage_user() {
        let dir = TempDir::new().unwrap();
        let mut feature = feature_with_payload(dir.path(), "foo");
        feature.metadata.container_user = Some("devuser".to_string());
        let overlay = OverlayGenerator::default()
            .generate("s", &[feature], &[], dir.path())
            .unwrap();
        assert!(overlay.dockerfile_fragment.ends_with("USER devuser\n"));
    }
}
