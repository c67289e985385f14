//! Build planning
//!
//! Three build paths (local docker, remote BuildKit, compose) share one
//! contract: take the substituted configuration plus overrides and produce a
//! [`BuildInfo`], or a skip when a matching image already exists.
//!
//! The shared preparation step resolves features, extends the Dockerfile
//! with the feature overlay, stages the build inputs (files 0600,
//! directories 0750), and computes the prebuild hash that doubles as cache
//! key and image tag suffix.

use crate::config::DevContainerConfig;
use crate::container::ImageDetails;
use crate::dockerfile;
use crate::driver::DockerCli;
use crate::errors::{BuildError, ConfigError, Result};
use crate::features::{resolve_features, FeatureCatalog, ResolvedFeature};
use crate::merge::ConfigContribution;
use crate::overlay::{BuildOverlay, OverlayGenerator, METADATA_LABEL};
use crate::workspace::WorkspaceDescriptor;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub mod buildkit;

/// Default stage name applied when the user's final `FROM` has no `AS`.
pub const DEFAULT_FINAL_STAGE: &str = "dev_container_user_stage";

/// Output of a successful (or skipped) build.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// The image reference the run controller should start
    pub image_ref: String,
    /// Content-addressed identifier of the build inputs
    pub prebuild_hash: String,
    /// Resolved details of the built or reused image
    pub image_details: ImageDetails,
    /// Configuration contributions parsed from the image's metadata label
    pub metadata_config: Vec<ConfigContribution>,
    /// All tags applied to the image
    pub tags: Vec<String>,
    /// Registry cache reference used, when any
    pub registry_cache: Option<String>,
    /// True when an existing image satisfied the build
    pub skipped: bool,
}

/// Prepared inputs shared by every build path.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Extended Dockerfile content (user stages + feature overlay)
    pub dockerfile_content: String,
    /// Staged Dockerfile location
    pub dockerfile_path: PathBuf,
    /// Build context directory
    pub context_dir: PathBuf,
    /// Stage the build targets
    pub target: String,
    /// Build arguments, sorted by key
    pub build_args: Vec<(String, String)>,
    /// Labels applied to the image
    pub labels: Vec<(String, String)>,
    /// Content hash of all build inputs
    pub prebuild_hash: String,
    /// Image tags: the hash tag first, user tags after
    pub tags: Vec<String>,
    /// The feature overlay that was applied, when features are declared
    pub overlay: Option<BuildOverlay>,
    /// Features in install order
    pub features: Vec<ResolvedFeature>,
}

impl BuildPlan {
    /// The canonical image reference (first tag).
    pub fn image_ref(&self) -> &str {
        &self.tags[0]
    }
}

/// Compute the prebuild hash.
///
/// SHA-256 over length-prefixed sections: canonical Dockerfile bytes (after
/// feature extension), build args sorted by key, feature ids and options in
/// install order, the target architecture, and the base image digest. Equal
/// inputs hash equal; any single byte of any section changes the hash.
pub fn compute_prebuild_hash(
    dockerfile_content: &str,
    build_args: &[(String, String)],
    features: &[ResolvedFeature],
    architecture: &str,
    base_image_digest: &str,
) -> String {
    let mut hasher = Sha256::new();

    let mut section = |bytes: &[u8]| {
        let mut buf = (bytes.len() as u64).to_be_bytes().to_vec();
        buf.extend_from_slice(bytes);
        buf
    };

    hasher.update(section(dockerfile_content.as_bytes()));

    let mut sorted_args: Vec<&(String, String)> = build_args.iter().collect();
    sorted_args.sort();
    for (key, value) in sorted_args {
        hasher.update(section(key.as_bytes()));
        hasher.update(section(value.as_bytes()));
    }

    for feature in features {
        hasher.update(section(feature.reference.id.as_bytes()));
        if let Some(version) = &feature.reference.version {
            hasher.update(section(version.as_bytes()));
        }
        for (name, value) in &feature.options {
            hasher.update(section(name.as_bytes()));
            hasher.update(section(value.to_env_string().as_bytes()));
        }
    }

    hasher.update(section(architecture.as_bytes()));
    hasher.update(section(base_image_digest.as_bytes()));

    let digest = hasher.finalize();
    digest
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Prepare the shared build plan for a Dockerfile- or image-based
/// configuration.
///
/// The user's Dockerfile (or a synthesized `FROM <image>`) is stripped of
/// syntax directives, given a named final stage, and extended with the
/// feature overlay. All inputs are staged under `staging_dir`.
#[instrument(skip_all, fields(workspace_id = %descriptor.id))]
pub fn prepare_build_plan(
    config: &DevContainerConfig,
    descriptor: &WorkspaceDescriptor,
    catalog: &dyn FeatureCatalog,
    base_image_digest: &str,
    staging_dir: &Path,
) -> Result<BuildPlan> {
    let architecture = descriptor
        .target_architecture
        .as_deref()
        .unwrap_or("amd64");

    // Source Dockerfile: configured, overridden, or synthesized from image.
    let (user_dockerfile, context_dir) = load_user_dockerfile(config, descriptor)?;

    let cleaned = dockerfile::remove_syntax_directive(&user_dockerfile);
    let final_stage = dockerfile::ensure_final_stage_name(&cleaned, DEFAULT_FINAL_STAGE)?;

    let features = resolve_features(&config.features, catalog)?;

    let (content, target, overlay) = if features.is_empty() {
        (final_stage.content.clone(), final_stage.name.clone(), None)
    } else {
        let overlay = OverlayGenerator::default().generate(
            &final_stage.name,
            &features,
            &[],
            staging_dir,
        )?;
        let mut content = final_stage.content.clone();
        content.push_str(&overlay.dockerfile_fragment);
        let target = overlay.override_target.clone();
        (content, target, Some(overlay))
    };

    let mut build_args: Vec<(String, String)> = config
        .build
        .as_ref()
        .map(|b| {
            b.args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (key, value) in &descriptor.overrides.build_args {
        build_args.retain(|(k, _)| k != key);
        build_args.push((key.clone(), value.clone()));
    }
    build_args.sort();

    let prebuild_hash = compute_prebuild_hash(
        &content,
        &build_args,
        &features,
        architecture,
        base_image_digest,
    );

    let mut labels = vec![(
        crate::container::WORKSPACE_ID_LABEL.to_string(),
        descriptor.id.clone(),
    )];
    if let Some(overlay) = &overlay {
        labels.push((METADATA_LABEL.to_string(), overlay.metadata_label.clone()));
    }

    let mut tags = vec![format!("gantry:{}-{}", prebuild_hash, descriptor.id)];
    tags.extend(descriptor.overrides.tags.iter().cloned());

    // Stage the extended Dockerfile next to the overlay payloads.
    create_dir_restricted(staging_dir)?;
    let dockerfile_path = staging_dir.join("Dockerfile.extended");
    write_file_restricted(&dockerfile_path, content.as_bytes())?;

    debug!(
        prebuild_hash = %prebuild_hash,
        target = %target,
        features = features.len(),
        "prepared build plan"
    );

    Ok(BuildPlan {
        dockerfile_content: content,
        dockerfile_path,
        context_dir,
        target,
        build_args,
        labels,
        prebuild_hash,
        tags,
        overlay,
        features,
    })
}

/// Load the user's Dockerfile, or synthesize `FROM <image>` for image-based
/// configurations that still need feature extension.
fn load_user_dockerfile(
    config: &DevContainerConfig,
    descriptor: &WorkspaceDescriptor,
) -> Result<(String, PathBuf)> {
    let config_dir = config
        .config_dir()
        .map(Path::to_path_buf)
        .or_else(|| descriptor.local_folder().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    if let Some(image) = descriptor.overrides.image.as_ref().or(config.image.as_ref()) {
        return Ok((format!("FROM {}\n", image), config_dir));
    }

    let build = config.build.as_ref().ok_or_else(|| ConfigError::Validation {
        message: "configuration has neither image nor build".to_string(),
    })?;

    let dockerfile_rel = descriptor
        .overrides
        .dockerfile_path
        .clone()
        .or_else(|| build.dockerfile.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("Dockerfile"));
    let dockerfile_path = if dockerfile_rel.is_absolute() {
        dockerfile_rel
    } else {
        config_dir.join(dockerfile_rel)
    };

    let context_dir = match &build.context {
        Some(context) => {
            let context_path = PathBuf::from(context);
            if context_path.is_absolute() {
                context_path
            } else {
                config_dir.join(context_path)
            }
        }
        None => dockerfile_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(config_dir),
    };

    let content = std::fs::read_to_string(&dockerfile_path).map_err(|e| {
        BuildError::Failed {
            message: format!("cannot read Dockerfile {}: {}", dockerfile_path.display(), e),
        }
    })?;
    Ok((content, context_dir))
}

/// Execute the local docker build path.
///
/// When an image tagged with the prebuild hash already exists, the build is
/// skipped and the existing image's details are returned.
#[instrument(skip_all, fields(image = %plan.image_ref()))]
pub async fn local_build(docker: &DockerCli, plan: &BuildPlan) -> Result<BuildInfo> {
    if let Ok(existing) = docker.inspect_image(plan.image_ref()).await {
        info!(image = %plan.image_ref(), "matching image present, skipping build");
        return Ok(build_info_from_image(plan, existing, true, None));
    }

    let args = DockerCli::plan_build(
        &plan.dockerfile_path,
        &plan.context_dir,
        Some(&plan.target),
        &plan.build_args,
        &plan.labels,
        &plan.tags,
    );
    docker.execute(&args).await.map_err(|e| BuildError::Failed {
        message: e.to_string(),
    })?;

    let details = docker.inspect_image(plan.image_ref()).await?;
    info!(image = %plan.image_ref(), "image built");
    Ok(build_info_from_image(plan, details, false, None))
}

/// Assemble a [`BuildInfo`] from a plan and the resolved image.
pub fn build_info_from_image(
    plan: &BuildPlan,
    details: ImageDetails,
    skipped: bool,
    registry_cache: Option<String>,
) -> BuildInfo {
    let metadata_config = details
        .config
        .labels
        .get(METADATA_LABEL)
        .and_then(|label| crate::merge::parse_metadata_label(label).ok())
        .unwrap_or_default();

    BuildInfo {
        image_ref: plan.image_ref().to_string(),
        prebuild_hash: plan.prebuild_hash.clone(),
        image_details: details,
        metadata_config,
        tags: plan.tags.clone(),
        registry_cache,
        skipped,
    }
}

pub(crate) fn create_dir_restricted(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(BuildError::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))
            .map_err(BuildError::from)?;
    }
    Ok(())
}

pub(crate) fn write_file_restricted(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content).map_err(BuildError::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(BuildError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DirectoryCatalog;
    use crate::workspace::{DriverKind, WorkspaceSource};
    use std::io::Write;
    use tempfile::TempDir;

    fn descriptor(dir: &Path) -> WorkspaceDescriptor {
        WorkspaceDescriptor::new(
            WorkspaceSource::LocalFolder {
                path: dir.to_path_buf(),
            },
            DriverKind::Docker,
        )
    }

    fn empty_catalog(dir: &Path) -> DirectoryCatalog {
        DirectoryCatalog::new(dir.join("no-features"))
    }

    #[test]
    fn hash_is_stable_for_equal_inputs() {
        let args = vec![("A".to_string(), "1".to_string())];
        let a = compute_prebuild_hash("FROM alpine\n", &args, &[], "amd64", "sha256:base");
        let b = compute_prebuild_hash("FROM alpine\n", &args, &[], "amd64", "sha256:base");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_on_any_input_byte() {
        let args = vec![("A".to_string(), "1".to_string())];
        let base = compute_prebuild_hash("FROM alpine\n", &args, &[], "amd64", "sha256:base");

        assert_ne!(
            base,
            compute_prebuild_hash("FROM alpine \n", &args, &[], "amd64", "sha256:base")
        );
        assert_ne!(
            base,
            compute_prebuild_hash(
                "FROM alpine\n",
                &[("A".to_string(), "2".to_string())],
                &[],
                "amd64",
                "sha256:base"
            )
        );
        assert_ne!(
            base,
            compute_prebuild_hash("FROM alpine\n", &args, &[], "arm64", "sha256:base")
        );
        assert_ne!(
            base,
            compute_prebuild_hash("FROM alpine\n", &args, &[], "amd64", "sha256:other")
        );
    }

    #[test]
    fn hash_ignores_build_arg_order() {
        let forward = vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ];
        let reversed = vec![
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ];
        assert_eq!(
            compute_prebuild_hash("FROM alpine\n", &forward, &[], "amd64", "d"),
            compute_prebuild_hash("FROM alpine\n", &reversed, &[], "amd64", "d")
        );
    }

    #[test]
    fn plan_for_image_config_synthesizes_dockerfile() {
        let dir = TempDir::new().unwrap();
        let config = DevContainerConfig {
            image: Some("alpine:3.18".to_string()),
            ..Default::default()
        };
        let staging = dir.path().join("staging");
        let plan = prepare_build_plan(
            &config,
            &descriptor(dir.path()),
            &empty_catalog(dir.path()),
            "sha256:base",
            &staging,
        )
        .unwrap();

        assert!(plan.dockerfile_content.contains("FROM alpine:3.18 AS dev_container_user_stage"));
        assert_eq!(plan.target, DEFAULT_FINAL_STAGE);
        assert!(plan.overlay.is_none());
        assert!(plan.dockerfile_path.exists());
        assert_eq!(
            plan.tags[0],
            format!("gantry:{}-{}", plan.prebuild_hash, descriptor(dir.path()).id)
        );
    }

    #[test]
    fn plan_with_features_targets_overlay_stage() {
        let dir = TempDir::new().unwrap();
        // Feature catalog with one feature.
        let catalog_root = dir.path().join("catalog");
        let feature_dir = catalog_root.join("tool");
        std::fs::create_dir_all(&feature_dir).unwrap();
        std::fs::write(
            feature_dir.join("devcontainer-feature.json"),
            r#"{"id": "tool"}"#,
        )
        .unwrap();
        std::fs::write(feature_dir.join("install.sh"), "#!/bin/sh\n").unwrap();

        let mut config = DevContainerConfig {
            image: Some("alpine:3.18".to_string()),
            ..Default::default()
        };
        config
            .features
            .insert("tool".to_string(), serde_json::json!({}));

        let staging = dir.path().join("staging");
        let plan = prepare_build_plan(
            &config,
            &descriptor(dir.path()),
            &DirectoryCatalog::new(&catalog_root),
            "sha256:base",
            &staging,
        )
        .unwrap();

        assert_eq!(plan.target, "dev_container_feature_target");
        assert!(plan
            .labels
            .iter()
            .any(|(k, _)| k == crate::overlay::METADATA_LABEL));
        assert!(plan.overlay.is_some());
        assert_eq!(plan.features.len(), 1);
    }

    #[test]
    fn plan_reads_user_dockerfile() {
        let dir = TempDir::new().unwrap();
        let devcontainer_dir = dir.path().join(".devcontainer");
        std::fs::create_dir_all(&devcontainer_dir).unwrap();
        let mut df = std::fs::File::create(devcontainer_dir.join("Dockerfile")).unwrap();
        df.write_all(b"FROM ubuntu:22.04\nRUN true\n").unwrap();

        let mut config = DevContainerConfig {
            build: Some(crate::config::BuildSpec {
                dockerfile: Some("Dockerfile".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        config.config_path = Some(devcontainer_dir.join("devcontainer.json"));

        let staging = dir.path().join("staging");
        let plan = prepare_build_plan(
            &config,
            &descriptor(dir.path()),
            &empty_catalog(dir.path()),
            "",
            &staging,
        )
        .unwrap();
        assert!(plan
            .dockerfile_content
            .contains("FROM ubuntu:22.04 AS dev_container_user_stage"));
        assert_eq!(plan.context_dir, devcontainer_dir);
    }

    #[test]
    fn cli_build_args_override_config_args() {
        let dir = TempDir::new().unwrap();
        let mut config = DevContainerConfig {
            image: Some("alpine".to_string()),
            ..Default::default()
        };
        config.build = None;

        let mut desc = descriptor(dir.path());
        desc.overrides
            .build_args
            .insert("VERSION".to_string(), "2".to_string());

        let plan = prepare_build_plan(
            &config,
            &desc,
            &empty_catalog(dir.path()),
            "",
            &dir.path().join("staging"),
        )
        .unwrap();
        assert!(plan.build_args.contains(&("VERSION".to_string(), "2".to_string())));
    }
}
