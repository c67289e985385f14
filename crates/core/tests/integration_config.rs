//! Integration tests for configuration loading, substitution, and merging
//!
//! Exercises the end-to-end path from a devcontainer.json on disk through
//! variable substitution and feature metadata merging.

use gantry_core::config::ConfigLoader;
use gantry_core::features::{resolve_features, DirectoryCatalog};
use gantry_core::merge::{merge_configuration, MergedDevContainerConfig};
use gantry_core::variable::{SubstitutionContext, SubstitutionReport};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn workspace_with_config(config: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join(".devcontainer").join("devcontainer.json");
    write(&config_path, config);
    (dir, config_path)
}

#[test]
fn loads_substitutes_and_round_trips() {
    let (dir, config_path) = workspace_with_config(
        r#"{
            // The development image.
            "image": "mcr.microsoft.com/devcontainers/base:ubuntu",
            "containerEnv": {
                "WORKSPACE": "${localWorkspaceFolder}",
                "ID": "${devcontainerId}"
            },
            "forwardPorts": [3000],
            "mounts": ["type=volume,source=deps,target=/deps"],
        }"#,
    );

    let config = ConfigLoader::load_from_path(&config_path).unwrap();
    let context = SubstitutionContext::new(dir.path(), &config_path)
        .unwrap()
        .with_container_workspace_folder("/workspaces/app");
    let mut report = SubstitutionReport::new();

    let substituted = ConfigLoader::substitute(&config, &context, &mut report).unwrap();
    assert_eq!(
        substituted.container_env.get("WORKSPACE").unwrap(),
        &context.local_workspace_folder
    );
    assert_eq!(
        substituted.container_env.get("ID").unwrap(),
        &context.devcontainer_id
    );

    // Substitution is idempotent on already-substituted configurations.
    let twice = ConfigLoader::substitute(&substituted, &context, &mut report).unwrap();
    assert_eq!(substituted, twice);

    // Merged configuration survives serialize → deserialize unchanged.
    let merged = merge_configuration(&[], &[], &substituted);
    let json = serde_json::to_string(&merged).unwrap();
    let back: MergedDevContainerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(merged, back);
}

#[test]
fn feature_metadata_merges_user_and_mounts() {
    // Scenario: a feature contributes USER devuser and a cache volume; the
    // merged configuration must carry both, with user config still winning
    // scalars it sets.
    let (dir, config_path) = workspace_with_config(
        r#"{
            "image": "alpine:3.18",
            "features": {"foo@1.0": {}}
        }"#,
    );
    write(
        &dir.path().join(".devcontainer/features/foo/devcontainer-feature.json"),
        r#"{
            "id": "foo",
            "version": "1.0.0",
            "containerUser": "devuser",
            "mounts": ["type=volume,source=cache,target=/cache"]
        }"#,
    );
    write(
        &dir.path().join(".devcontainer/features/foo/install.sh"),
        "#!/bin/sh\n",
    );

    let config = ConfigLoader::load_from_path(&config_path).unwrap();
    let catalog = DirectoryCatalog::new(dir.path().join(".devcontainer/features"));
    let features = resolve_features(&config.features, &catalog).unwrap();
    assert_eq!(features.len(), 1);

    let contributions: Vec<_> = features.iter().map(|f| f.to_contribution()).collect();
    let merged = merge_configuration(&[], &contributions, &config);
    assert_eq!(merged.container_user.as_deref(), Some("devuser"));
    assert_eq!(merged.mounts.len(), 1);
    assert!(merged.mounts[0]
        .as_str()
        .unwrap()
        .contains("source=cache"));
}

#[test]
fn user_config_wins_over_feature_user() {
    let (dir, config_path) = workspace_with_config(
        r#"{
            "image": "alpine:3.18",
            "containerUser": "explicit",
            "features": {"foo": {}}
        }"#,
    );
    write(
        &dir.path().join(".devcontainer/features/foo/devcontainer-feature.json"),
        r#"{"id": "foo", "containerUser": "featureuser"}"#,
    );

    let config = ConfigLoader::load_from_path(&config_path).unwrap();
    let catalog = DirectoryCatalog::new(dir.path().join(".devcontainer/features"));
    let features = resolve_features(&config.features, &catalog).unwrap();
    let contributions: Vec<_> = features.iter().map(|f| f.to_contribution()).collect();

    let merged = merge_configuration(&[], &contributions, &config);
    assert_eq!(merged.container_user.as_deref(), Some("explicit"));
}

#[test]
fn list_merge_order_is_base_features_user() {
    let (dir, config_path) = workspace_with_config(
        r#"{
            "image": "alpine:3.18",
            "capAdd": ["USER_CAP"],
            "features": {"a": {}, "b": {}}
        }"#,
    );
    write(
        &dir.path().join(".devcontainer/features/a/devcontainer-feature.json"),
        r#"{"id": "a", "capAdd": ["CAP_A"]}"#,
    );
    write(
        &dir.path().join(".devcontainer/features/b/devcontainer-feature.json"),
        r#"{"id": "b", "capAdd": ["CAP_B"], "installsAfter": ["a"]}"#,
    );

    let config = ConfigLoader::load_from_path(&config_path).unwrap();
    let catalog = DirectoryCatalog::new(dir.path().join(".devcontainer/features"));
    let features = resolve_features(&config.features, &catalog).unwrap();
    let contributions: Vec<_> = features.iter().map(|f| f.to_contribution()).collect();

    let base = vec![gantry_core::merge::ConfigContribution {
        cap_add: vec!["BASE_CAP".to_string()],
        ..Default::default()
    }];
    let merged = merge_configuration(&base, &contributions, &config);
    assert_eq!(merged.cap_add, vec!["BASE_CAP", "CAP_A", "CAP_B", "USER_CAP"]);
}
