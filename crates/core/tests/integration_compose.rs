//! Compose path integration tests
//!
//! Verifies service selection, the exact `up` invocation for run-services,
//! and the generated override files.

use gantry_core::compose::{
    self, generate_up_override, ComposeProject, UpOverrideSpec, READY_MARKER,
};
use gantry_core::config::DevContainerConfig;
use gantry_core::driver::{ComposeCli, DockerCli};
use gantry_core::merge::MergedDevContainerConfig;
use std::path::PathBuf;
use tempfile::TempDir;

fn app_db_project() -> ComposeProject {
    ComposeProject::from_config_json(
        "gantry-ws1",
        vec![PathBuf::from("docker-compose.yml")],
        vec![],
        &serde_json::json!({
            "services": {
                "app": {"build": {"context": "."}},
                "db": {"image": "postgres:16"}
            }
        }),
    )
    .unwrap()
}

fn app_config() -> DevContainerConfig {
    DevContainerConfig {
        docker_compose_file: Some(serde_json::json!("docker-compose.yml")),
        service: Some("app".to_string()),
        run_services: vec!["db".to_string()],
        ..Default::default()
    }
}

#[test]
fn up_invocation_lists_primary_then_run_services_exactly() {
    let project = app_db_project();
    let config = app_config();
    let services = project.up_services(&config);

    let compose = ComposeCli::new(DockerCli::new(), "gantry-ws1")
        .with_files(vec![PathBuf::from("docker-compose.yml")]);
    let mut args: Vec<&str> = vec!["up", "-d", "--no-recreate"];
    for service in &services {
        args.push(service);
    }
    let plan = compose.plan(&args);

    let rendered = plan.join(" ");
    assert!(
        rendered.ends_with("up -d --no-recreate app db"),
        "unexpected plan: {}",
        rendered
    );
}

#[test]
fn up_override_carries_wrapper_and_workspace_label() {
    let mut merged = MergedDevContainerConfig::default();
    merged
        .entrypoints
        .push("/usr/local/share/feature-init.sh".to_string());

    let yaml = generate_up_override(&UpOverrideSpec {
        service: "app".to_string(),
        workspace_id: "ws1".to_string(),
        merged,
        metadata_label: Some(r#"[{"id":"foo"}]"#.to_string()),
        extra_env: vec![],
        request_gpu: false,
    })
    .unwrap();

    // The wrapper prints a marker, traps SIGTERM, runs merged entrypoints,
    // and the service carries the workspace id for discovery.
    assert!(yaml.contains(READY_MARKER));
    assert!(yaml.contains("trap 'exit 0' TERM"));
    assert!(yaml.contains("/usr/local/share/feature-init.sh &"));
    assert!(yaml.contains("GANTRY_WORKSPACE_ID: \"ws1\""));
    assert!(yaml.contains("dev.gantry.workspace.id: \"ws1\""));
    assert!(yaml.contains("devcontainer.metadata"));
}

#[test]
fn generated_files_land_in_workspace_compose_dir() {
    let dir = TempDir::new().unwrap();
    let overrides_dir = dir.path().join(".docker-compose");

    let build_path = compose::write_override_file(
        &overrides_dir,
        compose::BUILD_OVERRIDE_PREFIX,
        "services: {}\n",
    )
    .unwrap();
    let up_path = compose::write_override_file(
        &overrides_dir,
        compose::UP_OVERRIDE_PREFIX,
        "services: {}\n",
    )
    .unwrap();

    for (path, prefix) in [
        (&build_path, "docker-compose.devcontainer.build-"),
        (&up_path, "docker-compose.devcontainer.containerFeatures-"),
    ] {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(prefix), "{}", name);
        assert!(name.ends_with(".yml"));
        assert!(path.parent().unwrap().ends_with(".docker-compose"));
    }
}

#[test]
fn image_only_service_gets_synthesized_dockerfile() {
    let dir = TempDir::new().unwrap();
    let project = app_db_project();
    let (content, _context) =
        compose::service_dockerfile(dir.path(), &project.services["db"]).unwrap();
    assert_eq!(content, "FROM postgres:16\n");

    let named = gantry_core::dockerfile::ensure_final_stage_name(
        &content,
        "dev_container_user_stage",
    )
    .unwrap();
    assert!(named
        .content
        .contains("FROM postgres:16 AS dev_container_user_stage"));
}
