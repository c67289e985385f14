//! Run controller
//!
//! Drives one workspace from configuration to a running, set-up container:
//!
//! ```text
//!         ┌──────── acquire lock ────────┐
//!         ▼                              │
//!    DISCOVER ──(found & running)──► USE_EXISTING ──► release lock
//!         ├──(not found)──► BUILD ──► START ──► SETUP
//!         ├──(found, stopped)──► START ──► SETUP
//!         └──(recreate)──► STOP+DELETE ──► BUILD ──► START ──► SETUP
//! ```
//!
//! The workspace file lock serializes mutating runs; it is released as soon
//! as a running container is confirmed so other clients can attach while
//! setup runs. Readers (`status`) never take the lock.

use crate::build::{self, BuildInfo};
use crate::compose::{self, UpOverrideSpec};
use crate::config::{ConfigLoader, DevContainerConfig};
use crate::container::{ContainerDetails, WORKSPACE_ID_LABEL};
use crate::driver::{ComposeCli, DockerCli, Driver, COMPOSE_CONFIG_FILES_LABEL};
use crate::errors::{ConfigError, DriverError, Result};
use crate::features::FeatureCatalog;
use crate::host_requirements::{self, GpuMode};
use crate::lock::WorkspaceLock;
use crate::merge::{merge_configuration, MergedDevContainerConfig};
use crate::mount::Mount;
use crate::setup::{ContainerWorkspaceInfo, Ide, SetupExecutor, SetupOptions};
use crate::variable::{SubstitutionContext, SubstitutionReport};
use crate::workspace::{
    RunResult, WorkspaceDescriptor, WorkspaceLayout, WorkspaceRecord,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long a mutating run waits for the workspace lock.
const LOCK_WAIT: Duration = Duration::from_secs(60);
/// Default workspace folder inside the container.
const DEFAULT_CONTAINER_WORKSPACE: &str = "/workspaces";

/// What the controller decided to do after discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// Container is running and matches; reuse it
    UseExisting,
    /// Container exists but is stopped; start it
    Start,
    /// No container; build and create one
    Build,
    /// Recreate requested; delete then build
    Recreate,
}

/// Pure discovery decision.
pub fn decide_action(existing: Option<&ContainerDetails>, recreate: bool) -> RunAction {
    match existing {
        Some(_) if recreate => RunAction::Recreate,
        Some(details) if details.status.is_running() => RunAction::UseExisting,
        Some(_) => RunAction::Start,
        None => RunAction::Build,
    }
}

/// Compose fast path: when every generated override file tracked by the
/// container's config-files label still exists, a plain `up -d` suffices.
/// Any missing generated file forces a full rebuild.
pub fn compose_fast_path_available(labels: &HashMap<String, String>) -> bool {
    let Some(config_files) = labels.get(COMPOSE_CONFIG_FILES_LABEL) else {
        return false;
    };
    let generated: Vec<&str> = config_files
        .split(',')
        .filter(|file| {
            let name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.starts_with(compose::BUILD_OVERRIDE_PREFIX)
                || name.starts_with(compose::UP_OVERRIDE_PREFIX)
        })
        .collect();
    if generated.is_empty() {
        return false;
    }
    generated.iter().all(|file| Path::new(file).exists())
}

/// Options for one `up` run.
pub struct RunOptions {
    pub gpu_mode: GpuMode,
    pub setup: SetupOptions,
    pub ide: Option<Ide>,
    pub daemon_inactivity_timeout: Option<Duration>,
    /// Skip the setup phase entirely (build-only invocations)
    pub skip_setup: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            gpu_mode: GpuMode::Detect,
            setup: SetupOptions::default(),
            ide: None,
            daemon_inactivity_timeout: None,
            skip_setup: false,
        }
    }
}

/// Workspace status for readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceStatus {
    NotFound,
    Stopped { container_id: String },
    Running { container_id: String },
}

/// The run controller, bound to one driver and layout.
pub struct RunController<'a> {
    layout: &'a WorkspaceLayout,
    driver: &'a Driver,
    catalog: &'a dyn FeatureCatalog,
}

impl<'a> RunController<'a> {
    pub fn new(
        layout: &'a WorkspaceLayout,
        driver: &'a Driver,
        catalog: &'a dyn FeatureCatalog,
    ) -> Self {
        Self {
            layout,
            driver,
            catalog,
        }
    }

    /// Locate the devcontainer configuration for a workspace folder.
    pub fn find_config_path(workspace: &Path) -> Result<PathBuf> {
        let candidates = [
            workspace.join(".devcontainer").join("devcontainer.json"),
            workspace.join(".devcontainer.json"),
            workspace.join(".devcontainer").join("devcontainer.jsonc"),
        ];
        candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .ok_or_else(|| {
                ConfigError::NotFound {
                    path: candidates[0].display().to_string(),
                }
                .into()
            })
    }

    /// Read-only status; never takes the lock.
    #[instrument(skip(self), fields(workspace_id = %descriptor.id))]
    pub async fn status(&self, descriptor: &WorkspaceDescriptor) -> Result<WorkspaceStatus> {
        match self.find_existing(descriptor).await? {
            Some(details) if details.status.is_running() => Ok(WorkspaceStatus::Running {
                container_id: details.id,
            }),
            Some(details) => Ok(WorkspaceStatus::Stopped {
                container_id: details.id,
            }),
            None => Ok(WorkspaceStatus::NotFound),
        }
    }

    /// The full `up` flow.
    #[instrument(skip_all, fields(workspace_id = %descriptor.id))]
    pub async fn up(
        &self,
        descriptor: &WorkspaceDescriptor,
        config_path: &Path,
        options: &RunOptions,
        root: CancellationToken,
    ) -> Result<RunResult> {
        let raw_config = ConfigLoader::load_from_path(config_path)?;

        let workspace_folder = descriptor
            .local_folder()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let container_workspace = format!(
            "{}/{}",
            DEFAULT_CONTAINER_WORKSPACE,
            workspace_folder
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| descriptor.id.clone())
        );

        let context = SubstitutionContext::new(&workspace_folder, config_path)?
            .with_container_workspace_folder(
                raw_config
                    .workspace_folder
                    .clone()
                    .unwrap_or(container_workspace),
            )
            .with_init_env(descriptor.overrides.init_env.clone());

        let mut report = SubstitutionReport::new();
        let config = ConfigLoader::substitute(&raw_config, &context, &mut report)?;

        let capability = host_requirements::evaluate(
            config.host_requirements.as_ref(),
            options.gpu_mode,
            Some(&workspace_folder),
        )?;

        // Mutating phase, under the workspace lock.
        let lock = WorkspaceLock::acquire(
            self.layout.lock_path(&descriptor.id),
            descriptor.id.clone(),
            LOCK_WAIT,
        )
        .await?;

        let existing = self.find_existing(descriptor).await?;
        let action = decide_action(existing.as_ref(), descriptor.overrides.recreate);
        info!(action = ?action, "discovery complete");

        if action == RunAction::Recreate {
            if let Some(details) = &existing {
                if descriptor.overrides.reset {
                    self.wipe_workspace_content(descriptor)?;
                }
                self.driver.stop_container(&details.id).await.ok();
                self.driver.delete_container(&details.id).await?;
            }
        }

        let (details, build_info) = match action {
            RunAction::UseExisting => (existing.expect("UseExisting implies a container"), None),
            RunAction::Start => {
                // Compose restarts go through the fast path (or a full
                // rebuild when a generated override file is gone).
                if config.is_compose() {
                    self.build_and_start(descriptor, &config, capability.request_gpu)
                        .await?
                } else {
                    let details = existing.expect("Start implies a container");
                    self.driver.start_container(&details.id).await?;
                    let refreshed = self
                        .driver
                        .find_container(&details.id)
                        .await?
                        .ok_or_else(|| DriverError::ContainerNotFound {
                            id: details.id.clone(),
                        })?;
                    (refreshed, None)
                }
            }
            RunAction::Build | RunAction::Recreate => {
                self.build_and_start(descriptor, &config, capability.request_gpu)
                    .await?
            }
        };

        // A running container is confirmed; release so others can attach.
        drop(lock);

        let merged = self.merge_for_container(&config, &details, build_info.as_ref());
        let mut context = context;
        context.container_env = details.config.env_map();

        let scaffold = RunResult {
            config: config.clone(),
            merged_config: merged.clone(),
            substitution_context: context.clone(),
            container: details.clone(),
            workspace_folder: context.container_workspace_folder.clone(),
            remote_user: merged
                .remote_user
                .clone()
                .or_else(|| merged.container_user.clone())
                .unwrap_or_else(|| {
                    let user = details.config.user.clone();
                    if user.is_empty() {
                        "root".to_string()
                    } else {
                        user
                    }
                }),
            finished_at: chrono::Utc::now(),
        };

        let result = if options.skip_setup {
            scaffold
        } else {
            self.run_setup_phase(descriptor, &scaffold, &merged, options, root)
                .await?
        };

        self.layout.write_workspace(&WorkspaceRecord {
            descriptor: descriptor.clone(),
            last_container_id: Some(result.container.id.clone()),
            updated_at: Some(chrono::Utc::now()),
        })?;
        self.layout.write_result(&descriptor.id, &result)?;

        Ok(result)
    }

    /// Stop the workspace's container.
    #[instrument(skip(self), fields(workspace_id = %descriptor.id))]
    pub async fn stop(&self, descriptor: &WorkspaceDescriptor) -> Result<()> {
        let _lock = WorkspaceLock::acquire(
            self.layout.lock_path(&descriptor.id),
            descriptor.id.clone(),
            LOCK_WAIT,
        )
        .await?;

        match self.find_existing(descriptor).await? {
            Some(details) => self.driver.stop_container(&details.id).await,
            None => Err(DriverError::ContainerNotFound {
                id: descriptor.id.clone(),
            }
            .into()),
        }
    }

    /// Delete the workspace's container and persisted state.
    #[instrument(skip(self), fields(workspace_id = %descriptor.id))]
    pub async fn delete(&self, descriptor: &WorkspaceDescriptor) -> Result<()> {
        let _lock = WorkspaceLock::acquire(
            self.layout.lock_path(&descriptor.id),
            descriptor.id.clone(),
            LOCK_WAIT,
        )
        .await?;

        if let Some(details) = self.find_existing(descriptor).await? {
            self.driver.stop_container(&details.id).await.ok();
            self.driver.delete_container(&details.id).await?;
        }
        self.layout.delete_workspace(&descriptor.id)
    }

    /// Containers created by this engine carry the workspace id label on
    /// every driver, compose included (the up override sets it).
    async fn find_existing(
        &self,
        descriptor: &WorkspaceDescriptor,
    ) -> Result<Option<ContainerDetails>> {
        self.driver
            .docker()
            .find_workspace_container(&descriptor.id)
            .await
    }

    async fn build_and_start(
        &self,
        descriptor: &WorkspaceDescriptor,
        config: &DevContainerConfig,
        request_gpu: bool,
    ) -> Result<(ContainerDetails, Option<BuildInfo>)> {
        // Temporary staging for overlays; removed when this guard drops,
        // including on the error path.
        let staging = tempfile::TempDir::new().map_err(crate::errors::BuildError::from)?;

        if config.is_compose() {
            return self
                .compose_build_and_up(descriptor, config, request_gpu, staging.path())
                .await;
        }

        let docker = self.driver.docker();

        // Image-only configurations with no features run the image as-is.
        let direct_image = (config.build.is_none() && config.features.is_empty())
            .then(|| descriptor.overrides.image.clone().or_else(|| config.image.clone()))
            .flatten();

        let (image_ref, info, merged) = if let Some(image) = direct_image {
            debug!(image = %image, "image-only configuration, no build needed");
            let base_metadata = match docker.inspect_image(&image).await {
                Ok(details) => details
                    .config
                    .labels
                    .get(crate::overlay::METADATA_LABEL)
                    .and_then(|label| crate::merge::parse_metadata_label(label).ok())
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            let merged = merge_configuration(&base_metadata, &[], config);
            (image, None, merged)
        } else {
            let base_digest = match descriptor.overrides.image.as_ref().or(config.image.as_ref())
            {
                Some(image) => docker
                    .inspect_image(image)
                    .await
                    .map(|details| details.id)
                    .unwrap_or_default(),
                None => String::new(),
            };

            let plan = build::prepare_build_plan(
                config,
                descriptor,
                self.catalog,
                &base_digest,
                staging.path(),
            )?;
            let info = build::local_build(docker, &plan).await?;

            let merged = merge_configuration(
                &info.metadata_config,
                &plan
                    .features
                    .iter()
                    .map(|f| f.to_contribution())
                    .collect::<Vec<_>>(),
                config,
            );
            (info.image_ref.clone(), Some(info), merged)
        };

        let mut labels = HashMap::new();
        labels.insert(WORKSPACE_ID_LABEL.to_string(), descriptor.id.clone());

        let mut env: HashMap<String, String> = merged
            .container_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for entry in &descriptor.overrides.env {
            if let Some((key, value)) = entry.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }

        let mut mounts = Vec::new();
        if let Some(local) = descriptor.local_folder() {
            let workspace_mount = config.workspace_mount.clone().unwrap_or_else(|| {
                format!(
                    "type=bind,source={},target={}/{}",
                    local.display(),
                    DEFAULT_CONTAINER_WORKSPACE,
                    local
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| descriptor.id.clone())
                )
            });
            mounts.push(workspace_mount);
        }
        for value in &merged.mounts {
            mounts.push(Mount::from_value(value)?.to_docker_arg());
        }

        let mut extra_args: Vec<String> = config.run_args.clone();
        if merged.init.unwrap_or(false) {
            extra_args.push("--init".to_string());
        }
        if merged.privileged.unwrap_or(false) {
            extra_args.push("--privileged".to_string());
        }
        for cap in &merged.cap_add {
            extra_args.push("--cap-add".to_string());
            extra_args.push(cap.clone());
        }
        for opt in &merged.security_opt {
            extra_args.push("--security-opt".to_string());
            extra_args.push(opt.clone());
        }
        if request_gpu {
            extra_args.push("--gpus".to_string());
            extra_args.push("all".to_string());
        }
        for port in config.app_port_specs() {
            extra_args.push("-p".to_string());
            extra_args.push(port);
        }

        // Hold the container open; the agent attaches via exec.
        let entrypoint: Vec<String> = if merged.override_command.unwrap_or(true) {
            ["/bin/sh", "-c", "while sleep 1; do :; done"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };

        let plan_args = DockerCli::plan_run(
            &image_ref,
            &format!("gantry-{}", descriptor.id),
            &labels,
            &env,
            &mounts,
            merged.container_user.as_deref(),
            (!entrypoint.is_empty()).then_some(entrypoint.as_slice()),
            &extra_args,
        );
        let container_id = docker.run_container(&plan_args).await?;

        let details = docker
            .find_container(&container_id)
            .await?
            .ok_or_else(|| DriverError::ContainerNotFound {
                id: container_id.clone(),
            })?;
        Ok((details, info))
    }

    async fn compose_build_and_up(
        &self,
        descriptor: &WorkspaceDescriptor,
        config: &DevContainerConfig,
        request_gpu: bool,
        staging: &Path,
    ) -> Result<(ContainerDetails, Option<BuildInfo>)> {
        let Driver::Compose { docker, compose: compose_cli } = self.driver else {
            return Err(ConfigError::Validation {
                message: "compose configuration requires the compose driver".to_string(),
            }
            .into());
        };

        let service_name = config.service.clone().ok_or_else(|| ConfigError::Validation {
            message: "compose configuration names no service".to_string(),
        })?;

        // Fast path: all generated override files still on disk.
        if !descriptor.overrides.recreate {
            if let Ok(Some(details)) = compose_cli
                .find_dev_container(compose_cli.project_name(), &service_name)
                .await
            {
                if compose_fast_path_available(&details.labels) {
                    info!("compose override files intact, fast-path up");
                    let services = vec!["up", "-d", "--no-recreate"];
                    compose_cli.run(&services).await?;
                    let refreshed = compose_cli
                        .find_dev_container(compose_cli.project_name(), &service_name)
                        .await?
                        .ok_or_else(|| DriverError::ContainerNotFound {
                            id: service_name.clone(),
                        })?;
                    return Ok((refreshed, None));
                }
                debug!("generated override files missing, full rebuild");
            }
        }

        let project_dir = config
            .config_dir()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .or_else(|| descriptor.local_folder().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let config_json = {
            let stdout = compose_cli.run(&["config", "--format", "json"]).await?;
            serde_json::from_str(&stdout).map_err(|e| DriverError::UnexpectedOutput {
                message: format!("compose config output: {}", e),
            })?
        };
        let project = compose::ComposeProject::from_config_json(
            compose_cli.project_name(),
            compose_cli.files().to_vec(),
            Vec::new(),
            &config_json,
        )?;
        let service = project.devcontainer_service(config)?;

        // Feature-extend the service's Dockerfile (or a synthesized one).
        let (user_dockerfile, context_dir) = compose::service_dockerfile(&project_dir, service)?;
        let cleaned = crate::dockerfile::remove_syntax_directive(&user_dockerfile);
        let final_stage =
            crate::dockerfile::ensure_final_stage_name(&cleaned, build::DEFAULT_FINAL_STAGE)?;
        let features = crate::features::resolve_features(&config.features, self.catalog)?;

        let overrides_dir = self.layout.compose_overrides_dir(&descriptor.id);
        let (extended, target, metadata_label, feature_contributions) = if features.is_empty() {
            (final_stage.content.clone(), final_stage.name.clone(), None, Vec::new())
        } else {
            let overlay = crate::overlay::OverlayGenerator::default().generate(
                &final_stage.name,
                &features,
                &[],
                staging,
            )?;
            let mut content = final_stage.content.clone();
            content.push_str(&overlay.dockerfile_fragment);
            let contributions: Vec<_> = features.iter().map(|f| f.to_contribution()).collect();
            (
                content,
                overlay.override_target.clone(),
                Some(overlay.metadata_label.clone()),
                contributions,
            )
        };

        let overlay_dockerfile = overrides_dir.join("Dockerfile.extended");
        build::create_dir_restricted(&overrides_dir)?;
        build::write_file_restricted(&overlay_dockerfile, extended.as_bytes())?;

        let build_args: Vec<(String, String)> = service
            .build
            .as_ref()
            .map(|b| b.args.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let build_override = compose::generate_build_override(
            &service_name,
            &context_dir,
            &overlay_dockerfile,
            &target,
            &build_args,
        );
        let build_override_path = compose::write_override_file(
            &overrides_dir,
            compose::BUILD_OVERRIDE_PREFIX,
            &build_override,
        )?;

        let merged = merge_configuration(&[], &feature_contributions, config);
        let up_override = compose::generate_up_override(&UpOverrideSpec {
            service: service_name.clone(),
            workspace_id: descriptor.id.clone(),
            merged,
            metadata_label,
            extra_env: descriptor.overrides.env.clone(),
            request_gpu,
        })?;
        let up_override_path =
            compose::write_override_file(&overrides_dir, compose::UP_OVERRIDE_PREFIX, &up_override)?;

        // Layer the generated files over the user's stack for build and up.
        let mut files = compose_cli.files().to_vec();
        files.push(build_override_path);
        files.push(up_override_path);
        let layered = ComposeCli::new(docker.clone(), compose_cli.project_name())
            .with_files(files);

        layered.run(&["build", service_name.as_str()]).await?;

        let up_services = project.up_services(config);
        let mut up_args: Vec<&str> = vec!["up", "-d"];
        if !descriptor.overrides.recreate {
            up_args.push("--no-recreate");
        }
        for service in &up_services {
            up_args.push(service);
        }
        layered.run(&up_args).await?;

        let details = layered
            .find_dev_container(compose_cli.project_name(), &service_name)
            .await?
            .ok_or_else(|| DriverError::ContainerNotFound {
                id: service_name.clone(),
            })?;
        Ok((details, None))
    }

    /// Fold image metadata and feature contributions for the final merged
    /// configuration of this container.
    fn merge_for_container(
        &self,
        config: &DevContainerConfig,
        details: &ContainerDetails,
        build_info: Option<&BuildInfo>,
    ) -> MergedDevContainerConfig {
        let base_metadata = details
            .labels
            .get(crate::overlay::METADATA_LABEL)
            .and_then(|label| crate::merge::parse_metadata_label(label).ok())
            .or_else(|| build_info.map(|info| info.metadata_config.clone()))
            .unwrap_or_default();
        merge_configuration(&base_metadata, &[], config)
    }

    async fn run_setup_phase(
        &self,
        descriptor: &WorkspaceDescriptor,
        scaffold: &RunResult,
        merged: &MergedDevContainerConfig,
        options: &RunOptions,
        root: CancellationToken,
    ) -> Result<RunResult> {
        let docker = self.driver.docker();

        // Align the remote user's uid/gid with the host user on
        // shared-filesystem drivers so bind-mounted files stay writable.
        if scaffold.config.update_remote_user_uid.unwrap_or(false)
            && self.driver.has_shared_filesystem()
        {
            if let (Some(uid), Some(gid)) = (host_id("-u").await, host_id("-g").await) {
                if let Err(e) = docker
                    .update_container_user_uid(
                        &scaffold.container.id,
                        &scaffold.remote_user,
                        uid,
                        gid,
                    )
                    .await
                {
                    warn!(error = %e, "user uid/gid alignment failed, continuing");
                }
            }
        }

        let executor = SetupExecutor::new(docker, options.setup.clone());
        executor.inject_agent(&scaffold.container.id).await?;

        let forward_ports: Vec<u16> = merged
            .forward_ports
            .iter()
            .filter_map(|value| match value {
                serde_json::Value::Number(n) => n.as_u64().map(|p| p as u16),
                serde_json::Value::String(s) => {
                    s.rsplit(':').next().and_then(|p| p.parse().ok())
                }
                _ => None,
            })
            .collect();

        let info = ContainerWorkspaceInfo {
            workspace_id: descriptor.id.clone(),
            cli_options: descriptor.overrides.clone(),
            content_folder: scaffold.workspace_folder.clone(),
            ide: options.ide,
            pull_inside_container: matches!(
                descriptor.source,
                crate::workspace::WorkspaceSource::GitRepository { .. }
            ),
            daemon_inactivity_timeout_secs: options
                .daemon_inactivity_timeout
                .map(|d| d.as_secs()),
            forward_ports,
            shared_filesystem: self.driver.has_shared_filesystem(),
        };

        let result = executor
            .run_setup(
                &scaffold.container.id,
                Some(&scaffold.remote_user),
                scaffold,
                &info,
                root,
            )
            .await?;

        self.run_lifecycle_hooks(&result, options.setup.exec_timeout)
            .await?;
        Ok(result)
    }

    /// Run the merged lifecycle hooks inside the container, contribution
    /// order preserved. Each exec is bounded by the configured deadline.
    async fn run_lifecycle_hooks(
        &self,
        result: &RunResult,
        exec_timeout: Duration,
    ) -> Result<()> {
        let docker = self.driver.docker();
        for phase in [
            &result.merged_config.on_create_commands,
            &result.merged_config.post_create_commands,
            &result.merged_config.post_start_commands,
            &result.merged_config.post_attach_commands,
        ] {
            for command in phase {
                for argv in lifecycle_command_argv(command)? {
                    debug!(command = ?argv, "running lifecycle hook");
                    let exec = docker.command_container(
                        &result.container.id,
                        Some(&result.remote_user),
                        &argv,
                    );
                    tokio::time::timeout(exec_timeout, exec)
                        .await
                        .map_err(|_| crate::errors::TunnelError::DeadlineExceeded {
                            operation: format!("lifecycle hook {:?}", argv.first()),
                        })??;
                }
            }
        }
        Ok(())
    }

    fn wipe_workspace_content(&self, descriptor: &WorkspaceDescriptor) -> Result<()> {
        if let Some(folder) = descriptor.local_folder() {
            warn!(folder = %folder.display(), "reset requested, wiping workspace content");
            for entry in std::fs::read_dir(folder)? {
                let entry = entry?;
                let path = entry.path();
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}

/// The host user's uid or gid via `id` (`-u` / `-g`).
async fn host_id(flag: &str) -> Option<u32> {
    let output = tokio::process::Command::new("id")
        .arg(flag)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Expand a lifecycle command specification into argv lists: a string runs
/// through the shell, an array is a literal argv, an object runs each value.
pub fn lifecycle_command_argv(command: &serde_json::Value) -> Result<Vec<Vec<String>>> {
    match command {
        serde_json::Value::String(script) => Ok(vec![vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.clone(),
        ]]),
        serde_json::Value::Array(items) => {
            let argv: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect();
            if argv.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![argv])
            }
        }
        serde_json::Value::Object(named) => {
            let mut commands = Vec::new();
            for value in named.values() {
                commands.extend(lifecycle_command_argv(value)?);
            }
            Ok(commands)
        }
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(ConfigError::Validation {
            message: format!("unsupported lifecycle command: {}", other),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ContainerStatus};

    fn details(status: ContainerStatus) -> ContainerDetails {
        ContainerDetails {
            id: "abc".to_string(),
            status,
            labels: HashMap::new(),
            config: ContainerConfig::default(),
            mounts: Vec::new(),
        }
    }

    #[test]
    fn discovery_decisions() {
        assert_eq!(decide_action(None, false), RunAction::Build);
        assert_eq!(
            decide_action(Some(&details(ContainerStatus::Running)), false),
            RunAction::UseExisting
        );
        assert_eq!(
            decide_action(Some(&details(ContainerStatus::Exited)), false),
            RunAction::Start
        );
        assert_eq!(
            decide_action(Some(&details(ContainerStatus::Running)), true),
            RunAction::Recreate
        );
    }

    #[test]
    fn fast_path_requires_all_generated_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let build_file = dir.path().join(format!(
            "{}-123.yml",
            crate::compose::BUILD_OVERRIDE_PREFIX
        ));
        let up_file = dir.path().join(format!(
            "{}-124.yml",
            crate::compose::UP_OVERRIDE_PREFIX
        ));
        std::fs::write(&build_file, "services: {}\n").unwrap();
        std::fs::write(&up_file, "services: {}\n").unwrap();

        let mut labels = HashMap::new();
        labels.insert(
            COMPOSE_CONFIG_FILES_LABEL.to_string(),
            format!(
                "/tmp/docker-compose.yml,{},{}",
                build_file.display(),
                up_file.display()
            ),
        );
        assert!(compose_fast_path_available(&labels));

        // Any missing generated file forces a rebuild.
        std::fs::remove_file(&up_file).unwrap();
        assert!(!compose_fast_path_available(&labels));
    }

    #[test]
    fn fast_path_needs_generated_files_in_label() {
        let mut labels = HashMap::new();
        labels.insert(
            COMPOSE_CONFIG_FILES_LABEL.to_string(),
            "/tmp/docker-compose.yml".to_string(),
        );
        assert!(!compose_fast_path_available(&labels));
        assert!(!compose_fast_path_available(&HashMap::new()));
    }

    #[test]
    fn lifecycle_string_runs_through_shell() {
        let argv = lifecycle_command_argv(&serde_json::json!("npm install")).unwrap();
        assert_eq!(
            argv,
            vec![vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "npm install".to_string()
            ]]
        );
    }

    #[test]
    fn lifecycle_array_is_literal_argv() {
        let argv =
            lifecycle_command_argv(&serde_json::json!(["npm", "run", "build"])).unwrap();
        assert_eq!(
            argv,
            vec![vec![
                "npm".to_string(),
                "run".to_string(),
                "build".to_string()
            ]]
        );
    }

    #[test]
    fn lifecycle_object_runs_each_value() {
        let argv = lifecycle_command_argv(&serde_json::json!({
            "install": "npm install",
            "lint": ["npm", "run", "lint"]
        }))
        .unwrap();
        assert_eq!(argv.len(), 2);
    }

    #[test]
    fn config_discovery_prefers_devcontainer_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join(".devcontainer");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("devcontainer.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".devcontainer.json"), "{}").unwrap();

        let found = RunController::find_config_path(dir.path()).unwrap();
        assert_eq!(found, nested.join("devcontainer.json"));
    }
}
