//! Container drivers
//!
//! The engine drives containers through a tagged [`Driver`] variant rather
//! than trait objects: `Docker` for single containers, `Compose` for compose
//! projects, `Remote` for a docker CLI reached through a command prefix
//! (typically `ssh host`). Each variant exposes the thin capability set the
//! run controller needs; docker-only capabilities live on [`DockerCli`]
//! directly.
//!
//! Every operation is planned as an argv first (`plan_*` functions are pure
//! and unit-testable) and executed by a thin tokio process wrapper.

use crate::container::{ContainerDetails, ImageDetails, WORKSPACE_ID_LABEL};
use crate::errors::{DriverError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Compose label naming the project a container belongs to.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose label naming the service a container belongs to.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
/// Compose label listing the config files the project was created from.
pub const COMPOSE_CONFIG_FILES_LABEL: &str = "com.docker.compose.project.config_files";

/// Docker CLI wrapper; the `Docker` and `Compose` variants build on it.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_path: String,
    /// Prefix argv for remote execution (e.g. `ssh`, `host`); empty locally.
    exec_prefix: Vec<String>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
            exec_prefix: Vec::new(),
        }
    }

    /// Use a custom docker binary path.
    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            exec_prefix: Vec::new(),
        }
    }

    /// Route every invocation through a command prefix (remote driver).
    pub fn with_exec_prefix(mut self, prefix: Vec<String>) -> Self {
        self.exec_prefix = prefix;
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut argv: Vec<String> = self.exec_prefix.clone();
        argv.push(self.docker_path.clone());
        argv.extend(args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    /// Execute a docker command, capturing stdout. Non-zero exit is a
    /// [`DriverError::CliError`] carrying stderr.
    #[instrument(skip_all, fields(args = %args.join(" ")))]
    pub async fn execute(&self, args: &[String]) -> Result<String> {
        debug!("executing docker command");
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DriverError::NotInstalled
                } else {
                    DriverError::CliError(format!("failed to spawn docker: {}", e))
                }
            })?;

        if !output.status.success() {
            return Err(DriverError::CliError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Spawn a docker command with piped stdio for interactive use (agent
    /// transport, streamed exec). The caller owns the child.
    pub fn spawn_piped(&self, args: &[String]) -> Result<tokio::process::Child> {
        self.command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::CliError(format!("failed to spawn docker: {}", e)).into())
    }

    /// Find a container by id or name; `None` when it does not exist.
    pub async fn find_container(&self, id: &str) -> Result<Option<ContainerDetails>> {
        match self
            .execute(&to_args(&["inspect", "--type", "container", id]))
            .await
        {
            Ok(stdout) => {
                let parsed: Vec<Value> =
                    serde_json::from_str(&stdout).map_err(|e| DriverError::UnexpectedOutput {
                        message: format!("inspect output: {}", e),
                    })?;
                match parsed.first() {
                    Some(value) => Ok(Some(ContainerDetails::from_inspect_json(value)?)),
                    None => Ok(None),
                }
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find the workspace's container via the id label.
    pub async fn find_workspace_container(
        &self,
        workspace_id: &str,
    ) -> Result<Option<ContainerDetails>> {
        let stdout = self
            .execute(&to_args(&[
                "ps",
                "-aq",
                "--filter",
                &format!("label={}={}", WORKSPACE_ID_LABEL, workspace_id),
            ]))
            .await?;
        match stdout.split_whitespace().next() {
            Some(container_id) => self.find_container(container_id).await,
            None => Ok(None),
        }
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.execute(&to_args(&["start", id])).await.map(|_| ())
    }

    pub async fn stop_container(&self, id: &str) -> Result<()> {
        self.execute(&to_args(&["stop", id])).await.map(|_| ())
    }

    pub async fn delete_container(&self, id: &str) -> Result<()> {
        self.execute(&to_args(&["rm", "-f", id])).await.map(|_| ())
    }

    /// Plan the argv for an in-container exec.
    pub fn plan_command_container(
        id: &str,
        user: Option<&str>,
        interactive: bool,
        cmd: &[String],
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.push(id.to_string());
        args.extend(cmd.iter().cloned());
        args
    }

    /// Run a command inside the container, capturing stdout.
    pub async fn command_container(
        &self,
        id: &str,
        user: Option<&str>,
        cmd: &[String],
    ) -> Result<String> {
        self.execute(&Self::plan_command_container(id, user, false, cmd))
            .await
    }

    /// Spawn an in-container command with piped stdio (duplex transports).
    pub fn command_container_piped(
        &self,
        id: &str,
        user: Option<&str>,
        cmd: &[String],
    ) -> Result<tokio::process::Child> {
        self.spawn_piped(&Self::plan_command_container(id, user, true, cmd))
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let stdout = self
            .execute(&to_args(&["image", "inspect", reference]))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    crate::errors::BuildError::ImageNotFound {
                        reference: reference.to_string(),
                    }
                    .into()
                } else {
                    e
                }
            })?;
        let parsed: Vec<Value> =
            serde_json::from_str(&stdout).map_err(|e| DriverError::UnexpectedOutput {
                message: format!("image inspect output: {}", e),
            })?;
        let first = parsed.first().ok_or_else(|| DriverError::UnexpectedOutput {
            message: "empty image inspect output".to_string(),
        })?;
        ImageDetails::from_inspect_json(first)
    }

    /// Target architecture of a running container, normalized to GOARCH-style
    /// names (`amd64`, `arm64`).
    pub async fn target_architecture(&self, id: &str) -> Result<String> {
        let stdout = self
            .command_container(id, None, &to_args(&["uname", "-m"]))
            .await?;
        Ok(normalize_architecture(stdout.trim()))
    }

    /// Align the container user's UID/GID with the host user (docker-only
    /// capability used by the setup executor on shared-filesystem drivers).
    pub async fn update_container_user_uid(
        &self,
        id: &str,
        user: &str,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let script = format!(
            "usermod -u {uid} {user} 2>/dev/null || true; groupmod -g {gid} {user} 2>/dev/null || true",
        );
        self.command_container(id, Some("root"), &to_args(&["sh", "-c", &script]))
            .await
            .map(|_| ())
    }

    /// Plan a `docker run` for a single-container workspace.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_run(
        image: &str,
        name: &str,
        labels: &HashMap<String, String>,
        env: &HashMap<String, String>,
        mounts: &[String],
        user: Option<&str>,
        entrypoint: Option<&[String]>,
        extra_args: &[String],
    ) -> Vec<String> {
        let mut args = to_args(&["run", "-d", "--name", name]);
        let mut label_keys: Vec<&String> = labels.keys().collect();
        label_keys.sort();
        for key in label_keys {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, labels[key]));
        }
        let mut env_keys: Vec<&String> = env.keys().collect();
        env_keys.sort();
        for key in env_keys {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, env[key]));
        }
        for mount in mounts {
            args.push("--mount".to_string());
            args.push(mount.clone());
        }
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.extend(extra_args.iter().cloned());
        if let Some(entrypoint) = entrypoint {
            if let Some(first) = entrypoint.first() {
                args.push("--entrypoint".to_string());
                args.push(first.clone());
            }
        }
        args.push(image.to_string());
        if let Some(entrypoint) = entrypoint {
            args.extend(entrypoint.iter().skip(1).cloned());
        }
        args
    }

    /// Create and start a container from a prepared run plan, returning the id.
    pub async fn run_container(&self, plan: &[String]) -> Result<String> {
        let stdout = self.execute(plan).await?;
        Ok(stdout.trim().to_string())
    }

    /// Plan a `docker build`.
    pub fn plan_build(
        dockerfile: &PathBuf,
        context: &PathBuf,
        target: Option<&str>,
        build_args: &[(String, String)],
        labels: &[(String, String)],
        tags: &[String],
    ) -> Vec<String> {
        let mut args = to_args(&["build", "-f"]);
        args.push(dockerfile.display().to_string());
        if let Some(target) = target {
            args.push("--target".to_string());
            args.push(target.to_string());
        }
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for tag in tags {
            args.push("-t".to_string());
            args.push(tag.clone());
        }
        args.push(context.display().to_string());
        args
    }
}

/// Compose CLI wrapper bound to one project.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    docker: DockerCli,
    project_name: String,
    files: Vec<PathBuf>,
    env_files: Vec<PathBuf>,
}

impl ComposeCli {
    pub fn new(docker: DockerCli, project_name: impl Into<String>) -> Self {
        Self {
            docker,
            project_name: project_name.into(),
            files: Vec::new(),
            env_files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn with_env_files(mut self, env_files: Vec<PathBuf>) -> Self {
        self.env_files = env_files;
        self
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Deterministic compose project name for a workspace id. Compose
    /// project names must be lowercase alphanumeric/dash/underscore.
    pub fn derive_project_name(workspace_id: &str) -> String {
        let sanitized: String = workspace_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!("gantry-{}", sanitized.trim_matches('-'))
    }

    /// Plan a compose invocation with the project's `-f`/`--env-file` flags.
    pub fn plan(&self, args: &[&str]) -> Vec<String> {
        let mut argv = to_args(&["compose", "-p", &self.project_name]);
        for file in &self.files {
            argv.push("-f".to_string());
            argv.push(file.display().to_string());
        }
        for env_file in &self.env_files {
            argv.push("--env-file".to_string());
            argv.push(env_file.display().to_string());
        }
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    /// Run a compose subcommand (`ComposeHelper.Run` equivalent).
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        self.docker.execute(&self.plan(args)).await
    }

    /// Find the dev container of a project service.
    pub async fn find_dev_container(
        &self,
        project: &str,
        service: &str,
    ) -> Result<Option<ContainerDetails>> {
        let stdout = self
            .docker
            .execute(&to_args(&[
                "ps",
                "-aq",
                "--filter",
                &format!("label={}={}", COMPOSE_PROJECT_LABEL, project),
                "--filter",
                &format!("label={}={}", COMPOSE_SERVICE_LABEL, service),
            ]))
            .await?;
        match stdout.split_whitespace().next() {
            Some(id) => self.docker.find_container(id).await,
            None => Ok(None),
        }
    }

    /// The compose config files a project's containers were created from,
    /// read off the compose labels.
    pub async fn find_project_files(&self, project: &str) -> Result<Vec<PathBuf>> {
        let stdout = self
            .docker
            .execute(&to_args(&[
                "ps",
                "-aq",
                "--filter",
                &format!("label={}={}", COMPOSE_PROJECT_LABEL, project),
            ]))
            .await?;
        let Some(id) = stdout.split_whitespace().next() else {
            return Ok(Vec::new());
        };
        let Some(details) = self.docker.find_container(id).await? else {
            return Ok(Vec::new());
        };
        Ok(details
            .labels
            .get(COMPOSE_CONFIG_FILES_LABEL)
            .map(|files| files.split(',').map(PathBuf::from).collect())
            .unwrap_or_default())
    }

    /// Default image name compose assigns to a built service.
    pub fn get_default_image(project: &str, service: &str) -> String {
        format!("{}-{}", project, service)
    }
}

/// Remote agent driver: a docker CLI reached through an exec prefix, plus
/// the flag that the filesystem is not shared with the host (mount content
/// must be streamed through the tunnel).
#[derive(Debug, Clone)]
pub struct RemoteDriver {
    docker: DockerCli,
}

impl RemoteDriver {
    pub fn new(exec_prefix: Vec<String>) -> Self {
        Self {
            docker: DockerCli::new().with_exec_prefix(exec_prefix),
        }
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }
}

/// The backend that actually runs containers.
#[derive(Debug, Clone)]
pub enum Driver {
    /// Local docker daemon
    Docker(DockerCli),
    /// Local docker daemon driving a compose project
    Compose { docker: DockerCli, compose: ComposeCli },
    /// Remote docker reached over a command tunnel
    Remote(RemoteDriver),
}

impl Driver {
    /// The docker CLI this driver is built on.
    pub fn docker(&self) -> &DockerCli {
        match self {
            Driver::Docker(docker) => docker,
            Driver::Compose { docker, .. } => docker,
            Driver::Remote(remote) => remote.docker(),
        }
    }

    /// The compose helper, when this driver is compose-based.
    pub fn compose(&self) -> Option<&ComposeCli> {
        match self {
            Driver::Compose { compose, .. } => Some(compose),
            _ => None,
        }
    }

    /// Whether the driver shares a filesystem with this process. Remote
    /// drivers stream mount content through the tunnel instead.
    pub fn has_shared_filesystem(&self) -> bool {
        !matches!(self, Driver::Remote(_))
    }

    pub async fn find_container(&self, id: &str) -> Result<Option<ContainerDetails>> {
        self.docker().find_container(id).await
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.docker().start_container(id).await
    }

    pub async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker().stop_container(id).await
    }

    pub async fn delete_container(&self, id: &str) -> Result<()> {
        self.docker().delete_container(id).await
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn is_not_found(error: &crate::errors::GantryError) -> bool {
    let rendered = error.to_string().to_lowercase();
    rendered.contains("no such") || rendered.contains("not found")
}

fn normalize_architecture(machine: &str) -> String {
    match machine {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => {
            warn!(machine = other, "unrecognized architecture, passing through");
            other.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_plan_includes_user_and_command() {
        let plan = DockerCli::plan_command_container(
            "abc",
            Some("root"),
            false,
            &to_args(&["id", "-u"]),
        );
        assert_eq!(plan, to_args(&["exec", "-u", "root", "abc", "id", "-u"]));
    }

    #[test]
    fn interactive_exec_plan_adds_stdin_flag() {
        let plan = DockerCli::plan_command_container("abc", None, true, &to_args(&["cat"]));
        assert_eq!(plan, to_args(&["exec", "-i", "abc", "cat"]));
    }

    #[test]
    fn run_plan_orders_image_last() {
        let mut labels = HashMap::new();
        labels.insert("dev.gantry.workspace.id".to_string(), "ws1".to_string());
        let plan = DockerCli::plan_run(
            "alpine:3.18",
            "gantry-ws1",
            &labels,
            &HashMap::new(),
            &["type=bind,source=/src,target=/workspace".to_string()],
            None,
            None,
            &[],
        );
        assert_eq!(plan.last().unwrap(), "alpine:3.18");
        assert!(plan.contains(&"--label".to_string()));
        assert!(plan.contains(&"dev.gantry.workspace.id=ws1".to_string()));
    }

    #[test]
    fn build_plan_passes_target_and_tags() {
        let plan = DockerCli::plan_build(
            &PathBuf::from("/tmp/Dockerfile"),
            &PathBuf::from("/tmp/ctx"),
            Some("dev_container_feature_target"),
            &[("A".to_string(), "1".to_string())],
            &[("devcontainer.metadata".to_string(), "[]".to_string())],
            &["img:hash".to_string()],
        );
        assert!(plan.windows(2).any(|w| w[0] == "--target" && w[1] == "dev_container_feature_target"));
        assert!(plan.windows(2).any(|w| w[0] == "--build-arg" && w[1] == "A=1"));
        assert!(plan.windows(2).any(|w| w[0] == "-t" && w[1] == "img:hash"));
        assert_eq!(plan.last().unwrap(), "/tmp/ctx");
    }

    #[test]
    fn compose_plan_threads_project_and_files() {
        let compose = ComposeCli::new(DockerCli::new(), "gantry-ws1").with_files(vec![
            PathBuf::from("docker-compose.yml"),
            PathBuf::from("override.yml"),
        ]);
        let plan = compose.plan(&["up", "-d", "app", "db"]);
        assert_eq!(
            plan,
            to_args(&[
                "compose",
                "-p",
                "gantry-ws1",
                "-f",
                "docker-compose.yml",
                "-f",
                "override.yml",
                "up",
                "-d",
                "app",
                "db"
            ])
        );
    }

    #[test]
    fn default_image_name_joins_project_and_service() {
        assert_eq!(
            ComposeCli::get_default_image("gantry-ws1", "app"),
            "gantry-ws1-app"
        );
    }

    #[test]
    fn remote_driver_prefixes_invocations() {
        let remote = RemoteDriver::new(vec!["ssh".to_string(), "dev-host".to_string()]);
        let driver = Driver::Remote(remote);
        assert!(!driver.has_shared_filesystem());
        assert!(driver.compose().is_none());
    }

    #[test]
    fn project_name_is_deterministic_and_sanitized() {
        let a = ComposeCli::derive_project_name("My Workspace!");
        let b = ComposeCli::derive_project_name("My Workspace!");
        assert_eq!(a, b);
        assert!(a.starts_with("gantry-"));
        assert!(a.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '-'
            || c == '_'));
    }

    #[test]
    fn architecture_normalization() {
        assert_eq!(normalize_architecture("x86_64"), "amd64");
        assert_eq!(normalize_architecture("aarch64"), "arm64");
        assert_eq!(normalize_architecture("riscv64"), "riscv64");
    }
}
