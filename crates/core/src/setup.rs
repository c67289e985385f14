//! Setup executor (host side)
//!
//! After the run controller confirms a running container, this component:
//!
//! 1. Injects the agent binary at its well-known in-container path (streamed
//!    through the driver, chmod +x, guarded by an in-container lock
//!    directory, the whole step bounded by one timeout).
//! 2. Serializes the run-result scaffold and the workspace info payload
//!    (deflate + base64) and starts the in-container setup command.
//! 3. Serves the agent's callbacks over the tunnel (credentials, port
//!    forwards, mount streams, logs) while setup runs.
//! 4. Receives the populated result via the single `SendResult` RPC, drains
//!    the log channel, and hands the result back for persistence.

use crate::credentials::{self, DockerKeychain};
use crate::driver::DockerCli;
use crate::errors::{AgentError, Result, TunnelError};
use crate::portforward::PortForwarder;
use crate::tunnel::messages::{
    self, DockerCredentialsRequest, ForwardPortRequest, GitCredentialsRequest,
    StopForwardPortRequest, StreamRequest,
};
use crate::tunnel::{Envelope, RequestHandler, RequestKind, StreamSender, Tunnel};
use crate::workspace::{CliOverrides, RunResult};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Well-known in-container path of the injected agent binary.
pub const AGENT_CONTAINER_PATH: &str = "/usr/local/bin/gantry-agent";
/// In-container lock directory preventing concurrent injections.
pub const AGENT_INJECT_LOCK: &str = "/tmp/gantry-agent.inject.lock";
/// Well-known in-container location of the persisted run result.
pub const RESULT_LOCATION: &str = "/var/run/gantry/result.json";
/// Default bound on the whole inject step.
pub const DEFAULT_INJECT_TIMEOUT: Duration = Duration::from_secs(60);

/// IDE server to install inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ide {
    VsCode,
    OpenVsCode,
    JetBrains,
    Jupyter,
    RStudio,
    Fleet,
}

/// Everything the in-container setup process needs to know, shipped as a
/// compressed flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerWorkspaceInfo {
    /// Workspace id
    pub workspace_id: String,
    /// CLI overrides active for this run
    pub cli_options: CliOverrides,
    /// Folder holding the workspace content inside the container
    pub content_folder: String,
    /// IDE server to install, when any
    pub ide: Option<Ide>,
    /// Pull the source inside the container (git source, registry-style pull)
    pub pull_inside_container: bool,
    /// Spawn the container daemon with this inactivity timeout
    pub daemon_inactivity_timeout_secs: Option<u64>,
    /// Ports the agent's poller may ask the host to forward
    pub forward_ports: Vec<u16>,
    /// Whether the driver shares a filesystem with the host
    pub shared_filesystem: bool,
}

/// Default bound on one remote exec (lifecycle hooks and setup commands).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// Options controlling one setup run.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Host path of the agent binary to inject
    pub agent_binary: PathBuf,
    /// Bound on the whole inject step
    pub inject_timeout: Duration,
    /// Bound on each remote exec
    pub exec_timeout: Duration,
    /// Idle timeout applied to port forwards (zero = never expire)
    pub forward_idle_timeout: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("gantry-agent"),
            inject_timeout: DEFAULT_INJECT_TIMEOUT,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            forward_idle_timeout: Duration::ZERO,
        }
    }
}

/// Serialize a payload as deflate-compressed base64 for a command flag.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).map_err(|e| AgentError::SetupFailed {
        message: format!("payload serialization failed: {}", e),
    })?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| base64::engine::general_purpose::STANDARD.encode(compressed))
        .map_err(|e| {
            AgentError::SetupFailed {
                message: format!("payload compression failed: {}", e),
            }
            .into()
        })
}

/// Inverse of [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AgentError::SetupFailed {
            message: format!("payload base64 decode failed: {}", e),
        })?;
    let mut decoder = DeflateDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| AgentError::SetupFailed {
            message: format!("payload decompression failed: {}", e),
        })?;
    serde_json::from_slice(&json).map_err(|e| {
        AgentError::SetupFailed {
            message: format!("payload deserialization failed: {}", e),
        }
        .into()
    })
}

/// Runs the setup flow against one container.
pub struct SetupExecutor<'a> {
    docker: &'a DockerCli,
    options: SetupOptions,
}

impl<'a> SetupExecutor<'a> {
    pub fn new(docker: &'a DockerCli, options: SetupOptions) -> Self {
        Self { docker, options }
    }

    /// Inject the agent binary when absent. Idempotent: an existing binary
    /// short-circuits, and a lock directory inside the container keeps two
    /// concurrent injections from interleaving. A partial binary left by a
    /// failed attempt is overwritten on the next run.
    #[instrument(skip(self), fields(container_id = container_id))]
    pub async fn inject_agent(&self, container_id: &str) -> Result<()> {
        let inject = self.inject_agent_inner(container_id);
        match tokio::time::timeout(self.options.inject_timeout, inject).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::InjectTimeout {
                seconds: self.options.inject_timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn inject_agent_inner(&self, container_id: &str) -> Result<()> {
        let probe = format!("test -x {} && echo present || echo absent", AGENT_CONTAINER_PATH);
        let status = self
            .docker
            .command_container(
                container_id,
                Some("root"),
                &["sh".to_string(), "-c".to_string(), probe],
            )
            .await?;
        if status.trim() == "present" {
            debug!("agent binary already present");
            return Ok(());
        }

        // Lock directory: mkdir is atomic inside the container. If another
        // client injects first, the re-check sees the binary and returns.
        let acquire = format!(
            "while ! mkdir {lock} 2>/dev/null; do \
                 test -x {agent} && exit 0; sleep 1; \
             done; echo locked",
            lock = AGENT_INJECT_LOCK,
            agent = AGENT_CONTAINER_PATH
        );
        let acquired = self
            .docker
            .command_container(
                container_id,
                Some("root"),
                &["sh".to_string(), "-c".to_string(), acquire],
            )
            .await?;
        if acquired.trim() != "locked" {
            debug!("agent injected by a concurrent client");
            return Ok(());
        }

        let result = self.stream_agent_binary(container_id).await;

        let release = format!("rmdir {} 2>/dev/null || true", AGENT_INJECT_LOCK);
        let _ = self
            .docker
            .command_container(
                container_id,
                Some("root"),
                &["sh".to_string(), "-c".to_string(), release],
            )
            .await;

        result
    }

    async fn stream_agent_binary(&self, container_id: &str) -> Result<()> {
        let binary_path = self.select_agent_binary(container_id).await;
        let binary = tokio::fs::read(&binary_path)
            .await
            .map_err(|e| AgentError::SetupFailed {
                message: format!(
                    "cannot read agent binary {}: {}",
                    binary_path.display(),
                    e
                ),
            })?;

        let install = format!(
            "mkdir -p {dir} && cat > {agent}.tmp && chmod 0755 {agent}.tmp && mv {agent}.tmp {agent}",
            dir = PathBuf::from(AGENT_CONTAINER_PATH)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "/usr/local/bin".to_string()),
            agent = AGENT_CONTAINER_PATH
        );
        let mut child = self.docker.command_container_piped(
            container_id,
            Some("root"),
            &["sh".to_string(), "-c".to_string(), install],
        )?;

        let mut stdin = child.stdin.take().ok_or_else(|| AgentError::SetupFailed {
            message: "agent inject exec has no stdin".to_string(),
        })?;
        stdin
            .write_all(&binary)
            .await
            .map_err(|e| AgentError::SetupFailed {
                message: format!("agent binary stream failed: {}", e),
            })?;
        drop(stdin);

        let status = child.wait().await.map_err(|e| AgentError::SetupFailed {
            message: format!("agent inject exec failed: {}", e),
        })?;
        if !status.success() {
            return Err(AgentError::RemoteExit {
                code: status.code().unwrap_or(1),
            }
            .into());
        }
        info!(bytes = binary.len(), "agent binary injected");
        Ok(())
    }

    /// Prefer an architecture-suffixed sibling of the configured agent
    /// binary (`gantry-agent-arm64`) when the container's architecture
    /// differs from the default build.
    async fn select_agent_binary(&self, container_id: &str) -> PathBuf {
        let base = self.options.agent_binary.clone();
        let Ok(architecture) = self.docker.target_architecture(container_id).await else {
            return base;
        };
        let suffixed = PathBuf::from(format!("{}-{}", base.display(), architecture));
        if suffixed.exists() {
            debug!(binary = %suffixed.display(), "using architecture-specific agent binary");
            suffixed
        } else {
            base
        }
    }

    /// Run the in-container setup command and serve its callbacks until the
    /// populated result arrives. The log channel is drained to EOF before
    /// success is reported.
    #[instrument(skip_all, fields(container_id = container_id))]
    pub async fn run_setup(
        &self,
        container_id: &str,
        user: Option<&str>,
        scaffold: &RunResult,
        info: &ContainerWorkspaceInfo,
        root: CancellationToken,
    ) -> Result<RunResult> {
        let result_flag = encode_payload(scaffold)?;
        let info_flag = encode_payload(info)?;

        let mut child = self.docker.command_container_piped(
            container_id,
            user,
            &[
                AGENT_CONTAINER_PATH.to_string(),
                "agent".to_string(),
                "setup".to_string(),
                "--result".to_string(),
                result_flag,
                "--info".to_string(),
                info_flag,
            ],
        )?;

        let stdin = child.stdin.take().ok_or_else(|| AgentError::SetupFailed {
            message: "setup exec has no stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AgentError::SetupFailed {
            message: "setup exec has no stdout".to_string(),
        })?;

        let services = Arc::new(HostServices::new(self.options.forward_idle_timeout, root.clone()));
        let tunnel = Tunnel::start(stdout, stdin, services.clone(), root.clone());
        let keepalive = crate::tunnel::spawn_keepalive(
            tunnel.clone(),
            crate::tunnel::DEFAULT_KEEPALIVE_INTERVAL,
            root.clone(),
        );

        let outcome = tokio::select! {
            result = services.wait_for_result() => result,
            _ = root.cancelled() => Err(TunnelError::Cancelled.into()),
            _ = tunnel.closed() => Err(TunnelError::Disconnected.into()),
        };

        // Drain: logs issued before SendResult may still be in flight. The
        // agent exits after the result is acknowledged; wait for EOF.
        if outcome.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(10), tunnel.closed()).await;
        }
        if let Some(task) = keepalive {
            task.abort();
        }
        services.forwarder.shutdown();
        tunnel.shutdown().await;
        let exit = child.wait().await;

        // A remote failure carries the remote exit code to the caller.
        if outcome.is_err() {
            if let Ok(status) = exit {
                if let Some(code) = status.code().filter(|code| *code != 0) {
                    return Err(AgentError::RemoteExit { code }.into());
                }
            }
        }
        outcome
    }
}

/// Host-side handler serving the agent's callbacks.
pub struct HostServices {
    keychain: DockerKeychain,
    pub forwarder: PortForwarder,
    result: Mutex<Option<RunResult>>,
    result_ready: Notify,
}

impl HostServices {
    pub fn new(forward_idle_timeout: Duration, root: CancellationToken) -> Self {
        Self {
            keychain: DockerKeychain::default(),
            forwarder: PortForwarder::new(
                Arc::new(crate::portforward::TcpConnector::new("127.0.0.1")),
                forward_idle_timeout,
                root,
            ),
            result: Mutex::new(None),
            result_ready: Notify::new(),
        }
    }

    /// Wait until the agent delivers its `SendResult`.
    pub async fn wait_for_result(&self) -> Result<RunResult> {
        loop {
            if let Some(result) = self.result.lock().expect("result slot poisoned").take() {
                return Ok(result);
            }
            self.result_ready.notified().await;
        }
    }
}

#[async_trait]
impl RequestHandler for HostServices {
    async fn handle_unary(&self, kind: RequestKind, envelope: Envelope) -> Result<Bytes> {
        match kind {
            RequestKind::Ping => messages::encode_message(&serde_json::json!({})),
            RequestKind::GitUser => {
                messages::encode_message(&credentials::git_user().await?)
            }
            RequestKind::GitCredentials => {
                let request: GitCredentialsRequest = envelope.data_as()?;
                messages::encode_message(&credentials::git_credentials(&request).await?)
            }
            RequestKind::DockerCredentials => {
                let request: DockerCredentialsRequest = envelope.data_as()?;
                let response = self.keychain.resolve(&request).await?.unwrap_or_default();
                messages::encode_message(&response)
            }
            RequestKind::KubeConfig => {
                messages::encode_message(&read_optional_home_file(".kube/config"))
            }
            RequestKind::LoftConfig => {
                messages::encode_message(&read_optional_home_file(".loft/config.json"))
            }
            RequestKind::GPGPublicKeys => {
                let keys = capture_command("gpg", &["--export", "--armor"]).await;
                messages::encode_message(&keys)
            }
            RequestKind::GitSSHSignature => {
                messages::encode_message(&read_optional_home_file(".ssh/id_ed25519.pub"))
            }
            RequestKind::ForwardPort => {
                let request: ForwardPortRequest = envelope.data_as()?;
                // Best-effort: report failures, never fail the run.
                match self
                    .forwarder
                    .add_forward(request.port, request.host_port.unwrap_or(request.port))
                    .await
                {
                    Ok(local_port) => messages::encode_message(&serde_json::json!({
                        "localPort": local_port
                    })),
                    Err(e) => {
                        warn!(port = request.port, error = %e, "port forward failed");
                        messages::encode_message(&serde_json::json!({ "error": e.to_string() }))
                    }
                }
            }
            RequestKind::StopForwardPort => {
                let request: StopForwardPortRequest = envelope.data_as()?;
                self.forwarder.stop_forward(request.port);
                messages::encode_message(&serde_json::json!({}))
            }
            RequestKind::SendResult => {
                let result: RunResult = envelope.data_as()?;
                *self.result.lock().expect("result slot poisoned") = Some(result);
                self.result_ready.notify_waiters();
                messages::encode_message(&serde_json::json!({}))
            }
            other => Err(TunnelError::Protocol {
                message: format!("operation {:?} is not unary", other),
            }
            .into()),
        }
    }

    async fn handle_stream(
        &self,
        kind: RequestKind,
        envelope: Envelope,
        stream: StreamSender,
    ) -> Result<()> {
        let request: StreamRequest = envelope.data_as()?;
        match kind {
            RequestKind::StreamMount | RequestKind::StreamWorkspace => {
                stream_tar_of_path(&PathBuf::from(&request.path), stream).await
            }
            RequestKind::StreamGitClone => {
                let clone_dir = tempfile::TempDir::new().map_err(|e| AgentError::SetupFailed {
                    message: format!("clone staging failed: {}", e),
                })?;
                let output = tokio::process::Command::new("git")
                    .args(["clone", "--depth", "1"])
                    .arg(&request.path)
                    .arg(clone_dir.path())
                    .output()
                    .await
                    .map_err(|e| AgentError::SetupFailed {
                        message: format!("git clone failed: {}", e),
                    })?;
                if !output.status.success() {
                    return Err(AgentError::SetupFailed {
                        message: format!(
                            "git clone failed: {}",
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    }
                    .into());
                }
                stream_tar_of_path(clone_dir.path(), stream).await
            }
            other => Err(TunnelError::Protocol {
                message: format!("operation {:?} is not streaming", other),
            }
            .into()),
        }
    }
}

/// Tar a host directory and push it through the stream in bounded chunks.
async fn stream_tar_of_path(path: &std::path::Path, stream: StreamSender) -> Result<()> {
    let path = path.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &path)?;
        builder.into_inner()
    })
    .await
    .map_err(|e| AgentError::SetupFailed {
        message: format!("tar task failed: {}", e),
    })?
    .map_err(|e| AgentError::SetupFailed {
        message: format!("tar archive failed: {}", e),
    })?;

    for chunk in archive.chunks(64 * 1024) {
        stream.send(Bytes::copy_from_slice(chunk)).await?;
    }
    Ok(())
}

fn read_optional_home_file(relative: &str) -> Option<String> {
    let home = std::env::var_os("HOME")?;
    std::fs::read_to_string(PathBuf::from(home).join(relative)).ok()
}

async fn capture_command(binary: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let info = ContainerWorkspaceInfo {
            workspace_id: "ws-1".to_string(),
            content_folder: "/workspaces/demo".to_string(),
            ide: Some(Ide::OpenVsCode),
            pull_inside_container: true,
            forward_ports: vec![3000, 8080],
            shared_filesystem: false,
            ..Default::default()
        };
        let encoded = encode_payload(&info).unwrap();
        // Compressed payloads must be flag-safe.
        assert!(!encoded.contains(char::is_whitespace));
        let decoded: ContainerWorkspaceInfo = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let err = decode_payload::<ContainerWorkspaceInfo>("not-base64!!!").unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[tokio::test]
    async fn host_services_capture_result() {
        use crate::config::DevContainerConfig;
        use crate::container::{ContainerConfig, ContainerDetails, ContainerStatus};
        use crate::merge::MergedDevContainerConfig;
        use crate::variable::SubstitutionContext;

        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("devcontainer.json");
        let services = Arc::new(HostServices::new(Duration::ZERO, CancellationToken::new()));

        let result = RunResult {
            config: DevContainerConfig {
                image: Some("alpine".to_string()),
                ..Default::default()
            },
            merged_config: MergedDevContainerConfig::default(),
            substitution_context: SubstitutionContext::new(dir.path(), &config_path).unwrap(),
            container: ContainerDetails {
                id: "abc".to_string(),
                status: ContainerStatus::Running,
                labels: Default::default(),
                config: ContainerConfig::default(),
                mounts: Vec::new(),
            },
            workspace_folder: "/workspaces/demo".to_string(),
            remote_user: "root".to_string(),
            finished_at: chrono::Utc::now(),
        };

        let envelope = Envelope::new(RequestKind::SendResult, &result).unwrap();
        services
            .handle_unary(RequestKind::SendResult, envelope)
            .await
            .unwrap();

        let received = services.wait_for_result().await.unwrap();
        assert_eq!(received.container.id, "abc");
        assert_eq!(received.remote_user, "root");
    }

    #[tokio::test]
    async fn stream_tar_round_trip() {
        use crate::tunnel::{RejectingHandler, StreamRequest};

        let source = tempfile::TempDir::new().unwrap();
        std::fs::write(source.path().join("hello.txt"), b"hello world").unwrap();
        std::fs::create_dir(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("sub/nested.txt"), b"nested").unwrap();

        struct MountHandler {
            root: PathBuf,
        }

        #[async_trait]
        impl RequestHandler for MountHandler {
            async fn handle_unary(&self, _k: RequestKind, _e: Envelope) -> Result<Bytes> {
                unreachable!()
            }
            async fn handle_stream(
                &self,
                _kind: RequestKind,
                _envelope: Envelope,
                stream: StreamSender,
            ) -> Result<()> {
                stream_tar_of_path(&self.root, stream).await
            }
        }

        let root = CancellationToken::new();
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let client = Tunnel::over_duplex(client_side, Arc::new(RejectingHandler), root.clone());
        let _server = Tunnel::over_duplex(
            server_side,
            Arc::new(MountHandler {
                root: source.path().to_path_buf(),
            }),
            root,
        );

        let mut stream = client
            .open_stream(
                RequestKind::StreamMount,
                &StreamRequest {
                    path: "/cache".to_string(),
                },
            )
            .await
            .unwrap();

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            archive.extend_from_slice(&chunk);
        }

        let target = tempfile::TempDir::new().unwrap();
        tar::Archive::new(archive.as_slice())
            .unpack(target.path())
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(target.path().join("hello.txt")).unwrap(),
            "hello world"
        );
        assert_eq!(
            std::fs::read_to_string(target.path().join("sub/nested.txt")).unwrap(),
            "nested"
        );
    }
}
