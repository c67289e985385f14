//! In-container agent
//!
//! The setup process the host injects and runs inside the container. It
//! talks back to the host over its own stdio (multiplexed by the tunnel)
//! and performs: workspace ownership fixes, bind-mount streaming for
//! drivers without a shared filesystem, git credential helper wiring, IDE
//! server install, the container daemon spawn, and the port poller. When
//! done it populates the run result, persists it at the well-known
//! in-container location, and delivers it via a single `SendResult` RPC.

use crate::errors::{AgentError, Result};
use crate::mount::{Mount, MountType};
use crate::portforward::{allowed_ports, parse_listening_ports};
use crate::setup::{ContainerWorkspaceInfo, Ide, AGENT_CONTAINER_PATH, RESULT_LOCATION};
use crate::tunnel::http::{HttpTunnelClient, HttpTunnelServer};
use crate::tunnel::messages::{
    self, ForwardPortRequest, GitCredentialsRequest, GitCredentialsResponse, StreamRequest,
};
use crate::tunnel::{
    Envelope, LogLevel, RejectingHandler, RemoteLogger, RequestHandler, RequestKind,
    StreamSender, Tunnel,
};
use crate::workspace::RunResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Interval of the agent-side listening-port poller.
const PORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Run the in-container setup end to end. `result_flag` and `info_flag` are
/// the deflate+base64 payloads passed by the host.
#[instrument(skip_all)]
pub async fn run_setup(result_flag: &str, info_flag: &str, root: CancellationToken) -> Result<()> {
    let mut result: RunResult = crate::setup::decode_payload(result_flag)?;
    let info: ContainerWorkspaceInfo = crate::setup::decode_payload(info_flag)?;

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let tunnel = Tunnel::start(stdin, stdout, Arc::new(RejectingHandler), root.clone());
    let (logger, log_drain) = RemoteLogger::start(tunnel.clone(), root.clone());

    logger.log(LogLevel::Info, "container setup starting");

    let outcome = perform_setup(&tunnel, &logger, &mut result, &info, root.clone()).await;

    match &outcome {
        Ok(()) => {
            persist_result(&result)?;
            tunnel
                .call(RequestKind::SendResult, &result)
                .await
                .map(|_| ())?;
            logger.log(LogLevel::Info, "container setup finished");
        }
        Err(e) => logger.log(LogLevel::Error, format!("container setup failed: {}", e)),
    }

    // Give the drain task a chance to flush, then shut down the session.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while logger.queued_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    root.cancel();
    let _ = log_drain.await;
    tunnel.shutdown().await;

    outcome
}

async fn perform_setup(
    tunnel: &Arc<Tunnel>,
    logger: &Arc<RemoteLogger>,
    result: &mut RunResult,
    info: &ContainerWorkspaceInfo,
    root: CancellationToken,
) -> Result<()> {
    if !info.shared_filesystem {
        stream_missing_mounts(tunnel, logger, result, info).await?;
    }

    #[cfg(target_os = "linux")]
    if !info.shared_filesystem {
        chown_workspace(logger, &info.content_folder, &result.remote_user).await;
    }

    let credentials_port = wire_git_credential_helper(tunnel.clone(), logger, root.clone()).await;

    if let Some(ide) = info.ide {
        install_ide_server(logger, ide).await;
    }

    if let Some(timeout_secs) = info.daemon_inactivity_timeout_secs {
        spawn_container_daemon(logger, timeout_secs).await;
    }

    if !info.forward_ports.is_empty() {
        spawn_port_poller(tunnel.clone(), info.forward_ports.clone(), root);
    }

    if let Some(port) = credentials_port {
        logger.log(
            LogLevel::Debug,
            format!("git credential bridge listening on 127.0.0.1:{}", port),
        );
    }

    // In-container facts the host cannot see.
    result.workspace_folder = info.content_folder.clone();
    if result.remote_user.is_empty() {
        result.remote_user = current_user().await;
    }
    Ok(())
}

/// For each declared bind mount whose target is empty (or when a reset is
/// requested), pull its content from the host through `StreamMount`.
async fn stream_missing_mounts(
    tunnel: &Arc<Tunnel>,
    logger: &Arc<RemoteLogger>,
    result: &RunResult,
    info: &ContainerWorkspaceInfo,
) -> Result<()> {
    for value in &result.merged_config.mounts {
        let Ok(mount) = Mount::from_value(value) else {
            continue;
        };
        if mount.mount_type != MountType::Bind {
            continue;
        }
        let target = PathBuf::from(&mount.target);
        let needs_content = info.cli_options.reset || dir_is_empty(&target);
        if !needs_content {
            continue;
        }

        logger.log(
            LogLevel::Info,
            format!("streaming mount content into {}", mount.target),
        );
        let mut stream = tunnel
            .open_stream(
                RequestKind::StreamMount,
                &StreamRequest {
                    path: mount.source.clone(),
                },
            )
            .await?;

        unpack_stream_into(&mut stream, &target).await?;
    }
    Ok(())
}

/// Collect a tar stream into a spool file, then unpack it into `target`.
pub async fn unpack_stream_into(
    stream: &mut crate::tunnel::StreamReceiver,
    target: &Path,
) -> Result<()> {
    let mut spool = tempfile::NamedTempFile::new().map_err(|e| AgentError::SetupFailed {
        message: format!("mount spool failed: {}", e),
    })?;
    while let Some(chunk) = stream.next_chunk().await? {
        spool
            .write_all(&chunk)
            .map_err(|e| AgentError::SetupFailed {
                message: format!("mount spool write failed: {}", e),
            })?;
    }

    std::fs::create_dir_all(target).map_err(|e| AgentError::SetupFailed {
        message: format!("mount target create failed: {}", e),
    })?;
    let file = spool.reopen().map_err(|e| AgentError::SetupFailed {
        message: format!("mount spool reopen failed: {}", e),
    })?;
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || tar::Archive::new(file).unpack(&target))
        .await
        .map_err(|e| AgentError::SetupFailed {
            message: format!("mount unpack task failed: {}", e),
        })?
        .map_err(|e| AgentError::SetupFailed {
            message: format!("mount unpack failed: {}", e),
        })?;
    Ok(())
}

fn dir_is_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
async fn chown_workspace(logger: &Arc<RemoteLogger>, folder: &str, user: &str) {
    if user.is_empty() || user == "root" {
        return;
    }
    let output = Command::new("chown")
        .args(["-R", user, folder])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {}
        Ok(output) => logger.log(
            LogLevel::Warn,
            format!(
                "workspace chown failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ),
        Err(e) => logger.log(LogLevel::Warn, format!("workspace chown failed: {}", e)),
    }
}

/// Bridge handler: forwards unary operations from short-lived local
/// processes (the git credential helper) onto the stdio tunnel.
struct TunnelBridge {
    tunnel: Arc<Tunnel>,
}

#[async_trait]
impl RequestHandler for TunnelBridge {
    async fn handle_unary(&self, kind: RequestKind, envelope: Envelope) -> Result<Bytes> {
        self.tunnel.call(kind, &envelope.data).await
    }

    async fn handle_stream(
        &self,
        kind: RequestKind,
        _envelope: Envelope,
        _stream: StreamSender,
    ) -> Result<()> {
        Err(crate::errors::TunnelError::Protocol {
            message: format!("{:?} is not bridged", kind),
        }
        .into())
    }
}

/// Register the system git credential helper pointing at a local HTTP
/// bridge; unregistered when the tunnel session ends.
async fn wire_git_credential_helper(
    tunnel: Arc<Tunnel>,
    logger: &Arc<RemoteLogger>,
    root: CancellationToken,
) -> Option<u16> {
    let server = match HttpTunnelServer::bind_local(Arc::new(TunnelBridge { tunnel })).await {
        Ok(server) => server,
        Err(e) => {
            logger.log(
                LogLevel::Warn,
                format!("credential bridge unavailable: {}", e),
            );
            return None;
        }
    };
    let port = server.local_addr().ok()?.port();
    tokio::spawn(server.serve(root.clone()));

    let helper = format!("!{} agent git-credentials --port {}", AGENT_CONTAINER_PATH, port);
    let registered = Command::new("git")
        .args(["config", "--system", "--add", "credential.helper"])
        .arg(&helper)
        .output()
        .await;
    match registered {
        Ok(output) if output.status.success() => {
            // Unregister when the session ends.
            let cleanup_helper = helper.clone();
            tokio::spawn(async move {
                root.cancelled().await;
                let _ = Command::new("git")
                    .args(["config", "--system", "--unset", "credential.helper"])
                    .arg(regex::escape(&cleanup_helper))
                    .output()
                    .await;
            });
            Some(port)
        }
        Ok(output) => {
            logger.log(
                LogLevel::Warn,
                format!(
                    "git credential helper registration failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            );
            None
        }
        Err(e) => {
            logger.log(
                LogLevel::Warn,
                format!("git credential helper registration failed: {}", e),
            );
            None
        }
    }
}

/// The `agent git-credentials --port N` helper: speak the git-credential
/// wire format on stdio, resolving through the local HTTP bridge.
pub async fn run_git_credentials_helper(port: u16, action: &str) -> Result<()> {
    // Only `get` resolves; `store`/`erase` are accepted and ignored.
    if action != "get" {
        return Ok(());
    }

    let mut input = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut input).map_err(|e| {
        AgentError::SetupFailed {
            message: format!("credential helper stdin failed: {}", e),
        }
    })?;

    let mut request = GitCredentialsRequest::default();
    for line in input.lines() {
        match line.split_once('=') {
            Some(("protocol", value)) => request.protocol = value.to_string(),
            Some(("host", value)) => request.host = value.to_string(),
            Some(("path", value)) => request.path = Some(value.to_string()),
            _ => {}
        }
    }

    let client = HttpTunnelClient::local(port);
    let payload = client.call(RequestKind::GitCredentials, &request).await?;
    let response: GitCredentialsResponse =
        serde_json::from_value(payload).map_err(|e| AgentError::SetupFailed {
            message: format!("credential response invalid: {}", e),
        })?;

    let mut stdout = std::io::stdout();
    if let Some(username) = response.username {
        let _ = writeln!(stdout, "username={}", username);
    }
    if let Some(password) = response.password {
        let _ = writeln!(stdout, "password={}", password);
    }
    Ok(())
}

/// Install command for each supported IDE server; failures are logged and
/// setup continues.
fn ide_install_command(ide: Ide) -> &'static str {
    match ide {
        Ide::VsCode => {
            "test -d ~/.vscode-server || (curl -fsSL https://update.code.visualstudio.com/latest/server-linux-x64/stable | tar -xz -C /tmp)"
        }
        Ide::OpenVsCode => {
            "test -d ~/.openvscode-server || (curl -fsSL https://github.com/gitpod-io/openvscode-server/releases/latest/download/openvscode-server-linux-x64.tar.gz | tar -xz -C /tmp)"
        }
        Ide::JetBrains => {
            "test -d ~/.cache/JetBrains/RemoteDev || mkdir -p ~/.cache/JetBrains/RemoteDev"
        }
        Ide::Jupyter => {
            "command -v jupyter >/dev/null || pip install --quiet jupyterlab"
        }
        Ide::RStudio => {
            "command -v rserver >/dev/null || echo 'rstudio server not present'"
        }
        Ide::Fleet => {
            "test -d ~/.fleet || mkdir -p ~/.fleet"
        }
    }
}

async fn install_ide_server(logger: &Arc<RemoteLogger>, ide: Ide) {
    logger.log(LogLevel::Info, format!("installing IDE server: {:?}", ide));
    let output = Command::new("sh")
        .args(["-c", ide_install_command(ide)])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {}
        Ok(output) => logger.log(
            LogLevel::Warn,
            format!(
                "IDE install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ),
        Err(e) => logger.log(LogLevel::Warn, format!("IDE install failed: {}", e)),
    }
}

/// Spawn the detached container daemon that stops the container after the
/// configured inactivity window.
async fn spawn_container_daemon(logger: &Arc<RemoteLogger>, timeout_secs: u64) {
    let spawned = Command::new(AGENT_CONTAINER_PATH)
        .args(["agent", "daemon", "--inactivity-timeout"])
        .arg(timeout_secs.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    match spawned {
        Ok(_) => logger.log(
            LogLevel::Info,
            format!("container daemon started (timeout {}s)", timeout_secs),
        ),
        Err(e) => logger.log(LogLevel::Warn, format!("container daemon spawn failed: {}", e)),
    }
}

/// Poll `/proc/net/tcp` and ask the host to forward newly listening
/// allow-listed ports.
fn spawn_port_poller(tunnel: Arc<Tunnel>, allow_list: Vec<u16>, root: CancellationToken) {
    tokio::spawn(async move {
        let mut forwarded: HashSet<u16> = HashSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PORT_POLL_INTERVAL) => {}
                _ = root.cancelled() => break,
            }

            let listening = match tokio::fs::read_to_string("/proc/net/tcp").await {
                Ok(content) => parse_listening_ports(&content),
                Err(_) => continue,
            };

            for port in allowed_ports(&listening, &allow_list) {
                if forwarded.contains(&port) {
                    continue;
                }
                let request = ForwardPortRequest {
                    port,
                    host_port: Some(port),
                };
                if tunnel.call(RequestKind::ForwardPort, &request).await.is_ok() {
                    forwarded.insert(port);
                }
            }

            // Ports that stopped listening are released host-side.
            let gone: Vec<u16> = forwarded
                .iter()
                .copied()
                .filter(|port| !listening.contains(port))
                .collect();
            for port in gone {
                let _ = tunnel
                    .call(
                        RequestKind::StopForwardPort,
                        &messages::StopForwardPortRequest { port },
                    )
                    .await;
                forwarded.remove(&port);
            }
        }
    });
}

fn persist_result(result: &RunResult) -> Result<()> {
    let path = PathBuf::from(RESULT_LOCATION);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::SetupFailed {
            message: format!("result location create failed: {}", e),
        })?;
    }
    let json = serde_json::to_vec_pretty(result).map_err(|e| AgentError::SetupFailed {
        message: format!("result serialization failed: {}", e),
    })?;
    std::fs::write(&path, json).map_err(|e| {
        AgentError::SetupFailed {
            message: format!("result write failed: {}", e),
        }
        .into()
    })
}

async fn current_user() -> String {
    let output = Command::new("id").arg("-un").output().await;
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => "root".to_string(),
    }
}
