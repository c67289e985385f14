//! Host-side credentials relay
//!
//! Serves the in-container agent's credential callbacks. Git lookups shell
//! out to the local `git credential` helper chain; docker registry lookups
//! walk a keychain composed, in order, of: in-cluster Kubernetes (when a
//! service-account token is mounted), GCP, AWS ECR, Azure ACR (when
//! `AZURE_CLIENT_ID` and `AZURE_TENANT_ID` are set), and finally the
//! file-based docker config.

use crate::errors::{Result, TunnelError};
use crate::tunnel::messages::{
    DockerCredentialsRequest, DockerCredentialsResponse, GitCredentialsRequest,
    GitCredentialsResponse, GitUser,
};
use base64::Engine;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Mounted service-account token marking an in-cluster environment.
const K8S_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
/// Mounted image pull secret, docker config format.
const K8S_PULL_SECRET_PATH: &str = "/var/run/secrets/kubernetes.io/dockerconfigjson/.dockerconfigjson";

/// Git identity from the local configuration.
#[instrument]
pub async fn git_user() -> Result<GitUser> {
    let name = git_config_value("user.name").await;
    let email = git_config_value("user.email").await;
    Ok(GitUser { name, email })
}

async fn git_config_value(key: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["config", "--get", key])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Resolve git credentials through the local helper chain
/// (`git credential fill`).
#[instrument(skip_all, fields(host = %request.host))]
pub async fn git_credentials(
    request: &GitCredentialsRequest,
) -> Result<GitCredentialsResponse> {
    let mut child = Command::new("git")
        .args(["credential", "fill"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TunnelError::Transport {
            message: format!("failed to run git credential: {}", e),
        })?;

    let mut input = format!(
        "protocol={}\nhost={}\n",
        request.protocol, request.host
    );
    if let Some(path) = &request.path {
        input.push_str(&format!("path={}\n", path));
    }
    input.push('\n');

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("git credential stdin failed: {}", e),
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| TunnelError::Transport {
            message: format!("git credential failed: {}", e),
        })?;
    if !output.status.success() {
        debug!("git credential fill returned no credentials");
        return Ok(GitCredentialsResponse::default());
    }

    let parsed = parse_credential_output(&String::from_utf8_lossy(&output.stdout));
    Ok(GitCredentialsResponse {
        username: parsed.get("username").cloned(),
        password: parsed.get("password").cloned(),
    })
}

/// Parse `key=value` lines of the git-credential wire format.
fn parse_credential_output(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// One source of the docker keychain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainSource {
    Kubernetes,
    Gcp,
    AwsEcr,
    AzureAcr,
    DockerConfig,
}

/// The composed docker keychain, walked in order until a source yields
/// credentials for the registry.
#[derive(Debug, Clone)]
pub struct DockerKeychain {
    sources: Vec<KeychainSource>,
    docker_config_path: Option<PathBuf>,
}

impl Default for DockerKeychain {
    fn default() -> Self {
        Self {
            sources: vec![
                KeychainSource::Kubernetes,
                KeychainSource::Gcp,
                KeychainSource::AwsEcr,
                KeychainSource::AzureAcr,
                KeychainSource::DockerConfig,
            ],
            docker_config_path: None,
        }
    }
}

impl DockerKeychain {
    /// Keychain reading the docker config from an explicit path (tests).
    pub fn with_docker_config_path(mut self, path: PathBuf) -> Self {
        self.docker_config_path = Some(path);
        self
    }

    /// Resolve credentials for a registry; `None` when no source matches.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        request: &DockerCredentialsRequest,
    ) -> Result<Option<DockerCredentialsResponse>> {
        for source in &self.sources {
            let result = match source {
                KeychainSource::Kubernetes => self.lookup_kubernetes(&request.registry),
                KeychainSource::Gcp => self.lookup_gcp(&request.registry).await,
                KeychainSource::AwsEcr => self.lookup_aws_ecr(&request.registry).await,
                KeychainSource::AzureAcr => self.lookup_azure_acr(&request.registry).await,
                KeychainSource::DockerConfig => self.lookup_docker_config(&request.registry),
            };
            match result {
                Some(credentials) => {
                    debug!(source = ?source, registry = %request.registry, "keychain hit");
                    return Ok(Some(credentials));
                }
                None => continue,
            }
        }
        Ok(None)
    }

    /// In-cluster pull secret, only consulted when the service-account
    /// token is mounted.
    fn lookup_kubernetes(&self, registry: &str) -> Option<DockerCredentialsResponse> {
        if !PathBuf::from(K8S_TOKEN_PATH).exists() {
            return None;
        }
        lookup_in_docker_config(&PathBuf::from(K8S_PULL_SECRET_PATH), registry)
    }

    async fn lookup_gcp(&self, registry: &str) -> Option<DockerCredentialsResponse> {
        if !registry.ends_with("gcr.io") && !registry.ends_with("pkg.dev") {
            return None;
        }
        let token = capture_stdout("gcloud", &["auth", "print-access-token"]).await?;
        Some(DockerCredentialsResponse {
            username: Some("oauth2accesstoken".to_string()),
            secret: Some(token),
        })
    }

    async fn lookup_aws_ecr(&self, registry: &str) -> Option<DockerCredentialsResponse> {
        if !registry.ends_with(".amazonaws.com") {
            return None;
        }
        let password = capture_stdout("aws", &["ecr", "get-login-password"]).await?;
        Some(DockerCredentialsResponse {
            username: Some("AWS".to_string()),
            secret: Some(password),
        })
    }

    async fn lookup_azure_acr(&self, registry: &str) -> Option<DockerCredentialsResponse> {
        if std::env::var("AZURE_CLIENT_ID").is_err() || std::env::var("AZURE_TENANT_ID").is_err()
        {
            return None;
        }
        if !registry.ends_with(".azurecr.io") {
            return None;
        }
        let name = registry.trim_end_matches(".azurecr.io");
        let token = capture_stdout(
            "az",
            &[
                "acr",
                "login",
                "--name",
                name,
                "--expose-token",
                "--output",
                "tsv",
                "--query",
                "accessToken",
            ],
        )
        .await?;
        Some(DockerCredentialsResponse {
            // ACR token exchange uses the well-known null GUID user.
            username: Some("00000000-0000-0000-0000-000000000000".to_string()),
            secret: Some(token),
        })
    }

    fn lookup_docker_config(&self, registry: &str) -> Option<DockerCredentialsResponse> {
        let path = self
            .docker_config_path
            .clone()
            .or_else(default_docker_config_path)?;
        lookup_in_docker_config(&path, registry)
    }
}

fn default_docker_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".docker").join("config.json"))
}

/// Read an `auths` entry from a docker config file; `auth` is
/// base64(`user:pass`).
fn lookup_in_docker_config(path: &PathBuf, registry: &str) -> Option<DockerCredentialsResponse> {
    let content = std::fs::read_to_string(path).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content).ok()?;
    let auths = config.get("auths")?.as_object()?;

    let entry = auths.get(registry).or_else(|| {
        auths
            .iter()
            .find(|(key, _)| {
                key.trim_start_matches("https://")
                    .trim_end_matches('/')
                    .eq_ignore_ascii_case(registry)
            })
            .map(|(_, value)| value)
    })?;

    if let Some(auth) = entry.get("auth").and_then(|a| a.as_str()) {
        let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        return Some(DockerCredentialsResponse {
            username: Some(username.to_string()),
            secret: Some(password.to_string()),
        });
    }

    let username = entry.get("username").and_then(|u| u.as_str())?;
    let password = entry.get("password").and_then(|p| p.as_str())?;
    Some(DockerCredentialsResponse {
        username: Some(username.to_string()),
        secret: Some(password.to_string()),
    })
}

/// A long-lived background SSH connection holding the SSH agent alive.
///
/// IDEs that reuse `SSH_AUTH_SOCK` need the agent socket to stay valid for
/// the whole session; the backhaul pins it by keeping one connection open.
/// Other services read the socket path from [`Backhaul::auth_sock`].
pub struct Backhaul {
    child: tokio::process::Child,
    auth_sock: Option<String>,
}

impl Backhaul {
    /// The ssh invocation used for the backhaul: no remote command, batch
    /// mode so it never prompts.
    pub fn ssh_argv(host: &str) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            host.to_string(),
        ]
    }

    /// Spawn the backhaul process, snapshotting the agent socket path.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| TunnelError::Transport {
            message: "backhaul command is empty".to_string(),
        })?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Transport {
                message: format!("backhaul spawn failed: {}", e),
            })?;
        Ok(Self {
            child,
            auth_sock: std::env::var("SSH_AUTH_SOCK").ok(),
        })
    }

    /// The agent socket this backhaul keeps alive, when one is present.
    pub fn auth_sock(&self) -> Option<&str> {
        self.auth_sock.as_deref()
    }

    /// Whether the connection is still up.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the backhaul.
    pub async fn close(mut self) {
        let _ = self.child.kill().await;
    }
}

async fn capture_stdout(binary: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(binary)
        .args(args)
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        warn!(binary, "keychain helper returned non-zero, trying next source");
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_credential_wire_format() {
        let parsed = parse_credential_output("username=dev\npassword=hunter2\n");
        assert_eq!(parsed.get("username").unwrap(), "dev");
        assert_eq!(parsed.get("password").unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn docker_config_auth_entry_is_decoded() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.json");
        let auth = base64::engine::general_purpose::STANDARD.encode("dev:hunter2");
        std::fs::write(
            &config_path,
            serde_json::json!({"auths": {"registry.example.com": {"auth": auth}}}).to_string(),
        )
        .unwrap();

        let keychain = DockerKeychain::default().with_docker_config_path(config_path);
        let credentials = keychain
            .resolve(&DockerCredentialsRequest {
                registry: "registry.example.com".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credentials.username.as_deref(), Some("dev"));
        assert_eq!(credentials.secret.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn docker_config_matches_https_prefixed_keys() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            serde_json::json!({"auths": {"https://index.example.com/": {
                "username": "u", "password": "p"
            }}})
            .to_string(),
        )
        .unwrap();

        let keychain = DockerKeychain::default().with_docker_config_path(config_path);
        let credentials = keychain
            .resolve(&DockerCredentialsRequest {
                registry: "index.example.com".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credentials.username.as_deref(), Some("u"));
    }

    #[test]
    fn backhaul_argv_is_batch_and_command_free() {
        let argv = Backhaul::ssh_argv("dev.example.com");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-N".to_string()));
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert_eq!(argv.last().unwrap(), "dev.example.com");
    }

    #[tokio::test]
    async fn backhaul_tracks_process_liveness() {
        let mut backhaul = Backhaul::spawn(&["sleep".to_string(), "30".to_string()]).unwrap();
        assert!(backhaul.is_alive());
        backhaul.close().await;
    }

    #[tokio::test]
    async fn unknown_registry_resolves_none() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"auths": {}}"#).unwrap();

        let keychain = DockerKeychain::default().with_docker_config_path(config_path);
        let result = keychain
            .resolve(&DockerCredentialsRequest {
                registry: "nowhere.example.com".to_string(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
