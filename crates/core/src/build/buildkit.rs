//! Remote BuildKit build path
//!
//! Builds against a pre-provisioned BuildKit endpoint over mTLS and pushes
//! the result to a registry. Preconditions are validated before any work
//! starts so misconfiguration fails fast. When the target reference already
//! holds a manifest for the target architecture, the build is skipped
//! entirely.
//!
//! The solve submission is modelled as a [`SolveRequest`] handed to a
//! [`BuildkitExecutor`]; the default executor shells out to `buildctl`
//! rather than speaking the wire protocol itself.

use crate::build::{build_info_from_image, BuildInfo, BuildPlan};
use crate::container::{ContainerConfig, ImageDetails};
use crate::errors::{BuildError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Basic credentials for the target registry, resolved from the local
/// keychain before the build starts.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Configuration of the remote builder.
#[derive(Debug, Clone, Default)]
pub struct RemoteBuildConfig {
    /// BuildKit endpoint, e.g. `tcp://builder.internal:1234`
    pub endpoint: Option<String>,
    /// Target repository the image is pushed to, e.g. `registry.example.com/dev/acme`
    pub repository: Option<String>,
    /// PEM blocks for mTLS against the builder
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Refuse to build (validation-only invocations)
    pub no_build: bool,
    /// Requested by the caller but unsupported on this path
    pub skip_push: bool,
    /// Platform override; defaults to `linux/<target arch>`
    pub platform: Option<String>,
    /// Registry cache reference for cache-from/cache-to
    pub registry_cache: Option<String>,
    /// Additional named build contexts
    pub extra_contexts: BTreeMap<String, PathBuf>,
}

impl RemoteBuildConfig {
    /// Fail-fast validation of the remote path's preconditions.
    pub fn validate(&self) -> Result<()> {
        if self.no_build {
            return Err(BuildError::Precondition {
                message: "remote build requested in no-build mode".to_string(),
            }
            .into());
        }
        if self.skip_push {
            return Err(BuildError::Precondition {
                message: "remote builds must push; --skip-push is not supported".to_string(),
            }
            .into());
        }
        if self.endpoint.as_deref().unwrap_or("").is_empty() {
            return Err(BuildError::Precondition {
                message: "remote build requires a builder endpoint".to_string(),
            }
            .into());
        }
        if self.repository.as_deref().unwrap_or("").is_empty() {
            return Err(BuildError::Precondition {
                message: "remote build requires a target registry repository".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// The three builder certificates staged on disk, mode 0600, removed when
/// dropped.
#[derive(Debug)]
pub struct StagedCerts {
    dir: tempfile::TempDir,
}

impl StagedCerts {
    /// Write CA, client cert, and key into a fresh temp directory.
    pub fn write(config: &RemoteBuildConfig) -> Result<Self> {
        let dir = tempfile::TempDir::new().map_err(BuildError::from)?;
        for (name, bytes) in [
            ("ca.pem", &config.ca_pem),
            ("cert.pem", &config.cert_pem),
            ("key.pem", &config.key_pem),
        ] {
            crate::build::write_file_restricted(&dir.path().join(name), bytes)?;
        }
        Ok(Self { dir })
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.path().join("cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.path().join("key.pem")
    }
}

/// A fully assembled solve submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveRequest {
    /// Always `dockerfile.v0`
    pub frontend: String,
    /// Frontend attributes: `filename`, `target`, `platform`,
    /// `label:K`, `build-arg:K`, `context:NAME`
    pub frontend_attrs: BTreeMap<String, String>,
    /// Local mounts by name; `dockerfile` and `context` always present
    pub local_mounts: BTreeMap<String, PathBuf>,
    /// Import-cache references
    pub cache_from: Vec<String>,
    /// Export-cache reference
    pub cache_to: Option<String>,
    /// Image export: target reference, push enabled
    pub export_image: String,
    pub export_push: bool,
}

/// Assemble the solve request for a prepared plan.
///
/// Multi-context names that collide with the reserved `context`/`dockerfile`
/// mounts are prefixed with `_`.
pub fn assemble_solve_request(
    plan: &BuildPlan,
    config: &RemoteBuildConfig,
    architecture: &str,
) -> SolveRequest {
    let mut frontend_attrs = BTreeMap::new();
    frontend_attrs.insert(
        "filename".to_string(),
        plan.dockerfile_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Dockerfile".to_string()),
    );
    frontend_attrs.insert("target".to_string(), plan.target.clone());
    frontend_attrs.insert(
        "platform".to_string(),
        config
            .platform
            .clone()
            .unwrap_or_else(|| format!("linux/{}", architecture)),
    );
    for (key, value) in &plan.labels {
        frontend_attrs.insert(format!("label:{}", key), value.clone());
    }
    for (key, value) in &plan.build_args {
        frontend_attrs.insert(format!("build-arg:{}", key), value.clone());
    }

    let mut local_mounts = BTreeMap::new();
    local_mounts.insert(
        "dockerfile".to_string(),
        plan.dockerfile_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    );
    local_mounts.insert("context".to_string(), plan.context_dir.clone());
    for (name, path) in &config.extra_contexts {
        let mount_name = if name == "context" || name == "dockerfile" {
            format!("_{}", name)
        } else {
            name.clone()
        };
        frontend_attrs.insert(
            format!("context:{}", mount_name),
            format!("local:{}", mount_name),
        );
        local_mounts.insert(mount_name, path.clone());
    }

    let cache_from = config
        .registry_cache
        .iter()
        .map(|cache| format!("type=registry,ref={}", cache))
        .collect();
    let cache_to = config
        .registry_cache
        .as_ref()
        .map(|cache| format!("type=registry,ref={},mode=max", cache));

    SolveRequest {
        frontend: "dockerfile.v0".to_string(),
        frontend_attrs,
        local_mounts,
        cache_from,
        cache_to,
        export_image: remote_reference(config, plan),
        export_push: true,
    }
}

/// The fully qualified target reference: `<repository>:<prebuild hash>`.
pub fn remote_reference(config: &RemoteBuildConfig, plan: &BuildPlan) -> String {
    format!(
        "{}:{}",
        config.repository.as_deref().unwrap_or_default(),
        plan.prebuild_hash
    )
}

/// Existing-manifest probe against the target registry.
#[async_trait]
pub trait RegistryProbe: Send + Sync {
    /// Digest of an existing manifest matching `architecture`, when present.
    async fn manifest_digest(&self, reference: &str, architecture: &str)
        -> Result<Option<String>>;

    /// Verify the authenticated user may push to the repository.
    async fn check_push_permission(&self, reference: &str) -> Result<()>;
}

/// Submits solve requests to the builder.
#[async_trait]
pub trait BuildkitExecutor: Send + Sync {
    async fn solve(&self, request: &SolveRequest, certs: &StagedCerts) -> Result<()>;
}

/// `buildctl`-based executor: drives the remote builder through its CLI
/// instead of speaking the gRPC wire protocol.
#[derive(Debug, Clone)]
pub struct BuildctlCli {
    endpoint: String,
    buildctl_path: String,
}

impl BuildctlCli {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            buildctl_path: "buildctl".to_string(),
        }
    }

    /// Plan the buildctl argv for a solve request.
    pub fn plan(&self, request: &SolveRequest, certs: &StagedCerts) -> Vec<String> {
        let mut args = vec![
            "--addr".to_string(),
            self.endpoint.clone(),
            "--tlscacert".to_string(),
            certs.ca_path().display().to_string(),
            "--tlscert".to_string(),
            certs.cert_path().display().to_string(),
            "--tlskey".to_string(),
            certs.key_path().display().to_string(),
            "build".to_string(),
            "--frontend".to_string(),
            request.frontend.clone(),
        ];
        for (name, path) in &request.local_mounts {
            args.push("--local".to_string());
            args.push(format!("{}={}", name, path.display()));
        }
        for (key, value) in &request.frontend_attrs {
            args.push("--opt".to_string());
            args.push(format!("{}={}", key, value));
        }
        for cache in &request.cache_from {
            args.push("--import-cache".to_string());
            args.push(cache.clone());
        }
        if let Some(cache_to) = &request.cache_to {
            args.push("--export-cache".to_string());
            args.push(cache_to.clone());
        }
        args.push("--output".to_string());
        args.push(format!(
            "type=image,name={},push={}",
            request.export_image, request.export_push
        ));
        args
    }
}

#[async_trait]
impl BuildkitExecutor for BuildctlCli {
    async fn solve(&self, request: &SolveRequest, certs: &StagedCerts) -> Result<()> {
        let args = self.plan(request, certs);
        debug!(endpoint = %self.endpoint, "submitting solve via buildctl");
        let output = tokio::process::Command::new(&self.buildctl_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| BuildError::Failed {
                message: format!("failed to run buildctl: {}", e),
            })?;
        if !output.status.success() {
            return Err(BuildError::Failed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Registry probe over the OCI distribution HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRegistryProbe {
    client: reqwest::Client,
    auth: Option<RegistryAuth>,
}

impl HttpRegistryProbe {
    pub fn new(auth: Option<RegistryAuth>) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => builder.basic_auth(&auth.username, Some(&auth.password)),
            None => builder,
        }
    }
}

/// Split `host/repo:tag` into its API components.
fn split_reference(reference: &str) -> Result<(String, String, String)> {
    let (rest, tag) = match reference.rsplit_once(':') {
        // A colon inside the last path segment is the tag separator; a colon
        // before any slash belongs to the registry port.
        Some((rest, tag)) if !tag.contains('/') => (rest, tag.to_string()),
        _ => (reference, "latest".to_string()),
    };
    let (registry, repository) = rest.split_once('/').ok_or_else(|| BuildError::Precondition {
        message: format!("reference '{}' has no registry host", reference),
    })?;
    Ok((registry.to_string(), repository.to_string(), tag))
}

#[async_trait]
impl RegistryProbe for HttpRegistryProbe {
    #[instrument(skip(self))]
    async fn manifest_digest(
        &self,
        reference: &str,
        architecture: &str,
    ) -> Result<Option<String>> {
        let (registry, repository, tag) = split_reference(reference)?;
        let url = format!("https://{}/v2/{}/manifests/{}", registry, repository, tag);

        let response = self
            .request(self.client.get(&url).header(
                "Accept",
                "application/vnd.oci.image.index.v1+json, \
                 application/vnd.docker.distribution.manifest.list.v2+json, \
                 application/vnd.docker.distribution.manifest.v2+json, \
                 application/vnd.oci.image.manifest.v1+json",
            ))
            .send()
            .await
            .map_err(|e| BuildError::Failed {
                message: format!("registry request failed: {}", e),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BuildError::Failed {
                message: format!("registry returned {} for {}", response.status(), url),
            }
            .into());
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body: serde_json::Value = response.json().await.map_err(|e| BuildError::Failed {
            message: format!("registry manifest parse failed: {}", e),
        })?;

        // Manifest lists carry per-arch entries; single manifests are
        // accepted as matching (arch lives in the config blob).
        if let Some(manifests) = body.get("manifests").and_then(|m| m.as_array()) {
            let matching = manifests.iter().find(|entry| {
                entry
                    .pointer("/platform/architecture")
                    .and_then(|a| a.as_str())
                    == Some(architecture)
            });
            return Ok(matching
                .and_then(|entry| entry.get("digest"))
                .and_then(|d| d.as_str())
                .map(String::from));
        }

        Ok(digest.or(Some(format!("{}@{}", repository, tag))))
    }

    #[instrument(skip(self))]
    async fn check_push_permission(&self, reference: &str) -> Result<()> {
        let (registry, repository, _) = split_reference(reference)?;
        let url = format!("https://{}/v2/{}/blobs/uploads/", registry, repository);

        let response =
            self.request(self.client.post(&url))
                .send()
                .await
                .map_err(|e| BuildError::Failed {
                    message: format!("registry push probe failed: {}", e),
                })?;

        match response.status() {
            reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::CREATED => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(BuildError::PushDenied {
                    reference: reference.to_string(),
                    message: format!("registry returned {}", response.status()),
                }
                .into())
            }
            other => Err(BuildError::Failed {
                message: format!("unexpected registry response {} for {}", other, url),
            }
            .into()),
        }
    }
}

/// Execute the remote build path end to end.
#[instrument(skip_all, fields(repository = config.repository.as_deref().unwrap_or("")))]
pub async fn remote_build(
    plan: &BuildPlan,
    config: &RemoteBuildConfig,
    architecture: &str,
    registry: &dyn RegistryProbe,
    executor: &dyn BuildkitExecutor,
) -> Result<BuildInfo> {
    config.validate()?;

    let reference = remote_reference(config, plan);

    // Skip when the registry already holds this prebuild for our arch.
    if let Some(digest) = registry.manifest_digest(&reference, architecture).await? {
        info!(reference = %reference, digest = %digest, "remote image present, skipping solve");
        let details = ImageDetails {
            id: digest,
            config: ContainerConfig::default(),
            architecture: architecture.to_string(),
        };
        return Ok(remote_build_info(plan, &reference, details, true, config));
    }

    registry.check_push_permission(&reference).await?;

    let certs = StagedCerts::write(config)?;
    let request = assemble_solve_request(plan, config, architecture);
    executor.solve(&request, &certs).await?;

    let digest = registry
        .manifest_digest(&reference, architecture)
        .await?
        .unwrap_or_else(|| {
            warn!("pushed image not yet visible in registry, recording tag only");
            reference.clone()
        });
    let details = ImageDetails {
        id: digest,
        config: ContainerConfig::default(),
        architecture: architecture.to_string(),
    };
    Ok(remote_build_info(plan, &reference, details, false, config))
}

fn remote_build_info(
    plan: &BuildPlan,
    reference: &str,
    details: ImageDetails,
    skipped: bool,
    config: &RemoteBuildConfig,
) -> BuildInfo {
    let mut info = build_info_from_image(plan, details, skipped, config.registry_cache.clone());
    info.image_ref = reference.to_string();
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildPlan;

    fn test_plan() -> BuildPlan {
        BuildPlan {
            dockerfile_content: "FROM alpine AS s\n".to_string(),
            dockerfile_path: PathBuf::from("/stage/Dockerfile.extended"),
            context_dir: PathBuf::from("/src"),
            target: "s".to_string(),
            build_args: vec![("A".to_string(), "1".to_string())],
            labels: vec![("devcontainer.metadata".to_string(), "[]".to_string())],
            prebuild_hash: "cafebabe".to_string(),
            tags: vec!["gantry:cafebabe-ws".to_string()],
            overlay: None,
            features: Vec::new(),
        }
    }

    fn remote_config() -> RemoteBuildConfig {
        RemoteBuildConfig {
            endpoint: Some("tcp://builder:1234".to_string()),
            repository: Some("registry.example.com/dev/acme".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn validation_fails_fast() {
        let mut config = remote_config();
        config.no_build = true;
        assert!(config.validate().is_err());

        let mut config = remote_config();
        config.skip_push = true;
        assert!(config.validate().is_err());

        let mut config = remote_config();
        config.endpoint = None;
        assert!(config.validate().is_err());

        let mut config = remote_config();
        config.repository = None;
        assert!(config.validate().is_err());

        assert!(remote_config().validate().is_ok());
    }

    #[test]
    fn solve_request_carries_frontend_attrs() {
        let request = assemble_solve_request(&test_plan(), &remote_config(), "amd64");
        assert_eq!(request.frontend, "dockerfile.v0");
        assert_eq!(
            request.frontend_attrs.get("platform").unwrap(),
            "linux/amd64"
        );
        assert_eq!(request.frontend_attrs.get("target").unwrap(), "s");
        assert_eq!(request.frontend_attrs.get("build-arg:A").unwrap(), "1");
        assert_eq!(
            request.frontend_attrs.get("label:devcontainer.metadata").unwrap(),
            "[]"
        );
        assert_eq!(
            request.local_mounts.get("context").unwrap(),
            &PathBuf::from("/src")
        );
        assert_eq!(
            request.local_mounts.get("dockerfile").unwrap(),
            &PathBuf::from("/stage")
        );
        assert!(request.export_push);
        assert_eq!(request.export_image, "registry.example.com/dev/acme:cafebabe");
    }

    #[test]
    fn colliding_context_names_are_prefixed() {
        let mut config = remote_config();
        config
            .extra_contexts
            .insert("context".to_string(), PathBuf::from("/other"));
        let request = assemble_solve_request(&test_plan(), &config, "amd64");
        assert_eq!(
            request.local_mounts.get("_context").unwrap(),
            &PathBuf::from("/other")
        );
        assert_eq!(
            request.local_mounts.get("context").unwrap(),
            &PathBuf::from("/src")
        );
    }

    #[test]
    fn platform_override_is_respected() {
        let mut config = remote_config();
        config.platform = Some("linux/arm64/v8".to_string());
        let request = assemble_solve_request(&test_plan(), &config, "amd64");
        assert_eq!(
            request.frontend_attrs.get("platform").unwrap(),
            "linux/arm64/v8"
        );
    }

    #[test]
    fn registry_cache_maps_to_cache_attrs() {
        let mut config = remote_config();
        config.registry_cache = Some("registry.example.com/cache/acme".to_string());
        let request = assemble_solve_request(&test_plan(), &config, "amd64");
        assert_eq!(
            request.cache_from,
            vec!["type=registry,ref=registry.example.com/cache/acme".to_string()]
        );
        assert_eq!(
            request.cache_to.as_deref(),
            Some("type=registry,ref=registry.example.com/cache/acme,mode=max")
        );
    }

    #[test]
    fn split_reference_handles_ports_and_tags() {
        let (registry, repo, tag) =
            split_reference("registry.example.com:5000/dev/acme:abc").unwrap();
        assert_eq!(registry, "registry.example.com:5000");
        assert_eq!(repo, "dev/acme");
        assert_eq!(tag, "abc");

        let (_, _, tag) = split_reference("registry.example.com/dev/acme").unwrap();
        assert_eq!(tag, "latest");
    }

    struct StubProbe {
        existing_digest: Option<String>,
        push_allowed: bool,
    }

    #[async_trait]
    impl RegistryProbe for StubProbe {
        async fn manifest_digest(
            &self,
            _reference: &str,
            _architecture: &str,
        ) -> Result<Option<String>> {
            Ok(self.existing_digest.clone())
        }

        async fn check_push_permission(&self, reference: &str) -> Result<()> {
            if self.push_allowed {
                Ok(())
            } else {
                Err(BuildError::PushDenied {
                    reference: reference.to_string(),
                    message: "denied".to_string(),
                }
                .into())
            }
        }
    }

    struct CountingExecutor {
        solves: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BuildkitExecutor for CountingExecutor {
        async fn solve(&self, _request: &SolveRequest, _certs: &StagedCerts) -> Result<()> {
            self.solves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn existing_manifest_skips_solve() {
        let probe = StubProbe {
            existing_digest: Some("sha256:deadbeef".to_string()),
            push_allowed: true,
        };
        let executor = CountingExecutor {
            solves: std::sync::atomic::AtomicUsize::new(0),
        };

        let info = remote_build(&test_plan(), &remote_config(), "amd64", &probe, &executor)
            .await
            .unwrap();
        assert!(info.skipped);
        assert_eq!(info.image_details.id, "sha256:deadbeef");
        assert_eq!(executor.solves.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_manifest_solves_and_pushes() {
        let probe = StubProbe {
            existing_digest: None,
            push_allowed: true,
        };
        let executor = CountingExecutor {
            solves: std::sync::atomic::AtomicUsize::new(0),
        };

        let info = remote_build(&test_plan(), &remote_config(), "amd64", &probe, &executor)
            .await
            .unwrap();
        assert!(!info.skipped);
        assert_eq!(executor.solves.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(info.image_ref, "registry.example.com/dev/acme:cafebabe");
    }

    #[tokio::test]
    async fn denied_push_aborts_before_solve() {
        let probe = StubProbe {
            existing_digest: None,
            push_allowed: false,
        };
        let executor = CountingExecutor {
            solves: std::sync::atomic::AtomicUsize::new(0),
        };

        let err = remote_build(&test_plan(), &remote_config(), "amd64", &probe, &executor)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Push denied"));
        assert_eq!(executor.solves.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn staged_certs_are_restricted_and_removed() {
        let config = RemoteBuildConfig {
            ca_pem: b"ca".to_vec(),
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
            ..remote_config()
        };
        let certs = StagedCerts::write(&config).unwrap();
        let ca_path = certs.ca_path();
        assert!(ca_path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&ca_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        drop(certs);
        assert!(!ca_path.exists());
    }
}
