//! The `build` command: produce the workspace image without starting it.

use anyhow::{Context, Result};
use clap::Args;
use gantry_core::build;
use gantry_core::config::ConfigLoader;
use gantry_core::driver::DockerCli;
use gantry_core::run::RunController;
use gantry_core::variable::{SubstitutionContext, SubstitutionReport};
use gantry_core::workspace::CliOverrides;
use std::path::PathBuf;

use super::shared;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Workspace folder holding the devcontainer configuration
    pub workspace: PathBuf,

    /// Additional build arguments (KEY=VALUE, repeatable)
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Additional image tags
    #[arg(long)]
    pub tag: Vec<String>,

    /// Directory of local feature payloads
    #[arg(long)]
    pub features_dir: Option<PathBuf>,

    /// Remote BuildKit endpoint (tcp://host:port); enables the remote path
    #[arg(long)]
    pub builder_endpoint: Option<String>,

    /// Repository the remote build pushes to
    #[arg(long)]
    pub push_repository: Option<String>,

    /// Platform override for the remote build (e.g. linux/arm64)
    #[arg(long)]
    pub platform: Option<String>,

    /// mTLS CA certificate for the remote builder
    #[arg(long)]
    pub builder_ca: Option<PathBuf>,

    /// mTLS client certificate for the remote builder
    #[arg(long)]
    pub builder_cert: Option<PathBuf>,

    /// mTLS client key for the remote builder
    #[arg(long)]
    pub builder_key: Option<PathBuf>,

    /// Registry reference used as remote build cache
    #[arg(long)]
    pub registry_cache: Option<String>,
}

pub async fn execute(args: BuildArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let _layout = shared::layout(data_dir)?;
    let config_path = RunController::find_config_path(&args.workspace)?;
    let raw_config = ConfigLoader::load_from_path(&config_path)?;

    if raw_config.is_compose() {
        anyhow::bail!("compose configurations build through `up`");
    }

    let overrides = CliOverrides {
        build_args: shared::parse_key_values(&args.build_arg),
        tags: args.tag.clone(),
        ..Default::default()
    };
    let descriptor = shared::descriptor(&args.workspace, false, overrides)?;
    let catalog = shared::catalog(&config_path, args.features_dir.clone());

    let context = SubstitutionContext::new(&args.workspace, &config_path)?;
    let mut report = SubstitutionReport::new();
    let config = ConfigLoader::substitute(&raw_config, &context, &mut report)?;

    let docker = DockerCli::new();
    let base_digest = match config.image.as_ref() {
        Some(image) => docker
            .inspect_image(image)
            .await
            .map(|details| details.id)
            .unwrap_or_default(),
        None => String::new(),
    };

    let staging = tempfile::TempDir::new().context("creating build staging directory")?;
    let plan = build::prepare_build_plan(
        &config,
        &descriptor,
        &catalog,
        &base_digest,
        staging.path(),
    )?;

    let info = match &args.builder_endpoint {
        Some(endpoint) => remote_build(&args, endpoint, &plan).await?,
        None => build::local_build(&docker, &plan).await?,
    };

    println!(
        "{}",
        serde_json::json!({
            "imageRef": info.image_ref,
            "prebuildHash": info.prebuild_hash,
            "skipped": info.skipped,
            "tags": info.tags,
        })
    );
    Ok(())
}

async fn remote_build(
    args: &BuildArgs,
    endpoint: &str,
    plan: &build::BuildPlan,
) -> Result<build::BuildInfo> {
    use gantry_core::build::buildkit::{
        self, BuildctlCli, HttpRegistryProbe, RegistryAuth, RemoteBuildConfig,
    };
    use gantry_core::credentials::DockerKeychain;
    use gantry_core::tunnel::messages::DockerCredentialsRequest;

    let read_pem = |path: &Option<PathBuf>| -> Result<Vec<u8>> {
        match path {
            Some(path) => {
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
            None => Ok(Vec::new()),
        }
    };

    let config = RemoteBuildConfig {
        endpoint: Some(endpoint.to_string()),
        repository: args.push_repository.clone(),
        ca_pem: read_pem(&args.builder_ca)?,
        cert_pem: read_pem(&args.builder_cert)?,
        key_pem: read_pem(&args.builder_key)?,
        platform: args.platform.clone(),
        registry_cache: args.registry_cache.clone(),
        ..Default::default()
    };

    // Registry auth comes from the local keychain when it knows the host.
    let auth = match args
        .push_repository
        .as_deref()
        .and_then(|repo| repo.split('/').next())
    {
        Some(registry) => DockerKeychain::default()
            .resolve(&DockerCredentialsRequest {
                registry: registry.to_string(),
            })
            .await?
            .and_then(|credentials| {
                Some(RegistryAuth {
                    username: credentials.username?,
                    password: credentials.secret?,
                })
            }),
        None => None,
    };

    let architecture = std::env::consts::ARCH;
    let architecture = match architecture {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    let probe = HttpRegistryProbe::new(auth);
    let executor = BuildctlCli::new(endpoint);
    let info = buildkit::remote_build(plan, &config, architecture, &probe, &executor).await?;
    Ok(info)
}
