//! Workspaces and the persisted on-disk layout
//!
//! A [`WorkspaceDescriptor`] is the immutable per-run identity: where the
//! source comes from, which driver runs it, the target architecture, and the
//! CLI overrides. The [`WorkspaceLayout`] owns the per-user data directory:
//! one folder per workspace id holding `workspace.json` and the last
//! `result.json`, an agent binaries directory, and a `.docker-compose`
//! folder per workspace for generated override files.

use crate::config::DevContainerConfig;
use crate::container::ContainerDetails;
use crate::errors::{ConfigError, GantryError, Result};
use crate::merge::MergedDevContainerConfig;
use crate::variable::SubstitutionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Where the workspace content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum WorkspaceSource {
    /// A folder on the local machine
    LocalFolder { path: PathBuf },
    /// A git repository cloned into the container
    GitRepository {
        url: String,
        #[serde(default)]
        branch: Option<String>,
    },
    /// A container image used as-is
    Image { reference: String },
}

impl WorkspaceSource {
    /// Stable textual form used for id derivation.
    fn canonical_string(&self) -> String {
        match self {
            WorkspaceSource::LocalFolder { path } => {
                format!("local:{}", path.display())
            }
            WorkspaceSource::GitRepository { url, branch } => match branch {
                Some(branch) => format!("git:{}@{}", url, branch),
                None => format!("git:{}", url),
            },
            WorkspaceSource::Image { reference } => format!("image:{}", reference),
        }
    }

    /// Human-readable stem for the workspace id.
    fn name_stem(&self) -> String {
        let raw = match self {
            WorkspaceSource::LocalFolder { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "workspace".to_string()),
            WorkspaceSource::GitRepository { url, .. } => url
                .trim_end_matches(".git")
                .rsplit('/')
                .next()
                .unwrap_or("repo")
                .to_string(),
            WorkspaceSource::Image { reference } => reference
                .split(['/', ':'])
                .next_back()
                .unwrap_or("image")
                .to_string(),
        };
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    }
}

/// Which backend runs the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Docker,
    Compose,
    Remote,
}

/// User-supplied overrides for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliOverrides {
    /// Replace the configured image
    pub image: Option<String>,
    /// Replace the configured Dockerfile path
    pub dockerfile_path: Option<PathBuf>,
    /// Additional build arguments
    pub build_args: HashMap<String, String>,
    /// Delete and rebuild the container
    pub recreate: bool,
    /// Recreate and additionally wipe workspace content
    pub reset: bool,
    /// Environment entries injected into the container (KEY=VALUE)
    pub env: Vec<String>,
    /// Init-env overrides for `${localEnv:...}` resolution
    pub init_env: HashMap<String, String>,
    /// Additional image tags applied to builds
    pub tags: Vec<String>,
}

/// Immutable identity of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDescriptor {
    /// Stable workspace id, derived from the source
    pub id: String,
    /// Where the content comes from
    pub source: WorkspaceSource,
    /// Backend driver
    pub driver: DriverKind,
    /// Target platform architecture (`amd64`, `arm64`)
    pub target_architecture: Option<String>,
    /// CLI overrides for this run
    pub overrides: CliOverrides,
}

impl WorkspaceDescriptor {
    /// Build a descriptor, deriving the id from the source.
    pub fn new(source: WorkspaceSource, driver: DriverKind) -> Self {
        let id = derive_workspace_id(&source);
        Self {
            id,
            source,
            driver,
            target_architecture: None,
            overrides: CliOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: CliOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_target_architecture(mut self, arch: impl Into<String>) -> Self {
        self.target_architecture = Some(arch.into());
        self
    }

    /// The local source folder, when the source is local.
    pub fn local_folder(&self) -> Option<&Path> {
        match &self.source {
            WorkspaceSource::LocalFolder { path } => Some(path),
            _ => None,
        }
    }
}

/// Derive a stable workspace id: sanitized name stem plus a short hash of
/// the canonical source string.
pub fn derive_workspace_id(source: &WorkspaceSource) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.canonical_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", source.name_stem(), hex)
}

/// Output of a successful run, persisted as the workspace's `result.json`
/// and mirrored to the in-container result location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// The substituted configuration, including its origin path
    pub config: DevContainerConfig,
    /// The effective merged configuration
    pub merged_config: MergedDevContainerConfig,
    /// The substitution context the run used
    pub substitution_context: SubstitutionContext,
    /// The live container at the end of the run
    pub container: ContainerDetails,
    /// Workspace folder inside the container
    pub workspace_folder: String,
    /// Effective in-container user
    pub remote_user: String,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
}

/// Persisted workspace record (`workspace.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub descriptor: WorkspaceDescriptor,
    /// Container id of the last run, when known
    #[serde(default)]
    pub last_container_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The per-user on-disk layout.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    /// Layout under the user's platform data directory.
    pub fn default_location() -> Result<Self> {
        let dirs = directories_next::ProjectDirs::from("dev", "gantry", "gantry").ok_or_else(
            || GantryError::Internal {
                message: "could not determine user data directory".to_string(),
            },
        )?;
        Ok(Self::new(dirs.data_dir().to_path_buf()))
    }

    /// Layout rooted at an explicit directory (tests, `--data-dir`).
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder for one workspace id.
    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.root.join("workspaces").join(workspace_id)
    }

    /// `workspace.json` for a workspace.
    pub fn workspace_config_path(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("workspace.json")
    }

    /// `machine.json` for a workspace, when a remote machine is attached.
    pub fn machine_config_path(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("machine.json")
    }

    /// Last run's `result.json` for a workspace.
    pub fn result_path(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("result.json")
    }

    /// The workspace's folder of generated compose override files.
    pub fn compose_overrides_dir(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join(".docker-compose")
    }

    /// Lock file serializing mutating runs for a workspace.
    pub fn lock_path(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("workspace.lock")
    }

    /// Directory holding downloaded agent binaries, created 0750.
    pub fn agent_binaries_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("binaries");
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750))?;
        }
        Ok(dir)
    }

    /// Ensure a workspace's folder exists.
    pub fn ensure_workspace_dir(&self, workspace_id: &str) -> Result<PathBuf> {
        let dir = self.workspace_dir(workspace_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persist the workspace record.
    #[instrument(skip_all, fields(workspace_id = %record.descriptor.id))]
    pub fn write_workspace(&self, record: &WorkspaceRecord) -> Result<()> {
        self.ensure_workspace_dir(&record.descriptor.id)?;
        let path = self.workspace_config_path(&record.descriptor.id);
        write_json_atomic(&path, record)
    }

    /// Read a workspace record; `None` when the workspace is unknown.
    pub fn read_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRecord>> {
        read_json_optional(&self.workspace_config_path(workspace_id))
    }

    /// Persist a run result.
    #[instrument(skip_all, fields(workspace_id = workspace_id))]
    pub fn write_result(&self, workspace_id: &str, result: &RunResult) -> Result<()> {
        self.ensure_workspace_dir(workspace_id)?;
        write_json_atomic(&self.result_path(workspace_id), result)
    }

    /// Read the last run result; `None` when the workspace never ran.
    pub fn read_result(&self, workspace_id: &str) -> Result<Option<RunResult>> {
        read_json_optional(&self.result_path(workspace_id))
    }

    /// Delete everything persisted for a workspace.
    pub fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let dir = self.workspace_dir(workspace_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            debug!(workspace_id, "removed persisted workspace state");
        }
        Ok(())
    }
}

/// Atomic JSON write: temp file in the same directory, then rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().ok_or_else(|| GantryError::Internal {
        message: format!("path has no parent: {}", path.display()),
    })?;
    let json = serde_json::to_vec_pretty(value).map_err(|e| GantryError::Internal {
        message: format!("serialization failed: {}", e),
    })?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json_optional<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        message: format!("{}: {}", path.display(), e),
    })?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn workspace_id_is_stable_and_sanitized() {
        let source = WorkspaceSource::LocalFolder {
            path: PathBuf::from("/tmp/My Project"),
        };
        let a = derive_workspace_id(&source);
        let b = derive_workspace_id(&source);
        assert_eq!(a, b);
        assert!(a.starts_with("my-project-"));

        let other = WorkspaceSource::LocalFolder {
            path: PathBuf::from("/tmp/other"),
        };
        assert_ne!(a, derive_workspace_id(&other));
    }

    #[test]
    fn git_source_id_uses_repo_name() {
        let source = WorkspaceSource::GitRepository {
            url: "https://github.com/acme/widget.git".to_string(),
            branch: Some("main".to_string()),
        };
        assert!(derive_workspace_id(&source).starts_with("widget-"));
    }

    #[test]
    fn workspace_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        let descriptor = WorkspaceDescriptor::new(
            WorkspaceSource::Image {
                reference: "alpine:3.18".to_string(),
            },
            DriverKind::Docker,
        );
        let record = WorkspaceRecord {
            descriptor: descriptor.clone(),
            last_container_id: Some("abc".to_string()),
            updated_at: Some(Utc::now()),
        };

        layout.write_workspace(&record).unwrap();
        let back = layout.read_workspace(&descriptor.id).unwrap().unwrap();
        assert_eq!(back.descriptor, descriptor);
        assert_eq!(back.last_container_id.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_workspace_reads_none() {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        assert!(layout.read_workspace("ghost").unwrap().is_none());
        assert!(layout.read_result("ghost").unwrap().is_none());
    }

    #[test]
    fn layout_paths_are_per_workspace() {
        let layout = WorkspaceLayout::new(PathBuf::from("/data"));
        assert_eq!(
            layout.compose_overrides_dir("ws1"),
            PathBuf::from("/data/workspaces/ws1/.docker-compose")
        );
        assert_eq!(
            layout.lock_path("ws1"),
            PathBuf::from("/data/workspaces/ws1/workspace.lock")
        );
        assert_eq!(
            layout.machine_config_path("ws1"),
            PathBuf::from("/data/workspaces/ws1/machine.json")
        );
    }
}
