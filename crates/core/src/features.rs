//! Dev container features
//!
//! Resolves the features declared in a configuration against their published
//! metadata and orders them for installation. Ordering respects each
//! feature's `installsAfter` relations; declaration order breaks ties so the
//! result is deterministic.
//!
//! Failure modes are fatal by design: a missing feature id, a dependency
//! cycle, or two declarations pinning different versions of the same feature
//! all abort the run before any build work starts.

use crate::errors::{FeatureError, Result};
use crate::merge::ConfigContribution;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Effective value of a feature option.
///
/// Declarations may use booleans, strings, or numbers; numbers are carried
/// in their string form since install scripts only ever see env strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Text(String),
}

impl OptionValue {
    /// Accept the JSON shapes a declaration may use for an option value.
    fn from_declared(feature_id: &str, name: &str, value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(OptionValue::Bool(*b)),
            serde_json::Value::String(s) => Ok(OptionValue::Text(s.clone())),
            serde_json::Value::Number(n) => Ok(OptionValue::Text(n.to_string())),
            other => Err(FeatureError::Validation {
                message: format!(
                    "feature '{}': option '{}' cannot take {}",
                    feature_id, name, other
                ),
            }
            .into()),
        }
    }

    /// Render for a NAME=value environment assignment in the overlay.
    pub fn to_env_string(&self) -> String {
        match self {
            OptionValue::Bool(b) => b.to_string(),
            OptionValue::Text(s) => s.clone(),
        }
    }
}

/// Declared type of a feature option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Boolean,
    #[default]
    String,
}

impl OptionType {
    fn describe(&self) -> &'static str {
        match self {
            OptionType::Boolean => "boolean",
            OptionType::String => "string",
        }
    }
}

/// Schema of one feature option from the published metadata.
///
/// Kept as a flat record: the `type` field decides which of the remaining
/// fields apply, and a default that disagrees with the declared type simply
/// yields no default (the parse step rejects such metadata up front).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionSchema {
    pub r#type: OptionType,
    pub default: Option<serde_json::Value>,
    pub description: Option<String>,
    pub r#enum: Option<Vec<String>>,
    pub proposals: Option<Vec<String>>,
}

impl OptionSchema {
    /// The schema default coerced to an option value. `None` when no default
    /// is declared or the declared default disagrees with the type.
    pub fn default_value(&self) -> Option<OptionValue> {
        match (self.r#type, self.default.as_ref()?) {
            (OptionType::Boolean, serde_json::Value::Bool(b)) => Some(OptionValue::Bool(*b)),
            (OptionType::String, serde_json::Value::String(s)) => {
                Some(OptionValue::Text(s.clone()))
            }
            _ => None,
        }
    }

    /// Check one value against this schema; errors name the feature and
    /// the option.
    fn check(&self, feature_id: &str, name: &str, value: &OptionValue) -> Result<()> {
        match (self.r#type, value) {
            (OptionType::Boolean, OptionValue::Bool(_)) => Ok(()),
            (OptionType::String, OptionValue::Text(text)) => {
                let Some(allowed) = &self.r#enum else {
                    return Ok(());
                };
                if allowed.iter().any(|candidate| candidate == text) {
                    return Ok(());
                }
                Err(FeatureError::Validation {
                    message: format!(
                        "feature '{}': option '{}' accepts one of [{}], got '{}'",
                        feature_id,
                        name,
                        allowed.join(", "),
                        text
                    ),
                }
                .into())
            }
            (expected, _) => Err(FeatureError::Validation {
                message: format!(
                    "feature '{}': option '{}' expects a {} value",
                    feature_id,
                    name,
                    expected.describe()
                ),
            }
            .into()),
        }
    }
}

/// Feature metadata, the shape of `devcontainer-feature.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureMetadata {
    /// Feature identifier (required)
    pub id: String,
    /// Published version
    pub version: Option<String>,
    /// Human-readable name
    pub name: Option<String>,
    /// Feature description
    pub description: Option<String>,
    /// Feature options
    pub options: HashMap<String, OptionSchema>,
    /// Container environment contributed by the feature
    pub container_env: IndexMap<String, String>,
    /// Mounts contributed by the feature (docker mount strings)
    pub mounts: Vec<serde_json::Value>,
    /// User the container should run as
    pub container_user: Option<String>,
    /// User in-container commands should run as
    pub remote_user: Option<String>,
    /// Entrypoint script run before the user entrypoint
    pub entrypoint: Option<String>,
    /// Run an init process
    pub init: Option<bool>,
    /// Run privileged
    pub privileged: Option<bool>,
    /// Capabilities to add
    pub cap_add: Vec<String>,
    /// Security options
    pub security_opt: Vec<String>,
    /// Features that must install before this one
    pub installs_after: Vec<String>,
    /// Lifecycle hooks contributed by the feature
    pub on_create_command: Option<serde_json::Value>,
    pub update_content_command: Option<serde_json::Value>,
    pub post_create_command: Option<serde_json::Value>,
    pub post_start_command: Option<serde_json::Value>,
    pub post_attach_command: Option<serde_json::Value>,
}

impl FeatureMetadata {
    /// Structural checks applied right after parsing: the id must be
    /// present, and any declared option default must agree with its
    /// declared type (coercion yielding nothing while a default exists
    /// means the two disagree).
    fn ensure_well_formed(&self, origin: &Path) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FeatureError::Validation {
                message: format!("{} declares no feature id", origin.display()),
            }
            .into());
        }
        for (name, schema) in &self.options {
            if schema.default.is_some() && schema.default_value().is_none() {
                return Err(FeatureError::Validation {
                    message: format!(
                        "feature '{}': default for option '{}' does not match its declared {} type",
                        self.id,
                        name,
                        schema.r#type.describe()
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// A declared feature reference: `id`, `id@version`, or `id:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    /// Bare feature id, without any version suffix
    pub id: String,
    /// Pinned version, when declared
    pub version: Option<String>,
}

impl FeatureRef {
    /// Parse a declaration key. The version separator is `@`; an OCI-style
    /// `:tag` on the last path segment is accepted as the same thing.
    pub fn parse(declaration: &str) -> Self {
        if let Some((id, version)) = declaration.rsplit_once('@') {
            return Self {
                id: id.to_string(),
                version: Some(version.to_string()),
            };
        }
        // Only treat a colon in the final path segment as a version tag;
        // registry refs carry colons in the host part too (host:port).
        let last_segment = declaration.rsplit('/').next().unwrap_or(declaration);
        if let Some((_, tag)) = last_segment.split_once(':') {
            let id = &declaration[..declaration.len() - tag.len() - 1];
            return Self {
                id: id.to_string(),
                version: Some(tag.to_string()),
            };
        }
        Self {
            id: declaration.to_string(),
            version: None,
        }
    }

    /// Short name: the last path segment of the id.
    pub fn short_name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// A feature resolved against its metadata with effective option values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFeature {
    /// The declaration this feature came from
    pub reference: FeatureRef,
    /// Published metadata
    pub metadata: FeatureMetadata,
    /// Effective options: declared values over metadata defaults
    pub options: IndexMap<String, OptionValue>,
    /// Local folder holding the feature's install payload
    pub source_dir: PathBuf,
}

impl ResolvedFeature {
    /// Project this feature's metadata into a merge contribution.
    pub fn to_contribution(&self) -> ConfigContribution {
        ConfigContribution {
            id: Some(self.reference.id.clone()),
            container_user: self.metadata.container_user.clone(),
            remote_user: self.metadata.remote_user.clone(),
            init: self.metadata.init,
            privileged: self.metadata.privileged,
            override_command: None,
            entrypoint: self.metadata.entrypoint.clone(),
            mounts: self.metadata.mounts.clone(),
            cap_add: self.metadata.cap_add.clone(),
            security_opt: self.metadata.security_opt.clone(),
            forward_ports: Vec::new(),
            container_env: self.metadata.container_env.clone(),
            remote_env: IndexMap::new(),
            on_create_command: self.metadata.on_create_command.clone(),
            update_content_command: self.metadata.update_content_command.clone(),
            post_create_command: self.metadata.post_create_command.clone(),
            post_start_command: self.metadata.post_start_command.clone(),
            post_attach_command: self.metadata.post_attach_command.clone(),
        }
    }

    /// Option values rendered as `NAME=value` env assignments for install.sh.
    pub fn option_env(&self) -> Vec<(String, String)> {
        self.options
            .iter()
            .map(|(name, value)| {
                let env_name: String = name
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                (env_name, value.to_env_string())
            })
            .collect()
    }
}

/// Source of published feature metadata.
///
/// The engine never talks to a marketplace itself; it receives a catalog
/// (typically a pre-fetched directory tree) and looks features up by id.
pub trait FeatureCatalog {
    /// Look up a feature's metadata and install payload directory.
    fn lookup(&self, id: &str) -> Result<Option<(FeatureMetadata, PathBuf)>>;
}

/// Catalog backed by a directory: `<root>/<short-name>/devcontainer-feature.json`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FeatureCatalog for DirectoryCatalog {
    fn lookup(&self, id: &str) -> Result<Option<(FeatureMetadata, PathBuf)>> {
        let short = id.rsplit('/').next().unwrap_or(id);
        let dir = self.root.join(short);
        let metadata_path = dir.join("devcontainer-feature.json");
        if !metadata_path.exists() {
            return Ok(None);
        }
        let metadata = parse_feature_metadata(&metadata_path)?;
        Ok(Some((metadata, dir)))
    }
}

/// Parse feature metadata from a `devcontainer-feature.json` file.
#[instrument(level = "debug")]
pub fn parse_feature_metadata(path: &Path) -> Result<FeatureMetadata> {
    if !path.exists() {
        return Err(FeatureError::NotFound {
            id: path.display().to_string(),
        }
        .into());
    }

    let content = std::fs::read_to_string(path).map_err(|source| FeatureError::Io { source })?;
    let metadata: FeatureMetadata =
        json5::from_str(&content).map_err(|e| FeatureError::Validation {
            message: format!("{}: {}", path.display(), e),
        })?;
    metadata.ensure_well_formed(path)?;
    Ok(metadata)
}

/// Resolve the declared features of a configuration into an ordered install
/// plan.
///
/// Declaration order is preserved except where `installsAfter` forces a
/// feature later. Missing ids, version conflicts between declarations of the
/// same feature, and dependency cycles are fatal.
#[instrument(skip_all, fields(declared = declarations.len()))]
pub fn resolve_features(
    declarations: &IndexMap<String, serde_json::Value>,
    catalog: &dyn FeatureCatalog,
) -> Result<Vec<ResolvedFeature>> {
    // Parse references and reject conflicting version pins up front.
    let mut refs: Vec<(FeatureRef, &serde_json::Value)> = Vec::new();
    let mut pinned: HashMap<String, (String, String)> = HashMap::new();
    for (declaration, options) in declarations {
        let reference = FeatureRef::parse(declaration);
        if let Some(version) = &reference.version {
            if let Some((other_decl, other_version)) = pinned.get(&reference.id) {
                if other_version != version {
                    return Err(FeatureError::VersionConflict {
                        id: reference.id.clone(),
                        first: other_decl.clone(),
                        first_version: other_version.clone(),
                        second: declaration.clone(),
                        second_version: version.clone(),
                    }
                    .into());
                }
            } else {
                pinned.insert(
                    reference.id.clone(),
                    (declaration.clone(), version.clone()),
                );
            }
        }
        refs.push((reference, options));
    }

    // Look up metadata and build the unresolved set.
    let mut features: Vec<ResolvedFeature> = Vec::new();
    for (reference, declared_options) in refs {
        let (metadata, source_dir) =
            catalog
                .lookup(&reference.id)?
                .ok_or_else(|| FeatureError::NotFound {
                    id: reference.id.clone(),
                })?;

        let options = effective_options(&metadata, declared_options)?;
        features.push(ResolvedFeature {
            reference,
            metadata,
            options,
            source_dir,
        });
    }

    order_by_installs_after(features)
}

/// Compute effective option values: declared values validated against the
/// schema, metadata defaults filling the gaps.
fn effective_options(
    metadata: &FeatureMetadata,
    declared: &serde_json::Value,
) -> Result<IndexMap<String, OptionValue>> {
    let mut options = IndexMap::new();

    // Defaults first, in schema order.
    let mut names: Vec<&String> = metadata.options.keys().collect();
    names.sort();
    for name in names {
        if let Some(default) = metadata.options[name].default_value() {
            options.insert(name.clone(), default);
        }
    }

    match declared {
        serde_json::Value::Object(map) => {
            for (name, value) in map {
                let parsed = OptionValue::from_declared(&metadata.id, name, value)?;
                match metadata.options.get(name) {
                    Some(schema) => schema.check(&metadata.id, name, &parsed)?,
                    None => debug!(
                        feature = %metadata.id,
                        option = %name,
                        "declared option not in feature schema"
                    ),
                }
                options.insert(name.clone(), parsed);
            }
        }
        // `"feature": true` and `"feature": "version"` declare with defaults.
        serde_json::Value::Bool(_) | serde_json::Value::String(_) | serde_json::Value::Null => {}
        other => {
            return Err(FeatureError::Validation {
                message: format!(
                    "feature '{}': options must be an object, got {}",
                    metadata.id, other
                ),
            }
            .into())
        }
    }

    Ok(options)
}

/// Stable topological sort by `installsAfter`.
///
/// Kahn's algorithm over the declared set; edges reference features by full
/// id or short name. Relations naming features outside the declared set are
/// ignored. Ties resolve in declaration order.
fn order_by_installs_after(features: Vec<ResolvedFeature>) -> Result<Vec<ResolvedFeature>> {
    let index_of: HashMap<String, usize> = features
        .iter()
        .enumerate()
        .flat_map(|(i, f)| {
            let mut keys = vec![(f.reference.id.clone(), i)];
            keys.push((f.reference.short_name().to_string(), i));
            keys
        })
        .collect();

    // edges[i] = set of indexes that must install before i
    let mut before: Vec<HashSet<usize>> = vec![HashSet::new(); features.len()];
    for (i, feature) in features.iter().enumerate() {
        for dep in &feature.metadata.installs_after {
            if let Some(&j) = index_of.get(dep) {
                if j != i {
                    before[i].insert(j);
                }
            }
        }
    }

    let mut ordered: Vec<usize> = Vec::with_capacity(features.len());
    let mut placed: HashSet<usize> = HashSet::new();
    while ordered.len() < features.len() {
        let next = (0..features.len()).find(|i| {
            !placed.contains(i) && before[*i].iter().all(|dep| placed.contains(dep))
        });
        match next {
            Some(i) => {
                placed.insert(i);
                ordered.push(i);
            }
            None => {
                let remaining: Vec<String> = (0..features.len())
                    .filter(|i| !placed.contains(i))
                    .map(|i| features[i].reference.id.clone())
                    .collect();
                return Err(FeatureError::Cycle {
                    chain: remaining.join(" -> "),
                }
                .into());
            }
        }
    }

    let mut by_index: Vec<Option<ResolvedFeature>> = features.into_iter().map(Some).collect();
    Ok(ordered
        .into_iter()
        .map(|i| by_index[i].take().expect("each index placed once"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_feature(root: &Path, short: &str, json: &str) {
        let dir = root.join(short);
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("devcontainer-feature.json")).unwrap();
        f.write_all(json.as_bytes()).unwrap();
    }

    fn declare(entries: &[(&str, serde_json::Value)]) -> IndexMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parses_reference_forms() {
        assert_eq!(
            FeatureRef::parse("foo@1.0"),
            FeatureRef {
                id: "foo".to_string(),
                version: Some("1.0".to_string())
            }
        );
        assert_eq!(
            FeatureRef::parse("ghcr.io/devcontainers/features/node:2"),
            FeatureRef {
                id: "ghcr.io/devcontainers/features/node".to_string(),
                version: Some("2".to_string())
            }
        );
        assert_eq!(
            FeatureRef::parse("plain"),
            FeatureRef {
                id: "plain".to_string(),
                version: None
            }
        );
    }

    #[test]
    fn resolves_with_defaults_and_overrides() {
        let dir = TempDir::new().unwrap();
        write_feature(
            dir.path(),
            "node",
            r#"{
                "id": "node",
                "version": "1.2.0",
                "options": {
                    "nodeVersion": {"type": "string", "default": "20"},
                    "installYarn": {"type": "boolean", "default": false}
                }
            }"#,
        );
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[("node", serde_json::json!({"installYarn": true}))]);

        let resolved = resolve_features(&declared, &catalog).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved[0].options.get("nodeVersion"),
            Some(&OptionValue::Text("20".to_string()))
        );
        assert_eq!(
            resolved[0].options.get("installYarn"),
            Some(&OptionValue::Bool(true))
        );
        let env = resolved[0].option_env();
        assert!(env.contains(&("INSTALLYARN".to_string(), "true".to_string())));
    }

    #[test]
    fn missing_feature_is_fatal() {
        let dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[("ghost", serde_json::json!({}))]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        assert!(err.to_string().contains("Feature not found"));
    }

    #[test]
    fn version_conflict_names_both_contributors() {
        let dir = TempDir::new().unwrap();
        write_feature(dir.path(), "foo", r#"{"id": "foo"}"#);
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[
            ("foo@1.0", serde_json::json!({})),
            ("foo@2.0", serde_json::json!({})),
        ]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("foo@1.0"));
        assert!(rendered.contains("foo@2.0"));
    }

    #[test]
    fn installs_after_orders_features() {
        let dir = TempDir::new().unwrap();
        write_feature(
            dir.path(),
            "docker",
            r#"{"id": "docker", "installsAfter": ["common"]}"#,
        );
        write_feature(dir.path(), "common", r#"{"id": "common"}"#);
        let catalog = DirectoryCatalog::new(dir.path());
        // Declared in the "wrong" order on purpose.
        let declared = declare(&[
            ("docker", serde_json::json!({})),
            ("common", serde_json::json!({})),
        ]);

        let resolved = resolve_features(&declared, &catalog).unwrap();
        let ids: Vec<&str> = resolved.iter().map(|f| f.reference.id.as_str()).collect();
        assert_eq!(ids, vec!["common", "docker"]);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let dir = TempDir::new().unwrap();
        write_feature(dir.path(), "a", r#"{"id": "a"}"#);
        write_feature(dir.path(), "b", r#"{"id": "b"}"#);
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[
            ("b", serde_json::json!({})),
            ("a", serde_json::json!({})),
        ]);
        let resolved = resolve_features(&declared, &catalog).unwrap();
        let ids: Vec<&str> = resolved.iter().map(|f| f.reference.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn dependency_cycle_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_feature(dir.path(), "a", r#"{"id": "a", "installsAfter": ["b"]}"#);
        write_feature(dir.path(), "b", r#"{"id": "b", "installsAfter": ["a"]}"#);
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[
            ("a", serde_json::json!({})),
            ("b", serde_json::json!({})),
        ]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn invalid_enum_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_feature(
            dir.path(),
            "shell",
            r#"{
                "id": "shell",
                "options": {"flavor": {"type": "string", "enum": ["bash", "zsh"]}}
            }"#,
        );
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[("shell", serde_json::json!({"flavor": "fish"}))]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        assert!(err.to_string().contains("fish"));
        assert!(err.to_string().contains("bash, zsh"));
    }

    #[test]
    fn type_mismatch_names_feature_and_option() {
        let dir = TempDir::new().unwrap();
        write_feature(
            dir.path(),
            "tool",
            r#"{"id": "tool", "options": {"enabled": {"type": "boolean"}}}"#,
        );
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[("tool", serde_json::json!({"enabled": "yes"}))]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("'tool'"));
        assert!(rendered.contains("'enabled'"));
        assert!(rendered.contains("boolean"));
    }

    #[test]
    fn metadata_with_mismatched_default_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_feature(
            dir.path(),
            "broken",
            r#"{"id": "broken", "options": {"count": {"type": "boolean", "default": "three"}}}"#,
        );
        let catalog = DirectoryCatalog::new(dir.path());
        let declared = declare(&[("broken", serde_json::json!({}))]);
        let err = resolve_features(&declared, &catalog).unwrap_err();
        assert!(err.to_string().contains("does not match its declared boolean type"));
    }

    #[test]
    fn contribution_carries_metadata() {
        let metadata = FeatureMetadata {
            id: "foo".to_string(),
            container_user: Some("devuser".to_string()),
            mounts: vec![serde_json::json!("type=volume,source=cache,target=/cache")],
            ..Default::default()
        };
        let feature = ResolvedFeature {
            reference: FeatureRef::parse("foo@1.0"),
            metadata,
            options: IndexMap::new(),
            source_dir: PathBuf::from("/tmp/features/foo"),
        };
        let contribution = feature.to_contribution();
        assert_eq!(contribution.container_user.as_deref(), Some("devuser"));
        assert_eq!(contribution.mounts.len(), 1);
    }
}
