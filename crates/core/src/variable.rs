//! Variable substitution engine
//!
//! Implements variable substitution for devcontainer configurations. Every
//! string-valued leaf of a configuration may contain `${...}` tokens that are
//! expanded against a [`SubstitutionContext`] snapshotted at run start.
//!
//! ## Supported Variables
//!
//! - `${localWorkspaceFolder}` - Canonical workspace path on the host
//! - `${containerWorkspaceFolder}` - Workspace path inside the container
//! - `${localEnv:VAR}` - Host environment variable (init-env overrides first)
//! - `${containerEnv:VAR}` - Container environment variable; deferred in
//!   fields that execute inside the container
//! - `${devcontainerId}` - Deterministic hash ID derived from the workspace path
//!
//! ## Invariants
//!
//! - Substitution is idempotent on already-substituted text.
//! - Unknown variables resolve to the empty string and never fail the run.
//! - `localEnv` lookups consult the init-env overrides before the process
//!   environment snapshot.

use crate::errors::{ConfigError, GantryError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use tracing::{debug, instrument};

/// Regular expression for variable substitution tokens
static VARIABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^{}]+)\}").expect("variable token regex is valid"));

/// Substitution context containing values for variable resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstitutionContext {
    /// Canonical workspace folder path on the host
    pub local_workspace_folder: String,
    /// Workspace folder path inside the container
    pub container_workspace_folder: String,
    /// Host environment variables, snapshotted at run start
    pub local_env: HashMap<String, String>,
    /// Declared init-env overrides; consulted before `local_env`
    pub init_env: HashMap<String, String>,
    /// Known container environment (from image inspection); empty until resolved
    pub container_env: HashMap<String, String>,
    /// Path of the devcontainer configuration file this context was built for
    pub config_path: String,
    /// Deterministic container ID based on the workspace path
    pub devcontainer_id: String,
}

impl SubstitutionContext {
    /// Create a new substitution context for a workspace.
    ///
    /// Canonicalizes the workspace path, snapshots the process environment,
    /// and derives the deterministic devcontainer id from the canonical path.
    #[instrument(skip_all, fields(workspace_path = %workspace_path.display()))]
    pub fn new(workspace_path: &Path, config_path: &Path) -> Result<Self> {
        let canonical_path = workspace_path.canonicalize().map_err(|e| {
            GantryError::Config(ConfigError::Validation {
                message: format!(
                    "Invalid workspace path '{}': {}",
                    workspace_path.display(),
                    e
                ),
            })
        })?;

        let local_workspace_folder = canonical_path.to_string_lossy().to_string();
        let devcontainer_id = generate_devcontainer_id(&local_workspace_folder);
        debug!(
            workspace = %local_workspace_folder,
            devcontainer_id = %devcontainer_id,
            "created substitution context"
        );

        Ok(Self {
            local_workspace_folder,
            container_workspace_folder: String::new(),
            local_env: env::vars().collect(),
            init_env: HashMap::new(),
            container_env: HashMap::new(),
            config_path: config_path.to_string_lossy().to_string(),
            devcontainer_id,
        })
    }

    /// Set the in-container workspace folder used for `${containerWorkspaceFolder}`.
    pub fn with_container_workspace_folder(mut self, folder: impl Into<String>) -> Self {
        self.container_workspace_folder = folder.into();
        self
    }

    /// Add init-env overrides that shadow the process environment for
    /// `${localEnv:...}` lookups.
    pub fn with_init_env(mut self, init_env: HashMap<String, String>) -> Self {
        self.init_env = init_env;
        self
    }

    /// Provide known container environment for `${containerEnv:...}` lookups.
    pub fn with_container_env(mut self, container_env: HashMap<String, String>) -> Self {
        self.container_env = container_env;
        self
    }

    /// Look up a `localEnv` variable: init-env overrides first, then the
    /// process environment snapshot. Missing variables yield `None`.
    pub fn lookup_local_env(&self, name: &str) -> Option<&str> {
        self.init_env
            .get(name)
            .or_else(|| self.local_env.get(name))
            .map(String::as_str)
    }
}

/// Generate a deterministic devcontainer ID from the canonical workspace path.
///
/// First 12 hex characters of the SHA-256 of the path, enough to key
/// container labels and generated file names without collisions in practice.
fn generate_devcontainer_id(workspace_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_path.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Options controlling a substitution pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstitutionOptions {
    /// Leave `${containerEnv:...}` tokens untouched so the in-container agent
    /// can resolve them against the live environment. Used for remoteEnv and
    /// lifecycle command fields.
    pub defer_container_env: bool,
}

/// Report of variable substitutions performed
#[derive(Debug, Clone, Default)]
pub struct SubstitutionReport {
    /// Map of variable expressions to their resolved values
    pub replacements: HashMap<String, String>,
    /// Variable expressions that resolved to empty because they were unknown
    pub unknown_variables: Vec<String>,
}

impl SubstitutionReport {
    /// Create a new empty substitution report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful variable replacement
    pub fn add_replacement(&mut self, variable: String, value: String) {
        self.replacements.insert(variable, value);
    }

    /// Record a variable that resolved to empty because it was unknown
    pub fn add_unknown_variable(&mut self, variable: String) {
        self.unknown_variables.push(variable);
    }
}

/// Variable substitution engine
pub struct VariableSubstitution;

impl VariableSubstitution {
    /// Apply variable substitution to a single string.
    ///
    /// Tokens are resolved in one pass: `localEnv` first, then `containerEnv`
    /// (unless deferred), then the workspace placeholders. Unknown variables
    /// become the empty string, so a second pass over the output is a no-op.
    #[instrument(skip_all, fields(input_length = input.len()))]
    pub fn substitute_string(
        input: &str,
        context: &SubstitutionContext,
        options: SubstitutionOptions,
        report: &mut SubstitutionReport,
    ) -> String {
        let result = VARIABLE_REGEX.replace_all(input, |caps: &regex::Captures| {
            let variable_expr = &caps[1];

            if options.defer_container_env && variable_expr.starts_with("containerEnv:") {
                return format!("${{{}}}", variable_expr);
            }

            match Self::resolve_variable(variable_expr, context) {
                Some(value) => {
                    debug!(variable = variable_expr, "resolved substitution token");
                    report.add_replacement(variable_expr.to_string(), value.clone());
                    value
                }
                None => {
                    debug!(variable = variable_expr, "unknown variable, resolving to empty");
                    report.add_unknown_variable(variable_expr.to_string());
                    String::new()
                }
            }
        });

        result.to_string()
    }

    /// Resolve a variable expression to its value, or `None` when unknown.
    fn resolve_variable(variable_expr: &str, context: &SubstitutionContext) -> Option<String> {
        match variable_expr {
            "localWorkspaceFolder" => Some(context.local_workspace_folder.clone()),
            "containerWorkspaceFolder" => Some(context.container_workspace_folder.clone()),
            "devcontainerId" => Some(context.devcontainer_id.clone()),
            expr if expr.starts_with("localEnv:") => {
                let name = &expr["localEnv:".len()..];
                Some(context.lookup_local_env(name).unwrap_or_default().to_string())
            }
            expr if expr.starts_with("containerEnv:") => {
                let name = &expr["containerEnv:".len()..];
                Some(
                    context
                        .container_env
                        .get(name)
                        .cloned()
                        .unwrap_or_default(),
                )
            }
            _ => None,
        }
    }

    /// Apply substitution to every string leaf of a JSON value.
    pub fn substitute_json_value(
        value: &Value,
        context: &SubstitutionContext,
        options: SubstitutionOptions,
        report: &mut SubstitutionReport,
    ) -> Value {
        match value {
            Value::String(s) => {
                Value::String(Self::substitute_string(s, context, options, report))
            }
            Value::Array(arr) => Value::Array(
                arr.iter()
                    .map(|v| Self::substitute_json_value(v, context, options, report))
                    .collect(),
            ),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            Self::substitute_json_value(v, context, options, report),
                        )
                    })
                    .collect(),
            ),
            _ => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_context() -> (TempDir, SubstitutionContext) {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("devcontainer.json");
        let ctx = SubstitutionContext::new(dir.path(), &config_path)
            .unwrap()
            .with_container_workspace_folder("/workspaces/app");
        (dir, ctx)
    }

    #[test]
    fn substitutes_workspace_placeholders() {
        let (_dir, ctx) = test_context();
        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "${localWorkspaceFolder}/src:${containerWorkspaceFolder}/src",
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(
            out,
            format!("{}/src:/workspaces/app/src", ctx.local_workspace_folder)
        );
    }

    #[test]
    fn init_env_shadows_process_env() {
        let (_dir, mut ctx) = test_context();
        ctx.local_env
            .insert("GANTRY_TEST_VAR".to_string(), "from-process".to_string());
        ctx.init_env
            .insert("GANTRY_TEST_VAR".to_string(), "from-init".to_string());

        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "${localEnv:GANTRY_TEST_VAR}",
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(out, "from-init");
    }

    #[test]
    fn unknown_variable_resolves_to_empty() {
        let (_dir, ctx) = test_context();
        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "a${unknownThing}b",
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(out, "ab");
        assert_eq!(report.unknown_variables, vec!["unknownThing".to_string()]);
    }

    #[test]
    fn missing_local_env_is_empty_not_error() {
        let (_dir, ctx) = test_context();
        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "x${localEnv:GANTRY_DEFINITELY_NOT_SET}y",
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(out, "xy");
    }

    #[test]
    fn container_env_deferred_when_requested() {
        let (_dir, ctx) = test_context();
        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "${containerEnv:PATH}:/extra",
            &ctx,
            SubstitutionOptions {
                defer_container_env: true,
            },
            &mut report,
        );
        assert_eq!(out, "${containerEnv:PATH}:/extra");
    }

    #[test]
    fn container_env_resolved_when_known() {
        let (_dir, mut ctx) = test_context();
        ctx.container_env
            .insert("PATH".to_string(), "/usr/bin".to_string());
        let mut report = SubstitutionReport::new();
        let out = VariableSubstitution::substitute_string(
            "${containerEnv:PATH}:/extra",
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(out, "/usr/bin:/extra");
    }

    #[test]
    fn substitution_is_idempotent() {
        let (_dir, mut ctx) = test_context();
        ctx.init_env
            .insert("NAME".to_string(), "value".to_string());
        let mut report = SubstitutionReport::new();
        let input = "${localEnv:NAME}-${localWorkspaceFolder}-${unknown}";
        let once = VariableSubstitution::substitute_string(
            input,
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        let twice = VariableSubstitution::substitute_string(
            &once,
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn devcontainer_id_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("devcontainer.json");
        let a = SubstitutionContext::new(dir.path(), &config).unwrap();
        let b = SubstitutionContext::new(dir.path(), &config).unwrap();
        assert_eq!(a.devcontainer_id, b.devcontainer_id);
        assert_eq!(a.devcontainer_id.len(), 12);
    }

    #[test]
    fn json_value_substitution_recurses() {
        let (_dir, ctx) = test_context();
        let mut report = SubstitutionReport::new();
        let value = serde_json::json!({
            "folder": "${localWorkspaceFolder}",
            "nested": {"id": "${devcontainerId}"},
            "list": ["${containerWorkspaceFolder}", 42, true]
        });
        let out = VariableSubstitution::substitute_json_value(
            &value,
            &ctx,
            SubstitutionOptions::default(),
            &mut report,
        );
        assert_eq!(out["folder"], ctx.local_workspace_folder.as_str());
        assert_eq!(out["nested"]["id"], ctx.devcontainer_id.as_str());
        assert_eq!(out["list"][0], "/workspaces/app");
        assert_eq!(out["list"][1], 42);
    }
}
