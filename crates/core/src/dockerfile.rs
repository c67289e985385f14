//! Multi-stage Dockerfile parsing and variable resolution
//!
//! Parses a Dockerfile into a preamble (instructions before the first `FROM`,
//! holding global ARGs) plus an ordered list of stages. Each stage records its
//! base image reference (which may contain `${VAR}` tokens), its optional
//! `AS` name, the ordered ARG/ENV/USER instructions it contains, and the raw
//! instruction list for dumping.
//!
//! ## Variable resolution
//!
//! For a variable used inside stage S the search order is:
//!
//! 1. S's ARG instructions, reverse-ordered. User-supplied build args override
//!    defaults; default values themselves are expanded recursively in the
//!    same stage.
//! 2. S's ENV instructions, reverse-ordered.
//! 3. If S is the preamble, the caller-supplied base-image env map.
//! 4. Otherwise, resolve S's image reference; when it names another stage,
//!    recurse into that stage.
//!
//! Resolution keeps a visited set keyed by `image + "-" + target`; a revisit
//! means a stage cycle and the variable stays unresolved.

use crate::errors::{DockerfileError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

static FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^FROM\s+(?:--platform=\S+\s+)?(\S+)(?:\s+AS\s+(\S+))?\s*$")
        .expect("FROM regex is valid")
});

static SYNTAX_DIRECTIVE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^#\s*syntax\s*=").expect("syntax directive regex is valid"));

static VAR_TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::[-+][^}]*)?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("variable token regex is valid")
});

/// A single Dockerfile instruction with its raw text preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Uppercased keyword (`FROM`, `RUN`, `ARG`, ...)
    pub keyword: String,
    /// Everything after the keyword, continuations joined
    pub arguments: String,
}

impl Instruction {
    fn raw(&self) -> String {
        if self.arguments.is_empty() {
            self.keyword.clone()
        } else {
            format!("{} {}", self.keyword, self.arguments)
        }
    }
}

/// One build stage: a `FROM` and the instructions that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Base image reference, possibly containing `${VAR}` tokens
    pub image: String,
    /// `AS` name, when present
    pub target: Option<String>,
    /// ARG declarations in order: name and optional default
    pub args: Vec<(String, Option<String>)>,
    /// ENV assignments in order
    pub envs: Vec<(String, String)>,
    /// USER instructions in order
    pub users: Vec<String>,
    /// All instructions of the stage including the FROM, for dumping
    pub instructions: Vec<Instruction>,
}

impl Stage {
    fn new(image: String, target: Option<String>) -> Self {
        Self {
            image,
            target,
            args: Vec::new(),
            envs: Vec::new(),
            users: Vec::new(),
            instructions: Vec::new(),
        }
    }
}

/// A parsed multi-stage Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    /// Instructions before the first FROM (global ARGs)
    pub preamble: Vec<Instruction>,
    /// Stages in file order
    pub stages: Vec<Stage>,
}

impl Dockerfile {
    /// Parse Dockerfile text.
    ///
    /// Comments are dropped, line continuations are joined, and instruction
    /// keywords are normalized to uppercase. Parse errors are structural
    /// only; unknown instructions are preserved verbatim.
    #[instrument(skip_all, fields(bytes = content.len()))]
    pub fn parse(content: &str) -> Result<Self> {
        let mut preamble = Vec::new();
        let mut stages: Vec<Stage> = Vec::new();

        for line in logical_lines(content) {
            let Some((keyword, arguments)) = split_instruction(&line) else {
                continue;
            };

            if keyword == "FROM" {
                let caps = FROM_REGEX.captures(&line).ok_or_else(|| {
                    DockerfileError::Parse {
                        message: format!("malformed FROM instruction: '{}'", line),
                    }
                })?;
                let image = caps[1].to_string();
                let target = caps.get(2).map(|m| m.as_str().to_string());
                let mut stage = Stage::new(image, target);
                stage.instructions.push(Instruction {
                    keyword,
                    arguments,
                });
                stages.push(stage);
                continue;
            }

            let instruction = Instruction { keyword, arguments };
            match stages.last_mut() {
                Some(stage) => {
                    record_instruction(stage, &instruction);
                    stage.instructions.push(instruction);
                }
                None => preamble.push(instruction),
            }
        }

        Ok(Self { preamble, stages })
    }

    /// Serialize back to Dockerfile text. `parse(dump(d))` yields a
    /// Dockerfile equal to `d`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for instruction in &self.preamble {
            out.push_str(&instruction.raw());
            out.push('\n');
        }
        for stage in &self.stages {
            for instruction in &stage.instructions {
                out.push_str(&instruction.raw());
                out.push('\n');
            }
        }
        out
    }

    /// ARG defaults declared in the preamble (global build args).
    fn preamble_args(&self) -> Vec<(String, Option<String>)> {
        self.preamble
            .iter()
            .filter(|i| i.keyword == "ARG")
            .filter_map(|i| parse_arg(&i.arguments))
            .collect()
    }

    /// Find a stage by its `AS` name; empty target means the last stage.
    pub fn find_stage(&self, target: &str) -> Option<&Stage> {
        if target.is_empty() {
            return self.stages.last();
        }
        self.stages
            .iter()
            .find(|s| s.target.as_deref() == Some(target))
    }

    /// The recursively resolved base image reference of the named target, or
    /// of the last stage when `target` is empty.
    ///
    /// A stage whose `FROM` references another stage is followed until a real
    /// image reference is reached. `${VAR}` tokens in image references are
    /// expanded from build args and preamble ARG defaults.
    #[instrument(skip_all, fields(target = target))]
    pub fn find_base_image(
        &self,
        build_args: &HashMap<String, String>,
        target: &str,
    ) -> Option<String> {
        let stage = self.find_stage(target)?;
        let mut visited = HashSet::new();
        self.resolve_stage_image(stage, build_args, &mut visited)
    }

    fn resolve_stage_image(
        &self,
        stage: &Stage,
        build_args: &HashMap<String, String>,
        visited: &mut HashSet<String>,
    ) -> Option<String> {
        let key = format!(
            "{}-{}",
            stage.image,
            stage.target.as_deref().unwrap_or_default()
        );
        if !visited.insert(key) {
            debug!(image = %stage.image, "stage cycle detected, image unresolved");
            return None;
        }

        let image = self.expand_image_ref(&stage.image, build_args);
        match self.find_named_stage(&image) {
            Some(parent) => self.resolve_stage_image(parent, build_args, visited),
            None => Some(image),
        }
    }

    fn find_named_stage(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| s.target.as_deref() == Some(name))
    }

    /// Expand `${VAR}` tokens in an image reference from build args and
    /// preamble ARG defaults (Docker resolves `FROM` against global ARGs).
    fn expand_image_ref(&self, image: &str, build_args: &HashMap<String, String>) -> String {
        expand_tokens(image, &mut |name| {
            if let Some(value) = build_args.get(name) {
                return Some(value.clone());
            }
            for (arg_name, default) in self.preamble_args().iter().rev() {
                if arg_name == name {
                    return default.clone();
                }
            }
            None
        })
    }

    /// The effective `USER` at the end of the named stage (or last stage when
    /// `target` is empty), with variables resolved. When the stage sets no
    /// USER, the base-image stage chain is followed; `None` means the user
    /// comes from the base image config.
    #[instrument(skip_all, fields(target = target))]
    pub fn find_user(
        &self,
        build_args: &HashMap<String, String>,
        base_image_env: &HashMap<String, String>,
        target: &str,
    ) -> Option<String> {
        let mut stage = self.find_stage(target)?;
        let mut visited = HashSet::new();

        loop {
            let key = format!(
                "{}-{}",
                stage.image,
                stage.target.as_deref().unwrap_or_default()
            );
            if !visited.insert(key) {
                return None;
            }

            if let Some(user) = stage.users.last() {
                let mut resolve_visited = HashSet::new();
                let resolved = expand_tokens(user, &mut |name| {
                    self.resolve_variable(
                        Some(stage),
                        name,
                        build_args,
                        base_image_env,
                        &mut resolve_visited,
                    )
                });
                return Some(resolved);
            }

            let image = self.expand_image_ref(&stage.image, build_args);
            match self.find_named_stage(&image) {
                Some(parent) => stage = parent,
                None => return None,
            }
        }
    }

    /// Resolve one variable in the context of a stage (or the preamble when
    /// `stage` is `None`), per the module-level search order.
    fn resolve_variable(
        &self,
        stage: Option<&Stage>,
        name: &str,
        build_args: &HashMap<String, String>,
        base_image_env: &HashMap<String, String>,
        visited: &mut HashSet<String>,
    ) -> Option<String> {
        let (args, envs) = match stage {
            Some(s) => (&s.args, &s.envs),
            None => {
                // Preamble: ARG declarations only, then the caller's
                // base-image env map.
                for (arg_name, default) in self.preamble_args().iter().rev() {
                    if arg_name == name {
                        if let Some(value) = build_args.get(name) {
                            return Some(value.clone());
                        }
                        return default.clone();
                    }
                }
                return base_image_env.get(name).cloned();
            }
        };

        for (arg_name, default) in args.iter().rev() {
            if arg_name == name {
                if let Some(value) = build_args.get(name) {
                    return Some(value.clone());
                }
                // Defaults may reference other variables of the same stage.
                return default.as_ref().map(|d| {
                    expand_tokens(d, &mut |inner| {
                        self.resolve_variable(stage, inner, build_args, base_image_env, visited)
                    })
                });
            }
        }

        for (env_name, value) in envs.iter().rev() {
            if env_name == name {
                return Some(expand_tokens(value, &mut |inner| {
                    self.resolve_variable(stage, inner, build_args, base_image_env, visited)
                }));
            }
        }

        // Fall through to the stage's base image chain.
        let stage = stage.expect("preamble handled above");
        let key = format!(
            "{}-{}",
            stage.image,
            stage.target.as_deref().unwrap_or_default()
        );
        if !visited.insert(key) {
            debug!(variable = name, "stage cycle detected, variable unresolved");
            return None;
        }

        let image = self.expand_image_ref(&stage.image, build_args);
        match self.find_named_stage(&image) {
            Some(parent) => {
                self.resolve_variable(Some(parent), name, build_args, base_image_env, visited)
            }
            None => self.resolve_variable(None, name, build_args, base_image_env, visited),
        }
    }

    /// Source paths referenced by `ADD`/`COPY` instructions across all
    /// stages. `COPY --from=...` copies from another stage and contributes no
    /// context paths.
    pub fn build_context_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for stage in &self.stages {
            for instruction in &stage.instructions {
                if instruction.keyword != "ADD" && instruction.keyword != "COPY" {
                    continue;
                }
                let mut operands: Vec<&str> = Vec::new();
                let mut from_other_stage = false;
                for token in instruction.arguments.split_whitespace() {
                    if token.starts_with("--") {
                        if token.starts_with("--from=") {
                            from_other_stage = true;
                        }
                        continue;
                    }
                    operands.push(token);
                }
                if from_other_stage || operands.len() < 2 {
                    continue;
                }
                // Last operand is the destination.
                for source in &operands[..operands.len() - 1] {
                    files.push(source.to_string());
                }
            }
        }
        files
    }
}

/// Outcome of [`ensure_final_stage_name`]: the stage name to target and the
/// possibly rewritten Dockerfile text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalStageName {
    /// The final stage's name (existing `AS` name or the applied default)
    pub name: String,
    /// Dockerfile text with the final `FROM` carrying an `AS` name
    pub content: String,
}

/// Ensure the final `FROM` carries an `AS` name, appending `AS <default>`
/// textually when it does not. Fails when there is no `FROM` or the final
/// `FROM` is malformed.
#[instrument(skip_all)]
pub fn ensure_final_stage_name(content: &str, default: &str) -> Result<FinalStageName> {
    let mut last_from: Option<(usize, String)> = None;
    let lines: Vec<&str> = content.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.to_uppercase().starts_with("FROM ") || trimmed.to_uppercase() == "FROM" {
            last_from = Some((idx, trimmed.to_string()));
        }
    }

    let (idx, from_line) = last_from.ok_or_else(|| DockerfileError::NoFinalStage {
        message: "no FROM instruction found".to_string(),
    })?;

    let caps = FROM_REGEX
        .captures(&from_line)
        .ok_or_else(|| DockerfileError::NoFinalStage {
            message: format!("malformed final FROM: '{}'", from_line),
        })?;

    if let Some(existing) = caps.get(2) {
        return Ok(FinalStageName {
            name: existing.as_str().to_string(),
            content: content.to_string(),
        });
    }

    let mut rewritten: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    rewritten[idx] = format!("{} AS {}", lines[idx].trim_end(), default);
    Ok(FinalStageName {
        name: default.to_string(),
        content: rewritten.join("\n") + "\n",
    })
}

/// Strip `# syntax=...` directive lines from Dockerfile text.
pub fn remove_syntax_directive(content: &str) -> String {
    content
        .lines()
        .filter(|line| !SYNTAX_DIRECTIVE_REGEX.is_match(line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Join continuation lines and drop comments/blank lines, yielding one
/// logical instruction per element.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for raw in content.lines() {
        let trimmed = raw.trim();
        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
            continue;
        }
        current.push_str(trimmed);
        lines.push(std::mem::take(&mut current));
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn split_instruction(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let keyword = parts.next()?.to_uppercase();
    let arguments = parts.next().unwrap_or("").trim().to_string();
    Some((keyword, arguments))
}

fn record_instruction(stage: &mut Stage, instruction: &Instruction) {
    match instruction.keyword.as_str() {
        "ARG" => {
            if let Some(arg) = parse_arg(&instruction.arguments) {
                stage.args.push(arg);
            }
        }
        "ENV" => stage.envs.extend(parse_env(&instruction.arguments)),
        "USER" => stage.users.push(instruction.arguments.clone()),
        _ => {}
    }
}

fn parse_arg(arguments: &str) -> Option<(String, Option<String>)> {
    let arguments = arguments.trim();
    if arguments.is_empty() {
        return None;
    }
    match arguments.split_once('=') {
        Some((name, default)) => Some((
            name.trim().to_string(),
            Some(unquote(default.trim()).to_string()),
        )),
        None => Some((arguments.to_string(), None)),
    }
}

/// Parse ENV arguments: `ENV k=v k2=v2` and the legacy `ENV k v` form.
fn parse_env(arguments: &str) -> Vec<(String, String)> {
    let arguments = arguments.trim();
    if !arguments.contains('=') {
        // Legacy space-separated form assigns a single variable.
        if let Some((name, value)) = arguments.split_once(char::is_whitespace) {
            return vec![(name.to_string(), unquote(value.trim()).to_string())];
        }
        return Vec::new();
    }

    let mut envs = Vec::new();
    for pair in split_respecting_quotes(arguments) {
        if let Some((name, value)) = pair.split_once('=') {
            envs.push((name.to_string(), unquote(value).to_string()));
        }
    }
    envs
}

fn split_respecting_quotes(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;
    for c in input.chars() {
        match in_quotes {
            Some(q) if c == q => {
                in_quotes = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                in_quotes = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Expand `${VAR}`/`$VAR` tokens using a resolver; unresolved tokens are left
/// in place so callers can distinguish "unresolved" from empty.
fn expand_tokens(input: &str, resolve: &mut dyn FnMut(&str) -> Option<String>) -> String {
    VAR_TOKEN_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match resolve(name) {
                Some(value) => value,
                None => caps[0].to_string(),
            }
        })
        .to_string()
}
