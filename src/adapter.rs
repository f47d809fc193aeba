//! Tool adapters
//!
//! A [`ToolAdapter`] binds one external CLI's invocation convention to a
//! uniform `execute(prompt, model)` contract. [`CliToolAdapter`] is the
//! single config-driven implementation: it resolves the binary once at
//! construction, then drives template parsing, subprocess execution and
//! output normalization on every call.

use crate::error::{AdapterError, ExecError};
use crate::executor::SubprocessExecutor;
use crate::normalize::OutputNormalizer;
use crate::registry::ToolConfig;
use crate::template::{TemplateContext, TemplateParser, STANDARD_PLACEHOLDERS};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
        }
    }
}

/// Why a call produced an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CommandBuild,
    CommandNotFound,
    InvalidCommand,
    ExecutionFailed,
    Timeout,
    NonZeroExit,
}

/// Uniform result of one tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub status: ResponseStatus,
    /// Normalized response text, or the error message for failed calls
    pub output: String,
    pub tool: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolResponse {
    fn failure(tool: &str, model: &str, kind: ErrorKind, message: String) -> Self {
        Self {
            status: ResponseStatus::Error,
            output: message.clone(),
            tool: tool.to_string(),
            model: model.to_string(),
            exit_code: None,
            stdout: None,
            stderr: None,
            duration_ms: None,
            metadata: Map::new(),
            error: Some(message),
            error_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Capability every tool integration provides
pub trait ToolAdapter: Send + Sync {
    /// Run `prompt` on `model`. Execution failures come back as an error
    /// response; only caller mistakes (unknown model) are `Err`.
    fn execute(&self, prompt: &str, model: &str) -> Result<ToolResponse, AdapterError>;

    /// Check the tool's configuration is usable
    fn validate_config(&self) -> Result<(), AdapterError>;

    fn tool_name(&self) -> &str;

    fn supported_models(&self) -> &[String];

    fn supports_model(&self, model: &str) -> bool {
        self.supported_models().iter().any(|m| m == model)
    }
}

/// Config-driven adapter for any CLI that takes a prompt and a model
#[derive(Debug)]
pub struct CliToolAdapter {
    name: String,
    config: ToolConfig,
    binary_path: PathBuf,
    env: BTreeMap<String, String>,
    parser: TemplateParser,
    executor: SubprocessExecutor,
    normalizer: Arc<OutputNormalizer>,
}

impl CliToolAdapter {
    /// Build an adapter with the default parser, executor and normalizer
    pub fn new(name: &str, config: ToolConfig) -> Result<Self, AdapterError> {
        Self::with_components(
            name,
            config,
            TemplateParser::standard(),
            SubprocessExecutor::new(),
            Arc::new(OutputNormalizer::new()),
        )
    }

    pub fn with_components(
        name: &str,
        config: ToolConfig,
        parser: TemplateParser,
        executor: SubprocessExecutor,
        normalizer: Arc<OutputNormalizer>,
    ) -> Result<Self, AdapterError> {
        let missing: Vec<String> = config
            .env_required
            .iter()
            .filter(|var| std::env::var_os(var).map_or(true, |v| v.is_empty()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(AdapterError::MissingEnv {
                tool: name.to_string(),
                missing,
            });
        }

        let env = config
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect();

        let binary_path = resolve_binary(name, &config)?;
        info!(tool = name, path = %binary_path.display(), "resolved tool binary");

        Ok(Self {
            name: name.to_string(),
            config,
            binary_path,
            env,
            parser,
            executor,
            normalizer,
        })
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn build_command(&self, prompt: &str, model: &str) -> Result<Vec<String>, crate::error::TemplateError> {
        let mut context = TemplateContext::new();
        context.insert("binary".to_string(), self.binary_path.to_string_lossy().into_owned());
        context.insert("model".to_string(), model.to_string());
        context.insert("prompt".to_string(), prompt.to_string());
        self.parser.parse(&self.config.command_template, &context)
    }
}

impl ToolAdapter for CliToolAdapter {
    fn execute(&self, prompt: &str, model: &str) -> Result<ToolResponse, AdapterError> {
        if !self.config.supports(model) {
            return Err(AdapterError::InvalidModel {
                tool: self.name.clone(),
                model: model.to_string(),
                supported: self.config.models.clone(),
            });
        }

        let argv = match self.build_command(prompt, model) {
            Ok(argv) => argv,
            Err(e) => {
                warn!(tool = %self.name, error = %e, "failed to build command");
                return Ok(ToolResponse::failure(
                    &self.name,
                    model,
                    ErrorKind::CommandBuild,
                    format!("Failed to build command for '{}': {}", self.name, e),
                ));
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs());
        let env = (!self.env.is_empty()).then_some(&self.env);
        let result = match self.executor.execute(&argv, Some(timeout), env) {
            Ok(result) => result,
            Err(e) => {
                let kind = match e {
                    ExecError::CommandNotFound { .. } => ErrorKind::CommandNotFound,
                    ExecError::InvalidCommand(_) => ErrorKind::InvalidCommand,
                    ExecError::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
                };
                warn!(tool = %self.name, error = %e, "tool execution failed");
                return Ok(ToolResponse::failure(&self.name, model, kind, e.to_string()));
            }
        };

        let duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX);

        if result.timed_out {
            let mut response = ToolResponse::failure(
                &self.name,
                model,
                ErrorKind::Timeout,
                format!(
                    "Tool '{}' timed out after {}s. Raise `timeout` in tools.yaml or shorten the prompt.",
                    self.name,
                    timeout.as_secs()
                ),
            );
            response.exit_code = Some(result.exit_code);
            response.duration_ms = Some(duration_ms);
            return Ok(response);
        }

        if result.exit_code != 0 {
            let detail = result.stderr.trim();
            let mut response = ToolResponse::failure(
                &self.name,
                model,
                ErrorKind::NonZeroExit,
                format!(
                    "Tool '{}' exited with code {}{}{}",
                    self.name,
                    result.exit_code,
                    if detail.is_empty() { "" } else { ": " },
                    detail
                ),
            );
            response.exit_code = Some(result.exit_code);
            response.stdout = Some(result.stdout);
            response.stderr = Some(result.stderr);
            response.duration_ms = Some(duration_ms);
            return Ok(response);
        }

        let normalized = self
            .normalizer
            .normalize(&result.stdout, self.config.output_format.as_deref());
        let mut metadata = normalized.metadata;
        if !normalized.warnings.is_empty() {
            metadata.insert("warnings".to_string(), Value::from(normalized.warnings));
        }
        if !normalized.errors.is_empty() {
            metadata.insert("normalize_errors".to_string(), Value::from(normalized.errors));
        }
        debug!(tool = %self.name, model, duration_ms, "tool call succeeded");

        Ok(ToolResponse {
            status: ResponseStatus::Success,
            output: normalized.response_text,
            tool: self.name.clone(),
            model: model.to_string(),
            exit_code: Some(result.exit_code),
            stdout: Some(result.stdout),
            stderr: Some(result.stderr),
            duration_ms: Some(duration_ms),
            metadata,
            error: None,
            error_kind: None,
        })
    }

    fn validate_config(&self) -> Result<(), AdapterError> {
        let invalid = |message: String| AdapterError::InvalidConfig {
            tool: self.name.clone(),
            message,
        };

        if self.config.models.is_empty() {
            return Err(invalid("no models declared".to_string()));
        }
        let names = self
            .parser
            .placeholders(&self.config.command_template)
            .map_err(|e| invalid(e.to_string()))?;
        for required in ["binary", "prompt"] {
            if !names.iter().any(|n| n == required) {
                return Err(invalid(format!(
                    "command_template must reference {{{{{}}}}}",
                    required
                )));
            }
        }
        if let Some(unknown) = names
            .iter()
            .find(|n| !STANDARD_PLACEHOLDERS.contains(&n.as_str()))
        {
            return Err(invalid(format!("unsupported placeholder {{{{{}}}}}", unknown)));
        }
        Ok(())
    }

    fn tool_name(&self) -> &str {
        &self.name
    }

    fn supported_models(&self) -> &[String] {
        &self.config.models
    }
}

// ============================================================================
// Binary resolution
// ============================================================================

/// Resolve the tool's binary: explicit path, then PATH, then the platform table
fn resolve_binary(tool: &str, config: &ToolConfig) -> Result<PathBuf, AdapterError> {
    let explicit = config.binary_path.as_deref().or_else(|| {
        let b = config.binary.as_str();
        (b.contains(std::path::MAIN_SEPARATOR) || b.contains('/') || b.starts_with('~')).then_some(b)
    });
    if let Some(raw) = explicit {
        let path = expand_tilde(raw);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(AdapterError::NotExecutable {
            tool: tool.to_string(),
            path,
        });
    }

    let mut tried = vec![format!("PATH:{}", config.binary)];
    if let Ok(path) = which::which(&config.binary) {
        return Ok(path);
    }

    if let Some(candidates) = config.platforms.get(std::env::consts::OS) {
        for candidate in candidates {
            let path = expand_tilde(candidate);
            debug!(tool, path = %path.display(), "checking platform fallback");
            if is_executable(&path) {
                return Ok(path);
            }
            tried.push(path.display().to_string());
        }
    }

    Err(AdapterError::BinaryNotFound {
        tool: tool.to_string(),
        binary: config.binary.clone(),
        tried,
        install_hint: config.install_hint.clone(),
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    let home = std::env::var("HOME").ok();
    match (path, home) {
        ("~", Some(home)) => PathBuf::from(home),
        (p, Some(home)) if p.starts_with("~/") => PathBuf::from(home).join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("static regex")
    })
}

/// Expand `${VAR}` and `${VAR:default}` against the process environment
pub fn expand_env(value: &str) -> String {
    expand_env_with(value, |name| std::env::var(name).ok())
}

/// Expand `${VAR}` and `${VAR:default}` using `lookup`; unset without a default is empty
pub fn expand_env_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env_var_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1])
                .filter(|v| !v.is_empty())
                .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

// ============================================================================
// Registry
// ============================================================================

/// Adapters keyed by tool name, built once at startup
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ToolAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("tools", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every tool; tools that fail to construct are
    /// left out and returned alongside the registry
    pub fn from_tools(
        tools: &BTreeMap<String, ToolConfig>,
        normalizer: Arc<OutputNormalizer>,
    ) -> (Self, Vec<(String, AdapterError)>) {
        let mut registry = Self::new();
        let mut skipped = Vec::new();
        for (name, config) in tools {
            let built = CliToolAdapter::with_components(
                name,
                config.clone(),
                TemplateParser::standard(),
                SubprocessExecutor::new(),
                Arc::clone(&normalizer),
            );
            match built {
                Ok(adapter) => registry.insert(Arc::new(adapter)),
                Err(e) => {
                    warn!(tool = %name, error = %e, "tool unavailable, skipping");
                    skipped.push((name.clone(), e));
                }
            }
        }
        (registry, skipped)
    }

    pub fn insert(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.tool_name().to_string(), adapter);
    }

    pub fn get(&self, tool: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters.get(tool)
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.adapters.contains_key(tool)
    }

    /// Tool names in lexical order
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(|k| k.as_str()).collect()
    }

    /// Adapters in lexical order of tool name
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ToolAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
