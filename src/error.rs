//! Error types for every layer of the router
//!
//! Construction-time problems (bad binary, bad config) and programmer
//! errors (unknown model, malformed template) surface as these errors.
//! Per-call execution failures are folded into an error `ToolResponse`
//! by the adapter instead.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn a command template into an argv
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template syntax error: {message} (template: {template:?})")]
    Syntax { template: String, message: String },

    #[error("Template placeholder error: {message}")]
    Placeholder { message: String },
}

/// Failure to start or supervise a subprocess
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Command not found: '{program}'. Check that it is installed and on PATH.")]
    CommandNotFound { program: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to execute '{program}': {source}")]
    ExecutionFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Adapter construction and caller errors
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(
        "Binary for tool '{tool}' not found (looked for '{binary}').\n  Tried: {}\n  {}",
        .tried.join(", "),
        .install_hint.as_deref().unwrap_or("Install the tool or set `binary_path` in tools.yaml.")
    )]
    BinaryNotFound {
        tool: String,
        binary: String,
        tried: Vec<String>,
        install_hint: Option<String>,
    },

    #[error("Configured path for tool '{tool}' is not an executable file: {}", .path.display())]
    NotExecutable { tool: String, path: PathBuf },

    #[error("Model '{model}' is not supported by tool '{tool}'. Supported models: {}", .supported.join(", "))]
    InvalidModel {
        tool: String,
        model: String,
        supported: Vec<String>,
    },

    #[error("Tool '{tool}' requires environment variable(s) {}. Export them before running.", .missing.join(", "))]
    MissingEnv { tool: String, missing: Vec<String> },

    #[error("Invalid configuration for tool '{tool}': {message}")]
    InvalidConfig { tool: String, message: String },
}

/// No viable (tool, model) pair for a request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Unknown agent '{agent}'. Available agents: {}", .available.join(", "))]
    UnknownAgent {
        agent: String,
        available: Vec<String>,
    },

    #[error("Unknown model '{model}' selected for agent '{agent}'. Add it to models.yaml or fix the agent config.")]
    UnknownModel { agent: String, model: String },

    #[error(
        "No viable route for agent '{agent}': preferred tool '{tool}' is unavailable and the fallback chain was exhausted.\n  Tried: {}",
        .tried.join("; ")
    )]
    NoViableRoute {
        agent: String,
        tool: String,
        tried: Vec<String>,
    },

    #[error("No installed tool supports model '{model}' (agent '{agent}', selected tool '{tool}'). Install a compatible tool or change the model.")]
    NoCompatibleTool {
        agent: String,
        tool: String,
        model: String,
    },
}

/// Telemetry persistence errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Cannot open telemetry database {}: {source}", .path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: diesel::r2d2::PoolError,
    },

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Integrity error: invocation id '{0}' has already been logged")]
    Integrity(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors loading runtime or registry configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Anything that can stop a dispatch before a response is produced
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Tool '{0}' was selected but has no registered adapter")]
    MissingAdapter(String),
}
