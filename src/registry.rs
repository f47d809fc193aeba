//! Registry schemas: agents, tools, models and policies
//!
//! These are the already-validated configuration objects the router
//! consumes. They are deserialized from `agents.yaml`, `tools.yaml`,
//! `models.yaml` and (optionally) `policies.yaml` in a registry directory.

use crate::error::ConfigError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default subprocess timeout when a tool does not set one
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;

/// How to invoke one external CLI tool
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolConfig {
    /// Binary name looked up on PATH, or a path (absolute or `~/...`)
    pub binary: String,

    /// Explicit path that must exist; takes precedence over `binary`
    #[serde(default)]
    pub binary_path: Option<String>,

    /// e.g. `{{binary}} -p "{{prompt}}" --model {{model}}`
    pub command_template: String,

    /// Models this tool can run
    #[serde(default)]
    pub models: Vec<String>,

    /// Fallback install locations keyed by OS (`linux`, `macos`, `windows`)
    #[serde(default)]
    pub platforms: BTreeMap<String, Vec<String>>,

    /// Extra environment for the child; values may use `${VAR}` or `${VAR:default}`
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    /// Variables that must be set in the router's environment
    #[serde(default)]
    pub env_required: Vec<String>,

    /// Timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Output format hint for the normalizer (`json`, `jsonl`, `text`, ...)
    #[serde(default)]
    pub output_format: Option<String>,

    /// Shown when the binary cannot be found
    #[serde(default)]
    pub install_hint: Option<String>,
}

impl ToolConfig {
    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
    }
}

/// Per-1k-token pricing
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct TokenCost {
    pub input: f64,
    pub output: f64,
}

/// Pricing and capabilities of one model
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ModelConfig {
    pub provider: String,
    pub cost_per_1k_tokens: TokenCost,
    #[serde(default)]
    pub context_window: u64,
    #[serde(default)]
    pub task_suitability: Vec<String>,
}

impl ModelConfig {
    /// Cost in USD of a call with the given token counts
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_tokens.input
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_tokens.output
    }
}

/// Routing preferences of one agent
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AgentConfig {
    pub preferred_tool: String,
    pub preferred_model: String,
    /// Ordered `tool:model` pairs
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    /// Task type → model override
    #[serde(default)]
    pub task_types: BTreeMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Cheap-model substitution for small prompts
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CostOptimization {
    pub simple_task_threshold_tokens: u64,
    #[serde(default)]
    pub simple_task_models: Vec<String>,
}

/// Rate limits, carried for downstream admission control
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RateLimiting {
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub cost_optimization: Option<CostOptimization>,
    #[serde(default)]
    pub rate_limiting: Option<RateLimiting>,
}

/// Everything the router needs, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Registry {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub policies: PoliciesConfig,
}

#[derive(Deserialize)]
struct AgentsFile {
    agents: BTreeMap<String, AgentConfig>,
}

#[derive(Deserialize)]
struct ToolsFile {
    tools: BTreeMap<String, ToolConfig>,
}

#[derive(Deserialize)]
struct ModelsFile {
    models: BTreeMap<String, ModelConfig>,
}

#[derive(Deserialize)]
struct PoliciesFile {
    #[serde(default)]
    policies: PoliciesConfig,
}

impl Registry {
    /// Load a registry directory; `policies.yaml` may be absent
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let agents: AgentsFile = read_yaml(&dir.join("agents.yaml"))?;
        let tools: ToolsFile = read_yaml(&dir.join("tools.yaml"))?;
        let models: ModelsFile = read_yaml(&dir.join("models.yaml"))?;

        let policies_path = dir.join("policies.yaml");
        let policies = if policies_path.exists() {
            read_yaml::<PoliciesFile>(&policies_path)?.policies
        } else {
            PoliciesConfig::default()
        };

        Ok(Self {
            agents: agents.agents,
            tools: tools.tools,
            models: models.models,
            policies,
        })
    }

    /// Parse a single document holding all four sections
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
