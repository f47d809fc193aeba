//! Routing engine
//!
//! Picks a (tool, model) pair for an agent request. The decision depends
//! only on the loaded configuration, the adapters that are actually
//! installed, and the request inputs, so the same inputs always produce
//! the same decision.

use crate::adapter::{AdapterRegistry, ToolAdapter};
use crate::error::RoutingError;
use crate::registry::{AgentConfig, ModelConfig, PoliciesConfig, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The resolved (tool, model) pair for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub tool: String,
    pub model: String,
    /// Every step that shaped the decision, joined with "; "
    pub reason: String,
    pub fallback_used: bool,
    pub original_tool: String,
    pub original_model: String,
}

/// Selects tools and models per agent policy
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    agents: BTreeMap<String, AgentConfig>,
    models: BTreeMap<String, ModelConfig>,
    policies: PoliciesConfig,
    adapters: AdapterRegistry,
}

impl RoutingEngine {
    pub fn new(
        agents: BTreeMap<String, AgentConfig>,
        models: BTreeMap<String, ModelConfig>,
        policies: PoliciesConfig,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            agents,
            models,
            policies,
            adapters,
        }
    }

    pub fn from_registry(registry: &Registry, adapters: AdapterRegistry) -> Self {
        Self::new(
            registry.agents.clone(),
            registry.models.clone(),
            registry.policies.clone(),
            adapters,
        )
    }

    /// Choose a tool and model for `agent`
    pub fn route(
        &self,
        agent: &str,
        task_type: Option<&str>,
        prompt_tokens: Option<u64>,
    ) -> Result<RoutingDecision, RoutingError> {
        let config = self.agents.get(agent).ok_or_else(|| RoutingError::UnknownAgent {
            agent: agent.to_string(),
            available: self.agents.keys().cloned().collect(),
        })?;

        let mut tool = config.preferred_tool.clone();
        let mut model = config.preferred_model.clone();
        let mut reasons = vec![format!("preferred {}:{}", tool, model)];
        let mut fallback_used = false;

        if let Some(task) = task_type {
            if let Some(task_model) = config.task_types.get(task) {
                model = task_model.clone();
                reasons.push(format!("task type '{}' selects model {}", task, model));
            }
        }

        let selected = self.models.get(&model).ok_or_else(|| RoutingError::UnknownModel {
            agent: agent.to_string(),
            model: model.clone(),
        })?;

        let cheaper = self.cheaper_model(&model, selected, prompt_tokens);
        if let Some(cheaper) = &cheaper {
            reasons.push(format!(
                "prompt under simple-task threshold, using cheaper model {}",
                cheaper
            ));
            model = cheaper.clone();
        }

        match self.adapters.get(&tool) {
            None => {
                reasons.push(format!("tool '{}' unavailable", tool));
                let (fb_tool, fb_model) = self.walk_fallback_chain(agent, config, &tool)?;
                reasons.push(format!("fallback {}:{}", fb_tool, fb_model));
                if let Some(cheaper) = cheaper.as_ref().filter(|c| **c != fb_model) {
                    reasons.push(format!(
                        "fallback entry overrides cheaper model {}",
                        cheaper
                    ));
                }
                tool = fb_tool;
                model = fb_model;
                fallback_used = true;
            }
            Some(adapter) if !adapter.supports_model(&model) => {
                let switched = self
                    .adapters
                    .iter()
                    .find(|a| a.supports_model(&model))
                    .map(|a| a.tool_name().to_string())
                    .ok_or_else(|| RoutingError::NoCompatibleTool {
                        agent: agent.to_string(),
                        tool: tool.clone(),
                        model: model.clone(),
                    })?;
                reasons.push(format!(
                    "tool '{}' does not support {}, switching to '{}'",
                    tool, model, switched
                ));
                tool = switched;
                fallback_used = true;
            }
            Some(_) => {}
        }

        let decision = RoutingDecision {
            tool,
            model,
            reason: reasons.join("; "),
            fallback_used,
            original_tool: config.preferred_tool.clone(),
            original_model: config.preferred_model.clone(),
        };
        debug!(agent, tool = %decision.tool, model = %decision.model, reason = %decision.reason, "routed");
        Ok(decision)
    }

    /// First configured simple-task model strictly cheaper on input than `current`
    fn cheaper_model(&self, name: &str, current: &ModelConfig, prompt_tokens: Option<u64>) -> Option<String> {
        let policy = self.policies.cost_optimization.as_ref()?;
        let tokens = prompt_tokens?;
        if tokens >= policy.simple_task_threshold_tokens {
            return None;
        }
        policy
            .simple_task_models
            .iter()
            .filter(|candidate| candidate.as_str() != name)
            .find(|candidate| {
                self.models.get(candidate.as_str()).is_some_and(|m| {
                    m.cost_per_1k_tokens.input < current.cost_per_1k_tokens.input
                })
            })
            .cloned()
    }

    fn walk_fallback_chain(
        &self,
        agent: &str,
        config: &AgentConfig,
        preferred_tool: &str,
    ) -> Result<(String, String), RoutingError> {
        let mut tried = Vec::new();
        for entry in &config.fallback_chain {
            let Some((tool, model)) = entry.split_once(':') else {
                tried.push(format!("{} (malformed, expected tool:model)", entry));
                continue;
            };
            let (tool, model) = (tool.trim(), model.trim());
            let Some(adapter) = self.adapters.get(tool) else {
                tried.push(format!("{} (tool unavailable)", entry));
                continue;
            };
            if !self.models.contains_key(model) {
                tried.push(format!("{} (unknown model)", entry));
                continue;
            }
            if !adapter.supports_model(model) {
                tried.push(format!("{} (model not supported by tool)", entry));
                continue;
            }
            return Ok((tool.to_string(), model.to_string()));
        }
        Err(RoutingError::NoViableRoute {
            agent: agent.to_string(),
            tool: preferred_tool.to_string(),
            tried,
        })
    }

    /// Estimated USD cost of a call, if the model is known
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.models
            .get(model)
            .map(|m| m.cost_for(input_tokens, output_tokens))
    }

    pub fn adapter(&self, tool: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters.get(tool)
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(|k| k.as_str()).collect()
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }
}

/// Rough token count for text: about four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}
