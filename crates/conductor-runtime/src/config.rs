//! Runtime configuration loading from YAML.
//!
//! One [`RuntimeConfig`] document covers the run budget, reasoner settings,
//! per-tool call policies (timeout, retry, breaker), and the optional result
//! cache. Every section and field has a default, so an empty document is a
//! valid configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_core::RunBudget;

use crate::reasoner::ReasonerSettings;
use crate::resilience::{BreakerProfiles, CircuitBreakerConfig, RetryOptions};
use crate::tools::{ToolCacheConfig, ToolProfile};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Reasoner section: generation settings plus transport retry policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasonerConfig {
    /// Model, token limit, temperature, system prompt.
    #[serde(flatten)]
    pub settings: ReasonerSettings,

    /// Retry policy for transport failures of one reasoner call.
    #[serde(default = "default_reasoner_retry")]
    pub retry: RetryOptions,
}

fn default_reasoner_retry() -> RetryOptions {
    RetryOptions::default()
}

/// Call policy and breaker profile for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    /// Circuit breaker profile.
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Per-attempt timeout and retry policy.
    #[serde(flatten)]
    pub call: ToolProfile,
}

/// Tools section: a default policy plus per-tool overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Applied to any tool without an explicit override.
    #[serde(default)]
    pub default: ToolSettings,

    /// Per-tool overrides keyed by tool name.
    #[serde(default)]
    pub per_tool: BTreeMap<String, ToolSettings>,
}

impl ToolsConfig {
    /// Call policy for `name` (falls back to the default section).
    pub fn call_profile(&self, name: &str) -> ToolProfile {
        self.per_tool
            .get(name)
            .map(|settings| settings.call.clone())
            .unwrap_or_else(|| self.default.call.clone())
    }

    /// Breaker profiles for the registry, one per override plus the default.
    pub fn breaker_profiles(&self) -> BreakerProfiles {
        BreakerProfiles {
            default: self.default.breaker.clone(),
            per_tool: self
                .per_tool
                .iter()
                .map(|(name, settings)| (name.clone(), settings.breaker.clone()))
                .collect(),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Turn, per-turn, and wall-clock caps for a run.
    #[serde(default)]
    pub budget: RunBudget,

    /// Reasoner backend settings.
    #[serde(default)]
    pub reasoner: ReasonerConfig,

    /// Per-tool call policies.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Tool-result cache (disabled unless enabled explicitly).
    #[serde(default)]
    pub cache: ToolCacheConfig,
}

impl RuntimeConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Reject configurations that would make a run degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "budget.max_turns must be at least 1".to_string(),
            ));
        }
        if self.budget.total_budget.is_zero() || self.budget.per_turn_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "budget timeouts must be non-zero".to_string(),
            ));
        }
        if self.reasoner.settings.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "reasoner.max_tokens must be at least 1".to_string(),
            ));
        }
        let breaker_settings = std::iter::once(("default", &self.tools.default))
            .chain(self.tools.per_tool.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, settings) in breaker_settings {
            if settings.breaker.failure_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "tools.{name}: failure_threshold must be at least 1"
                )));
            }
            if settings.breaker.half_open_probes == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "tools.{name}: half_open_probes must be at least 1"
                )));
            }
        }
        Ok(())
    }
}
