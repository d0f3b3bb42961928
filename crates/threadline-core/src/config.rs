//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ModelSettings, RunConfig, ThreadId, ThreadSettings};

/// Top-level Threadline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<EchoConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

/// Global agent defaults, overridable per thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursion_limit: Option<u32>,

    /// Name of the runtime node that produces assistant messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_node: Option<String>,
}

impl AgentConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// What to do when a thread that already has a live invocation starts another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Replace the registration and leave the previous invocation running.
    Overwrite,
    /// Cancel the previous invocation, then replace it.
    #[default]
    CancelPrevious,
    /// Refuse the new invocation.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `conversations.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Pacing of the built-in echo runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "threadline_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::ThreadlineError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted)
            .map_err(|e| crate::error::ThreadlineError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn default_model(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.default_model.clone())
            .unwrap_or_else(|| "qwen-plus".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent.as_ref().and_then(|a| a.max_tokens).unwrap_or(4096)
    }

    pub fn recursion_limit(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.recursion_limit)
            .unwrap_or(1000)
    }

    pub fn model_node(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.model_node.clone())
            .unwrap_or_else(|| "model".to_string())
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.registry
            .as_ref()
            .map(|r| r.on_conflict)
            .unwrap_or_default()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("conversations"))
    }

    pub fn echo_delay_ms(&self) -> u64 {
        self.echo.as_ref().map(|e| e.delay_ms).unwrap_or(0)
    }

    /// Merge per-thread overrides over the global agent defaults.
    pub fn run_config(&self, thread_id: &ThreadId, overrides: Option<&ThreadSettings>) -> RunConfig {
        let agent = self.agent.clone().unwrap_or_default();
        let overrides = overrides.cloned().unwrap_or_default();

        RunConfig {
            thread_id: thread_id.clone(),
            model: ModelSettings {
                model: overrides.model.unwrap_or_else(|| self.default_model()),
                api_key: overrides.api_key.or_else(|| agent.resolve_api_key()),
                base_url: overrides.base_url.or(agent.base_url),
                max_tokens: overrides.max_tokens.unwrap_or_else(|| self.max_tokens()),
            },
            recursion_limit: overrides
                .recursion_limit
                .unwrap_or_else(|| self.recursion_limit()),
            configurable: overrides.configurable,
        }
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "agent.default_model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(agent) = &self.agent {
            if agent.resolve_api_key().is_none() {
                warnings.push("Agent has no API key configured".to_string());
            }
            if agent.max_tokens == Some(0) {
                errors.push("agent.max_tokens cannot be 0".to_string());
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Threadline data: `~/.threadline/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threadline")
}
