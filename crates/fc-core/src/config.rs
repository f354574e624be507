use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Kinded};
use crate::types::{ApprovalMode, Mode};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

impl Kinded for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// LLM provider credentials and identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub endpoint: String,
    pub api_version: Option<String>,
    pub model: String,
}

/// Embeddings provider. All fields optional; when `endpoint` is unset the
/// vector store runs in degraded keyword mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub model_name: Option<String>,
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub default_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_size: 100,
            default_timeout_ms: 600_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub max_concurrent_requests: usize,
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub retry_attempts: u32,
    pub enabled: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            requests_per_minute: 5_000,
            tokens_per_minute: 5_000_000,
            retry_attempts: 3,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 4000,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, sourced entirely from the environment.
///
/// `API_KEY` and `ENDPOINT` are required; everything else falls back to
/// documented defaults. Credentials never appear as literals anywhere else
/// in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    pub embedding: EmbeddingConfig,
    pub mode: Mode,
    pub approval_mode: ApprovalMode,
    pub agents: AgentLimits,
    pub throttle: ThrottleConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Load via an injected lookup function (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = get("API_KEY").ok_or(ConfigError::Missing("API_KEY"))?;
        let endpoint = get("ENDPOINT").ok_or(ConfigError::Missing("ENDPOINT"))?;

        let mode = match get("FLEXICLI_MODE") {
            Some(raw) => raw.parse::<Mode>().map_err(|_| ConfigError::Invalid {
                var: "FLEXICLI_MODE",
                value: raw,
            })?,
            None => Mode::Concise,
        };

        let approval_mode = match get("APPROVAL_MODE") {
            Some(raw) => raw
                .parse::<ApprovalMode>()
                .map_err(|_| ConfigError::Invalid {
                    var: "APPROVAL_MODE",
                    value: raw,
                })?,
            None => ApprovalMode::Default,
        };

        let agents = AgentLimits {
            max_concurrent: parse_or(&get, "MINI_AGENT_MAX_CONCURRENT", 10)?,
            queue_size: parse_or(&get, "MINI_AGENT_QUEUE_SIZE", 100)?,
            default_timeout_ms: parse_or(&get, "MINI_AGENT_DEFAULT_TIMEOUT", 600_000)?,
            max_retries: parse_or(&get, "MINI_AGENT_MAX_RETRIES", 2)?,
        };

        let throttle = ThrottleConfig {
            max_concurrent_requests: parse_or(&get, "MAX_CONCURRENT_REQUESTS", 4)?,
            requests_per_minute: parse_or(&get, "REQUESTS_PER_MINUTE", 5_000)?,
            tokens_per_minute: parse_or(&get, "TOKENS_PER_MINUTE", 5_000_000)?,
            retry_attempts: parse_or(&get, "RETRY_ATTEMPTS", 3)?,
            enabled: get("ENABLE_THROTTLING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        };

        let monitoring = MonitoringConfig {
            enabled: get("ENABLE_MONITORING")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            port: parse_or(&get, "MONITOR_PORT", 4000)?,
        };

        Ok(Self {
            provider: ProviderConfig {
                api_key,
                endpoint,
                api_version: get("API_VERSION"),
                model: get("MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            },
            embedding: EmbeddingConfig {
                api_key: get("EMBEDDING_API_KEY"),
                endpoint: get("EMBEDDING_API_ENDPOINT"),
                deployment: get("EMBEDDING_API_DEPLOYMENT"),
                model_name: get("EMBEDDING_API_MODEL_NAME"),
                api_version: get("EMBEDDING_API_API_VERSION"),
            },
            mode,
            approval_mode,
            agents,
            throttle,
            monitoring,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            var,
            value: raw,
        }),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
