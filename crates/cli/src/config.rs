//! Configuration loading from keel.toml.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use runtime::{OperationTimeouts, ProviderTimeouts};
use serde::Deserialize;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern is valid")
});

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub limits: LimitsConfig,
    pub retrieval: RetrievalConfig,
    /// Tool providers, registered in file order.
    #[serde(rename = "provider")]
    pub providers: Vec<ProviderConfig>,
}

/// OpenAI-compatible endpoint.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl ModelConfig {
    /// The configured key, if any. Local endpoints often need none.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub max_rounds: usize,
    /// Knowledge label active at startup.
    pub label: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_rounds: runtime::DEFAULT_MAX_ROUNDS,
            label: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub call_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub chat_timeout_secs: u64,
    pub index_timeout_secs: u64,
    pub admin_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let operations = OperationTimeouts::default();
        Self {
            call_timeout_secs: runtime::DEFAULT_CALL_TIMEOUT.as_secs(),
            handshake_timeout_secs: runtime::DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            chat_timeout_secs: operations.chat.as_secs(),
            index_timeout_secs: operations.index.as_secs(),
            admin_timeout_secs: operations.admin.as_secs(),
        }
    }
}

impl LimitsConfig {
    pub fn provider_timeouts(&self) -> ProviderTimeouts {
        ProviderTimeouts {
            call: Duration::from_secs(self.call_timeout_secs),
            handshake: Duration::from_secs(self.handshake_timeout_secs),
        }
    }

    pub fn operation_timeouts(&self) -> OperationTimeouts {
        OperationTimeouts {
            chat: Duration::from_secs(self.chat_timeout_secs),
            index: Duration::from_secs(self.index_timeout_secs),
            admin: Duration::from_secs(self.admin_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub similarity_threshold: f32,
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: runtime::DEFAULT_SIMILARITY_THRESHOLD,
            top_k: runtime::DEFAULT_TOP_K,
        }
    }
}

/// One `[[provider]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProviderConfig {
    /// Resolve `${VAR}` references against the process environment.
    pub fn to_server_config(&self) -> mcp::ServerConfig {
        mcp::ServerConfig {
            name: self.name.clone(),
            command: expand_env(&self.command),
            args: self.args.iter().map(|a| expand_env(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand_env(v)))
                .collect(),
        }
    }
}

/// Replace every `${VAR}` with its value; unset variables expand to "".
pub fn expand_env(value: &str) -> String {
    ENV_REFERENCE
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, provider) in self.providers.iter().enumerate() {
            if self.providers[..i].iter().any(|p| p.name == provider.name) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be at least 1".into()));
        }
        Ok(())
    }

    pub fn server_configs(&self) -> Vec<mcp::ServerConfig> {
        self.providers
            .iter()
            .map(ProviderConfig::to_server_config)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("provider `{0}` is configured more than once")]
    DuplicateProvider(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
