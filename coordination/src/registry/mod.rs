//! Provider Registry: configured remote providers
//!
//! Holds one [`ProviderConfig`] per provider identity together with the
//! wire implementation built for it. Read-mostly: lookups clone an `Arc`
//! handle out from under a read lock so no lock is ever held across a
//! network call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::{build_provider, SharedProvider, WireProtocol};

/// Default per-call timeout when a config entry does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Errors raised while loading or validating provider settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider '{provider}' is enabled but has no {field}")]
    MissingField {
        provider: String,
        field: &'static str,
    },

    #[error("provider '{0}' is declared more than once")]
    DuplicateProvider(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Static settings for one remote provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identity used by routing records (e.g. "claude", "deepseek").
    pub id: String,
    pub protocol: WireProtocol,
    /// Default model id for this provider.
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    /// Inline credential. Prefer `api_key_env`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(id: &str, protocol: WireProtocol, model: &str, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            protocol,
            model: model.to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            api_key_env: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Built-in settings for well-known providers.
    pub fn preset(id: &str) -> Option<Self> {
        let (protocol, model, base_url, env, priority) = match id {
            "claude" => (
                WireProtocol::Anthropic,
                "claude-sonnet-4-20250514",
                "https://api.anthropic.com",
                "ANTHROPIC_API_KEY",
                0,
            ),
            "gemini" => (
                WireProtocol::Gemini,
                "gemini-2.0-flash-exp",
                "https://generativelanguage.googleapis.com",
                "GEMINI_API_KEY",
                1,
            ),
            "deepseek" => (
                WireProtocol::OpenAi,
                "deepseek-reasoner",
                "https://api.deepseek.com",
                "DEEPSEEK_API_KEY",
                2,
            ),
            "kimi" => (
                WireProtocol::OpenAi,
                "kimi-k2-turbo-preview",
                "https://api.moonshot.cn/v1",
                "MOONSHOT_API_KEY",
                3,
            ),
            "qwen" => (
                WireProtocol::OpenAi,
                "qwen-plus",
                "https://dashscope.aliyuncs.com/compatible-mode/v1",
                "DASHSCOPE_API_KEY",
                4,
            ),
            "glm" => (
                WireProtocol::OpenAi,
                "glm-4-flash",
                "https://open.bigmodel.cn/api/paas/v4",
                "ZHIPU_API_KEY",
                5,
            ),
            "openrouter" => (
                WireProtocol::OpenAi,
                "anthropic/claude-3.5-sonnet",
                "https://openrouter.ai/api/v1",
                "OPENROUTER_API_KEY",
                6,
            ),
            _ => return None,
        };

        let mut config = Self::new(id, protocol, model, base_url).with_priority(priority);
        config.api_key_env = Some(env.to_string());
        Some(config)
    }

    /// Identities with a built-in preset, in default priority order.
    pub fn preset_ids() -> &'static [&'static str] {
        &["claude", "gemini", "deepseek", "kimi", "qwen", "glm", "openrouter"]
    }

    /// Fill `api_key` from `api_key_env` when no inline key is set.
    pub fn resolve_credential(&mut self) {
        if self.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            return;
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    self.api_key = Some(key);
                }
            }
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Check that an enabled entry has everything needed to make a call.
    ///
    /// Disabled entries are never rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let missing = |field| ConfigError::MissingField {
            provider: self.id.clone(),
            field,
        };
        if self.id.trim().is_empty() {
            return Err(missing("id"));
        }
        if self.model.trim().is_empty() {
            return Err(missing("model"));
        }
        if self.base_url.trim().is_empty() {
            return Err(missing("base_url"));
        }
        if !self.has_credential() {
            return Err(missing("credential"));
        }
        Ok(())
    }

    /// Reasoning models think before answering and get twice the budget.
    pub fn is_reasoning_model(model: &str) -> bool {
        model.contains("reasoner")
    }

    /// Per-call timeout for `model` on this provider.
    pub fn call_timeout(&self, model: &str) -> Duration {
        let base = Duration::from_millis(self.timeout_ms.max(1));
        if Self::is_reasoning_model(model) {
            base * 2
        } else {
            base
        }
    }
}

/// A provider's settings together with its live wire implementation.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub config: ProviderConfig,
    pub client: SharedProvider,
}

impl RegisteredProvider {
    pub fn id(&self) -> &str {
        &self.config.id
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("config", &self.config)
            .field("protocol", &self.client.protocol())
            .finish()
    }
}

/// Shared reference to a ProviderRegistry
pub type SharedProviderRegistry = Arc<ProviderRegistry>;

/// Catalogue of configured providers keyed by identity.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of configs, rejecting duplicate ids.
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for config in configs {
            if registry.get(&config.id).is_some() {
                return Err(ConfigError::DuplicateProvider(config.id.clone()));
            }
            registry.register(config.clone())?;
        }
        Ok(registry)
    }

    pub fn shared(self) -> SharedProviderRegistry {
        Arc::new(self)
    }

    /// Validate `config` and register the matching wire implementation.
    ///
    /// Registering an existing identity replaces it.
    pub fn register(&self, config: ProviderConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let client = build_provider(&config)?;
        self.insert(config, client);
        Ok(())
    }

    /// Register with a caller-supplied implementation.
    pub fn register_with(
        &self,
        config: ProviderConfig,
        client: SharedProvider,
    ) -> Result<(), ConfigError> {
        if config.enabled && config.id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                provider: config.id,
                field: "id",
            });
        }
        if config.enabled && config.model.trim().is_empty() {
            return Err(ConfigError::MissingField {
                provider: config.id,
                field: "model",
            });
        }
        self.insert(config, client);
        Ok(())
    }

    fn insert(&self, config: ProviderConfig, client: SharedProvider) {
        let id = config.id.clone();
        info!(
            provider = %id,
            protocol = %config.protocol,
            model = %config.model,
            priority = config.priority,
            enabled = config.enabled,
            "Registered provider"
        );
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(id, RegisteredProvider { config, client });
    }

    /// Settings for `id`, enabled or not.
    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.lookup(id).map(|p| p.config)
    }

    /// Settings and implementation for `id`, enabled or not.
    pub fn lookup(&self, id: &str) -> Option<RegisteredProvider> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned()
    }

    /// Enabled provider for `id`, if any.
    pub fn enabled(&self, id: &str) -> Option<RegisteredProvider> {
        self.lookup(id).filter(|p| p.config.enabled)
    }

    /// Enabled providers ordered by ascending priority, then identity.
    pub fn list_enabled(&self) -> Vec<RegisteredProvider> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut enabled: Vec<RegisteredProvider> = entries
            .values()
            .filter(|p| p.config.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        enabled
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        self.list_enabled()
            .into_iter()
            .map(|p| p.config.id)
            .collect()
    }

    /// Default model for `id`, falling back to the built-in preset.
    pub fn default_model(&self, id: &str) -> Option<String> {
        self.get(id)
            .map(|c| c.model)
            .or_else(|| ProviderConfig::preset(id).map(|c| c.model))
    }

    /// Enable or disable an entry. Enabling re-validates the settings.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, ConfigError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(id) else {
            return Ok(false);
        };
        let mut config = entry.config.clone();
        config.enabled = enabled;
        config.validate()?;
        entry.config = config;
        debug!(provider = id, enabled, "Provider toggled");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
