//! Process configuration
//!
//! One TOML file holds every tunable:
//!
//! ```toml
//! routing_path = "task_routing.json"
//!
//! [[providers]]
//! id = "claude"
//! protocol = "anthropic"
//! model = "claude-sonnet-4-20250514"
//! base_url = "https://api.anthropic.com"
//! api_key_env = "ANTHROPIC_API_KEY"
//!
//! [retry]
//! # capped again by the routing record's maxRetries; the smaller wins
//! max_attempts = 3
//!
//! [orchestrator]
//! primary_ms = 250000
//! secondary_ms = 120000
//!
//! [arbitration]
//! strategy = "narrative_assisted"
//! ```
//!
//! Credentials are read from the environment at load. Without a file,
//! [`AugurConfig::from_env`] enables every built-in preset whose key is set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ensemble::ArbitrationConfig;
use crate::registry::{ConfigError, ProviderConfig, ProviderRegistry};
use crate::resilience::StageTimeouts;
use crate::retry::RetryPolicy;
use crate::verification::AgreementConfig;

/// Routing record location when none is configured.
pub const DEFAULT_ROUTING_FILE: &str = "task_routing.json";

/// Overrides the routing record location.
pub const ROUTING_PATH_ENV: &str = "AUGUR_ROUTING_PATH";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AugurConfig {
    pub providers: Vec<ProviderConfig>,
    pub retry: RetryPolicy,
    pub verification: AgreementConfig,
    pub orchestrator: StageTimeouts,
    pub arbitration: ArbitrationConfig,
    pub routing_path: Option<PathBuf>,
}

impl AugurConfig {
    /// Built-in presets; each is enabled only if its credential is present.
    pub fn from_env() -> Self {
        let providers = ProviderConfig::preset_ids()
            .iter()
            .filter_map(|id| ProviderConfig::preset(id))
            .map(|mut config| {
                config.resolve_credential();
                config.enabled = config.has_credential();
                config
            })
            .collect::<Vec<_>>();

        let enabled = providers.iter().filter(|p| p.enabled).count();
        debug!(presets = providers.len(), enabled, "Built provider presets from environment");

        Self {
            providers,
            routing_path: std::env::var(ROUTING_PATH_ENV).ok().map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Parse TOML text. `origin` names the source in errors.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        if config.providers.is_empty() {
            config.providers = Self::from_env().providers;
        }
        for provider in &mut config.providers {
            provider.resolve_credential();
        }
        if config.routing_path.is_none() {
            config.routing_path = std::env::var(ROUTING_PATH_ENV).ok().map(PathBuf::from);
        }

        config.validate()?;
        Ok(config)
    }

    /// Read, resolve credentials and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text, path)?;
        info!(
            path = ?path,
            providers = config.providers.len(),
            enabled = config.providers.iter().filter(|p| p.enabled).count(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// `load(path)` when given, otherwise `from_env()`.
    pub fn load_or_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.id.clone()));
            }
            provider.validate()?;
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.min_delay_ms".to_string(),
                message: "floor exceeds cap".to_string(),
            });
        }

        self.orchestrator.validate()?;

        let weights = &self.verification;
        if weights.length_weight < 0.0 || weights.keyword_weight < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "verification".to_string(),
                message: "agreement weights must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn routing_path(&self) -> PathBuf {
        self.routing_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROUTING_FILE))
    }

    pub fn build_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        ProviderRegistry::from_configs(&self.providers)
    }
}
