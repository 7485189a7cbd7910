//! Task router: task type → provider, model and sampling parameters.
//!
//! Resolution order: per-task override with a provider → global primary
//! (keeping any per-task parameters). Every mutation is persisted; a failed
//! save is reported but the in-memory change stands.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::routing::{GlobalRouting, GlobalUpdate, RoutingConfig, TaskAssignment};
use crate::provider::GenerationParams;
use crate::registry::SharedProviderRegistry;

/// Saving the routing record failed. The in-memory state is unaffected.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write routing config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize routing config: {0}")]
    Serialize(String),
}

/// Why a record could not be read.
#[derive(Debug)]
enum LoadFailure {
    Missing,
    Corrupt(String),
}

/// Outcome of resolving a task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub task_type: String,
    pub provider: String,
    pub model: String,
    pub params: GenerationParams,
    /// Whether a per-task override chose the provider.
    pub overridden: bool,
}

/// Shared reference to a TaskRouter
pub type SharedTaskRouter = Arc<TaskRouter>;

pub struct TaskRouter {
    path: Option<PathBuf>,
    config: RwLock<RoutingConfig>,
    registry: SharedProviderRegistry,
}

impl TaskRouter {
    /// In-memory router with built-in defaults and no persistence.
    pub fn new(registry: SharedProviderRegistry) -> Self {
        Self::with_config(RoutingConfig::default(), registry)
    }

    pub fn with_config(config: RoutingConfig, registry: SharedProviderRegistry) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
            registry,
        }
    }

    /// Load the record at `path`, recovering from the backup copy and then
    /// from built-in defaults. Never fails.
    pub fn load(path: impl AsRef<Path>, registry: SharedProviderRegistry) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = load_with_recovery(&path);
        Self {
            path: Some(path),
            config: RwLock::new(config),
            registry,
        }
    }

    pub fn shared(self) -> SharedTaskRouter {
        Arc::new(self)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Resolve provider, model and parameters for `task_type`.
    pub fn resolve(&self, task_type: &str) -> RouteDecision {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let defaults = GenerationParams::default();
        let assignment = config.task_overrides.get(task_type);

        let params = GenerationParams {
            max_tokens: assignment
                .and_then(|a| a.max_tokens)
                .unwrap_or(defaults.max_tokens),
            temperature: assignment
                .and_then(|a| a.temperature)
                .unwrap_or(defaults.temperature),
        };

        let decision = match assignment.and_then(|a| a.provider.as_ref().map(|p| (p, a))) {
            Some((provider, assignment)) => RouteDecision {
                task_type: task_type.to_string(),
                provider: provider.clone(),
                model: assignment
                    .model
                    .clone()
                    .or_else(|| self.registry.default_model(provider))
                    .unwrap_or_default(),
                params,
                overridden: true,
            },
            None => {
                let provider = config.global.primary_provider.clone();
                RouteDecision {
                    task_type: task_type.to_string(),
                    model: self.registry.default_model(&provider).unwrap_or_default(),
                    provider,
                    params,
                    overridden: false,
                }
            }
        };

        debug!(
            task_type,
            provider = %decision.provider,
            model = %decision.model,
            overridden = decision.overridden,
            "Resolved route"
        );
        decision
    }

    pub fn global(&self) -> GlobalRouting {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .global
            .clone()
    }

    pub fn snapshot(&self) -> RoutingConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Merge `update` into the override for `task_type` and persist.
    pub fn set_override(
        &self,
        task_type: &str,
        update: TaskAssignment,
    ) -> Result<(), PersistenceError> {
        self.mutate(|config| {
            config
                .task_overrides
                .entry(task_type.to_string())
                .or_default()
                .merge(update);
        })
    }

    /// Drop the override for `task_type`; returns whether one existed.
    pub fn clear_override(&self, task_type: &str) -> Result<bool, PersistenceError> {
        let mut removed = false;
        self.mutate(|config| {
            removed = config.task_overrides.remove(task_type).is_some();
        })?;
        Ok(removed)
    }

    /// Apply a partial update to the global default and persist.
    pub fn set_global_default(&self, update: GlobalUpdate) -> Result<(), PersistenceError> {
        self.mutate(|config| config.global.apply(update))
    }

    pub fn reset_to_default(&self) -> Result<(), PersistenceError> {
        self.mutate(|config| *config = RoutingConfig::default())
    }

    /// Re-read the record from disk, with the same recovery as [`load`](Self::load).
    pub fn reload(&self) {
        if let Some(path) = &self.path {
            let fresh = load_with_recovery(path);
            *self.config.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        }
    }

    /// Persist the current record. A router without a path is a no-op.
    pub fn save(&self) -> Result<(), PersistenceError> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        match &self.path {
            Some(path) => save_record(path, &config),
            None => Ok(()),
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut RoutingConfig)) -> Result<(), PersistenceError> {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut config);
        let Some(path) = &self.path else {
            return Ok(());
        };
        save_record(path, &config).inspect_err(|e| {
            warn!(path = ?path, "Routing change kept in memory only: {}", e);
        })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.backup")
}

fn read_record(path: &Path) -> Result<RoutingConfig, LoadFailure> {
    if !path.exists() {
        return Err(LoadFailure::Missing);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| LoadFailure::Corrupt(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| LoadFailure::Corrupt(e.to_string()))
}

/// Primary file → backup file → built-in defaults.
fn load_with_recovery(path: &Path) -> RoutingConfig {
    match read_record(path) {
        Ok(config) => {
            info!(path = ?path, overrides = config.task_overrides.len(), "Loaded routing config");
            return config;
        }
        Err(LoadFailure::Missing) => {
            debug!(path = ?path, "No routing config on disk");
        }
        Err(LoadFailure::Corrupt(message)) => {
            warn!(path = ?path, "Routing config is corrupted ({}), trying backup", message);
        }
    }

    let backup = backup_path(path);
    if let Ok(config) = read_record(&backup) {
        warn!(path = ?backup, "Recovered routing config from backup");
        return config;
    }

    warn!(path = ?path, "Using built-in routing defaults");
    RoutingConfig::default()
}

/// Backup the current file, write a temp file, then rename over the original.
fn save_record(path: &Path, config: &RoutingConfig) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    if path.exists() {
        if let Err(e) = std::fs::copy(path, backup_path(path)) {
            warn!(path = ?path, "Failed to back up routing config: {}", e);
        }
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, content).map_err(io_err)?;
    std::fs::rename(&temp, path).map_err(io_err)?;
    Ok(())
}
