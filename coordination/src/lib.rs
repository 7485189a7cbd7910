//! Augur Coordination Library
//!
//! This library provides:
//! - A provider layer over several text-generation wire protocols
//! - Task routing with persisted overrides, retries and provider failover
//! - Dual verification of important answers across two providers
//! - Multi-source reconciliation: conflict analysis, arbitration and a final
//!   narrative, with per-task degraded modes
//!
//! # Features
//!
//! ## Providers
//! - Anthropic messages, OpenAI-compatible chat completions and Gemini
//!   `generateContent`, all behind [`provider::TextGenerationProvider`]
//! - Built-in presets enabled by credential presence
//!
//! ## Routing
//! - `task_routing.json` record: global primary, fallback order, per-task
//!   provider/model/sampling overrides
//! - Exponential backoff with jitter for retryable failures
//!
//! ## Ensemble
//! - Pairwise conflict severity with penalized, weighted reconciliation
//! - Tie-breaker arbitration with a never-reuse rule
//! - Progress events over a broadcast bus and cooperative cancellation
//!
//! # Usage
//!
//! ```bash
//! # Reconcile a batch of precomputed source results
//! augur run --batch ./batch.json --config ./augur.toml
//!
//! # One routed call, optionally cross-checked
//! augur ask single_interpretation "What does this reading suggest?" --verify
//!
//! # Inspect and change routing
//! augur route show
//! augur route set comprehensive_report --provider claude
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod ensemble;
pub mod events;
pub mod failover;
pub mod judgment;
pub mod provider;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod router;
pub mod sources;
pub mod verification;

#[cfg(test)]
mod testing;

// Re-export configuration
pub use config::AugurConfig;

// Re-export provider types
pub use provider::{ProviderError, SharedProvider, TextGenerationProvider, TextRequest, WireProtocol};

// Re-export provider registry types
pub use registry::{ConfigError, ProviderConfig, ProviderRegistry, SharedProviderRegistry};

// Re-export routing types
pub use router::{RouteDecision, RoutingConfig, SharedTaskRouter, TaskKind, TaskRouter};

// Re-export retry and failover types
pub use failover::{FailoverError, FailoverRouter, ProviderReply};
pub use retry::{RetryPolicy, RetryingInvoker};

// Re-export verification types
pub use verification::{AgreementConfig, DualVerificationCoordinator, VerificationOutcome, VerifiedResponse};

// Re-export judgment and source types
pub use judgment::{Category, Judgment, Polarity};
pub use sources::{AnalysisSource, SourceCatalog, StaticSource};

// Re-export key ensemble types
pub use ensemble::{
    AnalysisBatch, AnalysisTask, ArbitrationSystem, ConflictResolver, FinalReport,
    NarrativeTask, Orchestrator, OrchestratorError, Severity,
};

// Re-export key event types
pub use events::{EventBus, Phase, ProgressEvent, SharedEventBus};

// Re-export resilience types
pub use resilience::{DegradationLevel, DegradedResponse, StageTimeouts};
