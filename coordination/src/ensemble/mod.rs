//! Multi-source ensemble module
//!
//! Combines the judgments of several independent analysis sources into one
//! answer, and settles serious disagreements with a third source.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      Orchestrator                          │
//! │  • Runs every source and interprets its result             │
//! │  • Degrades per task (backup provider, then template)      │
//! │  • Writes the final narrative                              │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!               ┌───────────┴───────────┐
//!               ▼                       ▼
//!     ┌──────────────────┐    ┌──────────────────┐
//!     │ ConflictResolver │    │ ArbitrationSystem│
//!     │ pairwise severity│    │ tie-breaker pick │
//!     │ weighted result  │    │ verdict strategy │
//!     └──────────────────┘    └──────────────────┘
//! ```
//!
//! # Components
//!
//! - **ConflictResolver**: Classifies every pair of judgments and reconciles
//!   them into one weighted judgment
//! - **ArbitrationSystem**: Picks an unused tie-breaker source for each major
//!   conflict and reaches a verdict (rule-based or provider-assisted)
//! - **Orchestrator**: Drives one request end to end with per-stage timeouts,
//!   progress events and cancellation
//!
//! # Usage
//!
//! ```ignore
//! use augur_coordination::ensemble::{AnalysisBatch, NarrativeTask, Orchestrator};
//!
//! let orchestrator = Orchestrator::from_config(&config, failover, catalog)
//!     .with_event_bus(bus);
//! let report = orchestrator.run(&batch, &NarrativeTask::default()).await?;
//! println!("{} ({:.0}%)", report.reconciled.category, report.confidence * 100.0);
//! ```

pub mod arbitration;
pub mod conflict;
pub mod orchestrator;

// Re-export core types
pub use arbitration::{
    should_arbitrate, ArbitrationConfig, ArbitrationError, ArbitrationRequest,
    ArbitrationResult, ArbitrationStatus, ArbitrationStrategy, ArbitrationSystem,
    NarrativeArbitration, NarrativeVerdict, RuleBasedArbitration, SharedStrategy, StrategyKind,
    SupportedSide, Verdict,
};
pub use conflict::{
    ConflictAnalysis, ConflictRecord, ConflictResolver, ReconciledJudgment, Severity,
};
pub use orchestrator::{
    template_summary, AnalysisBatch, AnalysisTask, FinalReport, NarrativeResult, NarrativeTask,
    Orchestrator, OrchestratorError, OrchestratorResult, TaskResult, TaskStatus,
};
