//! Progress event types
//!
//! One event per phase transition of an orchestrated request. Events are
//! accumulated in the final result and broadcast on the [`EventBus`].
//!
//! [`EventBus`]: super::EventBus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label used when an event concerns the whole request rather than one source.
pub const REQUEST_SCOPE: &str = "request";

/// Phase of an orchestrated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Planning,
    Calculating,
    Interpreting,
    Degraded,
    TaskCompleted,
    TaskFailed,
    Summarising,
    ConflictAnalysis,
    Arbitration,
    Narrative,
    Completed,
    Cancelled,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::Planning => "planning",
            Phase::Calculating => "calculating",
            Phase::Interpreting => "interpreting",
            Phase::Degraded => "degraded",
            Phase::TaskCompleted => "task_completed",
            Phase::TaskFailed => "task_failed",
            Phase::Summarising => "summarising",
            Phase::ConflictAnalysis => "conflict_analysis",
            Phase::Arbitration => "arbitration",
            Phase::Narrative => "narrative",
            Phase::Completed => "completed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.label())
    }
}

/// A single progress report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Source the event concerns, or [`REQUEST_SCOPE`]
    pub source_name: String,
    pub phase: Phase,
    /// Overall completion, 0 to 100
    pub percent: u8,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(source_name: impl Into<String>, phase: Phase, percent: u8, detail: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            phase,
            percent: percent.min(100),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_request_scoped(&self) -> bool {
        self.source_name == REQUEST_SCOPE
    }
}
