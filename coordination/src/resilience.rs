//! Resilience: per-task degraded mode
//!
//! An interpretation never hard-fails once its source has produced a
//! judgment. Each stage of the cascade runs under its own timeout and the
//! result carries how far down the cascade it had to go.
//!
//! # Design
//!
//! ```text
//! Interpretation
//!   ├─ Primary route answers within T1      → DegradedResponse { level: Full }
//!   ├─ Distinct backup answers within T2    → DegradedResponse { level: Partial, warnings }
//!   └─ Neither                              → DegradedResponse { level: Templated, warnings }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ConfigError;

/// How far down the cascade a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Primary route answered.
    Full,
    /// A distinct backup provider answered.
    Partial,
    /// No provider answered; text built from structured data.
    Templated,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Templated => write!(f, "templated"),
        }
    }
}

/// A response wrapped with degradation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedResponse<T> {
    pub payload: T,
    pub level: DegradationLevel,
    /// Provider id, or `"template"`.
    pub served_by: String,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// `served_by` for responses that made no network call.
pub const TEMPLATE_SERVER: &str = "template";

impl<T> DegradedResponse<T> {
    pub fn full(payload: T, served_by: &str) -> Self {
        Self {
            payload,
            level: DegradationLevel::Full,
            served_by: served_by.to_string(),
            warnings: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn partial(payload: T, served_by: &str, warnings: Vec<String>) -> Self {
        Self {
            payload,
            level: DegradationLevel::Partial,
            served_by: served_by.to_string(),
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn templated(payload: T, warnings: Vec<String>) -> Self {
        Self {
            payload,
            level: DegradationLevel::Templated,
            served_by: TEMPLATE_SERVER.to_string(),
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.level != DegradationLevel::Full
    }
}

/// Per-stage budgets for one orchestrated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    /// T1: primary interpretation stage.
    pub primary_ms: u64,
    /// T2: backup interpretation stage, shorter than T1.
    pub secondary_ms: u64,
    /// Final narrative stage.
    pub narrative_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            primary_ms: 250_000,
            secondary_ms: 120_000,
            narrative_ms: 300_000,
        }
    }
}

impl StageTimeouts {
    /// Budgets for a task; quick tasks get half of each.
    pub fn for_task(&self, quick: bool) -> Self {
        if quick {
            Self {
                primary_ms: self.primary_ms / 2,
                secondary_ms: self.secondary_ms / 2,
                narrative_ms: self.narrative_ms / 2,
            }
        } else {
            *self
        }
    }

    pub fn primary(&self) -> Duration {
        Duration::from_millis(self.primary_ms)
    }

    pub fn secondary(&self) -> Duration {
        Duration::from_millis(self.secondary_ms)
    }

    pub fn narrative(&self) -> Duration {
        Duration::from_millis(self.narrative_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_ms == 0 || self.secondary_ms == 0 || self.narrative_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator".to_string(),
                message: "stage timeouts must be positive".to_string(),
            });
        }
        if self.secondary_ms >= self.primary_ms {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.secondary_ms".to_string(),
                message: format!(
                    "backup stage ({} ms) must be shorter than primary stage ({} ms)",
                    self.secondary_ms, self.primary_ms
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_response_full() {
        let resp = DegradedResponse::full("text", "claude");
        assert!(!resp.is_degraded());
        assert_eq!(resp.served_by, "claude");
        assert!(resp.warnings.is_empty());
    }

    #[test]
    fn test_degraded_response_partial() {
        let resp = DegradedResponse::partial("text", "gemini", vec!["primary timed out".into()]);
        assert!(resp.is_degraded());
        assert_eq!(resp.level, DegradationLevel::Partial);
        assert_eq!(resp.warnings, vec!["primary timed out"]);
    }

    #[test]
    fn test_degraded_response_templated() {
        let resp = DegradedResponse::templated("summary", vec!["a".into(), "b".into()]);
        assert!(resp.is_degraded());
        assert_eq!(resp.served_by, TEMPLATE_SERVER);
        assert_eq!(resp.warnings.len(), 2);
    }

    #[test]
    fn test_degradation_level_ordering() {
        assert!(DegradationLevel::Full < DegradationLevel::Partial);
        assert!(DegradationLevel::Partial < DegradationLevel::Templated);
    }

    #[test]
    fn test_degradation_level_display() {
        assert_eq!(DegradationLevel::Full.to_string(), "full");
        assert_eq!(DegradationLevel::Templated.to_string(), "templated");
    }

    #[test]
    fn test_stage_timeouts_defaults_and_quick() {
        let timeouts = StageTimeouts::default();
        assert_eq!(timeouts.primary(), Duration::from_secs(250));
        assert_eq!(timeouts.secondary(), Duration::from_secs(120));
        assert_eq!(timeouts.narrative(), Duration::from_secs(300));

        let quick = timeouts.for_task(true);
        assert_eq!(quick.primary_ms, 125_000);
        assert_eq!(quick.secondary_ms, 60_000);
        assert_eq!(timeouts.for_task(false), timeouts);
    }

    #[test]
    fn test_stage_timeouts_validation() {
        assert!(StageTimeouts::default().validate().is_ok());

        let inverted = StageTimeouts {
            primary_ms: 100,
            secondary_ms: 200,
            narrative_ms: 300,
        };
        assert!(inverted.validate().is_err());

        let zero = StageTimeouts {
            narrative_ms: 0,
            ..StageTimeouts::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_degraded_response_json_roundtrip() {
        let resp = DegradedResponse::partial("hello".to_string(), "gemini", vec!["warn".into()]);
        let json = serde_json::to_string(&resp).unwrap();
        let back: DegradedResponse<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
