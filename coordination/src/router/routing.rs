//! Routing records: task kinds, the global default and per-task overrides.
//!
//! The persisted layout is camelCase JSON:
//!
//! ```json
//! {
//!   "global": {"primaryProvider": "claude", "fallbackOrder": ["deepseek"],
//!              "enableDualVerification": true, "timeoutMs": 60000, "maxRetries": 3},
//!   "taskOverrides": {"quick_interaction": {"provider": "deepseek", "model": "deepseek-chat",
//!                                           "maxTokens": 2048, "temperature": 0.8}}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Built-in task kinds. Routing keys are free-form strings; these are the
/// ones with shipped defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Final narrative combining every source.
    ComprehensiveReport,
    /// Interpretation of one source's structured result.
    SingleInterpretation,
    /// Short interpretation on a tight budget.
    QuickInterpretation,
    /// Conversational follow-up.
    QuickInteraction,
    SimpleQa,
    /// Extracting structured input from free text.
    InputParsing,
    /// Narrative-assisted arbitration.
    ConflictResolution,
    FollowUp,
    /// Secondary opinion used for cross-checking.
    Verification,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComprehensiveReport => "comprehensive_report",
            Self::SingleInterpretation => "single_interpretation",
            Self::QuickInterpretation => "quick_interpretation",
            Self::QuickInteraction => "quick_interaction",
            Self::SimpleQa => "simple_qa",
            Self::InputParsing => "input_parsing",
            Self::ConflictResolution => "conflict_resolution",
            Self::FollowUp => "follow_up",
            Self::Verification => "verification",
        }
    }

    pub fn all() -> &'static [TaskKind] {
        &[
            Self::ComprehensiveReport,
            Self::SingleInterpretation,
            Self::QuickInterpretation,
            Self::QuickInteraction,
            Self::SimpleQa,
            Self::InputParsing,
            Self::ConflictResolution,
            Self::FollowUp,
            Self::Verification,
        ]
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.as_str() == key)
    }

    /// Tasks that run on halved stage timeouts.
    pub fn is_quick(&self) -> bool {
        matches!(
            self,
            Self::QuickInterpretation | Self::QuickInteraction | Self::SimpleQa
        )
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing applied when a task has no override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRouting {
    pub primary_provider: String,
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_dual_verification: bool,
    /// Recorded for clients of the routing file only. Per-call timeouts come
    /// from each provider's `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per provider, further capped by the retry policy.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for GlobalRouting {
    fn default() -> Self {
        Self {
            primary_provider: "claude".to_string(),
            fallback_order: vec![
                "deepseek".to_string(),
                "kimi".to_string(),
                "gemini".to_string(),
            ],
            enable_dual_verification: true,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Partial update for [`GlobalRouting`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalUpdate {
    pub primary_provider: Option<String>,
    pub fallback_order: Option<Vec<String>>,
    pub enable_dual_verification: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl GlobalRouting {
    pub fn apply(&mut self, update: GlobalUpdate) {
        if let Some(primary) = update.primary_provider {
            self.primary_provider = primary;
        }
        if let Some(order) = update.fallback_order {
            self.fallback_order = order;
        }
        if let Some(dual) = update.enable_dual_verification {
            self.enable_dual_verification = dual;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries;
        }
    }
}

/// Per-task override. A missing provider means "use the global primary".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl TaskAssignment {
    pub fn provider(provider: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            ..Self::default()
        }
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn params(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = Some(max_tokens);
        self.temperature = Some(temperature);
        self
    }

    /// Overlay the fields set in `update`.
    pub fn merge(&mut self, update: TaskAssignment) {
        if update.provider.is_some() {
            self.provider = update.provider;
        }
        if update.model.is_some() {
            self.model = update.model;
        }
        if update.max_tokens.is_some() {
            self.max_tokens = update.max_tokens;
        }
        if update.temperature.is_some() {
            self.temperature = update.temperature;
        }
    }
}

/// The whole persisted routing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    pub global: GlobalRouting,
    #[serde(default)]
    pub task_overrides: BTreeMap<String, TaskAssignment>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut task_overrides = BTreeMap::new();
        let mut add = |kind: TaskKind, assignment: TaskAssignment| {
            task_overrides.insert(kind.as_str().to_string(), assignment);
        };

        add(
            TaskKind::ComprehensiveReport,
            TaskAssignment::provider("claude").params(8192, 0.7),
        );
        add(
            TaskKind::SingleInterpretation,
            TaskAssignment::default().params(4096, 0.7),
        );
        add(
            TaskKind::QuickInteraction,
            TaskAssignment::provider("deepseek")
                .model("deepseek-chat")
                .params(2048, 0.8),
        );
        add(
            TaskKind::InputParsing,
            TaskAssignment::provider("kimi").params(2048, 0.5),
        );
        add(
            TaskKind::ConflictResolution,
            TaskAssignment::provider("deepseek")
                .model("deepseek-reasoner")
                .params(4096, 0.6),
        );
        add(
            TaskKind::Verification,
            TaskAssignment::provider("gemini").params(2048, 0.7),
        );

        Self {
            global: GlobalRouting::default(),
            task_overrides,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_keys_round_trip_through_parse() {
        for kind in TaskKind::all() {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(*kind));
        }
        assert!(TaskKind::parse("nope").is_none());
        assert!(TaskKind::QuickInteraction.is_quick());
        assert!(!TaskKind::ComprehensiveReport.is_quick());
    }

    #[test]
    fn test_persisted_layout_is_camel_case() {
        let json = serde_json::to_value(RoutingConfig::default()).unwrap();
        assert_eq!(json["global"]["primaryProvider"], "claude");
        assert_eq!(json["global"]["enableDualVerification"], true);
        assert_eq!(json["global"]["maxRetries"], 3);
        assert_eq!(
            json["taskOverrides"]["quick_interaction"]["model"],
            "deepseek-chat"
        );
        assert_eq!(
            json["taskOverrides"]["quick_interaction"]["maxTokens"],
            2048
        );
    }

    #[test]
    fn test_partial_merge_keeps_unset_fields() {
        let mut assignment = TaskAssignment::provider("kimi").params(2048, 0.5);
        assignment.merge(TaskAssignment {
            temperature: Some(0.9),
            ..Default::default()
        });
        assert_eq!(assignment.provider.as_deref(), Some("kimi"));
        assert_eq!(assignment.max_tokens, Some(2048));
        assert_eq!(assignment.temperature, Some(0.9));
    }

    #[test]
    fn test_global_update_applies_only_set_fields() {
        let mut global = GlobalRouting::default();
        global.apply(GlobalUpdate {
            primary_provider: Some("kimi".to_string()),
            max_retries: Some(5),
            ..Default::default()
        });
        assert_eq!(global.primary_provider, "kimi");
        assert_eq!(global.max_retries, 5);
        assert_eq!(global.timeout_ms, 60_000);
        assert_eq!(global.fallback_order.len(), 3);
    }

    #[test]
    fn test_minimal_record_deserializes_with_defaults() {
        let cfg: RoutingConfig =
            serde_json::from_str(r#"{"global":{"primaryProvider":"A"}}"#).unwrap();
        assert_eq!(cfg.global.primary_provider, "A");
        assert!(cfg.global.enable_dual_verification);
        assert!(cfg.task_overrides.is_empty());
    }
}
