//! Arbitration of major conflicts by a previously unused tie-breaking source
//!
//! When two sources disagree badly, a third source that has not yet spoken
//! is consulted. Its judgment is folded into a three-way vote (rule-based)
//! or handed to a provider together with the conflict for a written verdict
//! (narrative-assisted). A narrative verdict that cannot be parsed falls
//! back to the rule-based vote.
//!
//! # Status
//!
//! ```text
//! not_needed
//! requested ──► in_progress ──► completed
//!                    └─────────► failed
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::conflict::{ConflictRecord, Severity};
use crate::failover::FailoverRouter;
use crate::judgment::{Category, Judgment, Polarity};
use crate::provider::TextRequest;
use crate::router::TaskKind;

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").unwrap());

/// Reliability assumed for a source missing from the weight table.
pub const DEFAULT_RELIABILITY: f64 = 0.7;

/// Multiplier on the tie-breaker's vote.
pub const TIE_BREAKER_BOOST: f64 = 1.2;

/// Question category used when the asked one has no candidate list.
pub const FALLBACK_CATEGORY: &str = "other";

/// Error type for arbitration operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArbitrationError {
    #[error("no eligible tie-breaker for {source_a} vs {source_b} in category '{category}'")]
    Unavailable {
        source_a: String,
        source_b: String,
        category: String,
    },

    #[error("invalid arbitration transition {from} -> {to}")]
    InvalidTransition {
        from: ArbitrationStatus,
        to: ArbitrationStatus,
    },

    #[error("tie-breaker '{tie_breaker}' failed: {message}")]
    SourceFailed { tie_breaker: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationStatus {
    NotNeeded,
    Requested,
    InProgress,
    Completed,
    Failed,
}

impl ArbitrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotNeeded => "not_needed",
            Self::Requested => "requested",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ArbitrationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::InProgress)
                | (Self::Requested, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotNeeded | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ArbitrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the conflict a verdict backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedSide {
    SourceA,
    SourceB,
    Neither,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RuleBased,
    NarrativeAssisted,
}

/// Candidate lists, reliability weights and strategy choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Ordered tie-breaker candidates per question category.
    pub candidates: BTreeMap<String, Vec<String>>,
    /// Declared reliability per source.
    pub reliability: BTreeMap<String, f64>,
    pub default_reliability: f64,
    pub tie_breaker_boost: f64,
    pub strategy: StrategyKind,
    /// Lowest severity that triggers arbitration.
    pub threshold: Severity,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let candidates = BTreeMap::from([
            ("career".to_string(), list(&["liuyao", "meihua", "xiaoliuren", "qimen"])),
            ("relationship".to_string(), list(&["cezi", "meihua", "liuyao", "ziwei"])),
            ("wealth".to_string(), list(&["liuyao", "qimen", "xiaoliuren", "meihua"])),
            ("health".to_string(), list(&["liuyao", "xiaoliuren", "meihua", "bazi"])),
            ("decision".to_string(), list(&["qimen", "liuyao", "daliuren", "meihua"])),
            ("study".to_string(), list(&["meihua", "liuyao", "bazi", "ziwei"])),
            ("other".to_string(), list(&["liuyao", "meihua", "xiaoliuren", "qimen"])),
        ]);
        let reliability = [
            ("bazi", 0.85),
            ("ziwei", 0.85),
            ("qimen", 0.80),
            ("daliuren", 0.80),
            ("liuyao", 0.75),
            ("meihua", 0.70),
            ("xiaoliuren", 0.65),
            ("cezi", 0.60),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();

        Self {
            candidates,
            reliability,
            default_reliability: DEFAULT_RELIABILITY,
            tie_breaker_boost: TIE_BREAKER_BOOST,
            strategy: StrategyKind::RuleBased,
            threshold: Severity::Major,
        }
    }
}

impl ArbitrationConfig {
    pub fn reliability_of(&self, source: &str) -> f64 {
        self.reliability
            .get(source)
            .copied()
            .unwrap_or(self.default_reliability)
    }

    /// Candidate list for a question category, falling back to `other`.
    pub fn candidates_for(&self, category: &str) -> &[String] {
        self.candidates
            .get(category)
            .or_else(|| self.candidates.get(FALLBACK_CATEGORY))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Severity gate; `threshold` is the lowest severity that arbitrates.
pub fn should_arbitrate(severity: Severity, threshold: Severity) -> bool {
    severity != Severity::None && severity >= threshold
}

/// A pending arbitration with its exclusion set and chosen tie-breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrationRequest {
    pub conflict: ConflictRecord,
    pub question_category: String,
    /// `used ∪ {source_a, source_b}` at selection time.
    pub excluded: BTreeSet<String>,
    pub tie_breaker: String,
    status: ArbitrationStatus,
}

impl ArbitrationRequest {
    pub fn status(&self) -> ArbitrationStatus {
        self.status
    }

    pub fn advance(&mut self, next: ArbitrationStatus) -> Result<(), ArbitrationError> {
        if !self.status.can_transition_to(next) {
            return Err(ArbitrationError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// What a strategy concluded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub tie_breaker_category: Category,
    pub supported_side: SupportedSide,
    pub final_category: Category,
    pub confidence: f64,
    pub explanation: String,
    pub strategy: String,
}

/// Outcome of one arbitration, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrationResult {
    pub source_a: String,
    pub source_b: String,
    pub excluded: Vec<String>,
    pub tie_breaker: Option<String>,
    pub tie_breaker_judgment: Option<Judgment>,
    pub final_category: Option<Category>,
    pub supported_side: Option<SupportedSide>,
    pub confidence: f64,
    pub explanation: String,
    pub strategy: Option<String>,
    pub status: ArbitrationStatus,
}

impl ArbitrationResult {
    pub fn not_needed(conflict: &ConflictRecord) -> Self {
        Self {
            source_a: conflict.source_a.clone(),
            source_b: conflict.source_b.clone(),
            excluded: Vec::new(),
            tie_breaker: None,
            tie_breaker_judgment: None,
            final_category: None,
            supported_side: None,
            confidence: 0.0,
            explanation: String::new(),
            strategy: None,
            status: ArbitrationStatus::NotNeeded,
        }
    }

    /// A failed arbitration; the caller keeps its pre-arbitration answer.
    pub fn failed(conflict: &ConflictRecord, tie_breaker: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            tie_breaker: tie_breaker.map(str::to_string),
            explanation: reason.into(),
            status: ArbitrationStatus::Failed,
            ..Self::not_needed(conflict)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ArbitrationStatus::Completed
    }

    pub fn summary(&self) -> String {
        match self.status {
            ArbitrationStatus::NotNeeded => "arbitration not needed".to_string(),
            ArbitrationStatus::Failed => format!("arbitration failed: {}", self.explanation),
            ArbitrationStatus::Completed => {
                let level = if self.confidence > 0.7 {
                    "high"
                } else if self.confidence > 0.5 {
                    "medium"
                } else {
                    "low"
                };
                format!(
                    "arbitration completed | tie-breaker {} | verdict {} | confidence {}",
                    self.tie_breaker.as_deref().unwrap_or("?"),
                    self.final_category
                        .map(|c| c.label())
                        .unwrap_or("unknown"),
                    level
                )
            }
            other => format!("arbitration {other}"),
        }
    }
}

/// How a tie-breaker's judgment turns into a verdict.
#[async_trait]
pub trait ArbitrationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn decide(&self, conflict: &ConflictRecord, tie_breaker: &Judgment, raw: &Value) -> Verdict;
}

pub type SharedStrategy = Arc<dyn ArbitrationStrategy>;

/// Weighted three-way polarity vote.
#[derive(Debug, Clone)]
pub struct RuleBasedArbitration {
    config: ArbitrationConfig,
}

impl RuleBasedArbitration {
    pub fn new(config: ArbitrationConfig) -> Self {
        Self { config }
    }

    pub fn vote(&self, conflict: &ConflictRecord, tie_breaker: &Judgment) -> Verdict {
        let voters = [
            (
                conflict.judgment_a.category(),
                self.config.reliability_of(&conflict.source_a),
            ),
            (
                conflict.judgment_b.category(),
                self.config.reliability_of(&conflict.source_b),
            ),
            (
                tie_breaker.category(),
                self.config.reliability_of(tie_breaker.source()) * self.config.tie_breaker_boost,
            ),
        ];
        let tie_polarity = tie_breaker.category().polarity();

        let mut tally: BTreeMap<u8, (f64, Category, f64)> = BTreeMap::new();
        for (category, weight) in voters {
            let entry = tally
                .entry(polarity_rank(category.polarity()))
                .or_insert((0.0, category, f64::MIN));
            entry.0 += weight;
            if weight > entry.2 {
                entry.1 = category;
                entry.2 = weight;
            }
        }

        let total: f64 = tally.values().map(|(w, _, _)| w).sum();
        // An exact tie goes to the tie-breaker's side, not to a fixed polarity.
        let winner = tally
            .iter()
            .max_by(|(pa, a), (pb, b)| {
                a.0.total_cmp(&b.0).then_with(|| {
                    let on_tie_side = |p: &u8| *p == polarity_rank(tie_polarity);
                    on_tie_side(*pa).cmp(&on_tie_side(*pb))
                })
            })
            .map(|(_, (weight, category, _))| (*weight, *category));

        let (winning_weight, final_category) = winner.unwrap_or((0.0, Category::Neutral));
        let confidence = if total > 0.0 {
            winning_weight / total
        } else {
            0.5
        };

        let supported_side = side_for(conflict, tie_polarity);
        let explanation = if tie_polarity == final_category.polarity() {
            let ally = match supported_side {
                SupportedSide::SourceA => conflict.source_a.as_str(),
                SupportedSide::SourceB => conflict.source_b.as_str(),
                SupportedSide::Neither => "neither side",
            };
            format!(
                "{} reads {}, agreeing with {}; combined verdict {}",
                tie_breaker.source(),
                tie_breaker.category(),
                ally,
                final_category
            )
        } else {
            format!(
                "{} reads {}; after weighting all three sources the verdict is {}",
                tie_breaker.source(),
                tie_breaker.category(),
                final_category
            )
        };

        Verdict {
            tie_breaker_category: tie_breaker.category(),
            supported_side,
            final_category,
            confidence,
            explanation,
            strategy: self.name().to_string(),
        }
    }
}

#[async_trait]
impl ArbitrationStrategy for RuleBasedArbitration {
    fn name(&self) -> &'static str {
        "rule-based"
    }

    async fn decide(&self, conflict: &ConflictRecord, tie_breaker: &Judgment, _raw: &Value) -> Verdict {
        self.vote(conflict, tie_breaker)
    }
}

fn polarity_rank(polarity: Polarity) -> u8 {
    match polarity {
        Polarity::Favorable => 0,
        Polarity::Neutral => 1,
        Polarity::Unfavorable => 2,
    }
}

fn side_for(conflict: &ConflictRecord, polarity: Polarity) -> SupportedSide {
    let a = conflict.judgment_a.category().polarity() == polarity;
    let b = conflict.judgment_b.category().polarity() == polarity;
    match (a, b) {
        (true, false) => SupportedSide::SourceA,
        (false, true) => SupportedSide::SourceB,
        _ => SupportedSide::Neither,
    }
}

/// Structured verdict requested from a provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictRecord {
    #[serde(alias = "tie_breaker_category", alias = "category")]
    pub tie_breaker_category: String,
    #[serde(default, alias = "supported_side")]
    pub supported_side: Option<String>,
    #[serde(alias = "final_category")]
    pub final_category: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub explanation: String,
}

/// Provider output after extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum NarrativeVerdict {
    Parsed(VerdictRecord),
    Unparsed(String),
}

impl NarrativeVerdict {
    /// Pull the outermost JSON object out of free text.
    pub fn parse(text: &str) -> Self {
        JSON_OBJECT
            .find(text)
            .and_then(|m| serde_json::from_str::<VerdictRecord>(m.as_str()).ok())
            .map(Self::Parsed)
            .unwrap_or_else(|| Self::Unparsed(text.to_string()))
    }
}

/// Asks a provider to adjudicate; falls back to the rule-based vote.
pub struct NarrativeArbitration {
    failover: Arc<FailoverRouter>,
    fallback: RuleBasedArbitration,
}

impl NarrativeArbitration {
    pub fn new(failover: Arc<FailoverRouter>, config: ArbitrationConfig) -> Self {
        Self {
            failover,
            fallback: RuleBasedArbitration::new(config),
        }
    }

    fn prompt(conflict: &ConflictRecord, tie_breaker: &Judgment, raw: &Value) -> TextRequest {
        let opinion = |j: &Judgment| {
            let rationale = if j.rationale().is_empty() {
                "no rationale given"
            } else {
                j.rationale()
            };
            format!("{} (score {:.2}): {}", j.category(), j.score(), rationale)
        };
        let raw_text = serde_json::to_string_pretty(raw).unwrap_or_else(|_| raw.to_string());

        let text = format!(
            "Two analysis sources disagree and a third source has been consulted to break the tie.\n\n\
             Source A ({a}): {opinion_a}\n\
             Source B ({b}): {opinion_b}\n\
             Severity: {severity} (score gap {gap:.2})\n\n\
             Tie-breaker {tb}: {opinion_tb}\n\
             Tie-breaker raw output:\n{raw_text}\n\n\
             Weigh the tie-breaker's result and answer with a single JSON object:\n\
             {{\"tieBreakerCategory\": \"very favorable|favorable|neutral|unfavorable|very unfavorable\", \
             \"supportedSide\": \"source_a|source_b|neither\", \
             \"finalCategory\": \"...\", \"confidence\": 0.0, \"explanation\": \"...\"}}",
            a = conflict.source_a,
            opinion_a = opinion(&conflict.judgment_a),
            b = conflict.source_b,
            opinion_b = opinion(&conflict.judgment_b),
            severity = conflict.severity,
            gap = conflict.difference,
            tb = tie_breaker.source(),
            opinion_tb = opinion(tie_breaker),
        );
        TextRequest::prompt(text)
            .with_system("You adjudicate disagreements between analysis sources. Reply with JSON only.")
    }

    fn from_record(record: &VerdictRecord, conflict: &ConflictRecord, tie_breaker: &Judgment) -> Option<Verdict> {
        let final_category = Category::parse(&record.final_category).ok()?;
        let tie_breaker_category =
            Category::parse(&record.tie_breaker_category).unwrap_or(tie_breaker.category());
        let supported_side = match record
            .supported_side
            .as_deref()
            .map(|s| s.trim().to_lowercase().replace(['-', ' '], "_"))
            .as_deref()
        {
            Some("source_a") | Some("a") => SupportedSide::SourceA,
            Some("source_b") | Some("b") => SupportedSide::SourceB,
            Some(_) => SupportedSide::Neither,
            None => side_for(conflict, tie_breaker_category.polarity()),
        };
        Some(Verdict {
            tie_breaker_category,
            supported_side,
            final_category,
            confidence: record.confidence.unwrap_or(DEFAULT_RELIABILITY).clamp(0.0, 1.0),
            explanation: record.explanation.clone(),
            strategy: "narrative-assisted".to_string(),
        })
    }
}

#[async_trait]
impl ArbitrationStrategy for NarrativeArbitration {
    fn name(&self) -> &'static str {
        "narrative-assisted"
    }

    async fn decide(&self, conflict: &ConflictRecord, tie_breaker: &Judgment, raw: &Value) -> Verdict {
        let request = Self::prompt(conflict, tie_breaker, raw);
        let reply = match self
            .failover
            .call(TaskKind::ConflictResolution.as_str(), &request)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Narrative arbitration unavailable, using rule-based vote");
                return self.fallback.vote(conflict, tie_breaker);
            }
        };

        match NarrativeVerdict::parse(&reply.text) {
            NarrativeVerdict::Parsed(record) => {
                match Self::from_record(&record, conflict, tie_breaker) {
                    Some(verdict) => verdict,
                    None => {
                        warn!(
                            provider = %reply.provider,
                            final_category = %record.final_category,
                            "Narrative verdict has an unknown category, using rule-based vote"
                        );
                        self.fallback.vote(conflict, tie_breaker)
                    }
                }
            }
            NarrativeVerdict::Unparsed(_) => {
                warn!(provider = %reply.provider, "Narrative verdict unparseable, using rule-based vote");
                self.fallback.vote(conflict, tie_breaker)
            }
        }
    }
}

/// Tie-breaker selection plus verdict.
pub struct ArbitrationSystem {
    config: ArbitrationConfig,
    strategy: SharedStrategy,
}

impl ArbitrationSystem {
    /// Rule-based system.
    pub fn new(config: ArbitrationConfig) -> Self {
        let strategy = Arc::new(RuleBasedArbitration::new(config.clone()));
        Self { config, strategy }
    }

    /// Strategy chosen by `config.strategy`; narrative needs a failover router.
    pub fn from_config(config: ArbitrationConfig, failover: Option<Arc<FailoverRouter>>) -> Self {
        match (config.strategy, failover) {
            (StrategyKind::NarrativeAssisted, Some(failover)) => {
                let strategy = Arc::new(NarrativeArbitration::new(failover, config.clone()));
                Self::with_strategy(config, strategy)
            }
            _ => Self::new(config),
        }
    }

    pub fn with_strategy(config: ArbitrationConfig, strategy: SharedStrategy) -> Self {
        Self { config, strategy }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn should_arbitrate(&self, severity: Severity) -> bool {
        should_arbitrate(severity, self.config.threshold)
    }

    /// First candidate outside `used ∪ {source_a, source_b}`.
    pub fn select_tie_breaker(
        &self,
        conflict: &ConflictRecord,
        question_category: &str,
        used: &BTreeSet<String>,
    ) -> Option<String> {
        self.config
            .candidates_for(question_category)
            .iter()
            .find(|c| !used.contains(*c) && !conflict.involves(c))
            .cloned()
    }

    /// Select a tie-breaker and open a request for it.
    pub fn request(
        &self,
        conflict: &ConflictRecord,
        question_category: &str,
        used: &BTreeSet<String>,
    ) -> Result<ArbitrationRequest, ArbitrationError> {
        let Some(tie_breaker) = self.select_tie_breaker(conflict, question_category, used) else {
            warn!(
                source_a = %conflict.source_a,
                source_b = %conflict.source_b,
                category = question_category,
                "No tie-breaker available"
            );
            return Err(ArbitrationError::Unavailable {
                source_a: conflict.source_a.clone(),
                source_b: conflict.source_b.clone(),
                category: question_category.to_string(),
            });
        };

        let mut excluded = used.clone();
        excluded.insert(conflict.source_a.clone());
        excluded.insert(conflict.source_b.clone());

        info!(
            tie_breaker = %tie_breaker,
            pair = %conflict.pair_label(),
            category = question_category,
            "Arbitration requested"
        );

        Ok(ArbitrationRequest {
            conflict: conflict.clone(),
            question_category: question_category.to_string(),
            excluded,
            tie_breaker,
            status: ArbitrationStatus::Requested,
        })
    }

    /// Run the strategy on the tie-breaker's judgment. Never fails; problems
    /// are reported as a `Failed` result.
    pub async fn arbitrate(
        &self,
        request: &mut ArbitrationRequest,
        tie_breaker_judgment: Judgment,
        raw: &Value,
    ) -> ArbitrationResult {
        let conflict = request.conflict.clone();

        if let Err(e) = request.advance(ArbitrationStatus::InProgress) {
            return ArbitrationResult::failed(&conflict, Some(request.tie_breaker.as_str()), e.to_string());
        }

        if tie_breaker_judgment.source() != request.tie_breaker {
            let error = ArbitrationError::SourceFailed {
                tie_breaker: request.tie_breaker.clone(),
                message: format!(
                    "judgment came from '{}' instead",
                    tie_breaker_judgment.source()
                ),
            };
            return self.fail(request, error.to_string());
        }

        let verdict = self
            .strategy
            .decide(&conflict, &tie_breaker_judgment, raw)
            .await;

        if let Err(e) = request.advance(ArbitrationStatus::Completed) {
            return ArbitrationResult::failed(&conflict, Some(request.tie_breaker.as_str()), e.to_string());
        }

        info!(
            tie_breaker = %request.tie_breaker,
            verdict = %verdict.final_category,
            confidence = verdict.confidence,
            strategy = %verdict.strategy,
            "Arbitration completed"
        );

        ArbitrationResult {
            source_a: conflict.source_a.clone(),
            source_b: conflict.source_b.clone(),
            excluded: request.excluded.iter().cloned().collect(),
            tie_breaker: Some(request.tie_breaker.clone()),
            tie_breaker_judgment: Some(tie_breaker_judgment),
            final_category: Some(verdict.final_category),
            supported_side: Some(verdict.supported_side),
            confidence: verdict.confidence,
            explanation: verdict.explanation,
            strategy: Some(verdict.strategy),
            status: ArbitrationStatus::Completed,
        }
    }

    /// Mark a request failed, e.g. when the tie-breaker's calculation errored.
    pub fn fail(&self, request: &mut ArbitrationRequest, reason: impl Into<String>) -> ArbitrationResult {
        let reason = reason.into();
        if let Err(e) = request.advance(ArbitrationStatus::Failed) {
            warn!(error = %e, "Arbitration already settled");
        }
        warn!(tie_breaker = %request.tie_breaker, reason = %reason, "Arbitration failed");
        let mut result = ArbitrationResult::failed(&request.conflict, Some(request.tie_breaker.as_str()), reason);
        result.excluded = request.excluded.iter().cloned().collect();
        result
    }
}
