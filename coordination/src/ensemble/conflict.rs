//! Conflict resolution over typed judgments
//!
//! Compares every pair of judgments, classifies how far apart they are and
//! reconciles them into one confidence-weighted judgment. Sources involved
//! in significant or major conflicts lose weight; penalties compound per
//! conflicting pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::judgment::{Category, Judgment};

/// Score gap at which a pair becomes a minor conflict.
pub const MINOR_THRESHOLD: f64 = 0.2;
/// Score gap at which a pair becomes a significant conflict.
pub const SIGNIFICANT_THRESHOLD: f64 = 0.4;
/// Score gap at which a pair becomes a major conflict.
pub const MAJOR_THRESHOLD: f64 = 0.5;

/// Weight multiplier per significant pair a source takes part in.
pub const SIGNIFICANT_PENALTY: f64 = 0.85;
/// Weight multiplier per major pair a source takes part in.
pub const MAJOR_PENALTY: f64 = 0.70;

/// Share of total weight above which one source is called out as dominant.
const DOMINANT_WEIGHT: f64 = 0.4;

/// How far apart two judgments are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Significant,
    Major,
}

impl Severity {
    /// Pure function of the absolute score difference.
    pub fn classify(difference: f64) -> Self {
        let difference = difference.abs();
        if difference >= MAJOR_THRESHOLD {
            Self::Major
        } else if difference >= SIGNIFICANT_THRESHOLD {
            Self::Significant
        } else if difference >= MINOR_THRESHOLD {
            Self::Minor
        } else {
            Self::None
        }
    }

    /// Resolution strategy tag.
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::None => "n/a",
            Self::Minor => "simple average",
            Self::Significant => "weighted reconciliation",
            Self::Major => "deep analysis/arbitration",
        }
    }

    /// Credibility assessed for a batch whose worst pair has this severity.
    pub fn credibility(&self) -> f64 {
        match self {
            Self::None => 0.95,
            Self::Minor => 0.85,
            Self::Significant => 0.7,
            Self::Major => 0.5,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Minor => write!(f, "minor"),
            Self::Significant => write!(f, "significant"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// One disagreeing pair. Conflicts are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub source_a: String,
    pub source_b: String,
    pub judgment_a: Judgment,
    pub judgment_b: Judgment,
    pub difference: f64,
    pub severity: Severity,
    pub strategy: String,
}

impl ConflictRecord {
    pub fn new(a: &Judgment, b: &Judgment) -> Self {
        let difference = (a.score() - b.score()).abs();
        let severity = Severity::classify(difference);
        Self {
            source_a: a.source().to_string(),
            source_b: b.source().to_string(),
            judgment_a: a.clone(),
            judgment_b: b.clone(),
            difference,
            severity,
            strategy: severity.strategy().to_string(),
        }
    }

    pub fn involves(&self, source: &str) -> bool {
        self.source_a == source || self.source_b == source
    }

    pub fn pair_label(&self) -> String {
        format!("{} vs {}", self.source_a, self.source_b)
    }
}

/// Confidence-weighted consolidation of a set of judgments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledJudgment {
    pub category: Category,
    pub score: f64,
    pub confidence: f64,
    /// Per-source weight; sums to 1 for non-empty input.
    pub weights: BTreeMap<String, f64>,
    pub recommendations: Vec<String>,
}

/// Full output of [`ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictAnalysis {
    pub has_conflict: bool,
    pub conflicts: Vec<ConflictRecord>,
    pub reconciled: ReconciledJudgment,
    pub needs_arbitration: bool,
    /// Major conflicts, most severe first.
    pub arbitration_conflicts: Vec<ConflictRecord>,
    pub max_severity: Severity,
    pub strategy: String,
    pub credibility: f64,
}

impl ConflictAnalysis {
    pub fn most_severe(&self) -> Option<&ConflictRecord> {
        self.conflicts
            .iter()
            .max_by(|a, b| a.difference.total_cmp(&b.difference))
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.severity == severity)
            .count()
    }

    /// Short human-readable report.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.has_conflict {
            out.push_str(&format!(
                "{} conflict(s): {} major, {} significant, {} minor\n",
                self.conflicts.len(),
                self.count(Severity::Major),
                self.count(Severity::Significant),
                self.count(Severity::Minor)
            ));
            for conflict in &self.conflicts {
                out.push_str(&format!(
                    "- {} ({}, gap {:.2}): {} vs {}\n",
                    conflict.pair_label(),
                    conflict.severity,
                    conflict.difference,
                    conflict.judgment_a.category(),
                    conflict.judgment_b.category()
                ));
            }
        } else {
            out.push_str("No conflicts between sources\n");
        }
        out.push_str(&format!(
            "Reconciled: {} (score {:.2}, confidence {:.2})\n",
            self.reconciled.category, self.reconciled.score, self.reconciled.confidence
        ));
        out.push_str(&format!(
            "Strategy: {}; credibility {:.2}",
            self.strategy, self.credibility
        ));
        out
    }
}

/// Pairwise conflict detection and weighted reconciliation.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    significant_penalty: f64,
    major_penalty: f64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            significant_penalty: SIGNIFICANT_PENALTY,
            major_penalty: MAJOR_PENALTY,
        }
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_penalties(significant: f64, major: f64) -> Self {
        Self {
            significant_penalty: significant.clamp(0.0, 1.0),
            major_penalty: major.clamp(0.0, 1.0),
        }
    }

    pub fn resolve(&self, judgments: &[Judgment]) -> ConflictAnalysis {
        let mut conflicts = Vec::new();
        for (i, a) in judgments.iter().enumerate() {
            for b in &judgments[i + 1..] {
                let record = ConflictRecord::new(a, b);
                if record.severity != Severity::None {
                    debug!(
                        pair = %record.pair_label(),
                        difference = record.difference,
                        severity = %record.severity,
                        "Conflict detected"
                    );
                    conflicts.push(record);
                }
            }
        }

        let max_severity = conflicts
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::None);

        let mut arbitration_conflicts: Vec<ConflictRecord> = conflicts
            .iter()
            .filter(|c| c.severity == Severity::Major)
            .cloned()
            .collect();
        arbitration_conflicts.sort_by(|a, b| b.difference.total_cmp(&a.difference));

        let mut reconciled = self.reconcile(judgments, &conflicts);
        reconciled.recommendations = recommendations(&conflicts, &reconciled);

        let strategy = match max_severity {
            Severity::Major => "arbitration required",
            other => other.strategy(),
        };

        info!(
            judgments = judgments.len(),
            conflicts = conflicts.len(),
            max_severity = %max_severity,
            reconciled = %reconciled.category,
            "Resolved judgments"
        );

        ConflictAnalysis {
            has_conflict: !conflicts.is_empty(),
            needs_arbitration: !arbitration_conflicts.is_empty(),
            arbitration_conflicts,
            conflicts,
            reconciled,
            max_severity,
            strategy: strategy.to_string(),
            credibility: max_severity.credibility(),
        }
    }

    fn reconcile(&self, judgments: &[Judgment], conflicts: &[ConflictRecord]) -> ReconciledJudgment {
        if judgments.is_empty() {
            return ReconciledJudgment {
                category: Category::Neutral,
                score: 0.5,
                confidence: 0.5,
                weights: BTreeMap::new(),
                recommendations: Vec::new(),
            };
        }

        let raw: Vec<f64> = judgments
            .iter()
            .map(|j| {
                conflicts
                    .iter()
                    .filter(|c| c.involves(j.source()))
                    .fold(j.confidence(), |weight, c| match c.severity {
                        Severity::Major => weight * self.major_penalty,
                        Severity::Significant => weight * self.significant_penalty,
                        _ => weight,
                    })
            })
            .collect();

        let total: f64 = raw.iter().sum();
        let n = judgments.len() as f64;
        let normalized: Vec<f64> = if total > 0.0 {
            raw.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / n; judgments.len()]
        };

        let score: f64 = judgments
            .iter()
            .zip(&normalized)
            .map(|(j, w)| w * j.score())
            .sum::<f64>()
            .clamp(0.0, 1.0);
        let confidence: f64 = judgments
            .iter()
            .zip(&normalized)
            .map(|(j, w)| w * j.confidence())
            .sum::<f64>()
            .clamp(0.0, 1.0);

        let mut weights = BTreeMap::new();
        for (j, w) in judgments.iter().zip(&normalized) {
            *weights.entry(j.source().to_string()).or_insert(0.0) += w;
        }

        ReconciledJudgment {
            category: Category::from_score(score),
            score,
            confidence,
            weights,
            recommendations: Vec::new(),
        }
    }
}

fn recommendations(conflicts: &[ConflictRecord], reconciled: &ReconciledJudgment) -> Vec<String> {
    let mut out = Vec::new();

    let majors: Vec<String> = conflicts
        .iter()
        .filter(|c| c.severity == Severity::Major)
        .map(ConflictRecord::pair_label)
        .collect();
    if !majors.is_empty() {
        out.push(format!(
            "{} major conflict(s) ({}); a tie-breaking source should be consulted",
            majors.len(),
            majors.join(", ")
        ));
    }

    let significant = conflicts
        .iter()
        .filter(|c| c.severity == Severity::Significant)
        .count();
    if significant > 0 {
        out.push(format!(
            "{} significant difference(s); conflicting sources were down-weighted",
            significant
        ));
    }

    if conflicts.is_empty() && reconciled.weights.len() > 1 {
        out.push("All sources are broadly consistent".to_string());
    }

    if reconciled.confidence < 0.6 {
        out.push(format!(
            "Reconciled confidence is low ({:.2}); treat the conclusion as tentative",
            reconciled.confidence
        ));
    } else if reconciled.confidence >= 0.8 {
        out.push(format!(
            "Reconciled confidence is high ({:.2})",
            reconciled.confidence
        ));
    }

    if let Some((source, weight)) = reconciled
        .weights
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
    {
        if *weight > DOMINANT_WEIGHT && reconciled.weights.len() > 1 {
            out.push(format!(
                "{} carries the most weight ({:.0}%)",
                source,
                weight * 100.0
            ));
        }
    }

    out
}
