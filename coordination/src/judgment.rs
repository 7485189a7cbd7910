//! Typed judgments on a five-way ordered scale.
//!
//! ```text
//! very_unfavorable  unfavorable   neutral      favorable    very_favorable
//! [0.00, 0.15)      [0.15, 0.35)  [0.35, 0.65) [0.65, 0.85) [0.85, 1.00]
//! ```
//!
//! A [`Judgment`]'s score always lies inside its category's band; the
//! constructors and deserialization enforce this.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BAND_EDGE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JudgmentError {
    #[error("score {score} lies outside the {category} band [{lo}, {hi})")]
    ScoreOutOfBand {
        category: Category,
        score: f64,
        lo: f64,
        hi: f64,
    },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    #[error("raw result has neither a category nor a score")]
    Incomplete,
}

/// Ordered judgment buckets, worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    VeryUnfavorable,
    Unfavorable,
    Neutral,
    Favorable,
    VeryFavorable,
}

/// Three-way direction of a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Favorable,
    Neutral,
    Unfavorable,
}

impl Category {
    pub fn all() -> &'static [Category] {
        &[
            Self::VeryUnfavorable,
            Self::Unfavorable,
            Self::Neutral,
            Self::Favorable,
            Self::VeryFavorable,
        ]
    }

    /// Bucket for a score in [0, 1]; out-of-range scores are clamped.
    pub fn from_score(score: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        if score >= 0.85 {
            Self::VeryFavorable
        } else if score >= 0.65 {
            Self::Favorable
        } else if score >= 0.35 {
            Self::Neutral
        } else if score >= 0.15 {
            Self::Unfavorable
        } else {
            Self::VeryUnfavorable
        }
    }

    /// `[lo, hi)` for every band except the top one, which is closed.
    pub fn band(&self) -> (f64, f64) {
        match self {
            Self::VeryUnfavorable => (0.0, 0.15),
            Self::Unfavorable => (0.15, 0.35),
            Self::Neutral => (0.35, 0.65),
            Self::Favorable => (0.65, 0.85),
            Self::VeryFavorable => (0.85, 1.0),
        }
    }

    pub fn contains(&self, score: f64) -> bool {
        (0.0..=1.0).contains(&score) && Self::from_score(score) == *self
    }

    /// Centre of the band.
    pub fn nominal_score(&self) -> f64 {
        match self {
            Self::VeryUnfavorable => 0.075,
            Self::Unfavorable => 0.25,
            Self::Neutral => 0.5,
            Self::Favorable => 0.75,
            Self::VeryFavorable => 0.925,
        }
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            Self::VeryUnfavorable | Self::Unfavorable => Polarity::Unfavorable,
            Self::Neutral => Polarity::Neutral,
            Self::Favorable | Self::VeryFavorable => Polarity::Favorable,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::VeryUnfavorable => "very unfavorable",
            Self::Unfavorable => "unfavorable",
            Self::Neutral => "neutral",
            Self::Favorable => "favorable",
            Self::VeryFavorable => "very favorable",
        }
    }

    /// Accepts labels with spaces, hyphens or underscores, any case.
    pub fn parse(text: &str) -> Result<Self, JudgmentError> {
        let key = text.trim().to_lowercase().replace(['-', '_'], " ");
        Self::all()
            .iter()
            .copied()
            .find(|c| c.label() == key)
            .ok_or_else(|| JudgmentError::UnknownCategory(text.to_string()))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Favorable => write!(f, "favorable"),
            Self::Neutral => write!(f, "neutral"),
            Self::Unfavorable => write!(f, "unfavorable"),
        }
    }
}

/// Wire form of a [`Judgment`], validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub source: String,
    pub category: Category,
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
}

/// One analysis source's bounded, typed outcome. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JudgmentRecord", into = "JudgmentRecord")]
pub struct Judgment {
    source: String,
    category: Category,
    score: f64,
    confidence: f64,
    rationale: String,
    timing: Option<String>,
    advice: Option<String>,
}

fn unit(field: &'static str, value: f64) -> Result<f64, JudgmentError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(JudgmentError::OutOfRange { field, value })
    }
}

impl Judgment {
    pub fn new(
        source: impl Into<String>,
        category: Category,
        score: f64,
        confidence: f64,
    ) -> Result<Self, JudgmentError> {
        let score = unit("score", score)?;
        let confidence = unit("confidence", confidence)?;
        if !category.contains(score) {
            let (lo, hi) = category.band();
            return Err(JudgmentError::ScoreOutOfBand {
                category,
                score,
                lo,
                hi,
            });
        }
        Ok(Self {
            source: source.into(),
            category,
            score,
            confidence,
            rationale: String::new(),
            timing: None,
            advice: None,
        })
    }

    /// Category derived from the score.
    pub fn from_score(
        source: impl Into<String>,
        score: f64,
        confidence: f64,
    ) -> Result<Self, JudgmentError> {
        let score = unit("score", score)?;
        Self::new(source, Category::from_score(score), score, confidence)
    }

    /// Place a score inside `category`'s band; `intensity` 0 is the bottom
    /// edge and 1 the top.
    pub fn from_intensity(
        source: impl Into<String>,
        category: Category,
        intensity: f64,
        confidence: f64,
    ) -> Result<Self, JudgmentError> {
        let intensity = unit("intensity", intensity)?;
        let (lo, hi) = category.band();
        let top = if category == Category::VeryFavorable {
            hi
        } else {
            hi - BAND_EDGE
        };
        let score = (lo + intensity * (top - lo)).clamp(lo, top);
        Self::new(source, category, score, confidence)
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_timing(mut self, timing: impl Into<String>) -> Self {
        self.timing = Some(timing.into());
        self
    }

    pub fn with_advice(mut self, advice: impl Into<String>) -> Self {
        self.advice = Some(advice.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn timing(&self) -> Option<&str> {
        self.timing.as_deref()
    }

    pub fn advice(&self) -> Option<&str> {
        self.advice.as_deref()
    }
}

impl TryFrom<JudgmentRecord> for Judgment {
    type Error = JudgmentError;

    fn try_from(record: JudgmentRecord) -> Result<Self, Self::Error> {
        let mut judgment = Judgment::new(
            record.source,
            record.category,
            record.score,
            record.confidence,
        )?
        .with_rationale(record.rationale);
        judgment.timing = record.timing;
        judgment.advice = record.advice;
        Ok(judgment)
    }
}

impl From<Judgment> for JudgmentRecord {
    fn from(j: Judgment) -> Self {
        Self {
            source: j.source,
            category: j.category,
            score: j.score,
            confidence: j.confidence,
            rationale: j.rationale,
            timing: j.timing,
            advice: j.advice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_score_band_edges() {
        assert_eq!(Category::from_score(0.85), Category::VeryFavorable);
        assert_eq!(Category::from_score(0.8499), Category::Favorable);
        assert_eq!(Category::from_score(0.65), Category::Favorable);
        assert_eq!(Category::from_score(0.5), Category::Neutral);
        assert_eq!(Category::from_score(0.35), Category::Neutral);
        assert_eq!(Category::from_score(0.15), Category::Unfavorable);
        assert_eq!(Category::from_score(0.0), Category::VeryUnfavorable);
        assert_eq!(Category::from_score(1.0), Category::VeryFavorable);
    }

    #[test]
    fn test_nominal_scores_sit_inside_their_bands() {
        for category in Category::all() {
            assert!(category.contains(category.nominal_score()), "{category}");
        }
        assert_eq!(Category::Favorable.nominal_score(), 0.75);
        assert_eq!(Category::Unfavorable.nominal_score(), 0.25);
    }

    #[test]
    fn test_score_must_match_category() {
        assert!(Judgment::new("a", Category::Favorable, 0.75, 0.8).is_ok());
        let err = Judgment::new("a", Category::Favorable, 0.3, 0.8).unwrap_err();
        assert!(matches!(err, JudgmentError::ScoreOutOfBand { .. }));
        assert!(Judgment::new("a", Category::Neutral, 0.5, 1.2).is_err());
        assert!(Judgment::new("a", Category::Neutral, f64::NAN, 0.5).is_err());
    }

    #[test]
    fn test_from_intensity_stays_in_band() {
        for category in Category::all() {
            for intensity in [0.0, 0.5, 1.0] {
                let j = Judgment::from_intensity("s", *category, intensity, 0.5).unwrap();
                assert_eq!(j.category(), *category);
            }
        }
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(Category::parse("Very Favorable").unwrap(), Category::VeryFavorable);
        assert_eq!(Category::parse("very_unfavorable").unwrap(), Category::VeryUnfavorable);
        assert_eq!(Category::parse("neutral").unwrap(), Category::Neutral);
        assert!(Category::parse("great").is_err());
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_record() {
        let ok: Judgment = serde_json::from_str(
            r#"{"source":"a","category":"favorable","score":0.7,"confidence":0.9,"advice":"go"}"#,
        )
        .unwrap();
        assert_eq!(ok.advice(), Some("go"));

        let bad = serde_json::from_str::<Judgment>(
            r#"{"source":"a","category":"favorable","score":0.2,"confidence":0.9}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_polarity() {
        assert_eq!(Category::VeryFavorable.polarity(), Polarity::Favorable);
        assert_eq!(Category::Unfavorable.polarity(), Polarity::Unfavorable);
        assert_eq!(Category::Neutral.polarity(), Polarity::Neutral);
    }
}
