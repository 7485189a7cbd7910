//! Analysis sources: producers of typed judgments.
//!
//! Domain engines live outside this crate; they plug in through
//! [`AnalysisSource`]. [`StaticSource`] serves results computed elsewhere.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use crate::judgment::{Category, Judgment, JudgmentError};

/// Confidence assumed when a raw result does not carry one.
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// A calculation engine producing one raw result and its typed judgment.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    fn name(&self) -> &str;

    async fn calculate(&self, input: &Value) -> anyhow::Result<Value>;

    fn to_judgment(&self, raw: &Value) -> Result<Judgment, JudgmentError>;

    /// `calculate` then `to_judgment`.
    async fn judge(&self, input: &Value) -> anyhow::Result<(Value, Judgment)> {
        let raw = self
            .calculate(input)
            .await
            .with_context(|| format!("{} calculation failed", self.name()))?;
        let judgment = self
            .to_judgment(&raw)
            .with_context(|| format!("{} produced an invalid judgment", self.name()))?;
        Ok((raw, judgment))
    }
}

pub type SharedSource = Arc<dyn AnalysisSource>;

/// Read a judgment out of a loosely-typed raw result.
///
/// Recognised keys: `category`, `score`, `intensity`, `confidence`,
/// `rationale`, `timing`, `advice`. A score alone implies its category; a
/// category alone sits at the centre of its band.
pub fn judgment_from_raw(source: &str, raw: &Value) -> Result<Judgment, JudgmentError> {
    let number = |key: &str| raw.get(key).and_then(Value::as_f64);
    let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);

    let category = text("category").map(|c| Category::parse(&c)).transpose()?;
    let confidence = number("confidence").unwrap_or(DEFAULT_CONFIDENCE);

    let judgment = match (category, number("score"), number("intensity")) {
        (Some(category), Some(score), _) => Judgment::new(source, category, score, confidence)?,
        (Some(category), None, Some(intensity)) => {
            Judgment::from_intensity(source, category, intensity, confidence)?
        }
        (Some(category), None, None) => {
            Judgment::new(source, category, category.nominal_score(), confidence)?
        }
        (None, Some(score), _) => Judgment::from_score(source, score, confidence)?,
        (None, None, _) => return Err(JudgmentError::Incomplete),
    };

    let mut judgment = judgment.with_rationale(text("rationale").unwrap_or_default());
    if let Some(timing) = text("timing") {
        judgment = judgment.with_timing(timing);
    }
    if let Some(advice) = text("advice") {
        judgment = judgment.with_advice(advice);
    }
    Ok(judgment)
}

/// Source whose result was computed ahead of time.
pub struct StaticSource {
    name: String,
    raw: Value,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, raw: Value) -> Self {
        Self {
            name: name.into(),
            raw,
        }
    }
}

#[async_trait]
impl AnalysisSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn calculate(&self, _input: &Value) -> anyhow::Result<Value> {
        Ok(self.raw.clone())
    }

    fn to_judgment(&self, raw: &Value) -> Result<Judgment, JudgmentError> {
        judgment_from_raw(&self.name, raw)
    }
}

/// Name → source lookup used for batch tasks and tie-breakers.
#[derive(Default, Clone)]
pub struct SourceCatalog {
    sources: BTreeMap<String, SharedSource>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: SharedSource) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn with(mut self, source: impl AnalysisSource + 'static) -> Self {
        self.register(Arc::new(source));
        self
    }

    pub fn get(&self, name: &str) -> Option<SharedSource> {
        self.sources.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
