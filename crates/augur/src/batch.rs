//! Batch files for `augur run`.
//!
//! ```json
//! {
//!   "question": "Should I change jobs this year?",
//!   "question_category": "career",
//!   "input": { "birth": "1990-01-01T08:00" },
//!   "tasks": [{ "source": "bazi" }, { "source": "ziwei", "quick": true }],
//!   "results": {
//!     "bazi":   { "category": "favorable", "score": 0.78, "confidence": 0.8 },
//!     "ziwei":  { "score": 0.12, "rationale": "..." },
//!     "liuyao": { "category": "favorable", "intensity": 0.6 }
//!   },
//!   "narrative": { "instructions": "Answer in three paragraphs." }
//! }
//! ```
//!
//! Every entry of `results` becomes a [`StaticSource`], so sources listed
//! only there are available as tie-breakers.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use augur_coordination::ensemble::{AnalysisBatch, NarrativeTask};
use augur_coordination::{SourceCatalog, StaticSource};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    #[serde(flatten)]
    pub batch: AnalysisBatch,
    /// Pre-computed raw result per source name.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    #[serde(default)]
    pub narrative: NarrativeTask,
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid batch file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(text)?;
        if file.batch.tasks.is_empty() {
            bail!("batch lists no tasks");
        }
        Ok(file)
    }

    pub fn catalog(&self) -> SourceCatalog {
        self.results
            .iter()
            .fold(SourceCatalog::new(), |catalog, (name, raw)| {
                catalog.with(StaticSource::new(name.clone(), raw.clone()))
            })
    }

    /// Task sources with no pre-computed result.
    pub fn missing_results(&self) -> Vec<&str> {
        self.batch
            .tasks
            .iter()
            .map(|t| t.source.as_str())
            .filter(|s| !self.results.contains_key(*s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "question": "Should I change jobs this year?",
        "question_category": "career",
        "tasks": [{"source": "bazi"}, {"source": "ziwei", "quick": true}],
        "results": {
            "bazi": {"category": "favorable", "score": 0.78},
            "liuyao": {"score": 0.7}
        },
        "narrative": {"instructions": "Be brief."}
    }"#;

    #[test]
    fn test_parse_batch_file() {
        let file = BatchFile::parse(SAMPLE).unwrap();
        assert_eq!(file.batch.question_category, "career");
        assert_eq!(file.batch.tasks.len(), 2);
        assert!(file.batch.tasks[1].quick);
        assert_eq!(file.narrative.task_type, "comprehensive_report");
        assert_eq!(file.narrative.instructions.as_deref(), Some("Be brief."));
    }

    #[test]
    fn test_catalog_includes_tie_breaker_only_sources() {
        let file = BatchFile::parse(SAMPLE).unwrap();
        let catalog = file.catalog();
        assert_eq!(catalog.names(), vec!["bazi", "liuyao"]);
        assert_eq!(file.missing_results(), vec!["ziwei"]);
    }

    #[test]
    fn test_empty_task_list_is_rejected() {
        let err = BatchFile::parse(r#"{"question": "q", "tasks": []}"#).unwrap_err();
        assert!(err.to_string().contains("no tasks"));
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let err = BatchFile::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid batch file"));
    }
}
