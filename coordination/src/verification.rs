//! Dual verification: ask the top two providers at once and compare.
//!
//! | primary | secondary | outcome                                             |
//! |---------|-----------|-----------------------------------------------------|
//! | ok      | ok        | agreement ≥ medium → primary + note; low → both      |
//! | ok      | failed    | primary text                                        |
//! | failed  | ok        | secondary text                                      |
//! | failed  | failed    | full failover over the same candidates              |
//!
//! Both calls run concurrently and each is bounded by the same budget, so a
//! failure or timeout on one side never cancels the other.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::failover::{Candidate, FailoverError, FailoverRouter, ProviderReply};
use crate::provider::{ProviderError, TextRequest};

/// Tunable weights and thresholds for agreement scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    pub length_weight: f64,
    pub keyword_weight: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
    /// Judgment vocabulary compared between responses (whole words/phrases).
    pub keywords: Vec<String>,
    /// Length ratio below which a difference is reported.
    pub length_ratio_warning: f64,
    pub favorable_markers: Vec<String>,
    pub unfavorable_markers: Vec<String>,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            length_weight: 0.3,
            keyword_weight: 0.7,
            high_threshold: 0.8,
            medium_threshold: 0.6,
            keywords: words(&[
                "very favorable",
                "favorable",
                "neutral",
                "unfavorable",
                "very unfavorable",
                "recommend",
                "avoid",
                "suitable",
                "advantage",
                "risk",
            ]),
            length_ratio_warning: 0.5,
            favorable_markers: words(&["favorable", "auspicious", "positive"]),
            unfavorable_markers: words(&["unfavorable", "inauspicious", "negative"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for AgreementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Comparison of two responses to the same request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agreement {
    pub score: f64,
    pub level: AgreementLevel,
    pub length_ratio: f64,
    pub keyword_overlap: f64,
    pub differences: Vec<String>,
}

/// Lowercased words joined by single spaces, padded for phrase matching.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let needle = normalize(phrase);
    !needle.trim().is_empty() && normalized.contains(&needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Favorable,
    Unfavorable,
}

fn polarity(normalized: &str, config: &AgreementConfig) -> Option<Polarity> {
    let fav = config
        .favorable_markers
        .iter()
        .any(|m| contains_phrase(normalized, m));
    let unfav = config
        .unfavorable_markers
        .iter()
        .any(|m| contains_phrase(normalized, m));
    match (fav, unfav) {
        (true, false) => Some(Polarity::Favorable),
        (false, true) => Some(Polarity::Unfavorable),
        _ => None,
    }
}

/// Score how closely two responses agree.
///
/// `score = length_weight · (shorter/longer) + keyword_weight · jaccard(keywords)`
pub fn score_agreement(a: &str, b: &str, config: &AgreementConfig) -> Agreement {
    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    let length_ratio = match len_a.max(len_b) {
        0 => 1.0,
        longest => len_a.min(len_b) as f64 / longest as f64,
    };

    let (norm_a, norm_b) = (normalize(a), normalize(b));
    let present = |norm: &str| -> HashSet<&str> {
        config
            .keywords
            .iter()
            .filter(|k| contains_phrase(norm, k))
            .map(String::as_str)
            .collect()
    };
    let (kw_a, kw_b) = (present(&norm_a), present(&norm_b));
    let union = kw_a.union(&kw_b).count();
    let keyword_overlap = if union == 0 {
        0.0
    } else {
        kw_a.intersection(&kw_b).count() as f64 / union as f64
    };

    let score = config.length_weight * length_ratio + config.keyword_weight * keyword_overlap;
    let level = if score >= config.high_threshold {
        AgreementLevel::High
    } else if score >= config.medium_threshold {
        AgreementLevel::Medium
    } else {
        AgreementLevel::Low
    };

    let mut differences = Vec::new();
    if let (Some(pa), Some(pb)) = (polarity(&norm_a, config), polarity(&norm_b, config)) {
        if pa != pb {
            differences.push("the responses reach opposite overall judgments".to_string());
        }
    }
    if length_ratio < config.length_ratio_warning {
        differences.push(format!(
            "response lengths differ substantially (ratio {:.2})",
            length_ratio
        ));
    }

    Agreement {
        score,
        level,
        length_ratio,
        keyword_overlap,
        differences,
    }
}

/// How a verified response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// Both answered and agreed at least at medium level.
    Agreed,
    /// Both answered but agreement was low; both texts returned.
    Diverged,
    PrimaryOnly,
    SecondaryOnly,
    /// Both failed; result came from full failover.
    FailedOver,
    /// Verification disabled or fewer than two providers.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedResponse {
    pub text: String,
    pub outcome: VerificationOutcome,
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub agreement: Option<Agreement>,
    /// Provider whose reply the text is built from.
    pub served_by: String,
}

impl VerifiedResponse {
    fn single(reply: ProviderReply, outcome: VerificationOutcome) -> Self {
        Self {
            served_by: reply.provider,
            text: reply.text,
            outcome,
            primary: None,
            secondary: None,
            agreement: None,
        }
    }
}

pub struct DualVerificationCoordinator {
    failover: Arc<FailoverRouter>,
    config: AgreementConfig,
}

impl DualVerificationCoordinator {
    pub fn new(failover: Arc<FailoverRouter>, config: AgreementConfig) -> Self {
        Self { failover, config }
    }

    pub fn config(&self) -> &AgreementConfig {
        &self.config
    }

    /// Call with cross-validation when enabled and at least two providers
    /// are available; otherwise plain failover.
    pub async fn call_with_verification(
        &self,
        task_type: &str,
        request: &TextRequest,
    ) -> Result<VerifiedResponse, FailoverError> {
        let (route, candidates) = self.failover.plan(task_type);
        let enabled = self.failover.router().global().enable_dual_verification;

        let (primary, secondary) = match (enabled, candidates.as_slice()) {
            (true, [primary, secondary, ..]) => (primary, secondary),
            _ => {
                let reply = self
                    .failover
                    .call_candidates(&route, &candidates, request)
                    .await
                    .into_result(task_type)?;
                return Ok(VerifiedResponse::single(reply, VerificationOutcome::Skipped));
            }
        };

        let budget = primary.timeout().max(secondary.timeout());
        info!(
            task_type,
            primary = primary.id(),
            secondary = secondary.id(),
            budget_ms = budget.as_millis() as u64,
            "Starting dual verification"
        );

        let (first, second) = futures::future::join(
            bounded(budget, primary, self.failover.call_candidate(&route, primary, request)),
            bounded(
                budget,
                secondary,
                self.failover.call_candidate(&route, secondary, request),
            ),
        )
        .await;

        match (first, second) {
            (Ok(a), Ok(b)) => Ok(self.merge(a, b)),
            (Ok(a), Err(e)) => {
                warn!(task_type, secondary = secondary.id(), "Secondary failed, using primary: {}", e);
                Ok(VerifiedResponse::single(a, VerificationOutcome::PrimaryOnly))
            }
            (Err(e), Ok(b)) => {
                warn!(task_type, primary = primary.id(), "Primary failed, using secondary: {}", e);
                Ok(VerifiedResponse::single(b, VerificationOutcome::SecondaryOnly))
            }
            (Err(ea), Err(eb)) => {
                warn!(
                    task_type,
                    "Both verification calls failed ({}; {}), falling back to failover", ea, eb
                );
                let reply = self
                    .failover
                    .call_candidates(&route, &candidates, request)
                    .await
                    .into_result(task_type)?;
                Ok(VerifiedResponse::single(reply, VerificationOutcome::FailedOver))
            }
        }
    }

    fn merge(&self, primary: ProviderReply, secondary: ProviderReply) -> VerifiedResponse {
        let agreement = score_agreement(&primary.text, &secondary.text, &self.config);
        let note = verification_note(&primary, &secondary, &agreement);

        let (text, outcome) = if agreement.level >= AgreementLevel::Medium {
            (
                format!("{}{}", primary.text, note),
                VerificationOutcome::Agreed,
            )
        } else {
            warn!(
                primary = %primary.provider,
                secondary = %secondary.provider,
                score = agreement.score,
                "Verification responses diverge"
            );
            (
                format!(
                    "**Verification warning**: the two models disagree (agreement {}, {:.2}). \
                     Review both answers before relying on either.\n\n\
                     ### Primary answer ({})\n\n{}\n\n### Secondary answer ({})\n\n{}{}",
                    agreement.level,
                    agreement.score,
                    primary.provider,
                    primary.text,
                    secondary.provider,
                    secondary.text,
                    note
                ),
                VerificationOutcome::Diverged,
            )
        };

        VerifiedResponse {
            text,
            outcome,
            served_by: primary.provider.clone(),
            primary: Some(primary.provider),
            secondary: Some(secondary.provider),
            agreement: Some(agreement),
        }
    }
}

async fn bounded(
    budget: Duration,
    candidate: &Candidate,
    call: impl Future<Output = Result<ProviderReply, ProviderError>>,
) -> Result<ProviderReply, ProviderError> {
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(candidate.id(), budget)),
    }
}

fn verification_note(primary: &ProviderReply, secondary: &ProviderReply, agreement: &Agreement) -> String {
    let analysis = if agreement.differences.is_empty() {
        "no notable differences".to_string()
    } else {
        agreement.differences.join("; ")
    };
    format!(
        "\n\n---\n**Dual verification**\n\
         - Primary: {} ({})\n\
         - Secondary: {} ({})\n\
         - Agreement: {} ({:.2})\n\
         - Analysis: {}",
        primary.provider,
        primary.model,
        secondary.provider,
        secondary.model,
        agreement.level,
        agreement.score,
        analysis
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProviderRegistry;
    use crate::retry::RetryingInvoker;
    use crate::router::{GlobalRouting, RoutingConfig, TaskRouter};
    use crate::testing::{registry_with, ScriptedProvider};

    fn coordinator(registry: ProviderRegistry, primary: &str, dual: bool) -> DualVerificationCoordinator {
        let registry = registry.shared();
        let config = RoutingConfig {
            global: GlobalRouting {
                primary_provider: primary.to_string(),
                fallback_order: Vec::new(),
                enable_dual_verification: dual,
                max_retries: 1,
                ..GlobalRouting::default()
            },
            task_overrides: Default::default(),
        };
        let router = TaskRouter::with_config(config, registry.clone()).shared();
        let failover = Arc::new(FailoverRouter::new(registry, router, RetryingInvoker::default()));
        DualVerificationCoordinator::new(failover, AgreementConfig::default())
    }

    #[test]
    fn test_identical_texts_agree_highly() {
        let text = "The outlook is favorable; we recommend acting now despite some risk.";
        let agreement = score_agreement(text, text, &AgreementConfig::default());
        assert!((agreement.score - 1.0).abs() < 1e-9);
        assert_eq!(agreement.level, AgreementLevel::High);
        assert!(agreement.differences.is_empty());
    }

    #[test]
    fn test_opposite_judgments_score_low_and_are_reported() {
        let a = "Overall favorable. We recommend going ahead.";
        let b = "Overall unfavorable. Avoid this for now, the risk is high.";
        let agreement = score_agreement(a, b, &AgreementConfig::default());
        assert_eq!(agreement.level, AgreementLevel::Low);
        assert!(agreement
            .differences
            .iter()
            .any(|d| d.contains("opposite")));
    }

    #[test]
    fn test_whole_word_matching_keeps_unfavorable_apart() {
        let agreement = score_agreement("unfavorable", "favorable", &AgreementConfig::default());
        assert_eq!(agreement.keyword_overlap, 0.0);
    }

    #[test]
    fn test_no_keywords_and_length_difference() {
        let agreement = score_agreement("abc", "abcdefghij", &AgreementConfig::default());
        assert_eq!(agreement.keyword_overlap, 0.0);
        assert!((agreement.length_ratio - 0.3).abs() < 1e-9);
        assert!((agreement.score - 0.09).abs() < 1e-9);
        assert!(agreement.differences.iter().any(|d| d.contains("lengths")));
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let config = AgreementConfig {
            medium_threshold: 0.05,
            ..AgreementConfig::default()
        };
        let agreement = score_agreement("abc", "abcdefghij", &config);
        assert_eq!(agreement.level, AgreementLevel::Medium);
    }

    #[tokio::test]
    async fn test_both_ok_and_agreeing_returns_primary_with_note() {
        let text = "Favorable outlook, recommend proceeding.";
        let a = ScriptedProvider::always("a", text);
        let b = ScriptedProvider::always("b", text);
        let dual = coordinator(registry_with(&[("a", 0, a.clone()), ("b", 1, b.clone())]), "a", true);

        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();

        assert_eq!(resp.outcome, VerificationOutcome::Agreed);
        assert!(resp.text.starts_with(text));
        assert!(resp.text.contains("Dual verification"));
        assert_eq!(resp.primary.as_deref(), Some("a"));
        assert_eq!(resp.secondary.as_deref(), Some("b"));
        assert_eq!((a.calls(), b.calls()), (1, 1));
    }

    #[tokio::test]
    async fn test_low_agreement_returns_both_texts() {
        let a = ScriptedProvider::always("a", "Favorable, recommend it.");
        let b = ScriptedProvider::always(
            "b",
            "Unfavorable. Avoid it entirely; the risk outweighs any advantage here.",
        );
        let dual = coordinator(registry_with(&[("a", 0, a), ("b", 1, b)]), "a", true);

        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();

        assert_eq!(resp.outcome, VerificationOutcome::Diverged);
        assert!(resp.text.contains("Verification warning"));
        assert!(resp.text.contains("Favorable, recommend it."));
        assert!(resp.text.contains("the risk outweighs"));
    }

    #[tokio::test]
    async fn test_one_side_failure_returns_the_other() {
        let a = ScriptedProvider::failing("a", "invalid key");
        let b = ScriptedProvider::always("b", "secondary text");
        let dual = coordinator(registry_with(&[("a", 0, a), ("b", 1, b)]), "a", true);
        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();
        assert_eq!(resp.outcome, VerificationOutcome::SecondaryOnly);
        assert_eq!(resp.text, "secondary text");

        let a = ScriptedProvider::always("a", "primary text");
        let b = ScriptedProvider::failing("b", "invalid key");
        let dual = coordinator(registry_with(&[("a", 0, a), ("b", 1, b)]), "a", true);
        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();
        assert_eq!(resp.outcome, VerificationOutcome::PrimaryOnly);
        assert_eq!(resp.text, "primary text");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_secondary_does_not_cancel_primary() {
        let a = ScriptedProvider::always("a", "fast");
        let b = ScriptedProvider::slow("b", "never", Duration::from_secs(3600));
        let dual = coordinator(registry_with(&[("a", 0, a), ("b", 1, b)]), "a", true);
        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();
        assert_eq!(resp.outcome, VerificationOutcome::PrimaryOnly);
        assert_eq!(resp.text, "fast");
    }

    #[tokio::test]
    async fn test_both_fail_matches_plain_failover() {
        let build = || {
            registry_with(&[
                ("a", 0, ScriptedProvider::failing("a", "bad request")),
                ("b", 1, ScriptedProvider::failing("b", "bad request")),
                ("c", 2, ScriptedProvider::always("c", "from c")),
            ])
        };
        let dual = coordinator(build(), "a", true);
        let verified = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();

        let plain = coordinator(build(), "a", true)
            .failover
            .call("x", &TextRequest::prompt("q"))
            .await
            .unwrap();

        assert_eq!(verified.outcome, VerificationOutcome::FailedOver);
        assert_eq!(verified.text, plain.text);
        assert_eq!(verified.served_by, plain.provider);
    }

    #[tokio::test]
    async fn test_all_fail_is_exhausted_like_failover() {
        let dual = coordinator(
            registry_with(&[
                ("a", 0, ScriptedProvider::failing("a", "bad request")),
                ("b", 1, ScriptedProvider::failing("b", "bad request")),
            ]),
            "a",
            true,
        );
        let err = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap_err();
        let FailoverError::AllProvidersExhausted { tried, .. } = err;
        assert_eq!(tried, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_single_provider_or_disabled_skips_verification() {
        let a = ScriptedProvider::always("a", "only");
        let dual = coordinator(registry_with(&[("a", 0, a)]), "a", true);
        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();
        assert_eq!(resp.outcome, VerificationOutcome::Skipped);

        let a = ScriptedProvider::always("a", "one");
        let b = ScriptedProvider::always("b", "two");
        let dual = coordinator(registry_with(&[("a", 0, a), ("b", 1, b.clone())]), "a", false);
        let resp = dual
            .call_with_verification("x", &TextRequest::prompt("q"))
            .await
            .unwrap();
        assert_eq!(resp.outcome, VerificationOutcome::Skipped);
        assert_eq!(resp.text, "one");
        assert_eq!(b.calls(), 0);
    }
}
