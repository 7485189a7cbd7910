//! Orchestrator: one analysis request from raw source results to a final,
//! reconciled answer.
//!
//! # Flow
//!
//! ```text
//! tasks ──► calculate ──► interpret (T1 primary ─► T2 backup ─► template)
//!                                   │
//!                                   ▼
//!                         conflict analysis ──► arbitration (major only)
//!                                   │
//!                                   ▼
//!                         narrative (dual verified, timeout) ──► FinalReport
//! ```
//!
//! Cancellation is checked between stages and raced against every
//! in-flight provider call.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::arbitration::{ArbitrationResult, ArbitrationSystem};
use super::conflict::{ConflictAnalysis, ConflictResolver, ReconciledJudgment};
use crate::config::AugurConfig;
use crate::events::{task_percent, Phase, ProgressEvent, ProgressTracker, SharedEventBus, REQUEST_SCOPE};
use crate::failover::FailoverRouter;
use crate::judgment::Judgment;
use crate::provider::TextRequest;
use crate::resilience::{DegradationLevel, DegradedResponse, StageTimeouts, TEMPLATE_SERVER};
use crate::router::TaskKind;
use crate::sources::SourceCatalog;
use crate::verification::{AgreementConfig, DualVerificationCoordinator, VerificationOutcome};

/// Fewer completed sources than this is reported as a limitation.
const MIN_SOURCES_FOR_CONFIDENCE: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("batch contains no tasks")]
    EmptyBatch,

    #[error("no task completed ({attempted} attempted): {}", .errors.join("; "))]
    NoTasksCompleted {
        attempted: usize,
        errors: Vec<String>,
    },

    #[error("request cancelled during {phase}")]
    Cancelled { phase: Phase },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// One source to evaluate and interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub source: String,
    /// Routing key; defaults by `quick`.
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Halves the stage budgets; quick task types imply it.
    #[serde(default)]
    pub quick: bool,
}

impl AnalysisTask {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            task_type: None,
            instructions: None,
            quick: false,
        }
    }

    pub fn quick(mut self) -> Self {
        self.quick = true;
        self
    }

    /// Halved stage budgets, either flagged or implied by a quick task type.
    pub fn runs_quick(&self) -> bool {
        self.quick || TaskKind::parse(self.task_type()).is_some_and(|kind| kind.is_quick())
    }

    pub fn task_type(&self) -> &str {
        match &self.task_type {
            Some(task_type) => task_type,
            None if self.quick => TaskKind::QuickInterpretation.as_str(),
            None => TaskKind::SingleInterpretation.as_str(),
        }
    }
}

/// The final write-up request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeTask {
    #[serde(default = "default_narrative_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_narrative_task_type() -> String {
    TaskKind::ComprehensiveReport.as_str().to_string()
}

impl Default for NarrativeTask {
    fn default() -> Self {
        Self {
            task_type: default_narrative_task_type(),
            instructions: None,
        }
    }
}

/// Everything the sources need, plus the tasks to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBatch {
    pub question: String,
    /// Selects the tie-breaker candidate list.
    #[serde(default = "default_question_category")]
    pub question_category: String,
    #[serde(default)]
    pub input: Value,
    pub tasks: Vec<AnalysisTask>,
}

fn default_question_category() -> String {
    "other".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub source: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub judgment: Option<Judgment>,
    pub raw: Option<Value>,
    pub interpretation: Option<DegradedResponse<String>>,
    pub error: Option<String>,
}

impl TaskResult {
    fn completed(task: &AnalysisTask, judgment: Judgment, raw: Value, interpretation: DegradedResponse<String>) -> Self {
        Self {
            source: task.source.clone(),
            task_type: task.task_type().to_string(),
            status: TaskStatus::Completed,
            judgment: Some(judgment),
            raw: Some(raw),
            interpretation: Some(interpretation),
            error: None,
        }
    }

    fn failed(task: &AnalysisTask, error: String) -> Self {
        Self {
            source: task.source.clone(),
            task_type: task.task_type().to_string(),
            status: TaskStatus::Failed,
            judgment: None,
            raw: None,
            interpretation: None,
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrativeResult {
    pub text: String,
    pub served_by: String,
    pub verification: Option<VerificationOutcome>,
    pub level: DegradationLevel,
}

/// Everything produced for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalReport {
    pub question: String,
    pub judgments: Vec<Judgment>,
    pub tasks: Vec<TaskResult>,
    /// Pre-arbitration analysis.
    pub conflicts: ConflictAnalysis,
    pub arbitration: Vec<ArbitrationResult>,
    /// Post-arbitration when a tie-breaker was folded in.
    pub reconciled: ReconciledJudgment,
    pub narrative: NarrativeResult,
    pub confidence: f64,
    pub limitations: Vec<String>,
    pub progress_events: Vec<ProgressEvent>,
}

impl FinalReport {
    pub fn completed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_completed()).count()
    }

    pub fn tie_breaker_judgments(&self) -> impl Iterator<Item = &Judgment> {
        self.arbitration
            .iter()
            .filter(|a| a.is_completed())
            .filter_map(|a| a.tie_breaker_judgment.as_ref())
    }
}

pub struct Orchestrator {
    failover: Arc<FailoverRouter>,
    verifier: DualVerificationCoordinator,
    resolver: ConflictResolver,
    arbitration: ArbitrationSystem,
    catalog: SourceCatalog,
    timeouts: StageTimeouts,
    bus: Option<SharedEventBus>,
}

impl Orchestrator {
    pub fn new(failover: Arc<FailoverRouter>, catalog: SourceCatalog) -> Self {
        Self {
            verifier: DualVerificationCoordinator::new(failover.clone(), AgreementConfig::default()),
            failover,
            resolver: ConflictResolver::new(),
            arbitration: ArbitrationSystem::new(Default::default()),
            catalog,
            timeouts: StageTimeouts::default(),
            bus: None,
        }
    }

    /// Wire every tunable from a loaded configuration.
    pub fn from_config(config: &AugurConfig, failover: Arc<FailoverRouter>, catalog: SourceCatalog) -> Self {
        let arbitration = ArbitrationSystem::from_config(config.arbitration.clone(), Some(failover.clone()));
        Self::new(failover, catalog)
            .with_timeouts(config.orchestrator)
            .with_agreement(config.verification.clone())
            .with_arbitration(arbitration)
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_agreement(mut self, config: AgreementConfig) -> Self {
        self.verifier = DualVerificationCoordinator::new(self.failover.clone(), config);
        self
    }

    pub fn with_arbitration(mut self, arbitration: ArbitrationSystem) -> Self {
        self.arbitration = arbitration;
        self
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub async fn run(&self, batch: &AnalysisBatch, narrative: &NarrativeTask) -> OrchestratorResult<FinalReport> {
        self.run_cancellable(batch, narrative, &CancellationToken::new())
            .await
    }

    pub async fn run_cancellable(
        &self,
        batch: &AnalysisBatch,
        narrative: &NarrativeTask,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<FinalReport> {
        if batch.tasks.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }

        let mut progress = match &self.bus {
            Some(bus) => ProgressTracker::with_bus(bus.clone()),
            None => ProgressTracker::new(),
        };
        let total = batch.tasks.len();
        progress.emit(REQUEST_SCOPE, Phase::Started, 0, format!("{total} task(s)"));

        checkpoint(cancel, &mut progress, Phase::Planning)?;
        let sources: Vec<&str> = batch.tasks.iter().map(|t| t.source.as_str()).collect();
        progress.emit(REQUEST_SCOPE, Phase::Planning, 5, sources.join(", "));
        info!(question_category = %batch.question_category, tasks = total, "Orchestration started");

        let mut tasks = Vec::with_capacity(total);
        for (index, task) in batch.tasks.iter().enumerate() {
            let result = self
                .run_task(batch, task, index, total, cancel, &mut progress)
                .await?;
            tasks.push(result);
        }

        let completed = tasks.iter().filter(|t| t.is_completed()).count();
        if completed == 0 {
            let errors: Vec<String> = tasks
                .iter()
                .filter_map(|t| t.error.as_ref().map(|e| format!("{}: {}", t.source, e)))
                .collect();
            warn!(attempted = total, "No task completed");
            return Err(OrchestratorError::NoTasksCompleted {
                attempted: total,
                errors,
            });
        }

        let mut limitations = task_limitations(&tasks);

        checkpoint(cancel, &mut progress, Phase::Summarising)?;
        progress.emit(
            REQUEST_SCOPE,
            Phase::Summarising,
            72,
            format!("{completed} of {total} task(s) completed"),
        );

        let judgments: Vec<Judgment> = tasks.iter().filter_map(|t| t.judgment.clone()).collect();
        progress.emit(REQUEST_SCOPE, Phase::ConflictAnalysis, 75, "comparing judgments");
        let conflicts = self.resolver.resolve(&judgments);
        progress.emit(
            REQUEST_SCOPE,
            Phase::ConflictAnalysis,
            78,
            format!(
                "{} conflict(s), most severe: {}",
                conflicts.conflicts.len(),
                conflicts.max_severity
            ),
        );

        let used: BTreeSet<String> = batch.tasks.iter().map(|t| t.source.clone()).collect();
        let arbitration = self
            .arbitrate(batch, &conflicts, used, &mut limitations, cancel, &mut progress)
            .await?;

        let tie_breakers: Vec<Judgment> = arbitration
            .iter()
            .filter(|a| a.is_completed())
            .filter_map(|a| a.tie_breaker_judgment.clone())
            .collect();
        let reconciled = if tie_breakers.is_empty() {
            conflicts.reconciled.clone()
        } else {
            let mut all = judgments.clone();
            all.extend(tie_breakers);
            self.resolver.resolve(&all).reconciled
        };

        checkpoint(cancel, &mut progress, Phase::Narrative)?;
        progress.emit(REQUEST_SCOPE, Phase::Narrative, 85, "writing narrative");
        let narrative = self
            .narrate(batch, narrative, &tasks, &conflicts, &arbitration, &reconciled, &mut limitations, cancel, &mut progress)
            .await?;
        progress.emit(
            REQUEST_SCOPE,
            Phase::Narrative,
            88,
            format!("narrative by {}", narrative.served_by),
        );

        if completed < MIN_SOURCES_FOR_CONFIDENCE {
            limitations.push(format!(
                "Only {completed} source(s) completed; conclusions rest on limited evidence"
            ));
        }
        let completion = completed as f64 / total as f64;
        if completed < total {
            limitations.push(format!(
                "{completed} of {total} tasks completed; confidence scaled accordingly"
            ));
        }
        let confidence = (reconciled.confidence * completion).clamp(0.0, 1.0);

        progress.emit(REQUEST_SCOPE, Phase::Completed, 100, format!("confidence {confidence:.2}"));
        info!(
            completed,
            attempted = total,
            category = %reconciled.category,
            confidence,
            limitations = limitations.len(),
            "Orchestration completed"
        );

        Ok(FinalReport {
            question: batch.question.clone(),
            judgments,
            tasks,
            conflicts,
            arbitration,
            reconciled,
            narrative,
            confidence,
            limitations,
            progress_events: progress.into_events(),
        })
    }

    async fn run_task(
        &self,
        batch: &AnalysisBatch,
        task: &AnalysisTask,
        index: usize,
        total: usize,
        cancel: &CancellationToken,
        progress: &mut ProgressTracker,
    ) -> OrchestratorResult<TaskResult> {
        checkpoint(cancel, progress, Phase::Calculating)?;
        progress.emit(
            &task.source,
            Phase::Calculating,
            task_percent(index, total, 0.0),
            format!("calculating {}", task.source),
        );

        let Some(source) = self.catalog.get(&task.source) else {
            let error = format!("unknown source '{}'", task.source);
            warn!(source = %task.source, "Unknown analysis source");
            progress.emit(&task.source, Phase::TaskFailed, task_percent(index, total, 1.0), &error);
            return Ok(TaskResult::failed(task, error));
        };

        let (raw, judgment) = match source.judge(&batch.input).await {
            Ok(pair) => pair,
            Err(e) => {
                let error = format!("{e:#}");
                warn!(source = %task.source, error = %error, "Source calculation failed");
                progress.emit(&task.source, Phase::TaskFailed, task_percent(index, total, 1.0), &error);
                return Ok(TaskResult::failed(task, error));
            }
        };

        progress.emit(
            &task.source,
            Phase::Interpreting,
            task_percent(index, total, 1.0 / 3.0),
            format!("{} reads {}", task.source, judgment.category()),
        );
        let interpretation = self
            .interpret(batch, task, &judgment, &raw, index, total, cancel, progress)
            .await?;

        progress.emit(
            &task.source,
            Phase::TaskCompleted,
            task_percent(index, total, 1.0),
            format!("{} interpretation ({})", task.source, interpretation.level),
        );
        Ok(TaskResult::completed(task, judgment, raw, interpretation))
    }

    /// Primary route under T1, a distinct backup under T2, then a template.
    #[allow(clippy::too_many_arguments)]
    async fn interpret(
        &self,
        batch: &AnalysisBatch,
        task: &AnalysisTask,
        judgment: &Judgment,
        raw: &Value,
        index: usize,
        total: usize,
        cancel: &CancellationToken,
        progress: &mut ProgressTracker,
    ) -> OrchestratorResult<DegradedResponse<String>> {
        let timeouts = self.timeouts.for_task(task.runs_quick());
        let task_type = task.task_type();
        let request = interpretation_request(batch, task, judgment, raw);
        let mut warnings = Vec::new();

        let primary = bounded(
            cancel,
            Phase::Interpreting,
            timeouts.primary(),
            self.failover.call(task_type, &request),
        )
        .await?;
        match primary {
            Some(Ok(reply)) => return Ok(DegradedResponse::full(reply.text, &reply.provider)),
            Some(Err(e)) => {
                warn!(source = %task.source, error = %e, "Primary interpretation failed");
                warnings.push(format!("primary stage failed: {e}"));
            }
            None => {
                warn!(source = %task.source, timeout_ms = timeouts.primary_ms, "Primary interpretation timed out");
                warnings.push(format!("primary stage timed out after {} ms", timeouts.primary_ms));
            }
        }

        let candidates = self.failover.candidate_ids(task_type);
        let backup = candidates
            .iter()
            .find(|id| Some(*id) != candidates.first())
            .cloned();

        if let Some(backup) = backup {
            progress.emit(
                &task.source,
                Phase::Degraded,
                task_percent(index, total, 0.5),
                format!("switching to backup provider {backup}"),
            );
            let secondary = bounded(
                cancel,
                Phase::Degraded,
                timeouts.secondary(),
                self.failover.call_provider(&backup, task_type, &request),
            )
            .await?;
            match secondary {
                Some(Ok(reply)) => {
                    let text = format!(
                        "{}\n\n(Interpretation provided by backup model {}.)",
                        reply.text, reply.provider
                    );
                    return Ok(DegradedResponse::partial(text, &reply.provider, warnings));
                }
                Some(Err(e)) => {
                    warn!(source = %task.source, backup = %backup, error = %e, "Backup interpretation failed");
                    warnings.push(format!("backup provider {backup} failed: {e}"));
                }
                None => {
                    warn!(source = %task.source, backup = %backup, "Backup interpretation timed out");
                    warnings.push(format!(
                        "backup provider {backup} timed out after {} ms",
                        timeouts.secondary_ms
                    ));
                }
            }
        } else {
            warnings.push("no distinct backup provider available".to_string());
        }

        progress.emit(
            &task.source,
            Phase::Degraded,
            task_percent(index, total, 2.0 / 3.0),
            "using templated summary",
        );
        Ok(DegradedResponse::templated(template_summary(judgment), warnings))
    }

    /// One round: each major conflict, most severe first, gets at most one
    /// tie-breaker. Every chosen tie-breaker joins the used set.
    async fn arbitrate(
        &self,
        batch: &AnalysisBatch,
        conflicts: &ConflictAnalysis,
        mut used: BTreeSet<String>,
        limitations: &mut Vec<String>,
        cancel: &CancellationToken,
        progress: &mut ProgressTracker,
    ) -> OrchestratorResult<Vec<ArbitrationResult>> {
        let pending: Vec<_> = conflicts
            .arbitration_conflicts
            .iter()
            .filter(|c| self.arbitration.should_arbitrate(c.severity))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        checkpoint(cancel, progress, Phase::Arbitration)?;
        progress.emit(
            REQUEST_SCOPE,
            Phase::Arbitration,
            80,
            format!("{} conflict(s) to arbitrate", pending.len()),
        );

        let mut results = Vec::with_capacity(pending.len());
        for conflict in pending {
            checkpoint(cancel, progress, Phase::Arbitration)?;

            let mut request = match self.arbitration.request(conflict, &batch.question_category, &used) {
                Ok(request) => request,
                Err(e) => {
                    limitations.push(format!(
                        "Arbitration unavailable for {}: {e}",
                        conflict.pair_label()
                    ));
                    results.push(ArbitrationResult::failed(conflict, None, e.to_string()));
                    continue;
                }
            };
            used.insert(request.tie_breaker.clone());

            let outcome = match self.catalog.get(&request.tie_breaker) {
                None => {
                    let reason = format!("source '{}' is not available", request.tie_breaker);
                    self.arbitration.fail(&mut request, reason)
                }
                Some(source) => match source.judge(&batch.input).await {
                    Err(e) => self.arbitration.fail(&mut request, format!("{e:#}")),
                    Ok((raw, judgment)) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                progress.emit(REQUEST_SCOPE, Phase::Cancelled, progress.percent(), "cancelled");
                                return Err(OrchestratorError::Cancelled { phase: Phase::Arbitration });
                            }
                            result = self.arbitration.arbitrate(&mut request, judgment, &raw) => result,
                        }
                    }
                },
            };

            if !outcome.is_completed() {
                limitations.push(format!(
                    "Arbitration failed for {}: {}; the pre-arbitration reconciliation is kept",
                    conflict.pair_label(),
                    outcome.explanation
                ));
            }
            progress.emit(REQUEST_SCOPE, Phase::Arbitration, 80, outcome.summary());
            results.push(outcome);
        }
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    async fn narrate(
        &self,
        batch: &AnalysisBatch,
        narrative: &NarrativeTask,
        tasks: &[TaskResult],
        conflicts: &ConflictAnalysis,
        arbitration: &[ArbitrationResult],
        reconciled: &ReconciledJudgment,
        limitations: &mut Vec<String>,
        cancel: &CancellationToken,
        progress: &mut ProgressTracker,
    ) -> OrchestratorResult<NarrativeResult> {
        let request = narrative_request(batch, narrative, tasks, conflicts, arbitration, reconciled);
        let outcome = bounded(
            cancel,
            Phase::Narrative,
            self.timeouts.narrative(),
            self.verifier
                .call_with_verification(&narrative.task_type, &request),
        )
        .await?;

        let fallback = |reason: String, limitations: &mut Vec<String>| {
            limitations.push(format!("{reason}; a templated summary is shown instead"));
            NarrativeResult {
                text: template_narrative(tasks, conflicts, arbitration, reconciled),
                served_by: TEMPLATE_SERVER.to_string(),
                verification: None,
                level: DegradationLevel::Templated,
            }
        };

        let result = match outcome {
            Some(Ok(verified)) => NarrativeResult {
                text: verified.text,
                served_by: verified.served_by,
                verification: Some(verified.outcome),
                level: DegradationLevel::Full,
            },
            Some(Err(e)) => {
                warn!(error = %e, "Narrative providers exhausted");
                fallback(format!("Narrative providers unavailable ({e})"), limitations)
            }
            None => {
                warn!(timeout_ms = self.timeouts.narrative_ms, "Narrative timed out");
                fallback(
                    format!("Narrative timed out after {} ms", self.timeouts.narrative_ms),
                    limitations,
                )
            }
        };
        if result.level == DegradationLevel::Templated {
            progress.emit(REQUEST_SCOPE, Phase::Degraded, 86, "templated narrative");
        }
        Ok(result)
    }
}

/// Fail with `Cancelled` if the token fired; recorded as a progress event.
fn checkpoint(cancel: &CancellationToken, progress: &mut ProgressTracker, phase: Phase) -> OrchestratorResult<()> {
    if cancel.is_cancelled() {
        progress.emit(REQUEST_SCOPE, Phase::Cancelled, progress.percent(), format!("cancelled before {phase}"));
        warn!(phase = %phase, "Orchestration cancelled");
        return Err(OrchestratorError::Cancelled { phase });
    }
    Ok(())
}

/// Run `call` under `budget`, aborting on cancellation. `None` on timeout.
async fn bounded<T>(
    cancel: &CancellationToken,
    phase: Phase,
    budget: Duration,
    call: impl Future<Output = T>,
) -> OrchestratorResult<Option<T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled { phase }),
        outcome = tokio::time::timeout(budget, call) => Ok(outcome.ok()),
    }
}

fn task_limitations(tasks: &[TaskResult]) -> Vec<String> {
    let mut out = Vec::new();
    for task in tasks {
        if let Some(error) = &task.error {
            out.push(format!("{} failed: {}", task.source, error));
        }
        let Some(interpretation) = task.interpretation.as_ref().filter(|i| i.is_degraded()) else {
            continue;
        };
        if interpretation.level == DegradationLevel::Partial {
            out.push(format!(
                "{} interpretation came from backup provider {}",
                task.source, interpretation.served_by
            ));
        } else {
            out.push(format!("{} interpretation is a templated summary", task.source));
        }
    }
    out
}

fn describe(judgment: &Judgment) -> String {
    format!(
        "{} (score {:.2}, confidence {:.0}%)",
        judgment.category(),
        judgment.score(),
        judgment.confidence() * 100.0
    )
}

fn interpretation_request(batch: &AnalysisBatch, task: &AnalysisTask, judgment: &Judgment, raw: &Value) -> TextRequest {
    let raw_text = serde_json::to_string_pretty(raw).unwrap_or_else(|_| raw.to_string());
    let mut text = format!(
        "Question: {}\nSource: {}\nJudgment: {}\n",
        batch.question,
        task.source,
        describe(judgment)
    );
    if !judgment.rationale().is_empty() {
        text.push_str(&format!("Rationale: {}\n", judgment.rationale()));
    }
    text.push_str(&format!("Raw result:\n{raw_text}\n"));
    if let Some(instructions) = &task.instructions {
        text.push_str(&format!("\n{instructions}\n"));
    }
    TextRequest::prompt(text).with_system(
        "You interpret the result of one analysis source for the user's question. \
         Be concrete, balanced and brief.",
    )
}

fn narrative_request(
    batch: &AnalysisBatch,
    narrative: &NarrativeTask,
    tasks: &[TaskResult],
    conflicts: &ConflictAnalysis,
    arbitration: &[ArbitrationResult],
    reconciled: &ReconciledJudgment,
) -> TextRequest {
    let mut text = format!("Question: {}\n\nSource readings:\n", batch.question);
    for task in tasks.iter().filter(|t| t.is_completed()) {
        if let (Some(judgment), Some(interpretation)) = (&task.judgment, &task.interpretation) {
            text.push_str(&format!(
                "- {}: {}\n  {}\n",
                task.source,
                describe(judgment),
                interpretation.payload.replace('\n', "\n  ")
            ));
        }
    }
    text.push_str(&format!("\nConflict analysis:\n{}\n", conflicts.summary()));
    for result in arbitration {
        text.push_str(&format!("Arbitration: {}\n", result.summary()));
    }
    text.push_str(&format!(
        "\nReconciled outlook: {} (score {:.2}, confidence {:.2})\n",
        reconciled.category, reconciled.score, reconciled.confidence
    ));
    if let Some(instructions) = &narrative.instructions {
        text.push_str(&format!("\n{instructions}\n"));
    }
    TextRequest::prompt(text).with_system(
        "You write the final report that combines several analysis sources into one \
         answer. Acknowledge disagreements and keep the advice practical.",
    )
}

/// Minimal per-source summary built without any network call.
pub fn template_summary(judgment: &Judgment) -> String {
    let mut out = format!("{} reads {}.", judgment.source(), describe(judgment));
    if !judgment.rationale().is_empty() {
        out.push_str(&format!(" {}", judgment.rationale()));
    }
    if let Some(timing) = judgment.timing() {
        out.push_str(&format!(" Timing: {timing}."));
    }
    if let Some(advice) = judgment.advice() {
        out.push_str(&format!(" Advice: {advice}."));
    }
    out.push_str(" A detailed interpretation is unavailable right now; retry later for a full reading.");
    out
}

fn template_narrative(
    tasks: &[TaskResult],
    conflicts: &ConflictAnalysis,
    arbitration: &[ArbitrationResult],
    reconciled: &ReconciledJudgment,
) -> String {
    let mut out = format!(
        "Overall outlook: {} (score {:.2}, confidence {:.0}%).\n\nSources:\n",
        reconciled.category,
        reconciled.score,
        reconciled.confidence * 100.0
    );
    for task in tasks {
        match &task.judgment {
            Some(judgment) => out.push_str(&format!("- {}: {}\n", task.source, describe(judgment))),
            None => out.push_str(&format!("- {}: unavailable\n", task.source)),
        }
    }
    out.push('\n');
    out.push_str(&conflicts.summary());
    out.push('\n');
    for result in arbitration {
        out.push_str(&format!("{}\n", result.summary()));
    }
    if !reconciled.recommendations.is_empty() {
        out.push_str("\nNotes:\n");
        for note in &reconciled.recommendations {
            out.push_str(&format!("- {note}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{ArbitrationConfig, ArbitrationStatus};
    use crate::events::EventBus;
    use crate::judgment::Category;
    use crate::provider::ProviderError;
    use crate::registry::ProviderRegistry;
    use crate::retry::RetryingInvoker;
    use crate::router::{GlobalRouting, RoutingConfig, TaskRouter};
    use crate::sources::StaticSource;
    use crate::testing::{registry_with, ScriptedProvider};
    use serde_json::json;

    fn failover(registry: ProviderRegistry, primary: &str) -> Arc<FailoverRouter> {
        let registry = registry.shared();
        let config = RoutingConfig {
            global: GlobalRouting {
                primary_provider: primary.to_string(),
                fallback_order: Vec::new(),
                enable_dual_verification: false,
                max_retries: 1,
                ..GlobalRouting::default()
            },
            task_overrides: Default::default(),
        };
        let router = TaskRouter::with_config(config, registry.clone()).shared();
        Arc::new(FailoverRouter::new(registry, router, RetryingInvoker::default()))
    }

    fn source(name: &str, score: f64) -> StaticSource {
        StaticSource::new(
            name,
            json!({"score": score, "confidence": 0.8, "rationale": format!("{name} rationale")}),
        )
    }

    fn catalog(entries: &[(&str, f64)]) -> SourceCatalog {
        entries
            .iter()
            .fold(SourceCatalog::new(), |catalog, (name, score)| catalog.with(source(name, *score)))
    }

    fn batch(category: &str, sources: &[&str]) -> AnalysisBatch {
        AnalysisBatch {
            question: "Should I change jobs this year?".to_string(),
            question_category: category.to_string(),
            input: json!({"birth": "1990-01-01"}),
            tasks: sources.iter().map(|s| AnalysisTask::new(s)).collect(),
        }
    }

    fn fast_timeouts() -> StageTimeouts {
        StageTimeouts {
            primary_ms: 5_000,
            secondary_ms: 2_000,
            narrative_ms: 8_000,
        }
    }

    #[tokio::test]
    async fn test_full_run_with_agreeing_sources() {
        let p1 = ScriptedProvider::always("p1", "a careful reading");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1.clone())]), "p1"),
            catalog(&[("bazi", 0.75), ("ziwei", 0.7)]),
        );

        let report = orchestrator
            .run(&batch("career", &["bazi", "ziwei"]), &NarrativeTask::default())
            .await
            .unwrap();

        assert_eq!(report.completed_tasks(), 2);
        assert!(report.tasks.iter().all(|t| !t.interpretation.as_ref().unwrap().is_degraded()));
        assert!(!report.conflicts.has_conflict);
        assert!(report.arbitration.is_empty());
        assert_eq!(report.narrative.text, "a careful reading");
        assert_eq!(report.narrative.served_by, "p1");
        assert_eq!(report.narrative.verification, Some(VerificationOutcome::Skipped));
        assert_eq!(report.reconciled.category, Category::Favorable);
        assert!((report.confidence - report.reconciled.confidence).abs() < 1e-9);
        assert!(report.limitations.iter().any(|l| l.contains("Only 2 source(s)")));
        // two interpretations plus the narrative
        assert_eq!(p1.calls(), 3);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_complete() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let bus = EventBus::new().shared();
        let mut receiver = bus.subscribe();
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1)]), "p1"),
            catalog(&[("bazi", 0.5), ("ziwei", 0.55), ("qimen", 0.6)]),
        )
        .with_event_bus(bus);

        let report = orchestrator
            .run(&batch("career", &["bazi", "ziwei", "qimen"]), &NarrativeTask::default())
            .await
            .unwrap();

        let events = &report.progress_events;
        assert_eq!(events.first().unwrap().phase, Phase::Started);
        assert_eq!(events.last().unwrap().phase, Phase::Completed);
        assert_eq!(events.last().unwrap().percent, 100);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert!(events
            .iter()
            .any(|e| e.source_name == "qimen" && e.phase == Phase::TaskCompleted && e.percent == 70));

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.phase, Phase::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_moves_to_backup_provider() {
        let slow = ScriptedProvider::slow("slow", "too late", Duration::from_secs(60));
        let backup = ScriptedProvider::always("backup", "backup reading");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("slow", 0, slow), ("backup", 1, backup.clone())]), "slow"),
            catalog(&[("bazi", 0.8)]),
        )
        .with_timeouts(fast_timeouts());

        let report = orchestrator
            .run(&batch("career", &["bazi"]), &NarrativeTask::default())
            .await
            .unwrap();

        let interpretation = report.tasks[0].interpretation.as_ref().unwrap();
        assert_eq!(interpretation.level, DegradationLevel::Partial);
        assert_eq!(interpretation.served_by, "backup");
        assert!(interpretation.payload.contains("backup model backup"));
        assert!(interpretation.warnings[0].contains("timed out"));
        assert!(report
            .limitations
            .iter()
            .any(|l| l.contains("came from backup provider backup")));

        // the narrative walks the slow provider first and runs out of time
        assert_eq!(report.narrative.level, DegradationLevel::Templated);
        assert!(report.limitations.iter().any(|l| l.contains("Narrative timed out")));
        assert!(report
            .progress_events
            .iter()
            .any(|e| e.phase == Phase::Degraded && e.source_name == "bazi"));
    }

    #[tokio::test]
    async fn test_all_providers_down_yields_templates() {
        let down = ScriptedProvider::sequence(
            "down",
            vec![Err(ProviderError::from_status("down", 401, "bad key", None))],
        );
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("down", 0, down)]), "down"),
            SourceCatalog::new().with(StaticSource::new(
                "bazi",
                json!({"category": "favorable", "score": 0.7, "timing": "spring", "advice": "prepare"}),
            )),
        );

        let report = orchestrator
            .run(&batch("career", &["bazi"]), &NarrativeTask::default())
            .await
            .unwrap();

        let interpretation = report.tasks[0].interpretation.as_ref().unwrap();
        assert_eq!(interpretation.level, DegradationLevel::Templated);
        assert!(interpretation.payload.starts_with("bazi reads favorable"));
        assert!(interpretation.payload.contains("Timing: spring."));
        assert!(interpretation.payload.contains("retry later"));
        assert!(interpretation
            .warnings
            .iter()
            .any(|w| w.contains("no distinct backup")));

        assert_eq!(report.narrative.served_by, TEMPLATE_SERVER);
        assert!(report.narrative.text.starts_with("Overall outlook: favorable"));
        assert!(report
            .limitations
            .iter()
            .any(|l| l.contains("Narrative providers unavailable")));
    }

    #[tokio::test]
    async fn test_partial_batch_scales_confidence() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1)]), "p1"),
            catalog(&[("bazi", 0.7)]),
        );

        let report = orchestrator
            .run(&batch("career", &["bazi", "ghost"]), &NarrativeTask::default())
            .await
            .unwrap();

        assert_eq!(report.completed_tasks(), 1);
        assert_eq!(report.tasks[1].status, TaskStatus::Failed);
        assert!(report.tasks[1].error.as_ref().unwrap().contains("ghost"));
        assert!((report.confidence - report.reconciled.confidence * 0.5).abs() < 1e-9);
        assert!(report.limitations.iter().any(|l| l.contains("1 of 2 tasks completed")));
        assert!(report.limitations.iter().any(|l| l.starts_with("ghost failed")));
    }

    #[tokio::test]
    async fn test_zero_completed_tasks_is_an_error() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1.clone())]), "p1"),
            SourceCatalog::new(),
        );

        let err = orchestrator
            .run(&batch("career", &["ghost"]), &NarrativeTask::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoTasksCompleted { attempted: 1, .. }));
        assert_eq!(p1.calls(), 0);

        let err = orchestrator
            .run(&batch("career", &[]), &NarrativeTask::default())
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::EmptyBatch);
    }

    #[tokio::test]
    async fn test_major_conflict_is_arbitrated_by_unused_source() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1)]), "p1"),
            catalog(&[("bazi", 0.8), ("ziwei", 0.1), ("liuyao", 0.75)]),
        );

        let report = orchestrator
            .run(&batch("career", &["bazi", "ziwei"]), &NarrativeTask::default())
            .await
            .unwrap();

        assert!(report.conflicts.needs_arbitration);
        assert_eq!(report.arbitration.len(), 1);
        let arbitration = &report.arbitration[0];
        assert_eq!(arbitration.status, ArbitrationStatus::Completed);
        assert_eq!(arbitration.tie_breaker.as_deref(), Some("liuyao"));
        assert_eq!(arbitration.final_category, Some(Category::Favorable));
        assert!(arbitration.excluded.contains(&"bazi".to_string()));

        assert!(report.reconciled.weights.contains_key("liuyao"));
        assert!(!report.conflicts.reconciled.weights.contains_key("liuyao"));
        assert_eq!(report.tie_breaker_judgments().count(), 1);
        assert!(report
            .progress_events
            .iter()
            .any(|e| e.phase == Phase::Arbitration));
    }

    #[tokio::test]
    async fn test_missing_tie_breaker_keeps_pre_arbitration_answer() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let mut config = ArbitrationConfig::default();
        config
            .candidates
            .insert("career".to_string(), vec!["bazi".to_string(), "ziwei".to_string()]);
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1)]), "p1"),
            catalog(&[("bazi", 0.9), ("ziwei", 0.1)]),
        )
        .with_arbitration(ArbitrationSystem::new(config));

        let report = orchestrator
            .run(&batch("career", &["bazi", "ziwei"]), &NarrativeTask::default())
            .await
            .unwrap();

        assert_eq!(report.arbitration[0].status, ArbitrationStatus::Failed);
        assert_eq!(report.reconciled, report.conflicts.reconciled);
        assert!(report
            .limitations
            .iter()
            .any(|l| l.contains("Arbitration unavailable for bazi vs ziwei")));
    }

    #[tokio::test]
    async fn test_tie_breaker_calculation_failure_is_absorbed() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let mut config = ArbitrationConfig::default();
        config
            .candidates
            .insert("career".to_string(), vec!["broken".to_string()]);
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1)]), "p1"),
            catalog(&[("bazi", 0.9), ("ziwei", 0.1)])
                .with(StaticSource::new("broken", json!({"nothing": true}))),
        )
        .with_arbitration(ArbitrationSystem::new(config));

        let report = orchestrator
            .run(&batch("career", &["bazi", "ziwei"]), &NarrativeTask::default())
            .await
            .unwrap();

        assert_eq!(report.arbitration[0].status, ArbitrationStatus::Failed);
        assert_eq!(report.arbitration[0].tie_breaker.as_deref(), Some("broken"));
        assert!(report.limitations.iter().any(|l| l.contains("Arbitration failed")));
    }

    #[tokio::test]
    async fn test_cancelled_request_stops() {
        let p1 = ScriptedProvider::always("p1", "ok");
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("p1", 0, p1.clone())]), "p1"),
            catalog(&[("bazi", 0.7)]),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator
            .run_cancellable(&batch("career", &["bazi"]), &NarrativeTask::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::Cancelled { phase: Phase::Planning });
        assert_eq!(p1.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_call() {
        let slow = ScriptedProvider::slow("slow", "late", Duration::from_secs(30));
        let orchestrator = Orchestrator::new(
            failover(registry_with(&[("slow", 0, slow)]), "slow"),
            catalog(&[("bazi", 0.7)]),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = orchestrator
            .run_cancellable(&batch("career", &["bazi"]), &NarrativeTask::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::Cancelled { phase: Phase::Interpreting });
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_task_type_halves_the_primary_budget() {
        let timeouts = fast_timeouts();
        let run = |task: AnalysisTask| async move {
            let slow = ScriptedProvider::slow("slow", "measured reading", Duration::from_secs(3));
            let orchestrator = Orchestrator::new(
                failover(registry_with(&[("slow", 0, slow)]), "slow"),
                catalog(&[("bazi", 0.8)]),
            )
            .with_timeouts(timeouts);
            let mut batch = batch("career", &[]);
            batch.tasks.push(task);
            orchestrator.run(&batch, &NarrativeTask::default()).await.unwrap()
        };

        let report = run(AnalysisTask::new("bazi")).await;
        let interpretation = report.tasks[0].interpretation.as_ref().unwrap();
        assert_eq!(interpretation.level, DegradationLevel::Full);

        let mut task = AnalysisTask::new("bazi");
        task.task_type = Some("simple_qa".to_string());
        assert!(task.runs_quick());
        let report = run(task).await;
        let interpretation = report.tasks[0].interpretation.as_ref().unwrap();
        assert_eq!(interpretation.level, DegradationLevel::Templated);
        assert!(interpretation.warnings[0].contains("2500 ms"));
    }

    #[test]
    fn test_task_type_defaults() {
        assert_eq!(AnalysisTask::new("bazi").task_type(), "single_interpretation");
        assert_eq!(AnalysisTask::new("bazi").quick().task_type(), "quick_interpretation");
        assert!(AnalysisTask::new("bazi").quick().runs_quick());
        assert!(!AnalysisTask::new("bazi").runs_quick());

        let batch: AnalysisBatch = serde_json::from_value(json!({
            "question": "q",
            "tasks": [{"source": "bazi", "task_type": "follow_up"}]
        }))
        .unwrap();
        assert_eq!(batch.question_category, "other");
        assert_eq!(batch.tasks[0].task_type(), "follow_up");
        assert_eq!(NarrativeTask::default().task_type, "comprehensive_report");
    }
}
