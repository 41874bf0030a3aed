//! The bounded refinement loop: pick one strategy, iterate it over the
//! draft, stop on the first terminal condition.
//!
//! ```text
//! Draft --> [select strategy] --> iterate --> converged / oscillating /
//!              |                     ^        budget / quality / cap
//!        confidence + budget         |
//!                                refined draft
//! ```
//!
//! Strategies are a closed set. Each one maps a draft to a refined draft
//! and never fails: an unusable model response leaves the input draft
//! unchanged, so a bad iteration costs budget but not quality.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::budget::BudgetManager;
use crate::config::RefinementConfig;
use crate::convergence::ConvergenceDetector;
use crate::llm::LlmGateway;
use crate::progress::{Phase, ProgressEmitter};
use crate::types::{Draft, ResearchTask, TerminationReason};

pub mod consistency;
pub mod critique;
pub mod crossval;
pub mod multipass;

pub use critique::is_improvement;
pub use crossval::anchor_index;

pub(crate) use crate::prompt::{clip_for_prompt, extract_json};

/// Retry bound for LLM calls made inside a refinement strategy. One
/// retry at most; a failed call degrades the step instead of stalling
/// the loop on backoff.
pub(crate) const STRATEGY_MAX_RETRIES: u32 = 1;

/// The four refinement strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Critique the draft, then revise against the kept critiques.
    CritiqueAndRevise,
    /// Fixed rewrite passes over completeness, consistency, clarity.
    MultiPass,
    /// Generate candidates at rising temperature and reconcile around
    /// the most mutually consistent one.
    CrossValidation,
    /// Check for contradictions and coverage holes, revise if found.
    ConsistencyCheck,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::CritiqueAndRevise => "critique_and_revise",
            StrategyKind::MultiPass => "multi_pass",
            StrategyKind::CrossValidation => "cross_validation",
            StrategyKind::ConsistencyCheck => "consistency_check",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a strategy from the draft's confidence and the remaining budget
/// fraction. High-confidence drafts only need a consistency pass; a
/// roomy budget affords cross-validation; otherwise critique-and-revise
/// is the cheap default. MultiPass is never auto-selected, only forced.
pub fn select_strategy(confidence: f32, remaining_ratio: f32) -> StrategyKind {
    if confidence > 0.8 {
        StrategyKind::ConsistencyCheck
    } else if remaining_ratio > 0.5 {
        StrategyKind::CrossValidation
    } else {
        StrategyKind::CritiqueAndRevise
    }
}

/// Record of one refinement run. Exactly one terminal status, and the
/// history holds one draft per executed iteration.
#[derive(Debug, Clone)]
pub struct RefinementSession {
    pub strategy: StrategyKind,
    pub iteration_history: Vec<Draft>,
    pub terminal_status: TerminationReason,
}

/// Final draft plus the session that produced it.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub draft: Draft,
    pub session: RefinementSession,
}

/// Drives refinement iterations until a terminal condition fires.
pub struct RefinementOrchestrator {
    llm: Arc<dyn LlmGateway>,
    config: RefinementConfig,
}

impl RefinementOrchestrator {
    pub fn new(llm: Arc<dyn LlmGateway>, config: RefinementConfig) -> Self {
        Self { llm, config }
    }

    /// Refine `initial` until a stop condition fires. Stop conditions are
    /// checked before every iteration, in precedence order: exhausted
    /// wall-clock or token budget, then convergence, then oscillation,
    /// then the quality target, then the iteration cap.
    pub async fn refine(
        &self,
        task: &ResearchTask,
        initial: Draft,
        budget: &BudgetManager,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> RefinementOutcome {
        let strategy = self
            .config
            .forced_strategy
            .unwrap_or_else(|| select_strategy(initial.confidence, budget.remaining_ratio()));
        debug!(strategy = strategy.as_str(), confidence = initial.confidence,
            "Starting refinement");

        let mut detector = ConvergenceDetector::from_config(&self.config);
        detector.add_iteration(&initial.content);

        let mut draft = initial;
        let mut history: Vec<Draft> = Vec::new();

        let terminal = loop {
            if cancel.is_cancelled() {
                break TerminationReason::Canceled;
            }
            if let Some(reason) = self.stop_reason(&detector, draft.confidence, budget, history.len())
            {
                break reason;
            }

            let span = emitter.phase_span(
                Phase::Refine,
                json!({"iteration": history.len() + 1, "strategy": strategy.as_str()}),
            );
            budget.record_iteration();
            let refined = self.run_strategy(strategy, task, &draft, budget).await;
            detector.add_iteration(&refined.content);
            history.push(refined.clone());
            span.end(json!({
                "confidence": refined.confidence,
                "similarity": detector.latest_similarity(),
            }));
            draft = refined;
        };

        debug!(terminal = %terminal, iterations = history.len(), "Refinement finished");
        RefinementOutcome {
            draft,
            session: RefinementSession {
                strategy,
                iteration_history: history,
                terminal_status: terminal,
            },
        }
    }

    fn stop_reason(
        &self,
        detector: &ConvergenceDetector,
        confidence: f32,
        budget: &BudgetManager,
        iterations_done: usize,
    ) -> Option<TerminationReason> {
        if budget.resources_exhausted() {
            Some(TerminationReason::BudgetExhausted)
        } else if detector.is_converged() {
            Some(TerminationReason::Converged)
        } else if detector.is_oscillating() {
            Some(TerminationReason::Oscillating)
        } else if confidence > self.config.quality_target {
            Some(TerminationReason::QualityAchieved)
        } else if iterations_done >= self.iteration_cap(budget) {
            Some(TerminationReason::MaxIterations)
        } else {
            None
        }
    }

    /// Iteration cap: the configured maximum, tightened by the budget's
    /// own iteration limit when one is set.
    fn iteration_cap(&self, budget: &BudgetManager) -> usize {
        let budget_cap = budget.budget().max_iterations;
        if budget_cap == 0 {
            self.config.max_iterations
        } else {
            self.config.max_iterations.min(budget_cap)
        }
    }

    async fn run_strategy(
        &self,
        kind: StrategyKind,
        task: &ResearchTask,
        draft: &Draft,
        budget: &BudgetManager,
    ) -> Draft {
        let llm = self.llm.as_ref();
        match kind {
            StrategyKind::CritiqueAndRevise => {
                critique::critique_and_revise(llm, task, draft, budget).await
            }
            StrategyKind::MultiPass => multipass::multi_pass(llm, task, draft, budget).await,
            StrategyKind::CrossValidation => {
                crossval::cross_validate(
                    llm,
                    task,
                    draft,
                    self.config.cross_validation_candidates,
                    budget,
                )
                .await
            }
            StrategyKind::ConsistencyCheck => {
                consistency::consistency_check(llm, task, draft, budget).await
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRevision {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse a revised draft from a model response. Responses carry the new
/// text and optionally a confidence; a missing confidence keeps the
/// caller's fallback value.
pub(crate) fn parse_revision(response: &str, fallback_confidence: f32) -> Option<(String, f32)> {
    let parsed: RawRevision = serde_json::from_str(extract_json(response)?).ok()?;
    let text = parsed.text.trim();
    if text.is_empty() {
        return None;
    }
    Some((
        text.to_string(),
        parsed
            .confidence
            .unwrap_or(fallback_confidence)
            .clamp(0.0, 1.0),
    ))
}
