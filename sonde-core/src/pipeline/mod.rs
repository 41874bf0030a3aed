//! The research loop: rounds of query generation, parallel search,
//! classification, and section synthesis, reviewed after each round.
//!
//! The loop never fails the whole run. Individual searches and section
//! syntheses may drop out (marking the state degraded); the loop keeps
//! whatever survived and the assembler builds a draft from it. Rounds end
//! early on cancellation, budget exhaustion, or a reviewer stop verdict,
//! and always at the round cap.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::BudgetManager;
use crate::config::{PipelineConfig, SearchConfig};
use crate::error::{LlmError, SearchError};
use crate::evidence::{EvidenceIndex, SourceId};
use crate::llm::LlmGateway;
use crate::progress::{Phase, PhaseSpan, ProgressEmitter};
use crate::report::ReportAssembler;
use crate::search::{SearchGateway, SearchHit};
use crate::types::{Draft, ResearchState, ResearchTask, SearchResult};

pub mod classify;
pub mod plan;
pub mod queries;
pub mod review;
pub mod synthesis;

pub use plan::build_plan;
pub use queries::QuerySpec;
pub use review::ReviewDecision;
pub use synthesis::{ClaimEvidence, SectionOutcome};

use classify::classify_results;
use queries::generate_queries;
use review::review_progress;
use synthesis::synthesize_section;

pub(crate) use crate::prompt::{clip_for_prompt, extract_json};

/// Output of a pipeline run: the assembled draft plus the state that
/// produced it, kept for refinement and reporting.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub draft: Draft,
    pub state: ResearchState,
}

/// Runs research rounds against an LLM gateway and a search gateway.
pub struct ResearchPipeline {
    llm: Arc<dyn LlmGateway>,
    search: Arc<dyn SearchGateway>,
    pipeline_config: PipelineConfig,
    search_config: SearchConfig,
    max_retries: u32,
}

impl ResearchPipeline {
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        search: Arc<dyn SearchGateway>,
        pipeline_config: PipelineConfig,
        search_config: SearchConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            llm,
            search,
            pipeline_config,
            search_config,
            max_retries,
        }
    }

    /// Run up to `max_rounds` research rounds and assemble a draft from
    /// whatever state they produced. Infallible: failed searches and
    /// syntheses degrade the state instead of aborting it.
    pub async fn run(
        &self,
        task: &ResearchTask,
        assembler: &ReportAssembler,
        budget: &BudgetManager,
        evidence: &EvidenceIndex,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut state = ResearchState::default();

        for round in 0..self.pipeline_config.max_rounds {
            if cancel.is_cancelled() {
                debug!(round, "Research canceled at round boundary");
                break;
            }
            if budget.resources_exhausted() {
                warn!(round, "Budget exhausted, stopping research rounds");
                break;
            }

            let span = emitter.phase_span(Phase::Query, json!({"round": round + 1}));
            let specs = generate_queries(
                self.llm.as_ref(),
                task,
                &state,
                &self.pipeline_config,
                self.max_retries,
                budget,
            )
            .await;
            span.end(json!({"count": specs.len()}));

            if specs.is_empty() {
                debug!(round, "No queries to run, stopping research rounds");
                break;
            }

            let span = emitter.phase_span(Phase::Search, json!({"queries": specs.len()}));
            let (round_results, failed) = self.execute_searches(specs, &span).await;
            if failed > 0 {
                state.degraded = true;
            }
            span.end(json!({"results": round_results.len(), "failed": failed}));

            let start_idx = state.results.len();
            state.results.extend(round_results);
            let round_results = &state.results[start_idx..];

            let span = emitter.phase_span(
                Phase::Synthesize,
                json!({"results": round_results.len(), "sections": task.plan.len()}),
            );
            let buckets = classify_results(
                self.llm.as_ref(),
                task,
                round_results,
                self.max_retries,
                budget,
            )
            .await;
            let outcomes = self
                .synthesize_sections(task, &state, round_results, &buckets, budget)
                .await;

            let mut synthesized = 0usize;
            for (section_name, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => {
                        for claim in &outcome.claims {
                            let ids: Vec<SourceId> = claim
                                .sources
                                .iter()
                                .map(|source| evidence.register_source(source))
                                .collect();
                            evidence.record(&claim.claim, &ids);
                        }
                        state.upsert_synthesis(outcome.synthesis);
                        synthesized += 1;
                    }
                    Err(e) => {
                        warn!(section = section_name.as_str(), error = %e,
                            "Skipping section synthesis for this round");
                        state.degraded = true;
                    }
                }
            }
            span.end(json!({"synthesized": synthesized}));

            state.rounds_completed += 1;

            let span = emitter.phase_span(Phase::Review, json!({"round": round + 1}));
            let decision =
                review_progress(self.llm.as_ref(), task, &state, self.max_retries, budget).await;
            span.end(json!({
                "continue": decision.continue_research,
                "rationale": decision.rationale,
            }));
            if !decision.continue_research {
                break;
            }
        }

        let draft = assembler.build(task, &state);
        PipelineOutcome { draft, state }
    }

    /// Fan queries out to the search gateway, bounded by a semaphore and a
    /// per-query timeout. Returns surviving results and the failure count.
    async fn execute_searches(
        &self,
        specs: Vec<QuerySpec>,
        span: &PhaseSpan<'_>,
    ) -> (Vec<SearchResult>, usize) {
        let semaphore = Arc::new(Semaphore::new(
            self.pipeline_config.max_parallel_searches.max(1),
        ));
        let timeout = Duration::from_secs(self.search_config.timeout_secs);
        let max_results = self.search_config.max_results;

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let semaphore = Arc::clone(&semaphore);
            let search = Arc::clone(&self.search);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                let outcome =
                    match tokio::time::timeout(timeout, search.search(&spec.query, max_results))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(SearchError::Timeout {
                            timeout_secs: timeout.as_secs(),
                        }),
                    };
                (spec, outcome)
            }));
        }

        let mut results = Vec::new();
        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok((spec, Ok(hits))) => {
                    span.progress(json!({"query": spec.query, "hits": hits.len()}));
                    results.push(result_from_hits(spec, hits));
                }
                Ok((spec, Err(e))) => {
                    warn!(query = spec.query.as_str(), error = %e,
                        "Search failed, continuing round without it");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Search task aborted");
                    failed += 1;
                }
            }
        }
        (results, failed)
    }

    /// Synthesize every section that received results this round, a few at
    /// a time. Results come back in plan order as (section name, outcome).
    async fn synthesize_sections(
        &self,
        task: &ResearchTask,
        state: &ResearchState,
        round_results: &[SearchResult],
        buckets: &[Vec<usize>],
        budget: &BudgetManager,
    ) -> Vec<(String, Result<SectionOutcome, LlmError>)> {
        let semaphore = Semaphore::new(self.pipeline_config.max_parallel_section_synthesis.max(1));
        let semaphore = &semaphore;

        let jobs = task.plan.iter().enumerate().filter_map(|(idx, section)| {
            let indexes = buckets.get(idx)?;
            if indexes.is_empty() {
                return None;
            }
            let selected: Vec<&SearchResult> = indexes
                .iter()
                .filter_map(|&i| round_results.get(i))
                .collect();
            Some(async move {
                let _permit = semaphore.acquire().await.unwrap();
                let outcome = synthesize_section(
                    self.llm.as_ref(),
                    &task.topic,
                    section,
                    state.synthesis_for(&section.name),
                    &selected,
                    self.max_retries,
                    budget,
                )
                .await;
                (section.name.clone(), outcome)
            })
        });

        futures::future::join_all(jobs).await
    }
}

/// Fold a query's hits into one search result: hit lines become the
/// content, hit URLs become the sources.
fn result_from_hits(spec: QuerySpec, hits: Vec<SearchHit>) -> SearchResult {
    let content = hits
        .iter()
        .map(|hit| format!("{}: {}", hit.title, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    let sources = hits.iter().map(SearchHit::source_ref).collect();
    SearchResult {
        query: spec.query,
        goal: spec.goal,
        priority: spec.priority,
        content,
        sources,
    }
}
