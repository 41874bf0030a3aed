//! Engine facade: plan, research, refine, finalize.
//!
//! `ResearchEngine` wires the pipeline, the refinement orchestrator, and
//! the shared budget and evidence state together for one task at a time.
//! It owns the cancellation token and the progress emitter; callers hold
//! a token clone to stop a running task and a progress stream to watch
//! it. Budget exhaustion and failed convergence are reported on the
//! final report, not as errors.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{Budget, BudgetManager};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, SessionError};
use crate::evidence::EvidenceIndex;
use crate::llm::LlmGateway;
use crate::pipeline::{ResearchPipeline, build_plan};
use crate::progress::{NoOpSink, Phase, ProgressEmitter, ProgressSink};
use crate::refine::RefinementOrchestrator;
use crate::report::ReportAssembler;
use crate::search::SearchGateway;
use crate::session::{ResearchSession, SessionPhase, SessionSummary, sessions_dir};
use crate::types::{FinalReport, ResearchTask};

pub struct ResearchEngine {
    config: EngineConfig,
    llm: Arc<dyn LlmGateway>,
    search: Arc<dyn SearchGateway>,
    emitter: ProgressEmitter,
    cancel: CancellationToken,
}

impl ResearchEngine {
    pub fn new(
        config: EngineConfig,
        llm: Arc<dyn LlmGateway>,
        search: Arc<dyn SearchGateway>,
    ) -> Self {
        Self::with_progress_sink(config, llm, search, Arc::new(NoOpSink))
    }

    /// Build an engine that reports progress events to `sink`.
    pub fn with_progress_sink(
        config: EngineConfig,
        llm: Arc<dyn LlmGateway>,
        search: Arc<dyn SearchGateway>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            llm,
            search,
            emitter: ProgressEmitter::new(sink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that stops the running task when cancelled. Cancellation is
    /// observed at round and iteration boundaries; the engine still
    /// returns its last assembled draft.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Research `topic` end to end and return the final report.
    pub async fn run(&self, topic: &str) -> Result<FinalReport> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(EngineError::InvalidInput {
                reason: "research topic is empty".to_string(),
            });
        }

        info!(topic, "Starting research task");
        let budget = BudgetManager::new(Budget::from_config(
            &self.config.budget,
            self.config.refinement.max_iterations,
        ));
        let evidence = EvidenceIndex::new();
        let mut session = self
            .config
            .session
            .enabled
            .then(|| ResearchSession::new(topic));

        let span = self.emitter.phase_span(Phase::Plan, json!({"topic": topic}));
        let plan = build_plan(
            self.llm.as_ref(),
            topic,
            self.config.llm.max_retries,
            &budget,
        )
        .await;
        span.end(json!({"sections": plan.len()}));
        let task = ResearchTask::new(topic, plan);

        if let Some(session) = session.as_mut() {
            session.set_plan(task.plan.clone());
            session.transition(SessionPhase::Researching);
        }

        let assembler = ReportAssembler::new(&self.config.report);
        let pipeline = ResearchPipeline::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.search),
            self.config.pipeline.clone(),
            self.config.search.clone(),
            self.config.llm.max_retries,
        );
        let outcome = pipeline
            .run(
                &task,
                &assembler,
                &budget,
                &evidence,
                &self.emitter,
                &self.cancel,
            )
            .await;

        if let Some(session) = session.as_mut() {
            session.rounds_completed = outcome.state.rounds_completed;
            session.degraded = outcome.state.degraded;
            session.transition(SessionPhase::Refining);
        }

        let orchestrator =
            RefinementOrchestrator::new(Arc::clone(&self.llm), self.config.refinement.clone());
        let refined = orchestrator
            .refine(&task, outcome.draft, &budget, &self.emitter, &self.cancel)
            .await;

        let span = self.emitter.phase_span(
            Phase::Finalize,
            json!({"termination": refined.session.terminal_status.to_string()}),
        );
        let report = FinalReport {
            content: refined.draft.content.clone(),
            citations: evidence.snapshot(),
            metadata: refined.draft.metadata.clone(),
            termination_reason: refined.session.terminal_status,
            usage: budget.usage(),
        };
        span.end(json!({
            "chars": report.content.len(),
            "citations": report.citations.entries.len(),
            "tokens": report.usage.total(),
        }));

        if let Some(mut session) = session {
            session.complete(report.clone());
            self.persist(&session).await;
        }

        info!(
            termination = %report.termination_reason,
            tokens = report.usage.total(),
            "Research task finished"
        );
        Ok(report)
    }

    /// Summaries of persisted sessions, newest first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        match sessions_dir(&self.config.session) {
            Some(dir) => ResearchSession::list_sessions(&dir).await,
            None => Vec::new(),
        }
    }

    /// Load a persisted session by id.
    pub async fn load_session(&self, id: &Uuid) -> Result<ResearchSession> {
        let dir = sessions_dir(&self.config.session).ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        Ok(ResearchSession::load(&dir, id).await?)
    }

    async fn persist(&self, session: &ResearchSession) {
        let Some(dir) = sessions_dir(&self.config.session) else {
            debug!("No sessions directory available, skipping persistence");
            return;
        };
        if let Err(e) = session.save(&dir).await {
            warn!(error = %e, "Failed to persist research session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::search::MockSearch;
    use crate::types::TerminationReason;

    fn make_engine(config: EngineConfig) -> ResearchEngine {
        ResearchEngine::new(
            config,
            Arc::new(MockLlm::new()),
            Arc::new(MockSearch::new()),
        )
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.pipeline.max_rounds = 1;
        config.session.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let engine = make_engine(test_config());
        let err = engine.run("   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_unscripted_run_produces_report() {
        // Every model call falls back deterministically; the run still
        // ends with a structured report and a terminal reason.
        let engine = make_engine(test_config());

        let report = engine.run("container networking basics").await.unwrap();

        assert!(report.content.starts_with("# Research Report:"));
        assert!(report.usage.total() > 0);
        assert!(report.citations.entries.is_empty());
        assert_eq!(report.termination_reason, TerminationReason::Converged);
    }

    #[tokio::test]
    async fn test_cancel_before_run_reports_canceled() {
        let engine = make_engine(test_config());
        engine.cancel();

        let report = engine.run("anything").await.unwrap();
        assert_eq!(report.termination_reason, TerminationReason::Canceled);
    }

    #[tokio::test]
    async fn test_completed_run_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.session.enabled = true;
        config.session.dir = Some(dir.path().to_path_buf());
        let engine = make_engine(config);

        engine.run("session persistence").await.unwrap();

        let sessions = engine.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].topic, "session persistence");

        let loaded = engine.load_session(&sessions[0].id).await.unwrap();
        assert_eq!(loaded.phase, SessionPhase::Complete);
        assert!(loaded.report.is_some());
    }
}
