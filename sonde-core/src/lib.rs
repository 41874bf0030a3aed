//! # Sonde Core
//!
//! Core library for the Sonde research engine.
//! Provides the research pipeline (planning, query generation, search,
//! synthesis), the refinement orchestrator with its strategies, budget
//! tracking, evidence indexing, configuration, and fundamental types.

pub mod budget;
pub mod config;
pub mod convergence;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod llm;
pub mod pipeline;
pub mod progress;
pub mod refine;
pub mod report;
pub mod search;
pub mod session;
pub mod types;

mod prompt;

// Re-export commonly used types at the crate root.
pub use budget::{Budget, BudgetManager};
pub use config::{EngineConfig, load_config};
pub use convergence::ConvergenceDetector;
pub use engine::ResearchEngine;
pub use error::{EngineError, LlmError, Result, SearchError, SessionError};
pub use evidence::{EvidenceIndex, EvidenceSnapshot, SourceId};
pub use llm::{GenerationRequest, GenerationResponse, LlmGateway, MockLlm, OpenAiCompatGateway};
pub use pipeline::{PipelineOutcome, ResearchPipeline};
pub use progress::{
    ChannelSink, NoOpSink, Phase, ProgressEmitter, ProgressEvent, ProgressSink, Status,
};
pub use refine::{RefinementOrchestrator, RefinementOutcome, RefinementSession, StrategyKind};
pub use report::render_markdown;
pub use search::{DuckDuckGoSearch, MockSearch, SearchGateway, SearchHit};
pub use session::{ResearchSession, SessionPhase, SessionSummary};
pub use types::{
    Coverage, Critique, CritiqueKind, Draft, FinalReport, ResearchState, ResearchTask,
    SearchResult, Section, SectionSynthesis, SourceRef, SynthesisMetadata, TerminationReason,
    TokenUsage,
};
