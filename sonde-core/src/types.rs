//! Core type definitions for the sonde research engine.
//!
//! Defines the data structures that flow through the pipeline and the
//! refinement loop: tasks and their section plans, search results,
//! per-section syntheses, drafts, critiques, and the final report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::EvidenceSnapshot;

/// A single research request. The section plan is fixed at creation;
/// later phases read it but never rewrite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: Uuid,
    pub topic: String,
    pub plan: Vec<Section>,
    pub created_at: DateTime<Utc>,
}

impl ResearchTask {
    pub fn new(topic: impl Into<String>, plan: Vec<Section>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            plan,
            created_at: Utc::now(),
        }
    }

    /// Position of a section in the plan, if present.
    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.plan.iter().position(|s| s.name == name)
    }
}

/// One planned section of the eventual report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub description: String,
}

impl Section {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A source reference attached to a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
}

impl SourceRef {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }
}

/// The stored outcome of one executed search query. Read-only once
/// stored; the raw content is what the report assembler later mines for
/// detail that per-section summaries inevitably drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub goal: String,
    /// 1 (lowest) to 5 (highest). Drives truncation order during
    /// report assembly: lower priority detail is dropped first.
    pub priority: u8,
    pub content: String,
    pub sources: Vec<SourceRef>,
}

/// How well a section is supported by the evidence gathered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    Covered,
    Partial,
    Missing,
}

impl std::fmt::Display for Coverage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Coverage::Covered => write!(f, "covered"),
            Coverage::Partial => write!(f, "partial"),
            Coverage::Missing => write!(f, "missing"),
        }
    }
}

/// The synthesized state of one section. Text is overwritten as rounds
/// add information; the claims extracted from it accumulate in the
/// evidence index and are never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSynthesis {
    pub section: String,
    pub text: String,
    pub coverage: Coverage,
    /// 0.0 to 1.0, the synthesis step's own estimate of source support.
    pub evidence_quality: f32,
    pub gaps: Vec<String>,
}

/// Aggregated cross-section observations, recomputed at assembly time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SynthesisMetadata {
    pub section_coverage: Vec<SectionCoverage>,
    pub evidence_quality: f32,
    pub knowledge_gaps: Vec<String>,
    pub cross_domain_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionCoverage {
    pub section: String,
    pub coverage: Coverage,
}

/// Accumulated working state of a research task across pipeline rounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchState {
    pub results: Vec<SearchResult>,
    pub syntheses: Vec<SectionSynthesis>,
    /// Set when any query or section in any round failed and was
    /// skipped. The task still completes; the flag surfaces in the
    /// report metadata.
    pub degraded: bool,
    pub rounds_completed: usize,
}

impl ResearchState {
    pub fn synthesis_for(&self, section: &str) -> Option<&SectionSynthesis> {
        self.syntheses.iter().find(|s| s.section == section)
    }

    /// Replace the synthesis for a section, or append it if the section
    /// has none yet. One entry per section, always.
    pub fn upsert_synthesis(&mut self, synthesis: SectionSynthesis) {
        match self
            .syntheses
            .iter_mut()
            .find(|s| s.section == synthesis.section)
        {
            Some(slot) => *slot = synthesis,
            None => self.syntheses.push(synthesis),
        }
    }
}

/// An immutable snapshot of the report at one point in the refinement
/// loop. Every refinement step produces a new draft, so the iteration
/// history can be replayed or diffed after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub content: String,
    /// 0.0 to 1.0.
    pub confidence: f32,
    pub metadata: SynthesisMetadata,
}

impl Draft {
    pub fn new(content: impl Into<String>, confidence: f32, metadata: SynthesisMetadata) -> Self {
        Self {
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata,
        }
    }
}

/// Categories a critique pass can assign to an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueKind {
    Accuracy,
    Completeness,
    Clarity,
    Consistency,
    Citation,
}

/// One issue raised against a draft. Lives only for the iteration that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub issue_type: CritiqueKind,
    pub description: String,
    /// 0.0 to 1.0; issues at 0.5 or below are ignored.
    pub severity: f32,
}

/// Token counts accumulated across LLM calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why the refinement loop stopped. Exactly one of these is assigned
/// per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Converged,
    Oscillating,
    BudgetExhausted,
    QualityAchieved,
    MaxIterations,
    Canceled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Converged => write!(f, "converged"),
            TerminationReason::Oscillating => write!(f, "oscillating"),
            TerminationReason::BudgetExhausted => write!(f, "budget_exhausted"),
            TerminationReason::QualityAchieved => write!(f, "quality_achieved"),
            TerminationReason::MaxIterations => write!(f, "max_iterations"),
            TerminationReason::Canceled => write!(f, "canceled"),
        }
    }
}

/// The engine's final output: report text, the citation snapshot backing
/// it, assembly metadata, and the reason refinement stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub content: String,
    pub citations: EvidenceSnapshot,
    pub metadata: SynthesisMetadata,
    pub termination_reason: TerminationReason,
    pub usage: TokenUsage,
}
