//! Per-section synthesis of classified search results.
//!
//! Each section gets one model call that folds new findings into the
//! existing section text and names the claims worth citing. The model's
//! claim list references a numbered source list built from the section's
//! results; indexes that point nowhere are dropped. An unparsable
//! response is re-requested once; after that a deterministic
//! excerpt-based synthesis keeps the round's findings.

use serde::Deserialize;
use tracing::debug;

use super::extract_json;
use crate::budget::BudgetManager;
use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{Coverage, SearchResult, Section, SectionSynthesis, SourceRef};

/// Cap on the numbered source list offered to the model per section.
const MAX_SECTION_SOURCES: usize = 10;

/// Synthesis plus the claims it wants recorded as evidence.
#[derive(Debug, Clone)]
pub struct SectionOutcome {
    pub synthesis: SectionSynthesis,
    pub claims: Vec<ClaimEvidence>,
}

/// One claim with the sources that support it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEvidence {
    pub claim: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Deserialize)]
struct RawSynthesis {
    text: String,
    #[serde(default)]
    coverage: Option<String>,
    #[serde(default)]
    evidence_quality: Option<f32>,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default)]
    claims: Vec<RawClaim>,
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    claim: String,
    #[serde(default)]
    sources: Vec<usize>,
}

/// Synthesize one section from its classified results.
///
/// Model errors are returned to the caller, which degrades the round and
/// keeps the prior synthesis. Parse failures degrade to an excerpt-based
/// outcome instead.
pub async fn synthesize_section(
    llm: &dyn LlmGateway,
    topic: &str,
    section: &Section,
    existing: Option<&SectionSynthesis>,
    results: &[&SearchResult],
    max_retries: u32,
    budget: &BudgetManager,
) -> Result<SectionOutcome, LlmError> {
    let sources = collect_sources(results);
    let request = GenerationRequest::new(
        "You synthesize research findings into report sections. Respond with JSON only.",
        build_synthesis_prompt(topic, section, existing, results, &sources),
    );

    let parsed = generate_parsed(llm, request, max_retries, budget, |text| {
        parse_synthesis(text, &section.name, &sources)
    })
    .await?;

    match parsed {
        Some(outcome) => Ok(outcome),
        None => {
            debug!(section = section.name.as_str(), "Synthesis response unparsable, using excerpts");
            Ok(fallback_outcome(section, results))
        }
    }
}

/// Deduplicate result sources by URL, preserving order, capped.
pub fn collect_sources(results: &[&SearchResult]) -> Vec<SourceRef> {
    let mut sources: Vec<SourceRef> = Vec::new();
    for result in results {
        for source in &result.sources {
            if sources.len() >= MAX_SECTION_SOURCES {
                return sources;
            }
            if !sources.iter().any(|s| s.url == source.url) {
                sources.push(source.clone());
            }
        }
    }
    sources
}

fn build_synthesis_prompt(
    topic: &str,
    section: &Section,
    existing: Option<&SectionSynthesis>,
    results: &[&SearchResult],
    sources: &[SourceRef],
) -> String {
    let mut findings = String::new();
    for (idx, result) in results.iter().enumerate() {
        findings.push_str(&format!(
            "[finding {}] query: {}\n{}\n\n",
            idx + 1,
            super::clip_for_prompt(&result.query, 200),
            super::clip_for_prompt(&result.content, 800),
        ));
    }

    let mut source_list = String::new();
    for (idx, source) in sources.iter().enumerate() {
        source_list.push_str(&format!("[{}] {} ({})\n", idx + 1, source.title, source.url));
    }

    let existing_text = match existing {
        Some(synthesis) => format!(
            "Current section text (revise rather than restart):\n{}\n\n",
            super::clip_for_prompt(&synthesis.text, 1_500)
        ),
        None => String::new(),
    };

    format!(
        "Write the \"{}\" section of a research report.\n\n\
         <topic>{}</topic>\n\
         Section scope: {}\n\n\
         {existing_text}\
         New findings:\n{findings}\
         Numbered sources:\n{source_list}\n\
         Return JSON with exactly this shape:\n\
         {{\"text\": \"the section text\", \"coverage\": \"covered\"|\"partial\"|\"missing\", \
         \"evidence_quality\": 0.0-1.0, \"gaps\": [\"open question\"], \
         \"claims\": [{{\"claim\": \"checkable statement\", \"sources\": [1]}}]}}\n\
         Claims must cite source numbers from the list above.",
        section.name,
        super::clip_for_prompt(topic, 500),
        section.description,
    )
}

/// Parse a synthesis response. Claim source numbers are 1-based indexes
/// into `sources`; out-of-range numbers are dropped.
pub fn parse_synthesis(
    response: &str,
    section_name: &str,
    sources: &[SourceRef],
) -> Option<SectionOutcome> {
    let parsed: RawSynthesis = serde_json::from_str(extract_json(response)?).ok()?;
    if parsed.text.trim().is_empty() {
        return None;
    }

    let coverage = match parsed.coverage.as_deref().map(str::to_lowercase).as_deref() {
        Some("covered") => Coverage::Covered,
        Some("missing") => Coverage::Missing,
        _ => Coverage::Partial,
    };

    let claims = parsed
        .claims
        .into_iter()
        .filter(|c| !c.claim.trim().is_empty())
        .map(|c| ClaimEvidence {
            claim: c.claim.trim().to_string(),
            sources: c
                .sources
                .iter()
                .filter_map(|&n| n.checked_sub(1).and_then(|i| sources.get(i)))
                .cloned()
                .collect(),
        })
        .collect();

    Some(SectionOutcome {
        synthesis: SectionSynthesis {
            section: section_name.to_string(),
            text: parsed.text.trim().to_string(),
            coverage,
            evidence_quality: parsed.evidence_quality.unwrap_or(0.5).clamp(0.0, 1.0),
            gaps: parsed.gaps,
        },
        claims,
    })
}

/// Excerpt-based synthesis used when the model response is unusable.
fn fallback_outcome(section: &Section, results: &[&SearchResult]) -> SectionOutcome {
    let mut text = String::new();
    for result in results.iter().take(3) {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let excerpt: String = result.content.chars().take(300).collect();
        text.push_str(excerpt.trim());
    }
    if text.is_empty() {
        text = format!("No usable findings for {} yet.", section.name);
    }

    SectionOutcome {
        synthesis: SectionSynthesis {
            section: section.name.clone(),
            text,
            coverage: Coverage::Partial,
            evidence_quality: 0.3,
            gaps: vec![format!("{} needs a reviewed synthesis pass", section.name)],
        },
        claims: Vec::new(),
    }
}
