//! Draft assembly from accumulated research state.
//!
//! Builds the dual-context draft: per-section synthesis up top, raw search
//! detail below it, and a metadata footer last. Assembly is pure string
//! work and never calls the model. When the draft exceeds the size budget,
//! detailed entries are dropped lowest priority first; synthesis text and
//! metadata are never dropped, even when they alone exceed the budget.

use crate::config::ReportConfig;
use crate::types::{
    Coverage, Draft, FinalReport, ResearchState, ResearchTask, SectionCoverage, SynthesisMetadata,
};

/// Builds drafts from a task plan and its accumulated state.
pub struct ReportAssembler {
    config: ReportConfig,
}

impl ReportAssembler {
    pub fn new(config: &ReportConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Assemble the draft. With zero syntheses (a fully failed first round)
    /// the draft falls back to detailed search content only.
    pub fn build(&self, task: &ResearchTask, state: &ResearchState) -> Draft {
        let metadata = self.derive_metadata(task, state);
        let confidence = self.confidence(task, &metadata);

        let title = format!("# Research Report: {}", task.topic);
        let synthesis_block = self.synthesis_block(task, state);
        let metadata_block = format_metadata(&metadata);
        let mut detailed = self.detailed_entries(state);

        let content = loop {
            let candidate = compose(&title, synthesis_block.as_deref(), &detailed, &metadata_block);
            if candidate.len() <= self.config.max_total_chars || detailed.is_empty() {
                break candidate;
            }
            drop_lowest_priority(&mut detailed);
        };

        Draft::new(content, confidence, metadata)
    }

    /// Coverage, average evidence quality, deduplicated gaps, and section
    /// cross-references, recomputed from scratch each time.
    fn derive_metadata(&self, task: &ResearchTask, state: &ResearchState) -> SynthesisMetadata {
        let section_coverage = task
            .plan
            .iter()
            .map(|section| SectionCoverage {
                section: section.name.clone(),
                coverage: state
                    .synthesis_for(&section.name)
                    .map(|s| s.coverage)
                    .unwrap_or(Coverage::Missing),
            })
            .collect();

        let evidence_quality = if state.syntheses.is_empty() {
            0.0
        } else {
            state.syntheses.iter().map(|s| s.evidence_quality).sum::<f32>()
                / state.syntheses.len() as f32
        };

        let mut knowledge_gaps: Vec<String> = Vec::new();
        for synthesis in &state.syntheses {
            for gap in &synthesis.gaps {
                if !knowledge_gaps.contains(gap) {
                    knowledge_gaps.push(gap.clone());
                }
            }
        }

        SynthesisMetadata {
            section_coverage,
            evidence_quality,
            knowledge_gaps,
            cross_domain_links: cross_links(task, state),
        }
    }

    fn confidence(&self, task: &ResearchTask, metadata: &SynthesisMetadata) -> f32 {
        let completion_rate = if task.plan.is_empty() {
            0.0
        } else {
            metadata
                .section_coverage
                .iter()
                .map(|c| coverage_score(c.coverage))
                .sum::<f32>()
                / task.plan.len() as f32
        };
        let gap_penalty = metadata.knowledge_gaps.len() as f32 * 0.05;
        (metadata.evidence_quality * 0.4 + completion_rate * 0.6 - gap_penalty).clamp(0.0, 1.0)
    }

    fn synthesis_block(&self, task: &ResearchTask, state: &ResearchState) -> Option<String> {
        if state.syntheses.is_empty() {
            return None;
        }
        let mut out = String::new();
        for section in &task.plan {
            if let Some(synthesis) = state.synthesis_for(&section.name) {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&format!("## {}\n\n{}", section.name, synthesis.text));
            }
        }
        Some(out)
    }

    fn detailed_entries(&self, state: &ResearchState) -> Vec<(u8, String)> {
        state
            .results
            .iter()
            .map(|result| {
                let mut entry = format!("### {}\n\n", result.query);
                entry.push_str(&truncate_text(
                    &result.content,
                    self.config.max_chars_per_result,
                ));
                let urls: Vec<&str> = result
                    .sources
                    .iter()
                    .take(self.config.max_sources_per_result)
                    .map(|s| s.url.as_str())
                    .collect();
                if !urls.is_empty() {
                    entry.push_str(&format!("\n\nSources: {}", urls.join(" | ")));
                }
                (result.priority, entry)
            })
            .collect()
    }
}

fn compose(
    title: &str,
    synthesis: Option<&str>,
    detailed: &[(u8, String)],
    metadata: &str,
) -> String {
    let mut parts: Vec<String> = vec![title.to_string()];
    if let Some(block) = synthesis {
        parts.push(block.to_string());
    }
    if !detailed.is_empty() {
        let entries: Vec<&str> = detailed.iter().map(|(_, e)| e.as_str()).collect();
        parts.push(format!("## Detailed Findings\n\n{}", entries.join("\n\n")));
    }
    parts.push(metadata.to_string());
    parts.join("\n\n")
}

/// Remove one entry: the numerically smallest priority, newest first among
/// ties, so early high-value findings survive longest.
fn drop_lowest_priority(entries: &mut Vec<(u8, String)>) {
    let mut drop_idx = 0;
    for (i, (priority, _)) in entries.iter().enumerate() {
        if *priority <= entries[drop_idx].0 {
            drop_idx = i;
        }
    }
    entries.remove(drop_idx);
}

fn format_metadata(metadata: &SynthesisMetadata) -> String {
    let mut out = String::from("## Research Metadata\n\n");

    if !metadata.section_coverage.is_empty() {
        let coverage: Vec<String> = metadata
            .section_coverage
            .iter()
            .map(|c| format!("{}: {}", c.section, c.coverage))
            .collect();
        out.push_str(&format!("**Coverage:** {}\n", coverage.join(" | ")));
    }
    out.push_str(&format!(
        "**Evidence quality:** {:.0}%\n",
        metadata.evidence_quality * 100.0
    ));
    if !metadata.knowledge_gaps.is_empty() {
        out.push_str("**Knowledge gaps:**\n");
        for gap in &metadata.knowledge_gaps {
            out.push_str(&format!("- {gap}\n"));
        }
    }
    if !metadata.cross_domain_links.is_empty() {
        out.push_str("**Cross-domain links:**\n");
        for link in &metadata.cross_domain_links {
            out.push_str(&format!("- {link}\n"));
        }
    }
    out.trim_end().to_string()
}

fn coverage_score(coverage: Coverage) -> f32 {
    match coverage {
        Coverage::Covered => 1.0,
        Coverage::Partial => 0.5,
        Coverage::Missing => 0.0,
    }
}

/// A link exists when one section's synthesis mentions another section by
/// name.
fn cross_links(task: &ResearchTask, state: &ResearchState) -> Vec<String> {
    let mut links = Vec::new();
    for synthesis in &state.syntheses {
        let text = synthesis.text.to_lowercase();
        for other in &task.plan {
            if other.name != synthesis.section
                && !other.name.is_empty()
                && text.contains(&other.name.to_lowercase())
            {
                links.push(format!("{} -> {}", synthesis.section, other.name));
            }
        }
    }
    links
}

/// Byte-capped truncation that respects char boundaries.
fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text[..end].trim_end().to_string();
    out.push_str("...");
    out
}

/// Render a finished report as markdown with numbered citations and a
/// source list.
pub fn render_markdown(report: &FinalReport) -> String {
    let mut out = report.content.clone();

    if !report.citations.is_empty() {
        out.push_str("\n\n## Citations\n\n");
        for (i, entry) in report.citations.entries.iter().enumerate() {
            let ids: Vec<String> = entry.source_ids.iter().map(|id| id.label()).collect();
            out.push_str(&format!("{}. {} [{}]\n", i + 1, entry.claim, ids.join(", ")));
        }
        out.push_str("\n### Sources\n\n");
        for source in &report.citations.sources {
            out.push_str(&format!(
                "- {}: {} ({})\n",
                source.id.label(),
                source.title,
                source.url
            ));
        }
    }

    out.push_str(&format!(
        "\n---\n**Termination:** {} | **Tokens:** {} in / {} out\n",
        report.termination_reason, report.usage.input_tokens, report.usage.output_tokens,
    ));
    out
}
