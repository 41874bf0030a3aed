//! Section plan generation.
//!
//! One model call proposes the report outline. An unparsable response is
//! re-requested once with a stricter instruction; after that, a heuristic
//! plan derived from the topic's shape keeps the run going.

use serde::Deserialize;
use tracing::debug;

use super::extract_json;
use crate::budget::BudgetManager;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::Section;

/// Upper bound on plan size regardless of what the model proposes.
pub const MAX_PLAN_SECTIONS: usize = 5;

#[derive(Debug, Deserialize)]
struct PlanResponse {
    sections: Vec<PlannedSection>,
}

#[derive(Debug, Deserialize)]
struct PlannedSection {
    name: String,
    #[serde(default)]
    description: String,
}

/// Produce the section plan for a topic. Never fails: model or parse
/// errors fall back to a heuristic plan.
pub async fn build_plan(
    llm: &dyn LlmGateway,
    topic: &str,
    max_retries: u32,
    budget: &BudgetManager,
) -> Vec<Section> {
    let request = GenerationRequest::new(
        "You are a research planning assistant. Respond with JSON only.",
        build_plan_prompt(topic),
    );

    match generate_parsed(llm, request, max_retries, budget, parse_plan).await {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            debug!(topic, "Plan response unparsable, using heuristic plan");
            fallback_plan(topic)
        }
        Err(error) => {
            debug!(topic, error = %error, "Plan call failed, using heuristic plan");
            fallback_plan(topic)
        }
    }
}

fn build_plan_prompt(topic: &str) -> String {
    format!(
        "Plan a research report on the topic below.\n\n\
         <topic>{}</topic>\n\n\
         Propose at most {MAX_PLAN_SECTIONS} sections that together cover the topic.\n\
         Return JSON with exactly this shape:\n\
         {{\"sections\": [{{\"name\": \"short section name\", \"description\": \"what this section covers\"}}]}}",
        super::clip_for_prompt(topic, 500),
    )
}

/// Parse a plan from a model response, returning None if no usable
/// sections are found.
pub fn parse_plan(response: &str) -> Option<Vec<Section>> {
    let parsed: PlanResponse = serde_json::from_str(extract_json(response)?).ok()?;
    let sections: Vec<Section> = parsed
        .sections
        .into_iter()
        .filter(|s| !s.name.trim().is_empty())
        .take(MAX_PLAN_SECTIONS)
        .map(|s| Section::new(s.name.trim(), s.description.trim()))
        .collect();
    if sections.is_empty() { None } else { Some(sections) }
}

/// Heuristic plan built from the topic's shape.
pub fn fallback_plan(topic: &str) -> Vec<Section> {
    let lower = topic.to_lowercase();
    let mut plan = vec![
        Section::new("Overview", format!("High level introduction to: {topic}")),
        Section::new(
            "Key Details",
            format!("Technical specifics and mechanisms behind: {topic}"),
        ),
    ];

    if lower.contains(" vs ") || lower.contains(" versus ") || lower.contains(" compared to ") {
        plan.push(Section::new(
            "Comparison",
            format!("Trade-offs between the alternatives in: {topic}"),
        ));
    }
    if lower.starts_with("how") {
        plan.push(Section::new(
            "Practical Steps",
            format!("Concrete steps for: {topic}"),
        ));
    }

    plan
}
