//! Assigns search results to plan sections.
//!
//! One model call classifies the whole round. Results the model skips or
//! mislabels fall back to deterministic keyword overlap against section
//! names and descriptions, so every result lands in exactly one section.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::extract_json;
use crate::budget::BudgetManager;
use crate::convergence::tokenize;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{ResearchTask, SearchResult, Section};

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    assignments: Vec<RawAssignment>,
}

#[derive(Debug, Deserialize)]
struct RawAssignment {
    result: usize,
    section: String,
}

/// Bucket result indexes by plan section. The returned vector is parallel
/// to `task.plan`; every input index appears in exactly one bucket.
pub async fn classify_results(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    results: &[SearchResult],
    max_retries: u32,
    budget: &BudgetManager,
) -> Vec<Vec<usize>> {
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); task.plan.len()];
    if results.is_empty() || task.plan.is_empty() {
        return buckets;
    }

    let request = GenerationRequest::new(
        "You classify search results into report sections. Respond with JSON only.",
        build_classification_prompt(task, results),
    );

    let assigned: HashMap<usize, String> =
        match generate_parsed(llm, request, max_retries, budget, parse_classification).await {
            Ok(Some(assigned)) => assigned,
            Ok(None) => {
                debug!("Classification response unparsable, using keyword overlap");
                HashMap::new()
            }
            Err(error) => {
                debug!(error = %error, "Classification call failed, using keyword overlap");
                HashMap::new()
            }
        };

    for (idx, result) in results.iter().enumerate() {
        let section_idx = assigned
            .get(&idx)
            .and_then(|name| {
                task.plan
                    .iter()
                    .position(|s| s.name.eq_ignore_ascii_case(name))
            })
            .unwrap_or_else(|| keyword_section(result, &task.plan));
        buckets[section_idx].push(idx);
    }

    buckets
}

fn build_classification_prompt(task: &ResearchTask, results: &[SearchResult]) -> String {
    let mut sections = String::new();
    for section in &task.plan {
        sections.push_str(&format!("- {}: {}\n", section.name, section.description));
    }

    let mut listing = String::new();
    for (idx, result) in results.iter().enumerate() {
        listing.push_str(&format!(
            "[{idx}] query: {}; excerpt: {}\n",
            super::clip_for_prompt(&result.query, 200),
            super::clip_for_prompt(&result.content, 300),
        ));
    }

    format!(
        "Assign each numbered search result to the report section it best supports.\n\n\
         <topic>{}</topic>\n\n\
         Sections:\n{sections}\n\
         Results:\n{listing}\n\
         Return JSON with exactly this shape:\n\
         {{\"assignments\": [{{\"result\": 0, \"section\": \"section name\"}}]}}\n\
         Skip results that support no section.",
        super::clip_for_prompt(&task.topic, 500),
    )
}

/// Parse assignments from a model response; None when unparsable.
pub fn parse_classification(response: &str) -> Option<HashMap<usize, String>> {
    let parsed: ClassificationResponse = serde_json::from_str(extract_json(response)?).ok()?;
    Some(
        parsed
            .assignments
            .into_iter()
            .map(|a| (a.result, a.section))
            .collect(),
    )
}

/// Nearest section by token overlap of the result's query and goal against
/// section name and description. Ties go to the earlier plan section; zero
/// overlap lands in the first section.
pub fn keyword_section(result: &SearchResult, plan: &[Section]) -> usize {
    let result_tokens = tokenize(&format!("{} {}", result.query, result.goal));

    let mut best_idx = 0;
    let mut best_overlap = 0;
    for (idx, section) in plan.iter().enumerate() {
        let section_tokens = tokenize(&format!("{} {}", section.name, section.description));
        let overlap = result_tokens.intersection(&section_tokens).count();
        if overlap > best_overlap {
            best_overlap = overlap;
            best_idx = idx;
        }
    }
    best_idx
}
