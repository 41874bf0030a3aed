//! Search query generation per round.
//!
//! One model call proposes (query, goal, priority) tuples aimed at the
//! sections that still need evidence. Priority ties are broken round-robin
//! across sections so no section is starved of search budget.

use serde::Deserialize;
use std::collections::VecDeque;
use tracing::debug;

use super::extract_json;
use crate::budget::BudgetManager;
use crate::config::PipelineConfig;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{ResearchState, ResearchTask, Section};

/// One planned search query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub query: String,
    pub goal: String,
    /// 1 (lowest) to 5 (highest).
    pub priority: u8,
    /// Section this query targets, when the model names one.
    pub section: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueriesResponse {
    queries: Vec<RawQuery>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    query: String,
    #[serde(default)]
    goal: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    section: Option<String>,
}

/// Generate this round's queries. Never fails: model or parse errors fall
/// back to one query per plan section.
pub async fn generate_queries(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    state: &ResearchState,
    config: &PipelineConfig,
    max_retries: u32,
    budget: &BudgetManager,
) -> Vec<QuerySpec> {
    let request = GenerationRequest::new(
        "You are a research assistant planning web searches. Respond with JSON only.",
        build_queries_prompt(task, state, config.max_queries_per_round),
    );

    let specs = match generate_parsed(llm, request, max_retries, budget, parse_queries).await {
        Ok(Some(specs)) => specs,
        Ok(None) => {
            debug!(topic = task.topic.as_str(), "Query response unparsable, using fallback queries");
            fallback_queries(task)
        }
        Err(error) => {
            debug!(topic = task.topic.as_str(), error = %error, "Query call failed, using fallback queries");
            fallback_queries(task)
        }
    };

    order_queries(specs, &task.plan, config.max_queries_per_round)
}

fn build_queries_prompt(task: &ResearchTask, state: &ResearchState, max_queries: usize) -> String {
    let mut sections = String::new();
    for section in &task.plan {
        let status = match state.synthesis_for(&section.name) {
            Some(synthesis) => {
                let gaps = if synthesis.gaps.is_empty() {
                    String::new()
                } else {
                    format!("; gaps: {}", synthesis.gaps.join(", "))
                };
                format!("{}{gaps}", synthesis.coverage)
            }
            None => "missing".to_string(),
        };
        sections.push_str(&format!(
            "- {}: {} [{}]\n",
            section.name, section.description, status
        ));
    }

    format!(
        "Plan web searches for a research report.\n\n\
         <topic>{}</topic>\n\n\
         Sections and their current coverage:\n{sections}\n\
         Round {} of research. Propose at most {max_queries} searches that fill the\n\
         weakest coverage first. Return JSON with exactly this shape:\n\
         {{\"queries\": [{{\"query\": \"search text\", \"goal\": \"what it should establish\", \
         \"priority\": 1-5, \"section\": \"section name\"}}]}}\n\
         Priority 5 is most important.",
        super::clip_for_prompt(&task.topic, 500),
        state.rounds_completed + 1,
    )
}

/// Parse query specs from a model response, returning None when nothing
/// usable is found.
pub fn parse_queries(response: &str) -> Option<Vec<QuerySpec>> {
    let parsed: QueriesResponse = serde_json::from_str(extract_json(response)?).ok()?;
    let specs: Vec<QuerySpec> = parsed
        .queries
        .into_iter()
        .filter(|q| !q.query.trim().is_empty())
        .map(|q| QuerySpec {
            query: q.query.trim().to_string(),
            goal: if q.goal.trim().is_empty() {
                "gather evidence".to_string()
            } else {
                q.goal.trim().to_string()
            },
            priority: q.priority.unwrap_or(3).clamp(1, 5),
            section: q.section.filter(|s| !s.trim().is_empty()),
        })
        .collect();
    if specs.is_empty() { None } else { Some(specs) }
}

/// One mid-priority query per plan section.
pub fn fallback_queries(task: &ResearchTask) -> Vec<QuerySpec> {
    task.plan
        .iter()
        .map(|section| QuerySpec {
            query: format!("{} {}", task.topic, section.name),
            goal: section.description.clone(),
            priority: 3,
            section: Some(section.name.clone()),
        })
        .collect()
}

/// Order queries by priority (highest first), breaking ties round-robin
/// across plan sections, then cap at `max`.
pub fn order_queries(specs: Vec<QuerySpec>, plan: &[Section], max: usize) -> Vec<QuerySpec> {
    let mut out = Vec::with_capacity(specs.len());
    for priority in (1..=5u8).rev() {
        let group: Vec<QuerySpec> = specs.iter().filter(|s| s.priority == priority).cloned().collect();
        out.extend(interleave_by_section(group, plan));
    }
    out.truncate(max);
    out
}

fn interleave_by_section(group: Vec<QuerySpec>, plan: &[Section]) -> Vec<QuerySpec> {
    // Last bucket holds queries with no matching section.
    let mut buckets: Vec<VecDeque<QuerySpec>> =
        (0..=plan.len()).map(|_| VecDeque::new()).collect();
    for spec in group {
        let idx = spec
            .section
            .as_deref()
            .and_then(|name| plan.iter().position(|s| s.name.eq_ignore_ascii_case(name)))
            .unwrap_or(plan.len());
        buckets[idx].push_back(spec);
    }

    let mut out = Vec::new();
    loop {
        let mut advanced = false;
        for bucket in buckets.iter_mut() {
            if let Some(spec) = bucket.pop_front() {
                out.push(spec);
                advanced = true;
            }
        }
        if !advanced {
            break;
        }
    }
    out
}
