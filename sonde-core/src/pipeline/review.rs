//! End-of-round review: decide whether another research round would help.
//!
//! The model sees per-section coverage and the round count and answers
//! continue or stop. Any failure here keeps the loop going; the round cap
//! bounds the damage and a spurious stop would be unrecoverable.

use serde::Deserialize;
use tracing::debug;

use super::extract_json;
use crate::budget::BudgetManager;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{ResearchState, ResearchTask};

/// Reviewer verdict for the round just finished.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewDecision {
    pub continue_research: bool,
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(rename = "continue")]
    continue_research: bool,
    #[serde(default)]
    rationale: String,
}

/// Ask the model whether the research loop should run another round.
pub async fn review_progress(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    state: &ResearchState,
    max_retries: u32,
    budget: &BudgetManager,
) -> ReviewDecision {
    let request = GenerationRequest::new(
        "You review research progress and decide whether more rounds are needed. \
         Respond with JSON only.",
        build_review_prompt(task, state),
    );

    match generate_parsed(llm, request, max_retries, budget, parse_review).await {
        Ok(Some(decision)) => decision,
        Ok(None) => {
            debug!("Review response unparsable, continuing research");
            ReviewDecision {
                continue_research: true,
                rationale: "review response was unusable".to_string(),
            }
        }
        Err(e) => {
            debug!(error = %e, "Review call failed, continuing research");
            ReviewDecision {
                continue_research: true,
                rationale: "reviewer unavailable".to_string(),
            }
        }
    }
}

fn build_review_prompt(task: &ResearchTask, state: &ResearchState) -> String {
    let mut status = String::new();
    for section in &task.plan {
        match state.synthesis_for(&section.name) {
            Some(synthesis) => {
                status.push_str(&format!(
                    "- {}: {} (evidence quality {:.2}, {} open gaps)\n",
                    section.name,
                    synthesis.coverage,
                    synthesis.evidence_quality,
                    synthesis.gaps.len(),
                ));
            }
            None => status.push_str(&format!("- {}: no synthesis yet\n", section.name)),
        }
    }

    format!(
        "Research topic:\n<topic>{}</topic>\n\n\
         Rounds completed: {}\n\
         Section status:\n{status}\n\
         Decide whether another round of searching would materially improve the report.\n\
         Return JSON with exactly this shape:\n\
         {{\"continue\": true, \"rationale\": \"one sentence\"}}",
        super::clip_for_prompt(&task.topic, 500),
        state.rounds_completed,
    )
}

/// Parse a review verdict from a model response.
pub fn parse_review(response: &str) -> Option<ReviewDecision> {
    let parsed: RawReview = serde_json::from_str(extract_json(response)?).ok()?;
    Some(ReviewDecision {
        continue_research: parsed.continue_research,
        rationale: if parsed.rationale.trim().is_empty() {
            "no rationale given".to_string()
        } else {
            parsed.rationale.trim().to_string()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Budget, BudgetManager};
    use crate::error::LlmError;
    use crate::llm::MockLlm;
    use crate::types::{Coverage, SectionSynthesis};

    fn make_task() -> ResearchTask {
        ResearchTask::new(
            "container networking",
            vec![crate::types::Section::new("Overview", "the basics")],
        )
    }

    #[test]
    fn test_parse_review_reads_continue_key() {
        let decision =
            parse_review("{\"continue\": false, \"rationale\": \"coverage complete\"}").unwrap();
        assert!(!decision.continue_research);
        assert_eq!(decision.rationale, "coverage complete");
    }

    #[test]
    fn test_parse_review_defaults_rationale() {
        let decision = parse_review("{\"continue\": true}").unwrap();
        assert!(decision.continue_research);
        assert_eq!(decision.rationale, "no rationale given");
    }

    #[test]
    fn test_parse_review_rejects_garbage() {
        assert!(parse_review("who knows").is_none());
        assert!(parse_review("{\"rationale\": \"missing verdict\"}").is_none());
    }

    #[tokio::test]
    async fn test_review_accepts_model_stop() {
        let llm = MockLlm::new();
        llm.queue_text("{\"continue\": false, \"rationale\": \"all sections covered\"}");
        let budget = BudgetManager::new(Budget::default());
        let mut state = ResearchState::default();
        state.upsert_synthesis(SectionSynthesis {
            section: "Overview".to_string(),
            text: "done".to_string(),
            coverage: Coverage::Covered,
            evidence_quality: 0.9,
            gaps: Vec::new(),
        });

        let decision = review_progress(&llm, &make_task(), &state, 0, &budget).await;
        assert!(!decision.continue_research);
        assert!(budget.tokens_consumed() > 0);
    }

    #[tokio::test]
    async fn test_review_continues_on_model_error() {
        let llm = MockLlm::new();
        llm.queue_error(LlmError::Timeout { timeout_secs: 30 });
        let budget = BudgetManager::new(Budget::default());

        let decision = review_progress(&llm, &make_task(), &ResearchState::default(), 0, &budget).await;
        assert!(decision.continue_research);
    }

    #[tokio::test]
    async fn test_review_continues_on_garbage() {
        let llm = MockLlm::new();
        llm.queue_text("sure, keep going I guess");
        let budget = BudgetManager::new(Budget::default());

        let decision = review_progress(&llm, &make_task(), &ResearchState::default(), 0, &budget).await;
        assert!(decision.continue_research);
        assert_eq!(decision.rationale, "review response was unusable");
    }
}
