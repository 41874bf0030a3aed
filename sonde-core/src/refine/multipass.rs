//! Multi-pass refinement: fixed rewrite passes, one focus each.
//!
//! Passes run in a set order with set emphasis weights. Each pass is a
//! single rewrite call; a pass that fails or stays unparsable keeps the
//! current draft and moves on. The loop exits early once confidence
//! clears 0.9.

use tracing::debug;

use super::{STRATEGY_MAX_RETRIES, clip_for_prompt, parse_revision};
use crate::budget::BudgetManager;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{Draft, ResearchTask};

const PASSES: [(&str, f32); 3] = [
    ("completeness", 0.4),
    ("consistency", 0.3),
    ("clarity", 0.3),
];

const EARLY_EXIT_CONFIDENCE: f32 = 0.9;

pub async fn multi_pass(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    draft: &Draft,
    budget: &BudgetManager,
) -> Draft {
    let mut current = draft.clone();

    for (focus, weight) in PASSES {
        if current.confidence > EARLY_EXIT_CONFIDENCE {
            debug!(confidence = current.confidence, "Confidence high, ending passes early");
            break;
        }

        let request = GenerationRequest::new(
            "You rewrite research reports with a single focus per pass. \
             Respond with JSON only.",
            build_pass_prompt(task, &current, focus, weight),
        );
        let fallback_confidence = current.confidence;
        let parsed = generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, |text| {
            parse_revision(text, fallback_confidence)
        })
        .await;
        match parsed {
            Ok(Some((text, confidence))) => {
                current = Draft::new(text, confidence, current.metadata.clone());
            }
            Ok(None) => {
                debug!(focus, "Pass output unparsable, keeping current draft");
            }
            Err(e) => {
                debug!(focus, error = %e, "Pass failed, keeping current draft");
            }
        }
    }

    current
}

fn build_pass_prompt(task: &ResearchTask, draft: &Draft, focus: &str, weight: f32) -> String {
    format!(
        "Rewrite this research report draft with one focus: {focus} \
         (emphasis weight {weight:.1}).\n\
         Change only what the focus demands; keep citation markers intact.\n\n\
         <topic>{}</topic>\n\n\
         Draft:\n{}\n\n\
         Return JSON with exactly this shape:\n\
         {{\"text\": \"the full rewritten report\", \"confidence\": 0.0-1.0}}",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::error::LlmError;
    use crate::llm::MockLlm;
    use crate::types::SynthesisMetadata;

    fn make_draft(content: &str, confidence: f32) -> Draft {
        Draft::new(content, confidence, SynthesisMetadata::default())
    }

    fn make_task() -> ResearchTask {
        ResearchTask::new("topic", Vec::new())
    }

    #[tokio::test]
    async fn test_runs_all_three_passes() {
        let llm = MockLlm::new();
        llm.queue_text("{\"text\": \"after completeness pass\", \"confidence\": 0.5}");
        llm.queue_text("{\"text\": \"after consistency pass\", \"confidence\": 0.6}");
        llm.queue_text("{\"text\": \"after clarity pass\", \"confidence\": 0.7}");
        let budget = BudgetManager::new(Budget::default());

        let result = multi_pass(&llm, &make_task(), &make_draft("seed", 0.3), &budget).await;

        assert_eq!(result.content, "after clarity pass");
        assert!((result.confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_early_exit_once_confident() {
        let llm = MockLlm::new();
        llm.queue_text("{\"text\": \"now excellent\", \"confidence\": 0.95}");
        let budget = BudgetManager::new(Budget::default());

        let result = multi_pass(&llm, &make_task(), &make_draft("seed", 0.3), &budget).await;

        assert_eq!(result.content, "now excellent");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_confident_draft_skips_all_passes() {
        let llm = MockLlm::new();
        let budget = BudgetManager::new(Budget::default());

        let result = multi_pass(&llm, &make_task(), &make_draft("good", 0.92), &budget).await;

        assert_eq!(result.content, "good");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_current_and_continues() {
        let llm = MockLlm::new();
        llm.queue_error(LlmError::AuthFailed {
            provider: "mock".to_string(),
        });
        llm.queue_text("{\"text\": \"recovered in pass two\", \"confidence\": 0.6}");
        llm.queue_text("not json at all");
        let budget = BudgetManager::new(Budget::default());

        let result = multi_pass(&llm, &make_task(), &make_draft("seed", 0.3), &budget).await;

        // Pass 1 failed, pass 2 landed, pass 3 was unparsable twice
        // (initial reply plus the stricter re-request).
        assert_eq!(result.content, "recovered in pass two");
        assert_eq!(llm.call_count(), 4);
    }
}
