//! Consistency check: look for contradictions and coverage holes, and
//! revise only when something turns up.
//!
//! Two check calls run against the draft. A check that fails to parse is
//! re-requested once and then reads as clean.

use serde::Deserialize;
use tracing::debug;

use super::{STRATEGY_MAX_RETRIES, clip_for_prompt, extract_json, parse_revision};
use crate::budget::BudgetManager;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{Draft, ResearchTask};

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    issues: Vec<String>,
}

pub async fn consistency_check(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    draft: &Draft,
    budget: &BudgetManager,
) -> Draft {
    let contradiction_prompt = format!(
        "Check this research report for internal contradictions: claims \
         that conflict with each other or with their own citations.\n\n\
         <topic>{}</topic>\n\n\
         Report:\n{}\n\n\
         Return JSON with exactly this shape:\n\
         {{\"issues\": [\"description of each contradiction\"]}}\n\
         Return an empty list if there are none.",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    );
    let coverage_prompt = format!(
        "Check whether this research report fully answers its research \
         question.\n\n\
         <topic>{}</topic>\n\n\
         Report:\n{}\n\n\
         Return JSON with exactly this shape:\n\
         {{\"issues\": [\"aspect of the question the report fails to address\"]}}\n\
         Return an empty list if coverage is complete.",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    );

    let mut issues = run_check(llm, contradiction_prompt, budget).await;
    issues.extend(run_check(llm, coverage_prompt, budget).await);

    if issues.is_empty() {
        debug!("Both checks clean, draft unchanged");
        return draft.clone();
    }

    let mut listed = String::new();
    for (idx, issue) in issues.iter().enumerate() {
        listed.push_str(&format!("{}. {}\n", idx + 1, issue));
    }
    let request = GenerationRequest::new(
        "You revise research reports. Respond with JSON only.",
        format!(
            "Revise this research report to resolve every issue listed.\n\
             Keep accurate content and all citation markers.\n\n\
             <topic>{}</topic>\n\n\
             Report:\n{}\n\n\
             Issues:\n{listed}\n\
             Return JSON with exactly this shape:\n\
             {{\"text\": \"the full revised report\", \"confidence\": 0.0-1.0}}",
            clip_for_prompt(&task.topic, 500),
            clip_for_prompt(&draft.content, 12_000),
        ),
    );
    match generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, |text| {
        parse_revision(text, draft.confidence)
    })
    .await
    {
        Ok(Some((text, confidence))) => Draft::new(text, confidence, draft.metadata.clone()),
        Ok(None) => draft.clone(),
        Err(e) => {
            debug!(error = %e, "Revision call failed, keeping draft");
            draft.clone()
        }
    }
}

async fn run_check(llm: &dyn LlmGateway, prompt: String, budget: &BudgetManager) -> Vec<String> {
    let request = GenerationRequest::new(
        "You check research reports for specific defects. Respond with JSON only.",
        prompt,
    );
    match generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, parse_issues).await {
        Ok(Some(issues)) => issues,
        Ok(None) => {
            debug!("Check response unparsable, treating as clean");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "Check call failed, treating as clean");
            Vec::new()
        }
    }
}

/// Parse an issue list from a check response. An empty list is a valid
/// parse meaning the check came back clean.
pub fn parse_issues(response: &str) -> Option<Vec<String>> {
    let parsed: CheckResponse = serde_json::from_str(extract_json(response)?).ok()?;
    Some(
        parsed
            .issues
            .into_iter()
            .map(|issue| issue.trim().to_string())
            .filter(|issue| !issue.is_empty())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::error::LlmError;
    use crate::llm::MockLlm;
    use crate::types::SynthesisMetadata;

    fn make_draft(content: &str) -> Draft {
        Draft::new(content, 0.85, SynthesisMetadata::default())
    }

    fn make_task() -> ResearchTask {
        ResearchTask::new("topic", Vec::new())
    }

    #[test]
    fn test_parse_issues_drops_blanks() {
        let issues = parse_issues("{\"issues\": [\"real problem\", \"  \", \"\"]}").unwrap();
        assert_eq!(issues, vec!["real problem"]);
        assert!(parse_issues("no json here").is_none());
        assert_eq!(parse_issues("{\"issues\": []}"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_clean_checks_skip_revision() {
        let llm = MockLlm::new();
        llm.queue_text("{\"issues\": []}");
        llm.queue_text("{\"issues\": []}");
        let budget = BudgetManager::new(Budget::default());
        let draft = make_draft("consistent body");

        let result = consistency_check(&llm, &make_task(), &draft, &budget).await;

        assert_eq!(result.content, "consistent body");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_found_issues_trigger_revision() {
        let llm = MockLlm::new();
        llm.queue_text("{\"issues\": [\"section two contradicts section one\"]}");
        llm.queue_text("{\"issues\": []}");
        llm.queue_text("{\"text\": \"contradiction resolved\", \"confidence\": 0.9}");
        let budget = BudgetManager::new(Budget::default());

        let result = consistency_check(&llm, &make_task(), &make_draft("body"), &budget).await;

        assert_eq!(result.content, "contradiction resolved");
        assert!((result.confidence - 0.9).abs() < f32::EPSILON);
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unparsable_checks_read_as_clean() {
        let llm = MockLlm::new();
        llm.queue_text("I could not find anything noteworthy.");
        llm.queue_text("Looks fine to me!");
        let budget = BudgetManager::new(Budget::default());

        let result = consistency_check(&llm, &make_task(), &make_draft("body"), &budget).await;

        assert_eq!(result.content, "body");
        // Each unparsable check burns its reformulation attempt too.
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_revision_keeps_draft() {
        let llm = MockLlm::new();
        llm.queue_text("{\"issues\": [\"missing the comparison aspect\"]}");
        llm.queue_text("{\"issues\": []}");
        llm.queue_error(LlmError::ProviderDown {
            message: "503".to_string(),
        });
        let budget = BudgetManager::new(Budget::default());

        let result = consistency_check(&llm, &make_task(), &make_draft("body"), &budget).await;
        assert_eq!(result.content, "body");
    }
}
