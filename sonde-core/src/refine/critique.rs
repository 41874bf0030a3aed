//! Critique-and-revise: one call to find faults, one call to fix them.
//!
//! Only critiques above the severity floor trigger a revision, and the
//! revision replaces the draft only when it passes `is_improvement`. A
//! rejected or failed revision keeps the prior draft.

use serde::Deserialize;
use tracing::debug;

use super::{STRATEGY_MAX_RETRIES, clip_for_prompt, extract_json, parse_revision};
use crate::budget::BudgetManager;
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{Critique, CritiqueKind, Draft, ResearchTask};

#[derive(Debug, Deserialize)]
struct CritiqueResponse {
    #[serde(default)]
    critiques: Vec<RawCritique>,
}

#[derive(Debug, Deserialize)]
struct RawCritique {
    #[serde(default)]
    issue_type: Option<String>,
    description: String,
    #[serde(default)]
    severity: Option<f32>,
}

/// Accept a revision when it kept at least 90% of the original length or
/// raised confidence. Anything else counts as regression.
pub fn is_improvement(old: &Draft, new: &Draft) -> bool {
    new.content.len() >= old.content.len() * 9 / 10 || new.confidence > old.confidence
}

pub async fn critique_and_revise(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    draft: &Draft,
    budget: &BudgetManager,
) -> Draft {
    let request = GenerationRequest::new(
        "You critique research reports. Respond with JSON only.",
        build_critique_prompt(task, draft),
    );
    let critiques =
        match generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, parse_critiques).await {
            Ok(Some(critiques)) => critiques,
            // Unparsable critique output reads as "no critiques found".
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "Critique call failed, keeping draft");
                return draft.clone();
            }
        };

    let actionable: Vec<&Critique> = critiques.iter().filter(|c| c.severity > 0.5).collect();
    if actionable.is_empty() {
        debug!("No actionable critiques, draft unchanged");
        return draft.clone();
    }

    let request = GenerationRequest::new(
        "You revise research reports. Respond with JSON only.",
        build_revise_prompt(task, draft, &actionable),
    );
    let revised = match generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, |text| {
        parse_revision(text, draft.confidence)
    })
    .await
    {
        Ok(revised) => revised,
        Err(e) => {
            debug!(error = %e, "Revise call failed, keeping draft");
            None
        }
    };

    match revised {
        Some((text, confidence)) => {
            let candidate = Draft::new(text, confidence, draft.metadata.clone());
            if is_improvement(draft, &candidate) {
                candidate
            } else {
                debug!("Revision rejected as regression, keeping draft");
                draft.clone()
            }
        }
        None => draft.clone(),
    }
}

fn build_critique_prompt(task: &ResearchTask, draft: &Draft) -> String {
    format!(
        "Critique this research report draft on the topic below.\n\n\
         <topic>{}</topic>\n\n\
         Draft:\n{}\n\n\
         Return JSON with exactly this shape:\n\
         {{\"critiques\": [{{\"issue_type\": \"accuracy\"|\"completeness\"|\"clarity\"|\
         \"consistency\"|\"citation\", \"description\": \"what is wrong\", \
         \"severity\": 0.0-1.0}}]}}\n\
         Return an empty list if the draft needs no work.",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    )
}

fn build_revise_prompt(task: &ResearchTask, draft: &Draft, critiques: &[&Critique]) -> String {
    let mut issues = String::new();
    for (idx, critique) in critiques.iter().enumerate() {
        issues.push_str(&format!(
            "{}. [{:?}] {}\n",
            idx + 1,
            critique.issue_type,
            critique.description,
        ));
    }

    format!(
        "Revise this research report draft to address every issue listed.\n\
         Keep accurate content and all citation markers.\n\n\
         <topic>{}</topic>\n\n\
         Draft:\n{}\n\n\
         Issues:\n{issues}\n\
         Return JSON with exactly this shape:\n\
         {{\"text\": \"the full revised report\", \"confidence\": 0.0-1.0}}",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    )
}

/// Parse critiques from a model response.
pub fn parse_critiques(response: &str) -> Option<Vec<Critique>> {
    let parsed: CritiqueResponse = serde_json::from_str(extract_json(response)?).ok()?;
    Some(
        parsed
            .critiques
            .into_iter()
            .filter(|c| !c.description.trim().is_empty())
            .map(|c| Critique {
                issue_type: critique_kind(c.issue_type.as_deref()),
                description: c.description.trim().to_string(),
                severity: c.severity.unwrap_or(0.6).clamp(0.0, 1.0),
            })
            .collect(),
    )
}

fn critique_kind(label: Option<&str>) -> CritiqueKind {
    match label.map(str::to_lowercase).as_deref() {
        Some("completeness") => CritiqueKind::Completeness,
        Some("clarity") => CritiqueKind::Clarity,
        Some("consistency") => CritiqueKind::Consistency,
        Some("citation") => CritiqueKind::Citation,
        _ => CritiqueKind::Accuracy,
    }
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

    #[test]
    fn test_is_improvement_length_floor() {
        let old = make_draft(&"x".repeat(100), 0.5);
        assert!(is_improvement(&old, &make_draft(&"y".repeat(90), 0.5)));
        assert!(!is_improvement(&old, &make_draft(&"y".repeat(89), 0.5)));
    }

    #[test]
    fn test_is_improvement_confidence_rescues_short_draft() {
        let old = make_draft(&"x".repeat(100), 0.5);
        assert!(is_improvement(&old, &make_draft("short", 0.6)));
    }

    #[test]
    fn test_parse_critiques_maps_kinds_and_defaults() {
        let response = "{\"critiques\": [\
            {\"issue_type\": \"citation\", \"description\": \"S3 unused\", \"severity\": 0.9}, \
            {\"description\": \"vague\"}]}";
        let critiques = parse_critiques(response).unwrap();
        assert_eq!(critiques[0].issue_type, CritiqueKind::Citation);
        assert_eq!(critiques[1].issue_type, CritiqueKind::Accuracy);
        assert!((critiques[1].severity - 0.6).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_no_actionable_critiques_keeps_draft() {
        let llm = MockLlm::new();
        llm.queue_text(
            "{\"critiques\": [{\"description\": \"minor nit\", \"severity\": 0.2}]}",
        );
        let budget = BudgetManager::new(Budget::default());
        let draft = make_draft("original body", 0.5);

        let result = critique_and_revise(&llm, &make_task(), &draft, &budget).await;

        assert_eq!(result.content, "original body");
        // Revision call was skipped entirely.
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_severe_critique_triggers_revision() {
        let llm = MockLlm::new();
        llm.queue_text(
            "{\"critiques\": [{\"issue_type\": \"completeness\", \
             \"description\": \"missing evidence\", \"severity\": 0.8}]}",
        );
        llm.queue_text("{\"text\": \"original body with added evidence\", \"confidence\": 0.7}");
        let budget = BudgetManager::new(Budget::default());
        let draft = make_draft("original body", 0.5);

        let result = critique_and_revise(&llm, &make_task(), &draft, &budget).await;

        assert_eq!(result.content, "original body with added evidence");
        assert!((result.confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_regressive_revision_is_rejected() {
        let llm = MockLlm::new();
        llm.queue_text(
            "{\"critiques\": [{\"issue_type\": \"clarity\", \
             \"description\": \"too wordy\", \"severity\": 0.9}]}",
        );
        // Much shorter and no confidence gain.
        llm.queue_text("{\"text\": \"tiny\", \"confidence\": 0.5}");
        let budget = BudgetManager::new(Budget::default());
        let draft = make_draft(&"detailed body ".repeat(20), 0.5);

        let result = critique_and_revise(&llm, &make_task(), &draft, &budget).await;
        assert_eq!(result.content, draft.content);
    }

    #[tokio::test]
    async fn test_critique_call_failure_keeps_draft() {
        let llm = MockLlm::new();
        llm.queue_error(LlmError::AuthFailed {
            provider: "mock".to_string(),
        });
        let budget = BudgetManager::new(Budget::default());
        let draft = make_draft("body", 0.5);

        let result = critique_and_revise(&llm, &make_task(), &draft, &budget).await;
        assert_eq!(result.content, "body");
    }
}
