//! Cross-validation: regenerate the draft several ways, keep the version
//! the others agree with, and reconcile around it.
//!
//! Candidates are generated concurrently at rising temperature and scored
//! by pairwise token-set similarity; the most mutually consistent one
//! anchors a final reconcile call. A candidate that stays unparsable after
//! one stricter re-request is dropped, and fewer than two survivors keeps
//! the draft unchanged.

use tracing::debug;

use super::{STRATEGY_MAX_RETRIES, clip_for_prompt, parse_revision};
use crate::budget::BudgetManager;
use crate::convergence::{jaccard_similarity, tokenize};
use crate::llm::{GenerationRequest, LlmGateway, generate_parsed};
use crate::types::{Draft, ResearchTask};

const MIN_CANDIDATES: usize = 2;
const MAX_CANDIDATES: usize = 4;
const BASE_TEMPERATURE: f32 = 0.3;
const TEMPERATURE_STEP: f32 = 0.2;

pub async fn cross_validate(
    llm: &dyn LlmGateway,
    task: &ResearchTask,
    draft: &Draft,
    requested_candidates: usize,
    budget: &BudgetManager,
) -> Draft {
    let n = requested_candidates.clamp(MIN_CANDIDATES, MAX_CANDIDATES);

    let jobs = (0..n).map(|i| {
        let temperature = BASE_TEMPERATURE + TEMPERATURE_STEP * i as f32;
        async move {
            let request = GenerationRequest::new(
                "You rewrite research reports. Respond with JSON only.",
                build_candidate_prompt(task, draft),
            )
            .with_temperature(temperature);
            generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, |text| {
                parse_revision(text, draft.confidence)
            })
            .await
            .unwrap_or_else(|e| {
                debug!(candidate = i, error = %e, "Candidate generation failed");
                None
            })
        }
    });
    let candidates: Vec<(String, f32)> = futures::future::join_all(jobs)
        .await
        .into_iter()
        .flatten()
        .collect();

    if candidates.len() < MIN_CANDIDATES {
        debug!(survived = candidates.len(), "Too few candidates, keeping draft");
        return draft.clone();
    }

    let texts: Vec<&str> = candidates.iter().map(|(text, _)| text.as_str()).collect();
    let matrix = consistency_matrix(&texts);
    let anchor = anchor_index(&matrix);

    let request = GenerationRequest::new(
        "You merge alternative revisions of a research report. Respond with JSON only.",
        build_reconcile_prompt(task, &candidates, anchor),
    );
    let anchor_confidence = candidates[anchor].1;
    match generate_parsed(llm, request, STRATEGY_MAX_RETRIES, budget, |text| {
        parse_revision(text, anchor_confidence)
    })
    .await
    {
        Ok(Some((text, confidence))) => Draft::new(text, confidence, draft.metadata.clone()),
        Ok(None) => {
            debug!("Reconciliation output unparsable, keeping draft");
            draft.clone()
        }
        Err(e) => {
            debug!(error = %e, "Reconciliation call failed, keeping draft");
            draft.clone()
        }
    }
}

/// Pairwise token-set similarity for each candidate pair. Symmetric,
/// with a 1.0 diagonal.
pub fn consistency_matrix(texts: &[&str]) -> Vec<Vec<f32>> {
    let sets: Vec<_> = texts.iter().map(|t| tokenize(t)).collect();
    let n = sets.len();
    let mut matrix = vec![vec![1.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let similarity = jaccard_similarity(&sets[i], &sets[j]);
            matrix[i][j] = similarity;
            matrix[j][i] = similarity;
        }
    }
    matrix
}

/// Index of the candidate with the highest average similarity to the
/// others. Ties go to the lowest index.
pub fn anchor_index(matrix: &[Vec<f32>]) -> usize {
    let n = matrix.len();
    let mut best = 0;
    let mut best_average = f32::MIN;
    for i in 0..n {
        let sum: f32 = (0..n).filter(|&j| j != i).map(|j| matrix[i][j]).sum();
        let average = if n > 1 { sum / (n - 1) as f32 } else { 1.0 };
        if average > best_average {
            best_average = average;
            best = i;
        }
    }
    best
}

fn build_candidate_prompt(task: &ResearchTask, draft: &Draft) -> String {
    format!(
        "Write an improved complete revision of this research report draft.\n\
         Keep every claim that is supported and all citation markers.\n\n\
         <topic>{}</topic>\n\n\
         Draft:\n{}\n\n\
         Return JSON with exactly this shape:\n\
         {{\"text\": \"the full revised report\", \"confidence\": 0.0-1.0}}",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&draft.content, 12_000),
    )
}

fn build_reconcile_prompt(
    task: &ResearchTask,
    candidates: &[(String, f32)],
    anchor: usize,
) -> String {
    let mut others = String::new();
    for (idx, (text, _)) in candidates.iter().enumerate() {
        if idx == anchor {
            continue;
        }
        others.push_str(&format!(
            "Alternative {}:\n{}\n\n",
            idx + 1,
            clip_for_prompt(text, 4_000),
        ));
    }

    format!(
        "Merge these alternative revisions into one final report.\n\
         The reference version is the most mutually consistent; prefer it \
         on any conflict and fold in the strongest additions from the \
         alternatives.\n\n\
         <topic>{}</topic>\n\n\
         Reference version:\n{}\n\n\
         {others}\
         Return JSON with exactly this shape:\n\
         {{\"text\": \"the final report\", \"confidence\": 0.0-1.0}}",
        clip_for_prompt(&task.topic, 500),
        clip_for_prompt(&candidates[anchor].0, 8_000),
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
        Draft::new(content, 0.4, SynthesisMetadata::default())
    }

    fn make_task() -> ResearchTask {
        ResearchTask::new("topic", Vec::new())
    }

    #[test]
    fn test_anchor_is_highest_average_similarity() {
        // AB=0.9, AC=0.2, BC=0.3 gives averages A=0.55, B=0.6, C=0.25.
        let matrix = vec![
            vec![1.0, 0.9, 0.2],
            vec![0.9, 1.0, 0.3],
            vec![0.2, 0.3, 1.0],
        ];
        assert_eq!(anchor_index(&matrix), 1);
    }

    #[test]
    fn test_anchor_tie_takes_lowest_index() {
        let matrix = vec![vec![1.0, 0.5], vec![0.5, 1.0]];
        assert_eq!(anchor_index(&matrix), 0);
    }

    #[test]
    fn test_consistency_matrix_shape() {
        let matrix = consistency_matrix(&["alpha bravo", "alpha bravo", "charlie delta"]);
        assert!((matrix[0][0] - 1.0).abs() < f32::EPSILON);
        assert!((matrix[0][1] - 1.0).abs() < f32::EPSILON);
        assert!(matrix[0][2].abs() < f32::EPSILON);
        assert!((matrix[1][2] - matrix[2][1]).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_reconciles_around_most_consistent_candidate() {
        let llm = MockLlm::new();
        llm.queue_text(
            "{\"text\": \"alpha bravo charlie delta echo foxtrot\", \"confidence\": 0.6}",
        );
        llm.queue_text(
            "{\"text\": \"alpha bravo charlie delta echo golf\", \"confidence\": 0.6}",
        );
        llm.queue_text(
            "{\"text\": \"zulu yankee xray whiskey victor uniform\", \"confidence\": 0.5}",
        );
        llm.queue_text("{\"text\": \"reconciled final report\", \"confidence\": 0.7}");
        let budget = BudgetManager::new(Budget::default());

        let result = cross_validate(&llm, &make_task(), &make_draft("seed"), 3, &budget).await;

        assert_eq!(result.content, "reconciled final report");
        assert!((result.confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn test_candidate_count_is_clamped() {
        let llm = MockLlm::new();
        llm.queue_text("{\"text\": \"one two three four\", \"confidence\": 0.5}");
        llm.queue_text("{\"text\": \"one two three five\", \"confidence\": 0.5}");
        llm.queue_text("{\"text\": \"merged\", \"confidence\": 0.6}");
        let budget = BudgetManager::new(Budget::default());

        // Requesting one candidate still generates the minimum of two.
        let result = cross_validate(&llm, &make_task(), &make_draft("seed"), 1, &budget).await;

        assert_eq!(result.content, "merged");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_too_few_candidates_keeps_draft() {
        let llm = MockLlm::new();
        llm.queue_error(LlmError::AuthFailed {
            provider: "mock".to_string(),
        });
        llm.queue_error(LlmError::AuthFailed {
            provider: "mock".to_string(),
        });
        llm.queue_text("{\"text\": \"lone survivor\", \"confidence\": 0.6}");
        let budget = BudgetManager::new(Budget::default());

        let result = cross_validate(&llm, &make_task(), &make_draft("seed"), 3, &budget).await;

        // Two of three candidates failed; no reconcile call happens.
        assert_eq!(result.content, "seed");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_failure_keeps_draft() {
        let llm = MockLlm::new();
        llm.queue_text("{\"text\": \"alpha bravo charlie\", \"confidence\": 0.5}");
        llm.queue_text("{\"text\": \"alpha bravo delta\", \"confidence\": 0.5}");
        llm.queue_error(LlmError::ProviderDown {
            message: "503".to_string(),
        });
        let budget = BudgetManager::new(Budget::default());

        let result = cross_validate(&llm, &make_task(), &make_draft("seed"), 2, &budget).await;
        assert_eq!(result.content, "seed");
    }
}
