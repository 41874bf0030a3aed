//! Draft convergence and oscillation detection.
//!
//! Refinement iterations can settle (each revision nearly identical to the
//! last) or ping-pong between two phrasings. Both are detected from token-set
//! Jaccard similarity over the draft history: convergence compares the two
//! most recent drafts, oscillation compares each draft to the one two
//! iterations back.

use std::collections::HashSet;

use crate::config::RefinementConfig;

/// Tracks draft history and detects convergence or oscillation.
pub struct ConvergenceDetector {
    convergence_threshold: f32,
    oscillation_threshold: f32,
    history: Vec<HashSet<String>>,
}

impl ConvergenceDetector {
    pub fn new(convergence_threshold: f32, oscillation_threshold: f32) -> Self {
        Self {
            convergence_threshold,
            oscillation_threshold,
            history: Vec::new(),
        }
    }

    pub fn from_config(config: &RefinementConfig) -> Self {
        Self::new(config.convergence_threshold, config.oscillation_threshold)
    }

    /// Record a draft produced by the latest iteration.
    pub fn add_iteration(&mut self, content: &str) {
        self.history.push(tokenize(content));
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Similarity between the two most recent drafts, if at least two exist.
    pub fn latest_similarity(&self) -> Option<f32> {
        let n = self.history.len();
        if n < 2 {
            return None;
        }
        Some(jaccard_similarity(&self.history[n - 1], &self.history[n - 2]))
    }

    /// True when the last two drafts are nearly identical.
    pub fn is_converged(&self) -> bool {
        match self.latest_similarity() {
            Some(similarity) => similarity > self.convergence_threshold,
            None => false,
        }
    }

    /// True when the latest draft closely matches the draft from two
    /// iterations back. Requires at least four drafts so a genuine A-B-A-B
    /// pattern has formed rather than a single revisit.
    pub fn is_oscillating(&self) -> bool {
        let n = self.history.len();
        if n < 4 {
            return false;
        }
        jaccard_similarity(&self.history[n - 1], &self.history[n - 3]) > self.oscillation_threshold
    }
}

/// Split text into a set of lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// Jaccard similarity between two token sets. Two empty sets count as
/// identical.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.union(b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_with_tokens(shared: usize, unique_prefix: &str, unique: usize) -> String {
        let mut words: Vec<String> = (0..shared).map(|i| format!("common{i}")).collect();
        words.extend((0..unique).map(|i| format!("{unique_prefix}{i}")));
        words.join(" ")
    }

    #[test]
    fn test_tokenize_normalizes() {
        let tokens = tokenize("Rust is FAST! (Really, fast.)");
        assert!(tokens.contains("rust"));
        assert!(tokens.contains("fast"));
        assert!(tokens.contains("really"));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        let a = tokenize("hello world");
        let b = tokenize("hello world");
        let c = tokenize("foo bar");

        assert!((jaccard_similarity(&a, &b) - 1.0).abs() < f32::EPSILON);
        assert!(jaccard_similarity(&a, &c).abs() < f32::EPSILON);
        assert!((jaccard_similarity(&a, &a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_jaccard_empty_sets() {
        let empty = HashSet::new();
        let full = tokenize("some words");
        assert!((jaccard_similarity(&empty, &empty) - 1.0).abs() < f32::EPSILON);
        assert!(jaccard_similarity(&empty, &full).abs() < f32::EPSILON);
    }

    #[test]
    fn test_converges_on_near_identical_drafts() {
        let mut detector = ConvergenceDetector::new(0.95, 0.9);

        // 97 shared tokens, 1 + 2 unique: similarity 97/100 = 0.97.
        detector.add_iteration(&draft_with_tokens(97, "alpha", 1));
        detector.add_iteration(&draft_with_tokens(97, "beta", 2));

        let similarity = detector.latest_similarity().unwrap();
        assert!((similarity - 0.97).abs() < 0.001);
        assert!(detector.is_converged());
    }

    #[test]
    fn test_no_convergence_on_distinct_drafts() {
        let mut detector = ConvergenceDetector::new(0.95, 0.9);
        detector.add_iteration("the quick brown fox jumps over the lazy dog");
        detector.add_iteration("completely different content about rust async runtimes");
        assert!(!detector.is_converged());
    }

    #[test]
    fn test_single_draft_never_converged() {
        let mut detector = ConvergenceDetector::new(0.95, 0.9);
        detector.add_iteration("only one draft so far");
        assert!(!detector.is_converged());
        assert!(detector.latest_similarity().is_none());
    }

    #[test]
    fn test_oscillation_detected_after_four_drafts() {
        let mut detector = ConvergenceDetector::new(0.95, 0.9);
        let a = "version alpha talks about memory safety and borrow checking";
        let b = "version beta covers async executors and task scheduling instead";

        detector.add_iteration(a);
        detector.add_iteration(b);
        detector.add_iteration(a);
        assert!(!detector.is_oscillating());

        detector.add_iteration(b);
        assert!(detector.is_oscillating());
        // The flip-flop is not convergence: consecutive drafts stay distinct.
        assert!(!detector.is_converged());
    }

    #[test]
    fn test_steady_progress_is_not_oscillation() {
        let mut detector = ConvergenceDetector::new(0.95, 0.9);
        detector.add_iteration(&draft_with_tokens(10, "a", 10));
        detector.add_iteration(&draft_with_tokens(10, "b", 10));
        detector.add_iteration(&draft_with_tokens(10, "c", 10));
        detector.add_iteration(&draft_with_tokens(10, "d", 10));
        assert!(!detector.is_oscillating());
    }

    #[test]
    fn test_from_config_uses_thresholds() {
        let config = RefinementConfig {
            convergence_threshold: 0.5,
            ..Default::default()
        };
        let mut detector = ConvergenceDetector::from_config(&config);
        detector.add_iteration(&draft_with_tokens(6, "x", 4));
        detector.add_iteration(&draft_with_tokens(6, "y", 4));
        // 6/14 ~= 0.43, below the lowered threshold.
        assert!(!detector.is_converged());
        detector.add_iteration(&draft_with_tokens(9, "z", 1));
        detector.add_iteration(&draft_with_tokens(9, "w", 1));
        // 9/11 ~= 0.82, above 0.5.
        assert!(detector.is_converged());
    }
}
