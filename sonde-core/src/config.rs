//! Configuration system for sonde.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment. Configuration is loaded from
//! `~/.config/sonde/config.toml` and/or `.sonde/config.toml` in the
//! workspace directory, with `SONDE_`-prefixed environment variables on
//! top (e.g. `SONDE_REFINEMENT__MAX_ITERATIONS=3`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::refine::StrategyKind;

/// Top-level configuration for the research engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub refinement: RefinementConfig,
    pub budget: BudgetConfig,
    pub report: ReportConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub session: SessionConfig,
}

/// Configuration for the round-based research pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum query/search/synthesize rounds per task.
    pub max_rounds: usize,
    /// Concurrent search requests per round.
    pub max_parallel_searches: usize,
    /// Concurrent section synthesis calls per round.
    pub max_parallel_section_synthesis: usize,
    /// Queries generated per round (upper bound handed to the model).
    pub max_queries_per_round: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_parallel_searches: 5,
            max_parallel_section_synthesis: 4,
            max_queries_per_round: 6,
        }
    }
}

/// Configuration for the refinement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Hard cap on refinement iterations.
    pub max_iterations: usize,
    /// Jaccard similarity above which two consecutive drafts count as
    /// converged.
    pub convergence_threshold: f32,
    /// Similarity between iteration n and n-2 above which the loop is
    /// flagged as oscillating.
    pub oscillation_threshold: f32,
    /// Confidence above which refinement stops early.
    pub quality_target: f32,
    /// Candidate drafts generated by the cross-validation strategy.
    pub cross_validation_candidates: usize,
    /// Force a specific strategy instead of automatic selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_strategy: Option<StrategyKind>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            convergence_threshold: 0.95,
            oscillation_threshold: 0.9,
            quality_target: 0.95,
            cross_validation_candidates: 3,
            forced_strategy: None,
        }
    }
}

/// Resource budget for one research task. Zero means unlimited for that
/// dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum total tokens (input + output) per task.
    pub tokens_limit: u64,
    /// Maximum wall-clock seconds per task.
    pub max_wall_clock_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            tokens_limit: 200_000,
            max_wall_clock_secs: 300,
        }
    }
}

/// Configuration for report assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Hard cap on assembled draft length in characters. Sized to a
    /// fraction of the model context window so the refinement prompts
    /// still fit.
    pub max_total_chars: usize,
    /// Per-result cap for raw search content carried into the detailed
    /// context block.
    pub max_chars_per_result: usize,
    /// Source URLs preserved per result in the detailed context block.
    pub max_sources_per_result: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_total_chars: 24_000,
            max_chars_per_result: 1_200,
            max_sources_per_result: 3,
        }
    }
}

/// LLM gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Context window size for the model.
    pub context_window: usize,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Retries for transient failures on top of the first attempt.
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 2048,
            temperature: 0.3,
            context_window: 128_000,
            timeout_secs: 60,
            max_retries: 2,
        }
    }
}

/// Search gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Provider name: "duckduckgo", "mock".
    pub provider: String,
    /// Per-query timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum hits requested per query.
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "duckduckgo".to_string(),
            timeout_secs: 30,
            max_results: 5,
        }
    }
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Whether finished tasks are persisted to disk.
    pub enabled: bool,
    /// Override for the session directory. Defaults to `sessions`
    /// under the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl EngineConfig {
    /// Validate the config and return any warnings.
    ///
    /// Returns human-readable warning messages for problematic values;
    /// an empty Vec means the config is usable as-is.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_rounds == 0 {
            warnings.push("pipeline.max_rounds is 0; the report will contain no research".into());
        }
        if self.pipeline.max_parallel_searches == 0 {
            warnings.push("pipeline.max_parallel_searches is 0; no searches will run".into());
        }
        if !(0.0..=1.0).contains(&self.refinement.convergence_threshold) {
            warnings.push(format!(
                "refinement.convergence_threshold ({}) is outside 0.0..=1.0",
                self.refinement.convergence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.refinement.oscillation_threshold) {
            warnings.push(format!(
                "refinement.oscillation_threshold ({}) is outside 0.0..=1.0",
                self.refinement.oscillation_threshold
            ));
        }
        if self.refinement.quality_target > 1.0 {
            warnings.push(format!(
                "refinement.quality_target ({}) exceeds 1.0 and can never be reached",
                self.refinement.quality_target
            ));
        }
        if !(2..=4).contains(&self.refinement.cross_validation_candidates) {
            warnings.push(format!(
                "refinement.cross_validation_candidates ({}) will be clamped to 2..=4",
                self.refinement.cross_validation_candidates
            ));
        }
        if self.report.max_chars_per_result > self.report.max_total_chars {
            warnings.push(format!(
                "report.max_chars_per_result ({}) exceeds report.max_total_chars ({})",
                self.report.max_chars_per_result, self.report.max_total_chars
            ));
        }
        if self.llm.max_tokens >= self.llm.context_window {
            warnings.push(format!(
                "llm.max_tokens ({}) >= llm.context_window ({}); responses may be truncated",
                self.llm.max_tokens, self.llm.context_window
            ));
        }
        if self.llm.temperature < 0.0 || self.llm.temperature > 2.0 {
            warnings.push(format!(
                "llm.temperature ({}) is outside the typical range 0.0-2.0",
                self.llm.temperature
            ));
        }

        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `SONDE_`)
/// 3. Workspace-local config (`.sonde/config.toml`)
/// 4. User config (`~/.config/sonde/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sonde", "sonde") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".sonde").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (SONDE_LLM__MODEL, SONDE_PIPELINE__MAX_ROUNDS, ...)
    figment = figment.merge(Env::prefixed("SONDE_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any sonde configuration file exists (user-level or
/// workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sonde", "sonde") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }

    if let Some(ws) = workspace {
        if ws.join(".sonde").join("config.toml").exists() {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.pipeline.max_rounds, 3);
        assert_eq!(config.pipeline.max_parallel_searches, 5);
        assert_eq!(config.refinement.max_iterations, 5);
        assert!((config.refinement.convergence_threshold - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.budget.tokens_limit, 200_000);
        assert_eq!(config.report.max_sources_per_result, 3);
        assert_eq!(config.search.provider, "duckduckgo");
        assert!(config.session.enabled);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.llm.model, config.llm.model);
        assert_eq!(
            deserialized.refinement.max_iterations,
            config.refinement.max_iterations
        );
        assert_eq!(
            deserialized.report.max_total_chars,
            config.report.max_total_chars
        );
    }

    #[test]
    fn test_validate_defaults_clean() {
        let warnings = EngineConfig::default().validate();
        assert!(
            warnings.is_empty(),
            "Default EngineConfig should have no warnings, got: {:?}",
            warnings
        );
    }

    #[test]
    fn test_validate_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.refinement.convergence_threshold = 1.5;
        config.refinement.quality_target = 1.2;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("convergence_threshold"));
        assert!(warnings[1].contains("quality_target"));
    }

    #[test]
    fn test_validate_zero_rounds() {
        let mut config = EngineConfig::default();
        config.pipeline.max_rounds = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_rounds"));
    }

    #[test]
    fn test_validate_candidate_clamp_warning() {
        let mut config = EngineConfig::default();
        config.refinement.cross_validation_candidates = 9;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("clamped"));
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.pipeline.max_rounds, 3);
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = EngineConfig::default();
        overrides.llm.model = "gpt-4o".to_string();
        overrides.refinement.max_iterations = 2;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.refinement.max_iterations, 2);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let sonde_dir = dir.path().join(".sonde");
        std::fs::create_dir_all(&sonde_dir).unwrap();
        std::fs::write(
            sonde_dir.join("config.toml"),
            r#"
[pipeline]
max_rounds = 5
max_parallel_searches = 2
max_parallel_section_synthesis = 2
max_queries_per_round = 4

[refinement]
max_iterations = 3
convergence_threshold = 0.9
oscillation_threshold = 0.8
quality_target = 0.9
cross_validation_candidates = 2
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.pipeline.max_rounds, 5);
        assert_eq!(config.refinement.max_iterations, 3);
        // Sections absent from the file keep their defaults.
        assert_eq!(config.budget.tokens_limit, 200_000);
        assert_eq!(config.search.provider, "duckduckgo");
    }

    #[test]
    fn test_forced_strategy_toml() {
        let toml_str = r#"
[refinement]
max_iterations = 5
convergence_threshold = 0.95
oscillation_threshold = 0.9
quality_target = 0.95
cross_validation_candidates = 3
forced_strategy = "multi_pass"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.refinement.forced_strategy,
            Some(StrategyKind::MultiPass)
        );
    }
}
