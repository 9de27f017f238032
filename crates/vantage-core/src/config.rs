//! Run configuration.
//!
//! `EvolutionConfig` is resolved once before a run starts and is read-only
//! afterwards. Files are parsed by extension: `.yaml`/`.yml` as YAML, `.toml`
//! as TOML, anything else as JSON. Unknown keys are ignored so older config
//! files keep loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vantage_state::Tier;

use crate::error::ConfigError;
use crate::proposer::{MutationStrategies, StrategyClass};

/// Weights applied to the three scoring tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    pub heuristics: f64,
    pub verification: f64,
    pub critic: f64,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            heuristics: 0.2,
            verification: 0.3,
            critic: 0.5,
        }
    }
}

impl TierWeights {
    pub fn weight(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Heuristics => self.heuristics,
            Tier::Verification => self.verification,
            Tier::Critic => self.critic,
            Tier::HumanReview => 0.0,
        }
    }

    pub fn sum(&self) -> f64 {
        self.heuristics + self.verification + self.critic
    }
}

fn default_seed_prompts() -> Vec<String> {
    vec![
        "Create a function that adds two numbers".to_string(),
        "Write a class for a basic calculator".to_string(),
    ]
}

fn default_mutation_strategies() -> MutationStrategies {
    let mut strategies = MutationStrategies::new();
    strategies.insert(
        StrategyClass::Breadth,
        vec![
            "Slightly modify existing code".to_string(),
            "Combine two existing functions".to_string(),
        ],
    );
    strategies.insert(
        StrategyClass::Depth,
        vec!["Refine for correctness and readability".to_string()],
    );
    strategies
}

/// Resolved parameters for one evolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub max_iterations: u64,
    #[serde(rename = "candidate_generation_N", alias = "candidate_generation_n")]
    pub candidate_generation_n: usize,
    pub top_k_selection: usize,
    pub pro_refinement_count: usize,

    pub enable_tier2: bool,
    pub enable_tier3: bool,
    pub enable_tier4: bool,
    pub stop_eval_on_tier1_fail: bool,
    pub stop_eval_on_tier2_fail: bool,
    pub stop_eval_on_tier3_fail: bool,
    pub review_on_tier1_fail: bool,
    pub review_on_tier2_fail: bool,
    pub review_on_tier3_fail: bool,
    pub require_human_review: bool,

    pub tier_weights: TierWeights,
    pub critic_pass_threshold: f64,

    pub llm_proposer_breadth: String,
    pub llm_proposer_depth: String,
    pub llm_critic: String,
    pub backend_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub max_concurrent_evaluations: usize,

    pub convergence_threshold: Option<f64>,
    pub token_budget: Option<u64>,

    pub audit_log_path: PathBuf,
    pub program_db_path: Option<PathBuf>,

    pub seed_prompts: Vec<String>,
    pub mutation_strategies: MutationStrategies,
    pub elite_seed_count: usize,

    pub verification_command: Option<Vec<String>>,
    pub verification_failure_markers: Vec<String>,
    pub verification_timeout_secs: u64,

    pub persistence_retries: u32,
    pub abort_on_persistence_failure: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            candidate_generation_n: 10,
            top_k_selection: 3,
            pro_refinement_count: 2,
            enable_tier2: true,
            enable_tier3: true,
            enable_tier4: true,
            stop_eval_on_tier1_fail: false,
            stop_eval_on_tier2_fail: false,
            stop_eval_on_tier3_fail: false,
            review_on_tier1_fail: false,
            review_on_tier2_fail: false,
            review_on_tier3_fail: false,
            require_human_review: false,
            tier_weights: TierWeights::default(),
            critic_pass_threshold: 0.5,
            llm_proposer_breadth: "gpt-4o-mini".to_string(),
            llm_proposer_depth: "gpt-4o".to_string(),
            llm_critic: "gpt-4o".to_string(),
            backend_timeout_secs: 60,
            max_concurrent_requests: 4,
            max_concurrent_evaluations: 8,
            convergence_threshold: None,
            token_budget: None,
            audit_log_path: PathBuf::from("data/score_registry.jsonl"),
            program_db_path: None,
            seed_prompts: default_seed_prompts(),
            mutation_strategies: default_mutation_strategies(),
            elite_seed_count: 0,
            verification_command: None,
            verification_failure_markers: vec!["error".to_string()],
            verification_timeout_secs: 30,
            persistence_retries: 2,
            abort_on_persistence_failure: false,
        }
    }
}

/// Document formats accepted by [`EvolutionConfig::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

impl EvolutionConfig {
    /// Read and parse a config file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, ConfigFormat::from_path(path)).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse a config document from a string.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let parse_err = |reason: String| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason,
        };
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string())),
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| parse_err(e.to_string())),
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))
            }
        }
    }

    /// Check every constraint a run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations < 1 {
            return Err(ConfigError::invalid("max_iterations", "must be at least 1"));
        }
        if self.candidate_generation_n < 1 {
            return Err(ConfigError::invalid(
                "candidate_generation_N",
                "must be at least 1",
            ));
        }

        for (field, w) in [
            ("tier_weights.heuristics", self.tier_weights.heuristics),
            ("tier_weights.verification", self.tier_weights.verification),
            ("tier_weights.critic", self.tier_weights.critic),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(field, format!("must be >= 0, got {w}")));
            }
        }
        if self.tier_weights.sum() > 1.0 + 1e-9 {
            return Err(ConfigError::invalid(
                "tier_weights",
                format!("weights sum to {:.3}, must not exceed 1", self.tier_weights.sum()),
            ));
        }
        if !(0.0..=1.0).contains(&self.critic_pass_threshold) {
            return Err(ConfigError::invalid(
                "critic_pass_threshold",
                "must be within [0, 1]",
            ));
        }

        if self.backend_timeout_secs == 0 {
            return Err(ConfigError::invalid("backend_timeout_secs", "must be at least 1"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_requests",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_evaluations == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_evaluations",
                "must be at least 1",
            ));
        }
        if let Some(t) = self.convergence_threshold {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::invalid("convergence_threshold", "must be >= 0"));
            }
        }

        if self.seed_prompts.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::invalid("seed_prompts", "must not be empty"));
        }
        if self.strategies(StrategyClass::Breadth).is_empty() {
            return Err(ConfigError::invalid(
                "mutation_strategies.breadth",
                "at least one breadth strategy is required",
            ));
        }

        for (field, model) in [
            ("llm_proposer_breadth", &self.llm_proposer_breadth),
            ("llm_proposer_depth", &self.llm_proposer_depth),
            ("llm_critic", &self.llm_critic),
        ] {
            if model.trim().is_empty() {
                return Err(ConfigError::invalid(field, "model name must not be empty"));
            }
        }

        if let Some(cmd) = &self.verification_command {
            if cmd.first().map(|c| c.trim().is_empty()).unwrap_or(true) {
                return Err(ConfigError::invalid(
                    "verification_command",
                    "must name an executable",
                ));
            }
            if self.verification_timeout_secs == 0 {
                return Err(ConfigError::invalid(
                    "verification_timeout_secs",
                    "must be at least 1",
                ));
            }
        }

        Ok(())
    }

    pub fn strategies(&self, class: StrategyClass) -> &[String] {
        self.mutation_strategies
            .get(&class)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a scoring tier runs. Tier 1 always does.
    pub fn tier_enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Heuristics => true,
            Tier::Verification => self.enable_tier2,
            Tier::Critic => self.enable_tier3,
            Tier::HumanReview => self.enable_tier4,
        }
    }

    pub fn stop_on_fail(&self, tier: Tier) -> bool {
        match tier {
            Tier::Heuristics => self.stop_eval_on_tier1_fail,
            Tier::Verification => self.stop_eval_on_tier2_fail,
            Tier::Critic => self.stop_eval_on_tier3_fail,
            Tier::HumanReview => false,
        }
    }

    pub fn review_on_fail(&self, tier: Tier) -> bool {
        match tier {
            Tier::Heuristics => self.review_on_tier1_fail,
            Tier::Verification => self.review_on_tier2_fail,
            Tier::Critic => self.review_on_tier3_fail,
            Tier::HumanReview => false,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EvolutionConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.candidate_generation_n, 10);
        assert_eq!(config.top_k_selection, 3);
        assert_eq!(config.tier_weights, TierWeights::default());
    }

    #[test]
    fn yaml_uses_original_key_names_and_ignores_unknown() {
        let yaml = r#"
max_iterations: 2
candidate_generation_N: 5
top_k_selection: 2
stop_eval_on_tier1_fail: true
program_db_config:
  backend: memory
tier_weights:
  critic: 0.4
"#;
        let config = EvolutionConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.candidate_generation_n, 5);
        assert_eq!(config.top_k_selection, 2);
        assert!(config.stop_eval_on_tier1_fail);
        assert_eq!(config.tier_weights.critic, 0.4);
        assert_eq!(config.tier_weights.heuristics, 0.2);
        assert_eq!(config.llm_critic, "gpt-4o");
    }

    #[test]
    fn toml_and_json_parse() {
        let toml = "max_iterations = 3\nenable_tier3 = false\n";
        let config = EvolutionConfig::parse(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert!(!config.enable_tier3);

        let json = r#"{"top_k_selection": 0, "token_budget": 500,
                       "mutation_strategies": {"breadth": ["mutate"]}}"#;
        let config = EvolutionConfig::parse(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.top_k_selection, 0);
        assert_eq!(config.token_budget, Some(500));
        assert_eq!(config.strategies(StrategyClass::Breadth), ["mutate"]);
        assert!(config.strategies(StrategyClass::Depth).is_empty());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.YML")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.conf")), ConfigFormat::Json);
    }

    fn expect_invalid(field: &str, mutate: impl FnOnce(&mut EvolutionConfig)) {
        let mut config = EvolutionConfig::default();
        mutate(&mut config);
        match config.validate() {
            Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected invalid {field}, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_bad_fields() {
        expect_invalid("max_iterations", |c| c.max_iterations = 0);
        expect_invalid("candidate_generation_N", |c| c.candidate_generation_n = 0);
        expect_invalid("tier_weights", |c| c.tier_weights.critic = 0.9);
        expect_invalid("tier_weights.heuristics", |c| c.tier_weights.heuristics = -0.1);
        expect_invalid("critic_pass_threshold", |c| c.critic_pass_threshold = 1.5);
        expect_invalid("seed_prompts", |c| c.seed_prompts.clear());
        expect_invalid("mutation_strategies.breadth", |c| {
            c.mutation_strategies.remove(&StrategyClass::Breadth);
        });
        expect_invalid("verification_command", |c| {
            c.verification_command = Some(vec![]);
        });
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EvolutionConfig::load("/nonexistent/vantage.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_names_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "max_iterations: [oops").unwrap();
        match EvolutionConfig::load(&path).unwrap_err() {
            ConfigError::Parse { path: p, .. } => assert!(p.ends_with("bad.yaml")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
