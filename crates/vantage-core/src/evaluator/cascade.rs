//! The tiered evaluation cascade.
//!
//! Scoring tiers run in fixed order (heuristics, verification, critic). After
//! each tier the cascade either advances or halts; a halted cascade leaves
//! later tiers absent from the result rather than zero. The human-review
//! flag is decided last, even after a halt.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use vantage_state::{Candidate, EvaluationResult, Tier, TierOutcome};

use crate::backend::GenerationBackend;
use crate::config::{EvolutionConfig, TierWeights};
use crate::error::EvalError;
use crate::evaluator::critic::{Critic, CriticTier, LlmCritic};
use crate::evaluator::heuristics::HeuristicTier;
use crate::evaluator::verification::{BehaviorOracle, CommandOracle, MarkerOracle, VerificationTier};
use crate::evaluator::Evaluator;

/// Cascade policy, lifted out of `EvolutionConfig`.
#[derive(Debug, Clone)]
pub struct CascadePolicy {
    pub enable_verification: bool,
    pub enable_critic: bool,
    pub enable_review: bool,
    pub stop_on_fail: [bool; 3],
    pub review_on_fail: [bool; 3],
    pub require_human_review: bool,
    pub weights: TierWeights,
}

impl CascadePolicy {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            enable_verification: config.enable_tier2,
            enable_critic: config.enable_tier3,
            enable_review: config.enable_tier4,
            stop_on_fail: Tier::SCORED.map(|t| config.stop_on_fail(t)),
            review_on_fail: Tier::SCORED.map(|t| config.review_on_fail(t)),
            require_human_review: config.require_human_review,
            weights: config.tier_weights,
        }
    }

    fn enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Heuristics => true,
            Tier::Verification => self.enable_verification,
            Tier::Critic => self.enable_critic,
            Tier::HumanReview => self.enable_review,
        }
    }

    fn index(tier: Tier) -> usize {
        usize::from(tier.number() - 1)
    }
}

impl Default for CascadePolicy {
    fn default() -> Self {
        Self::from_config(&EvolutionConfig::default())
    }
}

/// Where the cascade is after a tier has been handled.
enum Step {
    Advance,
    Halt,
}

/// Runs a candidate through the scoring tiers.
#[derive(Clone)]
pub struct EvaluatorCascade {
    policy: CascadePolicy,
    heuristics: HeuristicTier,
    verification: VerificationTier,
    critic: CriticTier,
}

impl EvaluatorCascade {
    pub fn new(
        policy: CascadePolicy,
        oracle: Arc<dyn BehaviorOracle>,
        critic: Arc<dyn Critic>,
        critic_pass_threshold: f64,
    ) -> Self {
        Self {
            policy,
            heuristics: HeuristicTier,
            verification: VerificationTier::new(oracle),
            critic: CriticTier::new(critic, critic_pass_threshold),
        }
    }

    /// Build the cascade a config describes: a command oracle when
    /// `verification_command` is set (marker oracle otherwise) and an LLM
    /// critic on `backend`.
    pub fn from_config(config: &EvolutionConfig, backend: Arc<dyn GenerationBackend>) -> Self {
        let oracle: Arc<dyn BehaviorOracle> = match &config.verification_command {
            Some(cmd) => Arc::new(CommandOracle::new(cmd.clone(), config.verification_timeout())),
            None => Arc::new(MarkerOracle::new(config.verification_failure_markers.clone())),
        };
        let critic = Arc::new(LlmCritic::new(
            backend,
            config.llm_critic.clone(),
            config.backend_timeout(),
        ));
        Self::new(
            CascadePolicy::from_config(config),
            oracle,
            critic,
            config.critic_pass_threshold,
        )
    }

    pub fn policy(&self) -> &CascadePolicy {
        &self.policy
    }

    async fn run_tier(&self, tier: Tier, candidate: &Candidate) -> TierOutcome {
        if !self.policy.enabled(tier) {
            return TierOutcome::skipped("tier disabled");
        }
        match tier {
            Tier::Heuristics => self.heuristics.check(&candidate.payload),
            Tier::Verification => self.verification.run(candidate).await,
            Tier::Critic => self.critic.run(candidate).await,
            Tier::HumanReview => TierOutcome::skipped("review tier does not score"),
        }
    }

    fn after(&self, tier: Tier, outcome: &TierOutcome) -> Step {
        if outcome.is_failure() && self.policy.stop_on_fail[CascadePolicy::index(tier)] {
            Step::Halt
        } else {
            Step::Advance
        }
    }

    fn review_reasons(
        &self,
        explicit: bool,
        tiers: &BTreeMap<Tier, TierOutcome>,
    ) -> Vec<String> {
        let mut reasons = Vec::new();
        if explicit {
            reasons.push("review requested".to_string());
        }
        if !self.policy.enabled(Tier::HumanReview) {
            return reasons;
        }
        if self.policy.require_human_review {
            reasons.push("review required by configuration".to_string());
        }
        for (tier, outcome) in tiers {
            if outcome.is_failure() && self.policy.review_on_fail[CascadePolicy::index(*tier)] {
                reasons.push(format!("{tier} failed: {}", outcome.detail()));
            }
        }
        reasons
    }
}

/// Weighted sum of tier scores, absent or skipped tiers contributing 0.
/// Halved when verification ran and failed; rounded to 3 decimals.
pub fn compose_fitness(tiers: &BTreeMap<Tier, TierOutcome>, weights: &TierWeights) -> f64 {
    let mut total: f64 = Tier::SCORED
        .iter()
        .map(|t| weights.weight(*t) * tiers.get(t).and_then(TierOutcome::score).unwrap_or(0.0))
        .sum();
    if tiers
        .get(&Tier::Verification)
        .map(TierOutcome::is_failure)
        .unwrap_or(false)
    {
        total /= 2.0;
    }
    ((total * 1000.0).round() / 1000.0).clamp(0.0, 1.0)
}

#[async_trait]
impl Evaluator for EvaluatorCascade {
    async fn evaluate(
        &self,
        candidate: &Candidate,
        require_human_review: bool,
    ) -> Result<EvaluationResult, EvalError> {
        if candidate.id.as_str().trim().is_empty() {
            return Err(EvalError::InvalidCandidate("candidate id is empty".into()));
        }
        if candidate.payload.trim().is_empty() {
            return Err(EvalError::InvalidCandidate(format!(
                "candidate {} has an empty payload",
                candidate.id
            )));
        }

        let mut tiers = BTreeMap::new();
        let mut halted_at = None;
        for tier in Tier::SCORED {
            let outcome = self.run_tier(tier, candidate).await;
            debug!(
                candidate = %candidate.id.short(),
                tier = %tier,
                score = ?outcome.score(),
                passed = ?outcome.passed(),
                "tier finished"
            );
            let step = self.after(tier, &outcome);
            tiers.insert(tier, outcome);
            if let Step::Halt = step {
                halted_at = Some(tier);
                break;
            }
        }

        let reasons = self.review_reasons(require_human_review, &tiers);
        let final_fitness_score = compose_fitness(&tiers, &self.policy.weights);

        Ok(EvaluationResult {
            candidate_id: candidate.id.clone(),
            generation: candidate.generation,
            payload_digest: candidate.payload_digest(),
            tiers,
            final_fitness_score,
            requires_human_review: !reasons.is_empty(),
            review_reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
            halted_at,
            evaluated_at: Utc::now(),
        })
    }
}
