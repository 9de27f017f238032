//! Candidate evaluation.
//!
//! - `heuristics`: Tier 1 static checks
//! - `verification`: Tier 2 behavioral oracle
//! - `critic`: Tier 3 external critic
//! - `cascade`: ordering, early exit, review flag and fitness composition

pub mod cascade;
pub mod critic;
pub mod heuristics;
pub mod verification;

use async_trait::async_trait;
use vantage_state::{Candidate, EvaluationResult};

use crate::error::EvalError;

pub use cascade::{compose_fitness, CascadePolicy, EvaluatorCascade};
pub use critic::{Critic, CriticTier, CriticVerdict, LlmCritic};
pub use heuristics::HeuristicTier;
pub use verification::{BehaviorOracle, CommandOracle, MarkerOracle, VerificationTier};

/// Turns a candidate into exactly one `EvaluationResult`.
///
/// Tier failures are data, not errors: the only `Err` is a candidate that
/// cannot be evaluated at all.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        candidate: &Candidate,
        require_human_review: bool,
    ) -> Result<EvaluationResult, EvalError>;
}
