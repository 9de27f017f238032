//! Candidate generation.
//!
//! `ProposerEnsemble` runs two passes against generation backends:
//! - breadth: one call per (seed, breadth strategy) pair on a fast model
//! - depth: one refinement call per (selected breadth output, depth strategy)
//!   pair on a slower model
//!
//! Calls within a pass run concurrently, bounded by a semaphore, each under
//! its own timeout. A failed call is logged and skipped; it never aborts the
//! batch. Output order follows the call plan, not completion order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};
use vantage_state::{Candidate, CandidateId};

use crate::backend::{call_with_timeout, CompletionRequest, GenerationBackend};
use crate::config::EvolutionConfig;
use crate::error::{BackendError, ProposeError};
use crate::metrics::METRICS;
use crate::obs;

const BREADTH_SYSTEM_PROMPT: &str =
    "You generate candidate solutions. Reply with the artifact only, no commentary.";
const DEPTH_SYSTEM_PROMPT: &str =
    "You refine candidate solutions for correctness and quality. Reply with the improved artifact only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyClass {
    Breadth,
    Depth,
}

impl std::fmt::Display for StrategyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyClass::Breadth => write!(f, "breadth"),
            StrategyClass::Depth => write!(f, "depth"),
        }
    }
}

/// Strategy names keyed by the pass they belong to.
pub type MutationStrategies = BTreeMap<StrategyClass, Vec<String>>;

/// A prompt to generate from, optionally derived from an existing candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub prompt: String,
    pub parent_id: Option<CandidateId>,
}

impl Seed {
    /// Seed that refines an existing candidate's payload.
    pub fn refine(payload: impl Into<String>, parent_id: CandidateId) -> Self {
        Self {
            prompt: payload.into(),
            parent_id: Some(parent_id),
        }
    }
}

impl From<&str> for Seed {
    fn from(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            parent_id: None,
        }
    }
}

impl From<String> for Seed {
    fn from(prompt: String) -> Self {
        Self {
            prompt,
            parent_id: None,
        }
    }
}

/// Produces a batch of candidates for one iteration.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// At most `n` candidates; fewer is a normal outcome.
    async fn generate_candidates(
        &self,
        seeds: &[Seed],
        strategies: &MutationStrategies,
        n: usize,
        generation: u64,
    ) -> Result<Vec<Candidate>, ProposeError>;
}

#[derive(Debug, Clone)]
pub struct ProposerSettings {
    pub breadth_model: String,
    pub depth_model: String,
    pub pro_refinement_count: usize,
    pub max_concurrent_requests: usize,
    pub timeout: Duration,
}

impl ProposerSettings {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            breadth_model: config.llm_proposer_breadth.clone(),
            depth_model: config.llm_proposer_depth.clone(),
            pro_refinement_count: config.pro_refinement_count,
            max_concurrent_requests: config.max_concurrent_requests,
            timeout: config.backend_timeout(),
        }
    }
}

/// One planned backend call.
#[derive(Debug, Clone)]
struct PlannedCall {
    stage: StrategyClass,
    model: String,
    system: &'static str,
    prompt: String,
    strategy: String,
    parent_id: Option<CandidateId>,
}

/// Breadth/depth proposer over generation backends.
pub struct ProposerEnsemble {
    breadth: Arc<dyn GenerationBackend>,
    depth: Arc<dyn GenerationBackend>,
    settings: ProposerSettings,
    permits: Arc<Semaphore>,
}

impl ProposerEnsemble {
    /// Both passes share one backend; models differ per pass.
    pub fn new(backend: Arc<dyn GenerationBackend>, settings: ProposerSettings) -> Self {
        Self::with_backends(backend.clone(), backend, settings)
    }

    pub fn with_backends(
        breadth: Arc<dyn GenerationBackend>,
        depth: Arc<dyn GenerationBackend>,
        settings: ProposerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1)));
        Self {
            breadth,
            depth,
            settings,
            permits,
        }
    }

    fn breadth_plan(
        &self,
        seeds: &[Seed],
        strategies: &[String],
        n: usize,
    ) -> Vec<PlannedCall> {
        seeds
            .iter()
            .filter(|s| !s.prompt.trim().is_empty())
            .flat_map(|seed| {
                strategies.iter().map(move |strategy| PlannedCall {
                    stage: StrategyClass::Breadth,
                    model: self.settings.breadth_model.clone(),
                    system: BREADTH_SYSTEM_PROMPT,
                    prompt: format!("Task:\n{}\n\nStrategy: {strategy}", seed.prompt),
                    strategy: strategy.clone(),
                    parent_id: seed.parent_id.clone(),
                })
            })
            .take(n)
            .collect()
    }

    fn depth_plan(&self, selected: &[Candidate], strategies: &[String]) -> Vec<PlannedCall> {
        selected
            .iter()
            .flat_map(|idea| {
                strategies.iter().map(move |strategy| PlannedCall {
                    stage: StrategyClass::Depth,
                    model: self.settings.depth_model.clone(),
                    system: DEPTH_SYSTEM_PROMPT,
                    prompt: format!(
                        "Refine this candidate.\nStrategy: {strategy}\n\n{}",
                        idea.payload
                    ),
                    strategy: strategy.clone(),
                    parent_id: Some(idea.id.clone()),
                })
            })
            .collect()
    }

    /// Execute a plan concurrently; results come back in plan order with
    /// failed calls dropped.
    async fn execute(&self, plan: Vec<PlannedCall>, generation: u64) -> Vec<Candidate> {
        let mut tasks = Vec::with_capacity(plan.len());
        for call in plan {
            let backend = match call.stage {
                StrategyClass::Breadth => Arc::clone(&self.breadth),
                StrategyClass::Depth => Arc::clone(&self.depth),
            };
            let permits = Arc::clone(&self.permits);
            let timeout = self.settings.timeout;

            tasks.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let request = CompletionRequest::new(call.model.clone())
                    .system(call.system)
                    .user(call.prompt.clone());
                let result = call_with_timeout(backend.as_ref(), request, timeout)
                    .await
                    .and_then(|c| {
                        if c.text.trim().is_empty() {
                            Err(BackendError::MalformedResponse("empty completion".into()))
                        } else {
                            Ok(c.text)
                        }
                    });
                (call, result)
            }));
        }

        let mut out = Vec::new();
        for task in tasks {
            let (call, result) = match task.await {
                Ok(pair) => pair,
                Err(e) => {
                    METRICS.inc_backend_failures();
                    tracing::warn!(error = %e, "generation task aborted");
                    continue;
                }
            };
            match result {
                Ok(text) => {
                    let mut candidate =
                        Candidate::new(text, generation).with_strategy(call.strategy);
                    candidate.parent_id = call.parent_id;
                    out.push(candidate);
                }
                Err(e) => {
                    METRICS.inc_backend_failures();
                    obs::emit_generation_failed(generation, &call.stage.to_string(), &call.model, &e);
                }
            }
        }
        out
    }
}

#[async_trait]
impl Proposer for ProposerEnsemble {
    #[instrument(skip_all, fields(generation = generation, n = n))]
    async fn generate_candidates(
        &self,
        seeds: &[Seed],
        strategies: &MutationStrategies,
        n: usize,
        generation: u64,
    ) -> Result<Vec<Candidate>, ProposeError> {
        if n == 0 {
            return Err(ProposeError::ZeroTarget);
        }
        if seeds.iter().all(|s| s.prompt.trim().is_empty()) {
            return Err(ProposeError::NoSeeds);
        }
        let breadth_strategies = strategies
            .get(&StrategyClass::Breadth)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if breadth_strategies.is_empty() {
            return Err(ProposeError::NoBreadthStrategies);
        }
        let depth_strategies = strategies
            .get(&StrategyClass::Depth)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let breadth_plan = self.breadth_plan(seeds, breadth_strategies, n);
        let planned_breadth = breadth_plan.len();
        let mut candidates = self.execute(breadth_plan, generation).await;

        let selected_len = self.settings.pro_refinement_count.min(candidates.len());
        let depth_plan = self.depth_plan(&candidates[..selected_len], depth_strategies);
        let planned_depth = depth_plan.len();
        let refined = self.execute(depth_plan, generation).await;

        debug!(
            breadth = candidates.len(),
            planned_breadth,
            depth = refined.len(),
            planned_depth,
            "proposer passes finished"
        );

        candidates.extend(refined);
        candidates.truncate(n);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedBackend;

    fn settings(refine: usize) -> ProposerSettings {
        ProposerSettings {
            breadth_model: "fast".into(),
            depth_model: "slow".into(),
            pro_refinement_count: refine,
            max_concurrent_requests: 2,
            timeout: Duration::from_secs(5),
        }
    }

    fn strategies(breadth: &[&str], depth: &[&str]) -> MutationStrategies {
        let mut s = MutationStrategies::new();
        s.insert(StrategyClass::Breadth, breadth.iter().map(|x| x.to_string()).collect());
        s.insert(StrategyClass::Depth, depth.iter().map(|x| x.to_string()).collect());
        s
    }

    #[test]
    fn breadth_plan_is_seed_major_and_capped() {
        let ensemble = ProposerEnsemble::new(Arc::new(ScriptedBackend::constant("x")), settings(0));
        let seeds = vec![Seed::from("a"), Seed::from("b")];
        let plan = ensemble.breadth_plan(&seeds, &["s1".into(), "s2".into()], 3);
        let order: Vec<(&str, &str)> = plan
            .iter()
            .map(|c| {
                let seed = if c.prompt.contains("Task:\na") { "a" } else { "b" };
                (seed, c.strategy.as_str())
            })
            .collect();
        assert_eq!(order, vec![("a", "s1"), ("a", "s2"), ("b", "s1")]);
        assert!(plan.iter().all(|c| c.model == "fast"));
    }

    #[tokio::test]
    async fn rejects_empty_inputs() {
        let ensemble = ProposerEnsemble::new(Arc::new(ScriptedBackend::constant("x")), settings(0));
        let s = strategies(&["s1"], &[]);
        assert!(matches!(
            ensemble.generate_candidates(&[], &s, 3, 0).await,
            Err(ProposeError::NoSeeds)
        ));
        assert!(matches!(
            ensemble.generate_candidates(&["a".into()], &s, 0, 0).await,
            Err(ProposeError::ZeroTarget)
        ));
        assert!(matches!(
            ensemble
                .generate_candidates(&["a".into()], &MutationStrategies::new(), 3, 0)
                .await,
            Err(ProposeError::NoBreadthStrategies)
        ));
    }
}
