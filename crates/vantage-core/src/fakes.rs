//! Deterministic stand-ins for backends, proposers and evaluators (testing only)
//!
//! - `ScriptedBackend`: answers from a closure, optionally after a delay
//! - `StubProposer`: returns a fixed batch shape per generation
//! - `StubEvaluator`: scores candidates with a closure

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vantage_state::{Candidate, EvaluationResult, Tier, TierOutcome};

use crate::backend::{Completion, CompletionRequest, GenerationBackend, TokenUsage};
use crate::error::{BackendError, EvalError, ProposeError};
use crate::evaluator::Evaluator;
use crate::proposer::{MutationStrategies, Proposer, Seed};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync>;

/// Backend that answers from a closure and records every request.
pub struct ScriptedBackend {
    responder: Responder,
    delay: Option<Duration>,
    usage: Option<TokenUsage>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            delay: None,
            usage: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answers `text`.
    pub fn constant(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(move |_| Ok(text.clone()))
    }

    /// Always fails with `BackendError::Request(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(move |_| Err(BackendError::Request(message.clone())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = (self.responder)(&request)?;
        Ok(Completion {
            text,
            usage: self.usage,
        })
    }
}

type BatchFn = Box<dyn Fn(u64, &[Seed]) -> Vec<Candidate> + Send + Sync>;

/// Proposer that builds each batch with a closure of (generation, seeds).
pub struct StubProposer {
    batch: BatchFn,
    calls: AtomicUsize,
    seen_seeds: Mutex<Vec<Vec<Seed>>>,
}

impl StubProposer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u64, &[Seed]) -> Vec<Candidate> + Send + Sync + 'static,
    {
        Self {
            batch: Box::new(f),
            calls: AtomicUsize::new(0),
            seen_seeds: Mutex::new(Vec::new()),
        }
    }

    /// `size` candidates per call with ids `cand-0..cand-{size-1}` and
    /// payloads `candidate <i>`.
    pub fn indexed(size: usize) -> Self {
        Self::new(move |generation, _| {
            (0..size)
                .map(|i| Candidate::with_id(format!("cand-{i}"), format!("candidate {i}"), generation))
                .collect()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seeds passed to each call, in call order.
    pub fn seen_seeds(&self) -> Vec<Vec<Seed>> {
        self.seen_seeds.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Proposer for StubProposer {
    async fn generate_candidates(
        &self,
        seeds: &[Seed],
        _strategies: &MutationStrategies,
        n: usize,
        generation: u64,
    ) -> Result<Vec<Candidate>, ProposeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen_seeds.lock() {
            seen.push(seeds.to_vec());
        }
        let mut batch = (self.batch)(generation, seeds);
        batch.truncate(n);
        Ok(batch)
    }
}

type ScoreFn = Box<dyn Fn(&Candidate) -> f64 + Send + Sync>;

/// Evaluator that assigns a closure-computed score as a passing Tier 1 result.
/// Empty payloads are rejected like the real cascade rejects them.
pub struct StubEvaluator {
    score: ScoreFn,
}

impl StubEvaluator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Candidate) -> f64 + Send + Sync + 'static,
    {
        Self { score: Box::new(f) }
    }

    /// Score = trailing index in the id (`cand-3` → 0.3).
    pub fn by_index() -> Self {
        Self::new(|c| {
            c.id.as_str()
                .rsplit('-')
                .next()
                .and_then(|i| i.parse::<f64>().ok())
                .map(|i| i * 0.1)
                .unwrap_or(0.0)
        })
    }
}

/// Result holding one passing heuristics tier with the given score.
pub fn scored_result(candidate: &Candidate, score: f64) -> EvaluationResult {
    let score = (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
    let mut tiers = BTreeMap::new();
    tiers.insert(Tier::Heuristics, TierOutcome::ran(true, score, "stub"));
    EvaluationResult {
        candidate_id: candidate.id.clone(),
        generation: candidate.generation,
        payload_digest: candidate.payload_digest(),
        tiers,
        final_fitness_score: score,
        requires_human_review: false,
        review_reason: None,
        halted_at: None,
        evaluated_at: Utc::now(),
    }
}

#[async_trait]
impl Evaluator for StubEvaluator {
    async fn evaluate(
        &self,
        candidate: &Candidate,
        require_human_review: bool,
    ) -> Result<EvaluationResult, EvalError> {
        if candidate.payload.trim().is_empty() {
            return Err(EvalError::InvalidCandidate(format!(
                "candidate {} has an empty payload",
                candidate.id
            )));
        }
        let mut result = scored_result(candidate, (self.score)(candidate));
        if require_human_review {
            result.requires_human_review = true;
            result.review_reason = Some("review requested".into());
        }
        Ok(result)
    }
}
