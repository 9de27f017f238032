//! The evolution loop.
//!
//! `Orchestrator` moves through `Init → Running* → Done`. Each step:
//! 1. sample seeds and strategies (plus elite seeds from the population)
//! 2. ask the proposer for `candidate_generation_N` candidates
//! 3. evaluate every candidate independently, bounded concurrency
//! 4. rank, promote the top `top_k_selection`, archive the rest
//! 5. log every result to the ScoreRegistry
//! 6. advance the counter and check termination
//!
//! Only configuration and persistence failures end a run early. Cancellation
//! is observed between iterations, never inside one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};
use vantage_state::{
    Candidate, EvaluationResult, FileProgramStore, PopulationEntry, StorageError, StorageResult,
};

use crate::backend::{GenerationBackend, MeteredBackend, UsageMeter};
use crate::config::EvolutionConfig;
use crate::error::{OrchestratorError, OrchestratorResult, PersistenceComponent};
use crate::evaluator::{Evaluator, EvaluatorCascade};
use crate::metrics::METRICS;
use crate::obs;
use crate::program_db::ProgramDb;
use crate::proposer::{MutationStrategies, Proposer, ProposerEnsemble, ProposerSettings, Seed};
use crate::score_registry::ScoreRegistry;

const NOT_SELECTED: &str = "not selected";
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Seed sampling
// ---------------------------------------------------------------------------

/// Seeds and strategies for one iteration.
#[derive(Debug, Clone)]
pub struct SeedBatch {
    pub seeds: Vec<Seed>,
    pub strategies: MutationStrategies,
}

/// Chooses what the proposer works from each iteration.
pub trait SeedSampler: Send + Sync {
    fn sample(&self, iteration: u64) -> SeedBatch;
}

/// Returns the same configured prompts and strategies every iteration.
#[derive(Debug, Clone)]
pub struct StaticSeedSampler {
    batch: SeedBatch,
}

impl StaticSeedSampler {
    pub fn new(prompts: Vec<String>, strategies: MutationStrategies) -> Self {
        Self {
            batch: SeedBatch {
                seeds: prompts.into_iter().map(Seed::from).collect(),
                strategies,
            },
        }
    }

    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::new(config.seed_prompts.clone(), config.mutation_strategies.clone())
    }
}

impl SeedSampler for StaticSeedSampler {
    fn sample(&self, _iteration: u64) -> SeedBatch {
        self.batch.clone()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    MaxIterations,
    Converged { delta: f64 },
    BudgetExhausted { used: u64, budget: u64 },
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::MaxIterations => write!(f, "max_iterations"),
            TerminationReason::Converged { delta } => write!(f, "converged (delta {delta:.4})"),
            TerminationReason::BudgetExhausted { used, budget } => {
                write!(f, "budget exhausted ({used}/{budget} tokens)")
            }
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationReport {
    /// Zero-based generation number of the iteration.
    pub iteration: u64,
    pub proposed: usize,
    pub evaluated: usize,
    pub promoted: usize,
    pub archived: usize,
    pub invalid: usize,
    pub logged: usize,
    pub persistence_failures: usize,
    pub best_fitness: Option<f64>,
    pub termination: Option<TerminationReason>,
}

/// What a whole run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub iterations: u64,
    pub termination: TerminationReason,
    pub best: Option<PopulationEntry>,
    pub candidates_evaluated: usize,
    pub candidates_promoted: usize,
    pub candidates_archived: usize,
    pub invalid_candidates: usize,
    pub records_logged: usize,
    pub persistence_failures: usize,
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Init,
    Running,
    Done,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires an `Orchestrator` together. The proposer and evaluator are
/// required; everything else defaults to in-memory stores and the
/// configured static seeds.
pub struct OrchestratorBuilder {
    config: EvolutionConfig,
    proposer: Arc<dyn Proposer>,
    evaluator: Arc<dyn Evaluator>,
    program_db: Option<ProgramDb>,
    registry: Option<ScoreRegistry>,
    sampler: Option<Box<dyn SeedSampler>>,
    meter: Option<Arc<UsageMeter>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl OrchestratorBuilder {
    pub fn program_db(mut self, db: ProgramDb) -> Self {
        self.program_db = Some(db);
        self
    }

    pub fn score_registry(mut self, registry: ScoreRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn seed_sampler(mut self, sampler: impl SeedSampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    pub fn usage_meter(mut self, meter: Arc<UsageMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Stop between iterations once the channel reads `true`.
    pub fn shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    /// Validate the configuration and construct the orchestrator.
    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        self.config.validate()?;
        let sampler = self
            .sampler
            .unwrap_or_else(|| Box::new(StaticSeedSampler::from_config(&self.config)));
        Ok(Orchestrator {
            config: Arc::new(self.config),
            proposer: self.proposer,
            evaluator: self.evaluator,
            program_db: self.program_db.unwrap_or_else(ProgramDb::in_memory),
            registry: self.registry.unwrap_or_else(ScoreRegistry::in_memory),
            sampler,
            meter: self.meter,
            shutdown: self.shutdown,
            state: RunState::Init,
            iteration: 0,
            best_history: Vec::new(),
            totals: Totals::default(),
        })
    }
}

#[derive(Debug, Default)]
struct Totals {
    evaluated: usize,
    promoted: usize,
    archived: usize,
    invalid: usize,
    logged: usize,
    persistence_failures: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Arc<EvolutionConfig>,
    proposer: Arc<dyn Proposer>,
    evaluator: Arc<dyn Evaluator>,
    program_db: ProgramDb,
    registry: ScoreRegistry,
    sampler: Box<dyn SeedSampler>,
    meter: Option<Arc<UsageMeter>>,
    shutdown: Option<watch::Receiver<bool>>,
    state: RunState,
    iteration: u64,
    best_history: Vec<f64>,
    totals: Totals,
}

impl Orchestrator {
    pub fn builder(
        config: EvolutionConfig,
        proposer: Arc<dyn Proposer>,
        evaluator: Arc<dyn Evaluator>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            proposer,
            evaluator,
            program_db: None,
            registry: None,
            sampler: None,
            meter: None,
            shutdown: None,
        }
    }

    /// Full production wiring: metered backend shared by proposer and
    /// critic, file-backed ProgramDB when `program_db_path` is set, JSONL
    /// audit log at `audit_log_path`.
    pub async fn from_config(
        config: EvolutionConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let meter = Arc::new(UsageMeter::new());
        let metered: Arc<dyn GenerationBackend> =
            Arc::new(MeteredBackend::new(backend, Arc::clone(&meter)));
        let proposer = Arc::new(ProposerEnsemble::new(
            Arc::clone(&metered),
            ProposerSettings::from_config(&config),
        ));
        let evaluator = Arc::new(EvaluatorCascade::from_config(&config, metered));

        let program_db = match &config.program_db_path {
            Some(dir) => {
                let store = FileProgramStore::open(dir).map_err(|source| {
                    OrchestratorError::Persistence {
                        iteration: 0,
                        component: PersistenceComponent::ProgramDb,
                        source,
                    }
                })?;
                ProgramDb::new(Arc::new(store))
            }
            None => ProgramDb::in_memory(),
        };
        let registry = ScoreRegistry::open_jsonl(&config.audit_log_path)
            .await
            .map_err(|source| OrchestratorError::Persistence {
                iteration: 0,
                component: PersistenceComponent::ScoreRegistry,
                source,
            })?;

        Self::builder(config, proposer, evaluator)
            .program_db(program_db)
            .score_registry(registry)
            .usage_meter(meter)
            .build()
    }

    /// Attach a shutdown channel to an already-built orchestrator.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Completed iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_finished(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn program_db(&self) -> &ProgramDb {
        &self.program_db
    }

    pub fn score_registry(&self) -> &ScoreRegistry {
        &self.registry
    }

    /// Seed the population from `baseline`, or restore persisted state.
    /// Runs implicitly with `None` before the first step if not called.
    pub async fn initialize(
        &mut self,
        baseline: Option<Vec<(Candidate, EvaluationResult)>>,
    ) -> OrchestratorResult<usize> {
        if self.state == RunState::Done {
            return Err(OrchestratorError::AlreadyFinished);
        }
        let size = self
            .program_db
            .seed_or_load(baseline)
            .await
            .map_err(|source| OrchestratorError::Persistence {
                iteration: self.iteration,
                component: PersistenceComponent::ProgramDb,
                source,
            })?;
        info!(population = size, "population initialized");
        self.state = RunState::Running;
        Ok(size)
    }

    /// Run until a termination condition holds.
    pub async fn run(&mut self) -> OrchestratorResult<RunSummary> {
        if self.state == RunState::Done {
            return Err(OrchestratorError::AlreadyFinished);
        }
        let termination = loop {
            if self.cancelled() {
                self.state = RunState::Done;
                break TerminationReason::Cancelled;
            }
            let report = self.step().await?;
            if let Some(reason) = report.termination {
                break reason;
            }
        };
        self.finish(termination).await
    }

    /// Execute one iteration.
    pub async fn step(&mut self) -> OrchestratorResult<IterationReport> {
        match self.state {
            RunState::Done => return Err(OrchestratorError::AlreadyFinished),
            RunState::Init => {
                self.initialize(None).await?;
            }
            RunState::Running => {}
        }
        let span = obs::iteration_span(self.iteration);
        self.step_inner().instrument(span).await
    }

    async fn step_inner(&mut self) -> OrchestratorResult<IterationReport> {
        let iteration = self.iteration;
        let mut report = IterationReport {
            iteration,
            ..IterationReport::default()
        };

        let SeedBatch {
            mut seeds,
            strategies,
        } = self.sampler.sample(iteration);
        seeds.extend(self.elite_seeds().await);
        obs::emit_iteration_started(iteration, seeds.len());

        let n = self.config.candidate_generation_n;
        let candidates = match self
            .proposer
            .generate_candidates(&seeds, &strategies, n, iteration)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                obs::emit_propose_failed(iteration, &e);
                Vec::new()
            }
        };
        report.proposed = candidates.len();
        if candidates.len() < n {
            obs::emit_short_batch(iteration, n, candidates.len());
        }

        // Evaluate
        let evaluator = Arc::clone(&self.evaluator);
        let outcomes: Vec<_> = stream::iter(candidates)
            .map(|candidate| {
                let evaluator = Arc::clone(&evaluator);
                async move {
                    let result = evaluator.evaluate(&candidate, false).await;
                    (candidate, result)
                }
            })
            .buffered(self.config.max_concurrent_evaluations)
            .collect()
            .await;

        let mut evaluated = Vec::with_capacity(outcomes.len());
        let mut invalid = Vec::new();
        for (candidate, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    obs::emit_candidate_evaluated(
                        iteration,
                        candidate.id.as_str(),
                        result.final_fitness_score,
                        result.requires_human_review,
                        result.halted_at.map(|t| t.to_string()).as_deref(),
                    );
                    evaluated.push((candidate, result));
                }
                Err(e) => {
                    obs::emit_candidate_invalid(iteration, candidate.id.as_str(), &e);
                    invalid.push((candidate, e.to_string()));
                }
            }
        }
        report.evaluated = evaluated.len();
        report.invalid = invalid.len();

        // Select
        evaluated.sort_by(|a, b| a.1.rank_cmp(&b.1));
        let results: Vec<EvaluationResult> = evaluated.iter().map(|(_, r)| r.clone()).collect();
        let cut = self.config.top_k_selection.min(evaluated.len());
        let rejected = evaluated.split_off(cut);
        let selected = evaluated;

        // A fatal write failure is returned only after archiving and logging.
        let mut fatal = None;

        // Promote
        let promoted = selected.len();
        if promoted > 0 {
            let db = &self.program_db;
            let outcome = retry_persist(self.config.persistence_retries, || {
                db.promote(selected.clone())
            })
            .await;
            if self.absorb(
                iteration,
                PersistenceComponent::ProgramDb,
                outcome,
                &mut report,
                &mut fatal,
            ) {
                report.promoted = promoted;
            }
        }

        // Archive
        for (candidate, result) in rejected {
            let db = &self.program_db;
            let outcome = retry_persist(self.config.persistence_retries, || {
                db.archive_evaluated(candidate.clone(), result.clone(), NOT_SELECTED)
            })
            .await;
            if self.absorb(
                iteration,
                PersistenceComponent::ProgramDb,
                outcome,
                &mut report,
                &mut fatal,
            ) {
                report.archived += 1;
            }
        }
        for (candidate, reason) in invalid {
            let db = &self.program_db;
            let reason = format!("invalid candidate: {reason}");
            let outcome = retry_persist(self.config.persistence_retries, || {
                db.archive_failure(candidate.clone(), reason.clone())
            })
            .await;
            if self.absorb(
                iteration,
                PersistenceComponent::ProgramDb,
                outcome,
                &mut report,
                &mut fatal,
            ) {
                report.archived += 1;
            }
        }

        // Log
        if !results.is_empty() {
            let registry = &self.registry;
            let outcome = retry_persist(self.config.persistence_retries, || {
                registry.log_scores(&results)
            })
            .await;
            if let Some(written) = self.absorb_value(
                iteration,
                PersistenceComponent::ScoreRegistry,
                outcome,
                &mut report,
                &mut fatal,
            ) {
                report.logged = written;
            }
        }

        if let Some(err) = fatal {
            self.record(&report);
            return Err(err);
        }

        // Advance
        self.iteration += 1;
        report.best_fitness = self.current_best_fitness().await;
        if let Some(best) = report.best_fitness {
            self.best_history.push(best);
        }
        report.termination = self.termination();
        if report.termination.is_some() {
            self.state = RunState::Done;
        }

        self.record(&report);
        obs::emit_iteration_finished(
            iteration,
            report.evaluated,
            report.promoted,
            report.archived,
            report.best_fitness,
        );
        Ok(report)
    }

    fn cancelled(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    async fn elite_seeds(&self) -> Vec<Seed> {
        let k = self.config.elite_seed_count;
        if k == 0 {
            return Vec::new();
        }
        match self.program_db.get_best(k).await {
            Ok(best) => best
                .into_iter()
                .map(|e| Seed::refine(e.candidate.payload, e.candidate.id))
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not read elite seeds; continuing without them");
                Vec::new()
            }
        }
    }

    async fn current_best_fitness(&self) -> Option<f64> {
        match self.program_db.get_best(1).await {
            Ok(best) => best.first().map(PopulationEntry::fitness),
            Err(e) => {
                warn!(error = %e, "could not read best entry");
                None
            }
        }
    }

    fn termination(&self) -> Option<TerminationReason> {
        if self.iteration >= self.config.max_iterations {
            return Some(TerminationReason::MaxIterations);
        }
        if let (Some(threshold), [.., prev, last]) =
            (self.config.convergence_threshold, self.best_history.as_slice())
        {
            let delta = (last - prev).abs();
            if delta < threshold {
                return Some(TerminationReason::Converged { delta });
            }
        }
        if let (Some(budget), Some(meter)) = (self.config.token_budget, &self.meter) {
            let used = meter.used();
            if used >= budget {
                return Some(TerminationReason::BudgetExhausted { used, budget });
            }
        }
        None
    }

    /// Fold a persistence outcome into the report. Returns `Ok(true)` when
    /// the write landed, `Ok(false)` when it failed and the run continues.
    fn absorb(
        &mut self,
        iteration: u64,
        component: PersistenceComponent,
        outcome: Result<(), (u32, StorageError)>,
        report: &mut IterationReport,
        fatal: &mut Option<OrchestratorError>,
    ) -> bool {
        self.absorb_value(iteration, component, outcome, report, fatal)
            .is_some()
    }

    /// Count a failed write. With `abort_on_persistence_failure` the first
    /// failure of the iteration is kept in `fatal` and the run is marked done.
    fn absorb_value<T>(
        &mut self,
        iteration: u64,
        component: PersistenceComponent,
        outcome: Result<T, (u32, StorageError)>,
        report: &mut IterationReport,
        fatal: &mut Option<OrchestratorError>,
    ) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err((attempts, source)) => {
                obs::emit_persistence_error(iteration, &component.to_string(), attempts, &source);
                METRICS.inc_persistence_failures();
                report.persistence_failures += 1;
                if self.config.abort_on_persistence_failure {
                    self.state = RunState::Done;
                    fatal.get_or_insert(OrchestratorError::Persistence {
                        iteration,
                        component,
                        source,
                    });
                }
                None
            }
        }
    }

    fn record(&mut self, report: &IterationReport) {
        self.totals.evaluated += report.evaluated;
        self.totals.promoted += report.promoted;
        self.totals.archived += report.archived;
        self.totals.invalid += report.invalid;
        self.totals.logged += report.logged;
        self.totals.persistence_failures += report.persistence_failures;

        METRICS.inc_iterations();
        METRICS.add_evaluated(report.evaluated as u64);
        METRICS.add_promoted(report.promoted as u64);
        METRICS.add_archived(report.archived as u64);
    }

    async fn finish(&mut self, termination: TerminationReason) -> OrchestratorResult<RunSummary> {
        let best = self
            .program_db
            .get_best(1)
            .await
            .ok()
            .and_then(|mut v| v.pop());
        obs::emit_run_finished(
            self.iteration,
            &termination.to_string(),
            best.as_ref().map(PopulationEntry::fitness),
        );
        METRICS.flush();

        Ok(RunSummary {
            iterations: self.iteration,
            termination,
            best,
            candidates_evaluated: self.totals.evaluated,
            candidates_promoted: self.totals.promoted,
            candidates_archived: self.totals.archived,
            invalid_candidates: self.totals.invalid,
            records_logged: self.totals.logged,
            persistence_failures: self.totals.persistence_failures,
            tokens_used: self.meter.as_ref().map(|m| m.used()),
        })
    }
}

/// Try `op` up to `1 + retries` times with linear backoff. On exhaustion
/// returns the attempt count and the last error.
async fn retry_persist<T, F, Fut>(retries: u32, mut op: F) -> Result<T, (u32, StorageError)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt > retries => return Err((attempt, e)),
            Err(e) => {
                warn!(attempt = attempt, error = %e, "persistence write failed; retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }
    }
}
