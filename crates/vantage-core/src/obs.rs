//! Structured observability hooks for the evolution loop.
//!
//! This module provides:
//! - An iteration-scoped span via [`iteration_span`], attached to each step
//!   with `tracing::Instrument`
//! - Emission functions for lifecycle events: iteration start/finish,
//!   candidate evaluated, run finished, persistence and backend errors
//!
//! Events are emitted at `info!` level unless noted. Filter with `RUST_LOG`.

use tracing::{info, warn};

/// Span tagging every event of one iteration with its number.
///
/// ```ignore
/// step_inner().instrument(iteration_span(3)).await
/// // every event inside carries iteration = 3
/// ```
pub fn iteration_span(iteration: u64) -> tracing::Span {
    tracing::info_span!("vantage.iteration", iteration = iteration)
}

pub fn emit_iteration_started(iteration: u64, seeds: usize) {
    info!(event = "iteration.started", iteration = iteration, seeds = seeds);
}

/// The proposer returned fewer candidates than requested. Not an error.
pub fn emit_short_batch(iteration: u64, requested: usize, received: usize) {
    info!(
        event = "iteration.short_batch",
        iteration = iteration,
        requested = requested,
        received = received,
    );
}

pub fn emit_candidate_evaluated(
    iteration: u64,
    candidate_id: &str,
    fitness: f64,
    requires_human_review: bool,
    halted_at: Option<&str>,
) {
    info!(
        event = "candidate.evaluated",
        iteration = iteration,
        candidate_id = %candidate_id,
        fitness = fitness,
        requires_human_review = requires_human_review,
        halted_at = halted_at.unwrap_or("none"),
    );
}

/// Candidate rejected before any tier ran (warning level).
pub fn emit_candidate_invalid(iteration: u64, candidate_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "candidate.invalid",
        iteration = iteration,
        candidate_id = %candidate_id,
        error = %error,
    );
}

pub fn emit_iteration_finished(
    iteration: u64,
    evaluated: usize,
    promoted: usize,
    archived: usize,
    best_fitness: Option<f64>,
) {
    info!(
        event = "iteration.finished",
        iteration = iteration,
        evaluated = evaluated,
        promoted = promoted,
        archived = archived,
        best_fitness = best_fitness.unwrap_or(0.0),
    );
}

pub fn emit_run_finished(iterations: u64, reason: &str, best_fitness: Option<f64>) {
    info!(
        event = "run.finished",
        iterations = iterations,
        reason = %reason,
        best_fitness = best_fitness.unwrap_or(0.0),
    );
}

/// Persistence write failed after retries (warning level).
pub fn emit_persistence_error(
    iteration: u64,
    component: &str,
    attempts: u32,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "persistence.error",
        iteration = iteration,
        component = %component,
        attempts = attempts,
        error = %error,
    );
}

/// The proposer rejected the batch; the iteration continues with no candidates.
pub fn emit_propose_failed(iteration: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "propose.failed",
        iteration = iteration,
        error = %error,
    );
}

/// A single generation call failed and was skipped (warning level).
pub fn emit_generation_failed(
    generation: u64,
    stage: &str,
    model: &str,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "generation.failed",
        generation = generation,
        stage = %stage,
        model = %model,
        error = %error,
    );
}
