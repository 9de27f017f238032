//! Vantage-Core: the evolutionary program-search loop
//!
//! Proposes candidates, scores them through a tiered cascade, promotes the
//! winners into a ranked population and logs every verdict for audit.
//!
//! ## Key Components
//!
//! - `ProposerEnsemble`: breadth and depth generation passes over a backend
//! - `EvaluatorCascade`: heuristics → verification → critic → review flag
//! - `ProgramDb`: ranked population plus archive of rejected candidates
//! - `ScoreRegistry`: append-only audit trail
//! - `Orchestrator`: iteration loop, selection and termination policy

pub mod backend;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod program_db;
pub mod proposer;
pub mod score_registry;
pub mod telemetry;

pub use backend::{
    call_with_timeout, ChatMessage, Completion, CompletionRequest, EchoBackend,
    GenerationBackend, MeteredBackend, OpenAiBackend, Role, TokenUsage, UsageMeter,
};
pub use config::{ConfigFormat, EvolutionConfig, TierWeights};
pub use error::{
    BackendError, ConfigError, EvalError, OrchestratorError, OrchestratorResult,
    PersistenceComponent, ProposeError,
};
pub use evaluator::{
    compose_fitness, BehaviorOracle, CascadePolicy, CommandOracle, Critic, CriticVerdict,
    Evaluator, EvaluatorCascade, LlmCritic, MarkerOracle,
};
pub use orchestrator::{
    IterationReport, Orchestrator, OrchestratorBuilder, RunSummary, SeedBatch, SeedSampler,
    StaticSeedSampler, TerminationReason,
};
pub use program_db::ProgramDb;
pub use proposer::{
    MutationStrategies, Proposer, ProposerEnsemble, ProposerSettings, Seed, StrategyClass,
};
pub use score_registry::ScoreRegistry;
