//! Error types for the evolution loop.
//!
//! Each layer has its own enum. Tier-level failures never surface here: the
//! cascade folds them into `TierOutcome::Failed`. Only configuration and
//! persistence failures can abort a run.

use std::path::PathBuf;

use thiserror::Error;
use vantage_state::StorageError;

/// Configuration could not be read, parsed or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// A single call to a generation backend failed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("call to {model} timed out after {secs}s")]
    Timeout { model: String, secs: u64 },

    #[error("request failed: {0}")]
    Request(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Request(err.to_string())
    }
}

/// Raised before any tier runs; fatal for that candidate only.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

/// The proposer was asked for something it cannot produce.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("no seed prompts supplied")]
    NoSeeds,

    #[error("target candidate count must be at least 1")]
    ZeroTarget,

    #[error("no breadth strategies configured")]
    NoBreadthStrategies,
}

/// Which store a persistence failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceComponent {
    ProgramDb,
    ScoreRegistry,
}

impl std::fmt::Display for PersistenceComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceComponent::ProgramDb => write!(f, "program_db"),
            PersistenceComponent::ScoreRegistry => write!(f, "score_registry"),
        }
    }
}

/// Errors that abort an evolution run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("iteration {iteration}: {component} write failed: {source}")]
    Persistence {
        iteration: u64,
        component: PersistenceComponent,
        #[source]
        source: StorageError,
    },

    #[error("run already finished")]
    AlreadyFinished,
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
