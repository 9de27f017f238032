//! Vantage-State: persistence layer for Synergy-Vantage
//!
//! Holds the data model of the evolution loop and the two stores it writes to.
//!
//! ## Key Components
//!
//! - `ProgramStore`: ranked population of promoted candidates plus the
//!   archive of rejected ones
//! - `ScoreSink`: append-only audit trail of evaluation results
//! - `MemoryProgramStore` / `MemoryScoreSink`: in-process implementations
//! - `FileProgramStore` / `JsonlScoreSink`: durable implementations
//! - `fakes`: failure-injecting stores for exercising retry paths

mod error;
pub mod fakes;
mod file_store;
mod memory;
pub mod model;
pub mod storage_traits;

pub use error::StorageError;
pub use file_store::{FileProgramStore, JsonlScoreSink};
pub use memory::{MemoryProgramStore, MemoryScoreSink};
pub use model::{
    sort_population, ArchiveRecord, AuditRecord, Candidate, CandidateId, EvaluationResult,
    PayloadKind, PopulationEntry, ReviewItem, ReviewLocation, Tier, TierOutcome,
};
pub use storage_traits::{ProgramStore, ScoreSink, StorageResult};
