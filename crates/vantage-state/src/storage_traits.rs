//! Storage trait definitions for Synergy-Vantage
//!
//! These traits define the two persistence seams of the evolution loop:
//! - `ProgramStore`: the ranked population plus the rejection archive
//! - `ScoreSink`: the append-only audit trail of evaluation results
//!
//! All traits are async and backend-agnostic. In-memory implementations live
//! in the `memory` module, file-backed ones in `file_store`.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{ArchiveRecord, AuditRecord, PopulationEntry, ReviewItem};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ProgramStore: ranked population + archive
// ---------------------------------------------------------------------------

/// Population store.
///
/// Guarantees:
/// - The population is always sorted by `EvaluationResult::rank_cmp`.
/// - At most one entry per candidate id; a later `promote` of the same id
///   replaces the earlier entry.
/// - Each mutating call is atomic with respect to every other call: readers
///   never observe a half-applied promotion.
/// - Archived candidates never appear in `best`.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    /// Insert or replace entries, then re-sort the whole population.
    async fn promote(&self, entries: Vec<PopulationEntry>) -> StorageResult<()>;

    /// Top-`k` prefix of the sorted population.
    async fn best(&self, k: usize) -> StorageResult<Vec<PopulationEntry>>;

    /// Record a rejected candidate outside the ranked population.
    async fn archive(&self, record: ArchiveRecord) -> StorageResult<()>;

    /// All archived candidates, oldest first.
    async fn archived(&self) -> StorageResult<Vec<ArchiveRecord>>;

    /// Replace the population with `baseline` (deduplicated by id, last wins).
    /// Idempotent: seeding twice with the same baseline yields the same state.
    async fn seed(&self, baseline: Vec<PopulationEntry>) -> StorageResult<()>;

    /// Restore previously persisted state. Returns the restored population
    /// size; stores without durable state report their current size.
    async fn load(&self) -> StorageResult<usize>;

    /// Number of entries in the ranked population.
    async fn len(&self) -> StorageResult<usize>;

    /// Candidates whose latest result carries `requires_human_review`,
    /// from both the population and the archive.
    async fn review_queue(&self) -> StorageResult<Vec<ReviewItem>>;
}

// ---------------------------------------------------------------------------
// ScoreSink: append-only audit trail
// ---------------------------------------------------------------------------

/// Audit sink.
///
/// Guarantees:
/// - Append-only: records are never rewritten or removed.
/// - `append` writes all given records as one serialized unit; concurrent
///   callers never interleave partial records.
/// - Durable implementations flush to stable storage before returning.
#[async_trait]
pub trait ScoreSink: Send + Sync {
    /// Append records in order.
    async fn append(&self, records: &[AuditRecord]) -> StorageResult<()>;

    /// Read every record back, in append order.
    async fn records(&self) -> StorageResult<Vec<AuditRecord>>;
}
