//! Failure-injecting stores (testing only)
//!
//! Wrap the in-memory stores and reject the first `n` writes, so callers can
//! exercise retry and escalation paths deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::memory::{MemoryProgramStore, MemoryScoreSink};
use crate::model::{ArchiveRecord, AuditRecord, PopulationEntry, ReviewItem};
use crate::storage_traits::*;

/// Shared countdown: `true` while failures remain.
#[derive(Debug)]
struct FailureBudget {
    remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl FailureBudget {
    fn new(failures: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// FailingScoreSink
// ---------------------------------------------------------------------------

/// Audit sink whose first `failures` appends are rejected.
#[derive(Debug)]
pub struct FailingScoreSink {
    inner: MemoryScoreSink,
    budget: FailureBudget,
}

impl FailingScoreSink {
    pub fn fail_first(failures: usize) -> Self {
        Self {
            inner: MemoryScoreSink::new(),
            budget: FailureBudget::new(failures),
        }
    }

    pub fn always() -> Self {
        Self::fail_first(usize::MAX)
    }

    /// Total append attempts, failed or not.
    pub fn attempts(&self) -> usize {
        self.budget.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoreSink for FailingScoreSink {
    async fn append(&self, records: &[AuditRecord]) -> StorageResult<()> {
        if self.budget.should_fail() {
            return Err(StorageError::WriteRejected(format!(
                "injected audit failure ({} records)",
                records.len()
            )));
        }
        self.inner.append(records).await
    }

    async fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        self.inner.records().await
    }
}

// ---------------------------------------------------------------------------
// FailingProgramStore
// ---------------------------------------------------------------------------

/// Population store whose first `failures` promotions are rejected.
/// Reads, archival and seeding always succeed.
#[derive(Debug)]
pub struct FailingProgramStore {
    inner: MemoryProgramStore,
    budget: FailureBudget,
}

impl FailingProgramStore {
    pub fn fail_first(failures: usize) -> Self {
        Self {
            inner: MemoryProgramStore::new(),
            budget: FailureBudget::new(failures),
        }
    }

    pub fn always() -> Self {
        Self::fail_first(usize::MAX)
    }
}

#[async_trait]
impl ProgramStore for FailingProgramStore {
    async fn promote(&self, entries: Vec<PopulationEntry>) -> StorageResult<()> {
        if self.budget.should_fail() {
            return Err(StorageError::WriteRejected(format!(
                "injected promote failure ({} entries)",
                entries.len()
            )));
        }
        self.inner.promote(entries).await
    }

    async fn best(&self, k: usize) -> StorageResult<Vec<PopulationEntry>> {
        self.inner.best(k).await
    }

    async fn archive(&self, record: ArchiveRecord) -> StorageResult<()> {
        self.inner.archive(record).await
    }

    async fn archived(&self) -> StorageResult<Vec<ArchiveRecord>> {
        self.inner.archived().await
    }

    async fn seed(&self, baseline: Vec<PopulationEntry>) -> StorageResult<()> {
        self.inner.seed(baseline).await
    }

    async fn load(&self) -> StorageResult<usize> {
        self.inner.load().await
    }

    async fn len(&self) -> StorageResult<usize> {
        self.inner.len().await
    }

    async fn review_queue(&self) -> StorageResult<Vec<ReviewItem>> {
        self.inner.review_queue().await
    }
}
