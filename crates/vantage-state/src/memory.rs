//! In-memory stores.
//!
//! `MemoryProgramStore` and `MemoryScoreSink` satisfy the trait contracts
//! without touching disk. They back runs that do not configure a path and
//! every test that needs a store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::{
    sort_population, ArchiveRecord, AuditRecord, PopulationEntry, ReviewItem, ReviewLocation,
};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// PopulationState, shared by the memory and file stores
// ---------------------------------------------------------------------------

/// Sorted population plus archive. Callers hold the store's lock for the
/// whole of each operation.
#[derive(Debug, Default, Clone)]
pub(crate) struct PopulationState {
    pub(crate) entries: Vec<PopulationEntry>,
    pub(crate) archive: Vec<ArchiveRecord>,
}

impl PopulationState {
    /// Upsert by id (last write wins), then restore the ordering invariant.
    pub(crate) fn upsert(&mut self, incoming: Vec<PopulationEntry>) {
        let mut index: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().0.clone(), i))
            .collect();

        for entry in incoming {
            match index.get(entry.id().as_str()) {
                Some(&i) => self.entries[i] = entry,
                None => {
                    index.insert(entry.id().0.clone(), self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
        sort_population(&mut self.entries);
    }

    pub(crate) fn replace(&mut self, baseline: Vec<PopulationEntry>) {
        self.entries.clear();
        self.upsert(baseline);
    }

    pub(crate) fn best(&self, k: usize) -> Vec<PopulationEntry> {
        self.entries.iter().take(k).cloned().collect()
    }

    pub(crate) fn review_queue(&self) -> Vec<ReviewItem> {
        let from_population = self
            .entries
            .iter()
            .filter(|e| e.result.requires_human_review)
            .map(|e| ReviewItem {
                candidate: e.candidate.clone(),
                result: e.result.clone(),
                location: ReviewLocation::Population,
            });

        let from_archive = self.archive.iter().filter_map(|a| {
            a.result
                .as_ref()
                .filter(|r| r.requires_human_review)
                .map(|r| ReviewItem {
                    candidate: a.candidate.clone(),
                    result: r.clone(),
                    location: ReviewLocation::Archive,
                })
        });

        from_population.chain(from_archive).collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryProgramStore
// ---------------------------------------------------------------------------

/// In-memory population store guarded by a single async mutex.
#[derive(Debug, Default)]
pub struct MemoryProgramStore {
    state: Mutex<PopulationState>,
}

impl MemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgramStore for MemoryProgramStore {
    async fn promote(&self, entries: Vec<PopulationEntry>) -> StorageResult<()> {
        self.state.lock().await.upsert(entries);
        Ok(())
    }

    async fn best(&self, k: usize) -> StorageResult<Vec<PopulationEntry>> {
        Ok(self.state.lock().await.best(k))
    }

    async fn archive(&self, record: ArchiveRecord) -> StorageResult<()> {
        self.state.lock().await.archive.push(record);
        Ok(())
    }

    async fn archived(&self) -> StorageResult<Vec<ArchiveRecord>> {
        Ok(self.state.lock().await.archive.clone())
    }

    async fn seed(&self, baseline: Vec<PopulationEntry>) -> StorageResult<()> {
        self.state.lock().await.replace(baseline);
        Ok(())
    }

    async fn load(&self) -> StorageResult<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn review_queue(&self) -> StorageResult<Vec<ReviewItem>> {
        Ok(self.state.lock().await.review_queue())
    }
}

// ---------------------------------------------------------------------------
// MemoryScoreSink
// ---------------------------------------------------------------------------

/// In-memory audit sink backed by a `Vec<AuditRecord>`.
#[derive(Debug, Default)]
pub struct MemoryScoreSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryScoreSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreSink for MemoryScoreSink {
    async fn append(&self, records: &[AuditRecord]) -> StorageResult<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }

    async fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        Ok(self.records.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::entry;
    use crate::model::Candidate;

    #[test]
    fn upsert_replaces_same_id() {
        let mut state = PopulationState::default();
        state.upsert(vec![entry("a", 0, 0.3), entry("b", 0, 0.6)]);
        state.upsert(vec![entry("a", 0, 0.9)]);

        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries[0].id().as_str(), "a");
        assert_eq!(state.entries[0].fitness(), 0.9);
    }

    #[test]
    fn upsert_dedupes_within_one_batch() {
        let mut state = PopulationState::default();
        state.upsert(vec![entry("a", 0, 0.3), entry("a", 0, 0.1)]);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].fitness(), 0.1);
    }

    #[tokio::test]
    async fn review_queue_spans_population_and_archive() {
        let store = MemoryProgramStore::new();

        let mut flagged = entry("flagged", 0, 0.7);
        flagged.result.requires_human_review = true;
        store.promote(vec![flagged, entry("plain", 0, 0.5)]).await.unwrap();

        let rejected = Candidate::with_id("rejected", "x", 0);
        let mut rejected_result = entry("rejected", 0, 0.1).result;
        rejected_result.requires_human_review = true;
        store
            .archive(ArchiveRecord::new(rejected, "not selected").with_result(rejected_result))
            .await
            .unwrap();

        let queue = store.review_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].location, ReviewLocation::Population);
        assert_eq!(queue[1].location, ReviewLocation::Archive);
    }
}
