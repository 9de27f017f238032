//! ProgramDB: the ranked population of promoted candidates.
//!
//! A thin facade over a `ProgramStore`. The store owns the population and
//! serializes every mutation; this type speaks in (candidate, result) pairs.

use std::sync::Arc;

use vantage_state::{
    ArchiveRecord, Candidate, EvaluationResult, MemoryProgramStore, PopulationEntry, ProgramStore,
    ReviewItem, StorageResult,
};

#[derive(Clone)]
pub struct ProgramDb {
    store: Arc<dyn ProgramStore>,
}

impl ProgramDb {
    pub fn new(store: Arc<dyn ProgramStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryProgramStore::new()))
    }

    /// Insert or replace each pair, then re-sort the population. A later
    /// promotion of the same id replaces the earlier entry.
    pub async fn promote(&self, batch: Vec<(Candidate, EvaluationResult)>) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let entries = batch
            .into_iter()
            .map(|(candidate, result)| PopulationEntry::new(candidate, result))
            .collect();
        self.store.promote(entries).await
    }

    /// Top-`k` prefix of the population; `k = 0` is empty.
    pub async fn get_best(&self, k: usize) -> StorageResult<Vec<PopulationEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.store.best(k).await
    }

    /// Record a rejected candidate outside the ranked population.
    pub async fn archive_failure(
        &self,
        candidate: Candidate,
        reason: impl Into<String>,
    ) -> StorageResult<()> {
        self.store.archive(ArchiveRecord::new(candidate, reason)).await
    }

    /// Archive an evaluated candidate, keeping its result so a review flag
    /// stays discoverable.
    pub async fn archive_evaluated(
        &self,
        candidate: Candidate,
        result: EvaluationResult,
        reason: impl Into<String>,
    ) -> StorageResult<()> {
        self.store
            .archive(ArchiveRecord::new(candidate, reason).with_result(result))
            .await
    }

    /// Initialize from `baseline`, or restore whatever the store persisted
    /// (empty for a fresh store). Returns the resulting population size.
    pub async fn seed_or_load(
        &self,
        baseline: Option<Vec<(Candidate, EvaluationResult)>>,
    ) -> StorageResult<usize> {
        match baseline {
            Some(pairs) => {
                let entries: Vec<PopulationEntry> = pairs
                    .into_iter()
                    .map(|(candidate, result)| PopulationEntry::new(candidate, result))
                    .collect();
                self.store.seed(entries).await?;
                self.store.len().await
            }
            None => self.store.load().await,
        }
    }

    pub async fn len(&self) -> StorageResult<usize> {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.store.len().await? == 0)
    }

    pub async fn archived(&self) -> StorageResult<Vec<ArchiveRecord>> {
        self.store.archived().await
    }

    pub async fn review_queue(&self) -> StorageResult<Vec<ReviewItem>> {
        self.store.review_queue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::scored_result;

    fn pair(id: &str, generation: u64, score: f64) -> (Candidate, EvaluationResult) {
        let c = Candidate::with_id(id, format!("payload {id}"), generation);
        let r = scored_result(&c, score);
        (c, r)
    }

    #[tokio::test]
    async fn get_best_zero_is_empty() {
        let db = ProgramDb::in_memory();
        db.promote(vec![pair("a", 0, 0.5)]).await.unwrap();
        assert!(db.get_best(0).await.unwrap().is_empty());
        assert_eq!(db.get_best(9).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seed_or_load_none_on_fresh_store_is_empty() {
        let db = ProgramDb::in_memory();
        assert_eq!(db.seed_or_load(None).await.unwrap(), 0);
        assert!(db.is_empty().await.unwrap());
    }
}
