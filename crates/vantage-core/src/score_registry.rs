//! ScoreRegistry: the append-only audit trail.
//!
//! Each `log_scores` call stamps its records with one wall-clock timestamp
//! that never goes backwards within a registry, and with consecutive
//! sequence numbers. The sink write happens under the registry lock, so
//! sequence numbers on disk are contiguous and in order.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vantage_state::{
    AuditRecord, CandidateId, EvaluationResult, JsonlScoreSink, MemoryScoreSink, ScoreSink,
    StorageResult,
};

#[derive(Debug, Default)]
struct Cursor {
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

pub struct ScoreRegistry {
    sink: Arc<dyn ScoreSink>,
    cursor: Mutex<Cursor>,
}

impl ScoreRegistry {
    pub fn new(sink: Arc<dyn ScoreSink>) -> Self {
        Self {
            sink,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryScoreSink::new()))
    }

    /// Open a JSONL log, continuing its sequence numbers and timestamps.
    pub async fn open_jsonl(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::resume(Arc::new(JsonlScoreSink::new(path.as_ref()))).await
    }

    /// Wrap a sink that may already hold records.
    pub async fn resume(sink: Arc<dyn ScoreSink>) -> StorageResult<Self> {
        let existing = sink.records().await?;
        let cursor = match existing.last() {
            Some(last) => Cursor {
                next_seq: last.seq + 1,
                last_timestamp: existing.iter().map(|r| r.timestamp).max(),
            },
            None => Cursor::default(),
        };
        Ok(Self {
            sink,
            cursor: Mutex::new(cursor),
        })
    }

    /// Append one audit record per result. Durable sinks have flushed by the
    /// time this returns. On error nothing is counted as written and the
    /// caller still holds `results`.
    pub async fn log_scores(&self, results: &[EvaluationResult]) -> StorageResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }
        let mut cursor = self.cursor.lock().await;
        let now = Utc::now();
        let timestamp = match cursor.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };

        let records: Vec<AuditRecord> = results
            .iter()
            .enumerate()
            .map(|(i, r)| AuditRecord::from_result(cursor.next_seq + i as u64, timestamp, r))
            .collect();
        self.sink.append(&records).await?;

        cursor.next_seq += records.len() as u64;
        cursor.last_timestamp = Some(timestamp);
        Ok(records.len())
    }

    pub async fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        self.sink.records().await
    }

    /// Every record logged for one candidate, oldest first.
    pub async fn history(&self, candidate_id: &CandidateId) -> StorageResult<Vec<AuditRecord>> {
        Ok(self
            .sink
            .records()
            .await?
            .into_iter()
            .filter(|r| &r.candidate_id == candidate_id)
            .collect())
    }
}
