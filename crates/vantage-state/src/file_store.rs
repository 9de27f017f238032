//! File-backed stores.
//!
//! Layout for `FileProgramStore::open(dir)`:
//! - `<dir>/population.json`: sorted population snapshot, replaced atomically
//!   (temp file in the same directory, fsync, rename)
//! - `<dir>/archive.jsonl`: one `ArchiveRecord` per line, append-only
//!
//! `JsonlScoreSink` appends one `AuditRecord` per line and fsyncs before
//! returning, so a record acknowledged to the caller survives a restart.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::memory::PopulationState;
use crate::model::{ArchiveRecord, AuditRecord, PopulationEntry, ReviewItem};
use crate::storage_traits::*;

const POPULATION_FILE: &str = "population.json";
const ARCHIVE_FILE: &str = "archive.jsonl";

/// Encode records as newline-terminated JSON lines in one buffer.
fn encode_lines<T: Serialize>(records: &[T]) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Append a pre-encoded buffer in a single write, then fsync.
async fn append_durable(path: &Path, buf: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.write_all(buf)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.flush().await.map_err(|e| StorageError::io(path, e))?;
    file.sync_data()
        .await
        .map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// Parse a JSONL file; a missing file reads as empty.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(path, e)),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| StorageError::Deserialization {
                path: path.display().to_string(),
                line: i + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Replace `path` with `bytes` via temp file + rename in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StorageError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(path, e))?;
    tmp.persist(path).map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// FileProgramStore
// ---------------------------------------------------------------------------

/// Population store persisted under a directory.
///
/// The in-memory state only changes after the snapshot write succeeds, so a
/// failed promotion leaves memory and disk agreeing on the previous state.
#[derive(Debug)]
pub struct FileProgramStore {
    dir: PathBuf,
    state: Mutex<PopulationState>,
}

impl FileProgramStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    /// Existing state is not read until `load` is called.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self {
            dir,
            state: Mutex::new(PopulationState::default()),
        })
    }

    pub fn population_path(&self) -> PathBuf {
        self.dir.join(POPULATION_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }

    async fn persist_snapshot(&self, entries: &[PopulationEntry]) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let path = self.population_path();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StorageError::WriteRejected(format!("snapshot writer failed: {e}")))?
    }
}

#[async_trait]
impl ProgramStore for FileProgramStore {
    async fn promote(&self, entries: Vec<PopulationEntry>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.upsert(entries);
        self.persist_snapshot(&next.entries).await?;
        debug!(population = next.entries.len(), "population snapshot written");
        *state = next;
        Ok(())
    }

    async fn best(&self, k: usize) -> StorageResult<Vec<PopulationEntry>> {
        Ok(self.state.lock().await.best(k))
    }

    async fn archive(&self, record: ArchiveRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let buf = encode_lines(std::slice::from_ref(&record))?;
        append_durable(&self.archive_path(), &buf).await?;
        state.archive.push(record);
        Ok(())
    }

    async fn archived(&self) -> StorageResult<Vec<ArchiveRecord>> {
        Ok(self.state.lock().await.archive.clone())
    }

    async fn seed(&self, baseline: Vec<PopulationEntry>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.replace(baseline);
        self.persist_snapshot(&next.entries).await?;
        *state = next;
        Ok(())
    }

    async fn load(&self) -> StorageResult<usize> {
        let mut state = self.state.lock().await;
        let path = self.population_path();
        let entries: Vec<PopulationEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Deserialization {
                    path: path.display().to_string(),
                    line: e.line(),
                    reason: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let archive = read_lines(&self.archive_path()).await?;

        let mut restored = PopulationState {
            entries: Vec::new(),
            archive,
        };
        restored.upsert(entries);
        let len = restored.entries.len();
        *state = restored;
        Ok(len)
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn review_queue(&self) -> StorageResult<Vec<ReviewItem>> {
        Ok(self.state.lock().await.review_queue())
    }
}

// ---------------------------------------------------------------------------
// JsonlScoreSink
// ---------------------------------------------------------------------------

/// Append-only JSONL audit log.
#[derive(Debug)]
pub struct JsonlScoreSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlScoreSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScoreSink for JsonlScoreSink {
    async fn append(&self, records: &[AuditRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(records)?;
        let _guard = self.write_lock.lock().await;
        append_durable(&self.path, &buf).await
    }

    async fn records(&self) -> StorageResult<Vec<AuditRecord>> {
        let _guard = self.write_lock.lock().await;
        read_lines(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::entry;

    #[tokio::test]
    async fn promote_writes_sorted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgramStore::open(dir.path()).unwrap();
        store
            .promote(vec![entry("low", 0, 0.2), entry("high", 0, 0.8)])
            .await
            .unwrap();

        let bytes = std::fs::read(store.population_path()).unwrap();
        let on_disk: Vec<PopulationEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk[0].id().as_str(), "high");
        assert_eq!(on_disk[1].id().as_str(), "low");
    }

    #[tokio::test]
    async fn load_restores_population_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileProgramStore::open(dir.path()).unwrap();
            store.promote(vec![entry("kept", 1, 0.6)]).await.unwrap();
            let rejected = entry("dropped", 1, 0.1);
            store
                .archive(ArchiveRecord::new(rejected.candidate, "not selected"))
                .await
                .unwrap();
        }

        let reopened = FileProgramStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 0);
        assert_eq!(reopened.load().await.unwrap(), 1);
        assert_eq!(reopened.best(5).await.unwrap()[0].id().as_str(), "kept");
        assert_eq!(reopened.archived().await.unwrap()[0].reason, "not selected");
    }

    #[tokio::test]
    async fn read_lines_reports_bad_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "\nnot json\n").unwrap();

        let err = read_lines::<AuditRecord>(&path).await.unwrap_err();
        match err {
            StorageError::Deserialization { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
