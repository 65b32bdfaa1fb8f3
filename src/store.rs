//! In-memory file registry with append-only processing history.
//!
//! Each file id owns a list of summaries, newest last, plus the records and
//! player lines of the latest pass. Writers for one id are serialized through
//! [`FileStore::lock`]; readers never block on it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::entities::PlayerStats;
use crate::error::ProcessingError;
use crate::schema::{now_iso8601, CanonicalRecord, FileStatus, Mapping, ProcessingSummary};

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub id: u64,
    pub file_name: String,
    pub file_type: String,
    #[serde(skip)]
    pub stored_path: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub uploaded_at: String,
    pub history: Vec<ProcessingSummary>,
    #[serde(skip)]
    pub records: Vec<CanonicalRecord>,
    #[serde(skip)]
    pub players: Vec<PlayerStats>,
}

impl FileEntry {
    pub fn latest(&self) -> Option<&ProcessingSummary> {
        self.history.last()
    }
}

/// Listing view of a file.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub id: u64,
    pub file_name: String,
    pub file_type: String,
    pub uploaded_at: String,
    pub version: u32,
    pub status: Option<FileStatus>,
    pub total_records: usize,
    pub matched_columns: Mapping,
    pub unmatched_columns: Vec<String>,
    pub missing_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileStore {
    inner: Arc<RwLock<HashMap<u64, FileEntry>>>,
    next_id: Arc<AtomicU64>,
    locks: Arc<Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new file and return its id.
    pub fn register(
        &self,
        file_name: &str,
        file_type: &str,
        stored_path: Option<PathBuf>,
        content_hash: Option<String>,
    ) -> u64 {
        // Id reservation happens under the write lock so a concurrent
        // `ensure` cannot claim the same id in between.
        let mut files = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        while files.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        }
        let entry = FileEntry {
            id,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            stored_path,
            content_hash,
            uploaded_at: now_iso8601(),
            history: Vec::new(),
            records: Vec::new(),
            players: Vec::new(),
        };
        files.insert(id, entry);
        tracing::debug!("FileStore: registered {} as id {}", file_name, id);
        id
    }

    /// Make sure an entry exists for `id`, creating an empty one if needed.
    pub fn ensure(&self, id: u64, file_name: &str, file_type: &str, stored_path: Option<PathBuf>) {
        let mut files = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if files.contains_key(&id) {
            return;
        }
        files.insert(
            id,
            FileEntry {
                id,
                file_name: file_name.to_string(),
                file_type: file_type.to_string(),
                stored_path,
                content_hash: None,
                uploaded_at: now_iso8601(),
                history: Vec::new(),
                records: Vec::new(),
                players: Vec::new(),
            },
        );
        self.next_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn get(&self, id: u64) -> Option<FileEntry> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn latest(&self, id: u64) -> Option<ProcessingSummary> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .and_then(|f| f.latest().cloned())
    }

    /// Append a summary as the file's next version and replace its current
    /// records. Returns the version assigned.
    pub fn append(
        &self,
        id: u64,
        mut summary: ProcessingSummary,
        records: Vec<CanonicalRecord>,
        players: Vec<PlayerStats>,
    ) -> Result<u32, ProcessingError> {
        let mut files = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = files.get_mut(&id).ok_or(ProcessingError::FileNotFound(id))?;

        let version = entry.latest().map_or(1, |s| s.version + 1);
        summary.version = version;
        entry.history.push(summary);
        entry.records = records;
        entry.players = players;
        tracing::debug!("FileStore: file {} now at version {}", id, version);
        Ok(version)
    }

    pub fn list(&self) -> Vec<FileMetadata> {
        let files = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<FileMetadata> = files
            .values()
            .map(|f| {
                let latest = f.latest();
                FileMetadata {
                    id: f.id,
                    file_name: f.file_name.clone(),
                    file_type: f.file_type.clone(),
                    uploaded_at: f.uploaded_at.clone(),
                    version: latest.map_or(0, |s| s.version),
                    status: latest.map(|s| s.status),
                    total_records: latest.map_or(0, |s| s.total_records),
                    matched_columns: latest.map(|s| s.matched_columns.clone()).unwrap_or_default(),
                    unmatched_columns: latest.map(|s| s.unmatched_columns.clone()).unwrap_or_default(),
                    missing_columns: latest.map(|s| s.missing_columns.clone()).unwrap_or_default(),
                }
            })
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }

    /// Exclusive write access to one file's history.
    ///
    /// Mutexes nobody holds or waits on are dropped on the way in, so the
    /// table stays as large as the set of ids currently being written.
    pub async fn lock(&self, id: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
