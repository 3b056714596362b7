//! Persistence of task fingerprints between runs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// The record kept for a task after it last succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub fingerprint: Fingerprint,
    /// Seconds since the UNIX epoch.
    pub recorded_at: u64,
}

impl TaskRecord {
    pub fn new(fingerprint: Fingerprint) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();

        Self {
            fingerprint,
            recorded_at,
        }
    }
}

/// Persisted mapping from task name to its last known fingerprint.
///
/// Implementations must make an update of one record all-or-nothing: after a
/// crash the store holds either the old or the new record for a task.
pub trait FingerprintStore: Send + Sync {
    fn get(&self, task: &str) -> Result<Option<TaskRecord>, StoreError>;
    fn put(&self, task: &str, record: TaskRecord) -> Result<(), StoreError>;
    fn remove(&self, task: &str) -> Result<bool, StoreError>;
    fn names(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory store, nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryStore {
    fn get(&self, task: &str) -> Result<Option<TaskRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(task).cloned())
    }

    fn put(&self, task: &str, record: TaskRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(task.to_string(), record);
        Ok(())
    }

    fn remove(&self, task: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(task).is_some())
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.keys().cloned().collect())
    }
}

/// CBOR encoded store in a single file.
///
/// Every update rewrites the whole file into a temporary sibling and renames
/// it over the old one. Writers are serialized by the lock, which is held for
/// the duration of the rewrite.
#[derive(Debug)]
pub struct FileStore {
    path: Utf8PathBuf,
    records: RwLock<BTreeMap<String, TaskRecord>>,
}

impl FileStore {
    /// Opens the store, an unreadable or corrupted file starts out empty.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let records = match File::open(&path) {
            Ok(file) => match ciborium::from_reader(BufReader::new(file)) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(path = %path, "discarding unreadable fingerprint store: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn save(&self, records: &BTreeMap<String, TaskRecord>) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            ciborium::into_writer(records, &mut writer)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;

        Ok(())
    }
}

impl FingerprintStore for FileStore {
    fn get(&self, task: &str) -> Result<Option<TaskRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(task).cloned())
    }

    fn put(&self, task: &str, record: TaskRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let previous = records.insert(task.to_string(), record);

        if let Err(e) = self.save(&records) {
            // keep memory in line with the file
            match previous {
                Some(previous) => records.insert(task.to_string(), previous),
                None => records.remove(task),
            };
            return Err(e);
        }

        Ok(())
    }

    fn remove(&self, task: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let Some(previous) = records.remove(task) else {
            return Ok(false);
        };

        if let Err(e) = self.save(&records) {
            records.insert(task.to_string(), previous);
            return Err(e);
        }

        Ok(true)
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::fingerprint::Signature;

    fn record(extra: &str) -> TaskRecord {
        let mut fingerprint = Fingerprint::default();
        fingerprint
            .dependencies
            .insert("a.txt".into(), Signature::Hash("abc".into()));
        fingerprint.targets.insert("out/a.txt".into(), true);
        fingerprint.extra = Some(extra.into());
        TaskRecord::new(fingerprint)
    }

    fn state_path(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().join("state/.haori.state")).unwrap()
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let store = FileStore::open(&path).unwrap();
        store.put("contents:a", record("1")).unwrap();
        store.put("hash:sums", record("2")).unwrap();
        drop(store);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.names().unwrap(), vec!["contents:a", "hash:sums"]);
        let loaded = store.get("contents:a").unwrap().unwrap();
        assert_eq!(loaded.fingerprint, record("1").fingerprint);
    }

    #[test]
    fn test_file_store_remove() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let store = FileStore::open(&path).unwrap();
        store.put("a", record("1")).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());

        let store = FileStore::open(&path).unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_corrupted_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"\xff\xff not cbor").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.names().unwrap().is_empty());

        store.put("a", record("1")).unwrap();
        assert!(FileStore::open(&path).unwrap().get("a").unwrap().is_some());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());
        store.put("a", record("1")).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().fingerprint.extra.as_deref(), Some("1"));
        assert!(store.remove("a").unwrap());
    }
}
