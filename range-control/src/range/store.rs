//! Durable index of ranges.
//!
//! One JSON document maps `range_id` to its metadata. The document is
//! loaded on startup, mutated in memory under a writer lock and rewritten
//! atomically (write temp, then rename) after every change, so a crash can
//! lose at most the change in flight, never the document.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use fs::directory_manager::{DirectoryManager, DirectoryManagerFs};
use fs::file_reader::FileReader;
use fs::file_renamer::FileRenamer;
use fs::writer_file::FileWriter;
use fs::LocalFile;
use thiserror::Error;
use tracing::debug;

use crate::discovery::TopologyIpSource;
use crate::range::entity::RangeMetadata;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not read metadata store: {0}")]
    Read(#[from] fs::file_reader::FileReaderError),

    #[error("metadata store is corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),

    #[error("could not persist metadata store: {0}")]
    Write(#[from] fs::writer_file::WriteError),

    #[error("could not replace metadata store: {0}")]
    Replace(#[from] fs::file_renamer::RenameError),

    #[error("could not create metadata directory: {0}")]
    Directory(#[from] std::io::Error),

    #[error("range `{0}` already exists")]
    Collision(String),

    #[error("range `{0}` not found")]
    NotFound(String),
}

pub struct MetadataStore {
    path: PathBuf,
    ranges: RwLock<HashMap<String, RangeMetadata>>,
}

impl MetadataStore {
    /// Opens the store, loading the existing document when present.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let ranges = if path.is_file() {
            let content = LocalFile.read(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), ranges = ranges.len(), "metadata store opened");
        Ok(Self {
            path,
            ranges: RwLock::new(ranges),
        })
    }

    pub fn insert(&self, metadata: RangeMetadata) -> Result<(), StoreError> {
        let mut ranges = self.write_lock();
        if ranges.contains_key(&metadata.range_id) {
            return Err(StoreError::Collision(metadata.range_id));
        }
        ranges.insert(metadata.range_id.clone(), metadata);
        self.persist(&ranges)
    }

    pub fn get(&self, range_id: &str) -> Option<RangeMetadata> {
        self.read_lock().get(range_id).cloned()
    }

    pub fn list(&self) -> Vec<RangeMetadata> {
        let mut ranges: Vec<RangeMetadata> = self.read_lock().values().cloned().collect();
        ranges.sort_by(|a, b| a.range_id.cmp(&b.range_id));
        ranges
    }

    pub fn range_ids(&self) -> Vec<String> {
        self.read_lock().keys().cloned().collect()
    }

    /// Applies `mutate` to the entry and persists the document.
    pub fn update<F>(&self, range_id: &str, mutate: F) -> Result<RangeMetadata, StoreError>
    where
        F: FnOnce(&mut RangeMetadata),
    {
        let mut ranges = self.write_lock();
        let entry = ranges
            .get_mut(range_id)
            .ok_or_else(|| StoreError::NotFound(range_id.to_string()))?;
        mutate(entry);
        entry.touch();
        let snapshot = entry.clone();
        self.persist(&ranges)?;
        Ok(snapshot)
    }

    pub fn remove(&self, range_id: &str) -> Result<RangeMetadata, StoreError> {
        let mut ranges = self.write_lock();
        let removed = ranges
            .remove(range_id)
            .ok_or_else(|| StoreError::NotFound(range_id.to_string()))?;
        self.persist(&ranges)?;
        Ok(removed)
    }

    fn persist(&self, ranges: &HashMap<String, RangeMetadata>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                DirectoryManagerFs.create(parent)?;
            }
        }
        let content =
            serde_json::to_string_pretty(ranges).expect("range metadata should serialize");
        let temp_path = self.path.with_extension("json.tmp");
        LocalFile.write(&temp_path, content)?;
        LocalFile.rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RangeMetadata>> {
        self.ranges.read().expect("store lock should not be poisoned")
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RangeMetadata>> {
        self.ranges
            .write()
            .expect("store lock should not be poisoned")
    }
}

impl TopologyIpSource for MetadataStore {
    fn assigned_ip(&self, range_id: &str, guest_id: &str) -> Option<String> {
        self.read_lock()
            .get(range_id)?
            .vm_ips
            .get(guest_id)
            .cloned()
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::entity::RangeStatus;
    use assert_matches::assert_matches;

    fn store_in(dir: &std::path::Path) -> MetadataStore {
        MetadataStore::open(dir.join("ranges_metadata.json")).unwrap()
    }

    #[test]
    fn test_insert_get_and_reload() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());

        let mut metadata = RangeMetadata::new("125");
        metadata.vm_ips.insert("desktop".to_string(), "192.168.100.42".to_string());
        store.insert(metadata).unwrap();

        // A fresh store over the same file sees the persisted entry.
        let reloaded = store_in(tempdir.path());
        let range = reloaded.get("125").unwrap();
        assert_eq!(range.status, RangeStatus::Creating);
        assert_eq!(range.vm_ips["desktop"], "192.168.100.42");
    }

    #[test]
    fn test_duplicate_insert_is_a_collision() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());

        store.insert(RangeMetadata::new("125")).unwrap();
        let err = store.insert(RangeMetadata::new("125")).unwrap_err();
        assert_matches!(err, StoreError::Collision(id) => assert_eq!(id, "125"));
    }

    #[test]
    fn test_update_persists_atomically() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());
        store.insert(RangeMetadata::new("125")).unwrap();

        store
            .update("125", |range| {
                range.status = RangeStatus::Active;
                range.resource_ids.domains.push("cyris-desktop-125".to_string());
            })
            .unwrap();

        // No temp file left behind, and the content is the new state.
        assert!(!tempdir.path().join("ranges_metadata.json.tmp").exists());
        let reloaded = store_in(tempdir.path());
        assert_eq!(reloaded.get("125").unwrap().status, RangeStatus::Active);
    }

    #[test]
    fn test_update_unknown_range_is_not_found() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());
        let err = store.update("ghost", |_| {}).unwrap_err();
        assert_matches!(err, StoreError::NotFound(_));
    }

    #[test]
    fn test_remove_clears_the_entry() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());
        store.insert(RangeMetadata::new("125")).unwrap();

        store.remove("125").unwrap();
        assert!(store.get("125").is_none());

        let reloaded = store_in(tempdir.path());
        assert!(reloaded.get("125").is_none());
        assert_matches!(store.remove("125"), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn test_corrupted_document_is_reported() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("ranges_metadata.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_matches!(MetadataStore::open(path), Err(StoreError::Corrupted(_)));
    }

    #[test]
    fn test_list_is_sorted_by_range_id() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());
        for id in ["20", "1", "3"] {
            store.insert(RangeMetadata::new(id)).unwrap();
        }
        let ids: Vec<String> = store.list().into_iter().map(|r| r.range_id).collect();
        assert_eq!(ids, vec!["1", "20", "3"]); // lexicographic, stable
    }

    #[test]
    fn test_store_serves_topology_ips() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = store_in(tempdir.path());
        let mut metadata = RangeMetadata::new("125");
        metadata
            .vm_ips
            .insert("desktop".to_string(), "192.168.100.42".to_string());
        store.insert(metadata).unwrap();

        assert_eq!(
            store.assigned_ip("125", "desktop").as_deref(),
            Some("192.168.100.42")
        );
        assert!(store.assigned_ip("125", "ghost").is_none());
        assert!(store.assigned_ip("ghost", "desktop").is_none());
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(tempdir.path()));
        store.insert(RangeMetadata::new("125")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update("125", |range| {
                            range.tags.insert(format!("worker-{i}"), "done".to_string());
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("125").unwrap().tags.len(), 8);
    }
}
