use crate::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key for a committed position: (consumer group, topic, partition)
type OffsetKey = (String, String, u32);

#[derive(Debug, Serialize, Deserialize)]
struct OffsetSnapshot {
    /// "group\0topic\0partition" → next offset to read
    committed: BTreeMap<String, u64>,
}

/// Durable committed offsets per consumer group.
///
/// A committed offset is the NEXT offset the group will read: committing `n`
/// means everything below `n` has had its side effects fully applied. Commits
/// are persisted immediately when a snapshot path is configured, so a
/// restarted consumer resumes without reprocessing acknowledged work (and
/// reprocesses unacknowledged work: at-least-once).
pub struct OffsetStore {
    committed: DashMap<OffsetKey, u64>,
    snapshot_path: Option<PathBuf>,
}

impl OffsetStore {
    /// Open the store, loading the snapshot file if one exists
    pub fn open(data_dir: Option<&Path>) -> Result<Self> {
        let snapshot_path = data_dir.map(|dir| dir.join("offsets.json"));
        let committed = DashMap::new();

        if let Some(path) = &snapshot_path {
            if path.exists() {
                let raw = fs::read_to_string(path)?;
                let snapshot: OffsetSnapshot = serde_json::from_str(&raw)
                    .map_err(|e| crate::Error::Other(format!("offset snapshot: {}", e)))?;
                for (key, offset) in snapshot.committed {
                    if let Some(parsed) = Self::parse_key(&key) {
                        committed.insert(parsed, offset);
                    }
                }
                info!(
                    path = %path.display(),
                    entries = committed.len(),
                    "Loaded committed offsets"
                );
            }
        }

        Ok(Self {
            committed,
            snapshot_path,
        })
    }

    /// Committed offset for a group/topic/partition, if any
    pub fn fetch(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry)
    }

    /// Durably record progress. Offsets only move forward: a stale commit
    /// from a retried batch is ignored rather than rewinding the group.
    pub fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        let key = (group.to_string(), topic.to_string(), partition);
        let mut advanced = true;
        self.committed
            .entry(key)
            .and_modify(|current| {
                if offset > *current {
                    *current = offset;
                } else {
                    advanced = false;
                }
            })
            .or_insert(offset);

        if advanced {
            debug!(group, topic, partition, offset, "Committed offset");
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let mut snapshot = OffsetSnapshot {
            committed: BTreeMap::new(),
        };
        for entry in self.committed.iter() {
            let (group, topic, partition) = entry.key();
            snapshot
                .committed
                .insert(format!("{}\0{}\0{}", group, topic, partition), *entry.value());
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(
            &tmp,
            serde_json::to_vec(&snapshot)
                .map_err(|e| crate::Error::Other(format!("offset snapshot: {}", e)))?,
        )?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn parse_key(raw: &str) -> Option<OffsetKey> {
        let mut parts = raw.split('\0');
        let group = parts.next()?.to_string();
        let topic = parts.next()?.to_string();
        let partition = parts.next()?.parse().ok()?;
        Some((group, topic, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_fetch() {
        let store = OffsetStore::open(None).unwrap();
        assert_eq!(store.fetch("loader", "rows", 0), None);

        store.commit("loader", "rows", 0, 10).unwrap();
        assert_eq!(store.fetch("loader", "rows", 0), Some(10));

        // Commits never rewind
        store.commit("loader", "rows", 0, 5).unwrap();
        assert_eq!(store.fetch("loader", "rows", 0), Some(10));
    }

    #[test]
    fn test_groups_are_independent() {
        let store = OffsetStore::open(None).unwrap();
        store.commit("detector", "uploads.raw", 0, 3).unwrap();
        store.commit("audit", "uploads.raw", 0, 1).unwrap();
        assert_eq!(store.fetch("detector", "uploads.raw", 0), Some(3));
        assert_eq!(store.fetch("audit", "uploads.raw", 0), Some(1));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = OffsetStore::open(Some(dir.path())).unwrap();
            store.commit("loader", "rows.transformed", 2, 41).unwrap();
        }

        let store = OffsetStore::open(Some(dir.path())).unwrap();
        assert_eq!(store.fetch("loader", "rows.transformed", 2), Some(41));
    }
}
