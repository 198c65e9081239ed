use super::RegistryStorage;
use crate::error::{RegistryError, RegistryResult};
use crate::types::{SchemaVersion, Source, SourceId, SourceStatus, TableMapping};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory registry storage.
///
/// Per-source state lives in independent map entries, so writers for
/// different sources never contend; the version pointer CAS goes through the
/// entry lock of a single `DashMap` shard, never a global lock.
#[derive(Default)]
pub struct MemoryStorage {
    sources: DashMap<SourceId, Source>,
    /// Version pointer per source
    latest: DashMap<SourceId, u32>,
    schemas: DashMap<(SourceId, u32), SchemaVersion>,
    mappings: DashMap<SourceId, TableMapping>,
    statuses: DashMap<SourceId, SourceStatus>,
    sequences: DashMap<SourceId, AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStorage for MemoryStorage {
    async fn insert_source(&self, source: Source) -> RegistryResult<()> {
        if self.sources.contains_key(&source.id) {
            return Err(RegistryError::AlreadyExists(format!(
                "Source '{}'",
                source.id
            )));
        }
        self.sources.insert(source.id, source);
        Ok(())
    }

    async fn get_source(&self, id: SourceId) -> RegistryResult<Option<Source>> {
        Ok(self.sources.get(&id).map(|s| s.clone()))
    }

    async fn find_source_by_name(&self, name: &str) -> RegistryResult<Option<Source>> {
        Ok(self
            .sources
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.clone()))
    }

    async fn list_sources(&self) -> RegistryResult<Vec<Source>> {
        Ok(self.sources.iter().map(|entry| entry.clone()).collect())
    }

    async fn latest_version(&self, id: SourceId) -> RegistryResult<Option<u32>> {
        Ok(self.latest.get(&id).map(|v| *v))
    }

    async fn get_schema(&self, id: SourceId, version: u32) -> RegistryResult<Option<SchemaVersion>> {
        Ok(self.schemas.get(&(id, version)).map(|s| s.clone()))
    }

    async fn cas_latest_version(
        &self,
        id: SourceId,
        expected: Option<u32>,
        schema: SchemaVersion,
    ) -> RegistryResult<bool> {
        let version = schema.version;
        match self.latest.entry(id) {
            dashmap::Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                self.schemas.insert((id, version), schema);
                entry.insert(version);
                Ok(true)
            }
            dashmap::Entry::Occupied(mut entry) => {
                if expected != Some(*entry.get()) {
                    return Ok(false);
                }
                self.schemas.insert((id, version), schema);
                entry.insert(version);
                Ok(true)
            }
        }
    }

    async fn get_mapping(&self, id: SourceId) -> RegistryResult<Option<TableMapping>> {
        Ok(self.mappings.get(&id).map(|m| m.clone()))
    }

    async fn set_mapping(&self, mapping: TableMapping) -> RegistryResult<()> {
        self.mappings.insert(mapping.source_id, mapping);
        Ok(())
    }

    async fn get_status(&self, id: SourceId) -> RegistryResult<SourceStatus> {
        Ok(self.statuses.get(&id).map(|s| *s).unwrap_or_default())
    }

    async fn set_status(&self, id: SourceId, status: SourceStatus) -> RegistryResult<()> {
        self.statuses.insert(id, status);
        Ok(())
    }

    async fn next_sequence(&self, id: SourceId) -> RegistryResult<u64> {
        let counter = self.sequences.entry(id).or_insert_with(|| AtomicU64::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, ColumnType};

    #[tokio::test]
    async fn test_cas_first_writer_wins() {
        let storage = MemoryStorage::new();
        let id = SourceId::new();

        let v1 = SchemaVersion::new(id, 1, vec![ColumnDef::required("a", ColumnType::Integer)]);
        assert!(storage.cas_latest_version(id, None, v1.clone()).await.unwrap());

        // A concurrent writer that also observed "no version" loses
        let stale = SchemaVersion::new(id, 1, vec![ColumnDef::required("b", ColumnType::Text)]);
        assert!(!storage.cas_latest_version(id, None, stale).await.unwrap());

        // Advancing from the observed pointer wins
        let v2 = SchemaVersion::new(id, 2, vec![ColumnDef::required("a", ColumnType::Integer)]);
        assert!(storage.cas_latest_version(id, Some(1), v2).await.unwrap());
        assert_eq!(storage.latest_version(id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sequences_are_per_source() {
        let storage = MemoryStorage::new();
        let a = SourceId::new();
        let b = SourceId::new();

        assert_eq!(storage.next_sequence(a).await.unwrap(), 0);
        assert_eq!(storage.next_sequence(a).await.unwrap(), 1);
        assert_eq!(storage.next_sequence(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_source_rejected() {
        let storage = MemoryStorage::new();
        let source = Source::new("enrollment");
        storage.insert_source(source.clone()).await.unwrap();
        assert!(storage.insert_source(source).await.is_err());
    }
}
