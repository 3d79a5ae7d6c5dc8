//! In-memory record store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RecordStore, StoreError};
use crate::resource::{ResourceRecord, ResourceState};

/// Mutex-guarded map store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, ResourceRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, resource_id: &str) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.records.lock().await.get(resource_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        resource_id: &str,
        expected: Option<ResourceState>,
        record: ResourceRecord,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let accepted = match (records.get(resource_id), expected) {
            (None, None) => true,
            (Some(current), Some(state)) => current.state == state,
            _ => false,
        };
        if accepted {
            records.insert(resource_id.to_string(), record);
        }
        Ok(accepted)
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut out: Vec<ResourceRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(id: &str, state: ResourceState) -> ResourceRecord {
        ResourceRecord::new(id, "kv_record", state, Default::default())
    }

    #[tokio::test]
    async fn insert_requires_absence() {
        let store = MemoryRecordStore::new();
        let record = make_record("res-1", ResourceState::CreateInProgress);

        assert!(store
            .compare_and_swap("res-1", None, record.clone())
            .await
            .unwrap());
        assert!(!store.compare_and_swap("res-1", None, record).await.unwrap());
    }

    #[tokio::test]
    async fn swap_requires_the_expected_state() {
        let store = MemoryRecordStore::new();
        let record = make_record("res-1", ResourceState::CreateInProgress);
        store
            .compare_and_swap("res-1", None, record.clone())
            .await
            .unwrap();

        let mut done = record.clone();
        done.state = ResourceState::CreateComplete;
        assert!(!store
            .compare_and_swap("res-1", Some(ResourceState::UpdateComplete), done.clone())
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("res-1", Some(ResourceState::CreateInProgress), done)
            .await
            .unwrap());

        let loaded = store.load("res-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ResourceState::CreateComplete);
    }

    #[tokio::test]
    async fn load_of_missing_record_is_none() {
        let store = MemoryRecordStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_by_resource_id() {
        let store = MemoryRecordStore::new();
        for id in ["res-b", "res-a", "res-c"] {
            store
                .compare_and_swap(id, None, make_record(id, ResourceState::CreateComplete))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["res-a", "res-b", "res-c"]);
    }
}
