use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{RecordCodec, ReportStore, StoreError};
use crate::model::{LocalId, OfflineReportRecord};

#[derive(Clone)]
struct StoredRow {
    checksum: String,
    data: Vec<u8>,
}

/// Process-local store. Clones share the same rows, so a queue reopened on a
/// clone sees exactly what a restarted process would see on disk.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<BTreeMap<String, StoredRow>>>,
    codec: RecordCodec,
    max_entries: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: RecordCodec) -> Self {
        Self {
            codec,
            ..Self::default()
        }
    }

    /// Caps the number of rows, mimicking a device that ran out of space.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites a row's stored bytes, bypassing encoding.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn corrupt(&self, local_id: &LocalId) {
        if let Ok(mut rows) = self.rows.lock() {
            if let Some(row) = rows.get_mut(local_id.as_str()) {
                row.data = b"garbage".to_vec();
            }
        }
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(rows
            .iter()
            .map(|(id, row)| self.codec.decode(id, &row.data, &row.checksum))
            .collect())
    }

    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError> {
        let (data, checksum) = self.codec.encode(record)?;
        let mut rows = self.rows.lock().map_err(|_| StoreError::LockFailed)?;
        let key = record.local_id().as_str();

        if let Some(max) = self.max_entries {
            if !rows.contains_key(key) && rows.len() >= max {
                return Err(StoreError::Full {
                    size: rows.len() + 1,
                    max,
                });
            }
        }

        rows.insert(key.to_string(), StoredRow { checksum, data });
        Ok(())
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::LockFailed)?;
        rows.get(local_id.as_str())
            .map(|row| self.codec.decode(local_id.as_str(), &row.data, &row.checksum))
            .transpose()
    }

    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(rows.remove(local_id.as_str()).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::LockFailed)?;
        rows.keys()
            .map(|k| {
                LocalId::new(k.as_str()).map_err(|e| StoreError::Corrupted {
                    local_id: k.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_record;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        let record = sample_record(1_000);

        store.put(&record).await.unwrap();
        assert_eq!(store.get(record.local_id()).await.unwrap(), Some(record.clone()));
        assert_eq!(store.list_ids().await.unwrap(), vec![record.local_id().clone()]);

        assert!(store.delete(record.local_id()).await.unwrap());
        assert!(!store.delete(record.local_id()).await.unwrap());
        assert!(store.get(record.local_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clones_share_rows() {
        let store = MemoryStore::new();
        let reopened = store.clone();
        store.put(&sample_record(1)).await.unwrap();
        assert_eq!(reopened.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_store_rejects_new_rows_but_allows_updates() {
        let store = MemoryStore::new().with_max_entries(1);
        let record = sample_record(1);
        store.put(&record).await.unwrap();
        store.put(&record).await.unwrap();
        assert!(matches!(
            store.put(&sample_record(2)).await,
            Err(StoreError::Full { max: 1, .. })
        ));
    }

    #[tokio::test]
    async fn corrupted_row_surfaces_per_record() {
        let store = MemoryStore::new();
        let good = sample_record(1);
        let bad = sample_record(2);
        store.put(&good).await.unwrap();
        store.put(&bad).await.unwrap();
        store.corrupt(bad.local_id());

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(loaded.iter().filter(|r| r.is_err()).count(), 1);
    }
}
