use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use super::{RecordCodec, ReportStore, StoreError};
use crate::model::{LocalId, OfflineReportRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_reports (
    local_id TEXT PRIMARY KEY,
    captured_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    checksum TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_reports_captured ON offline_reports(captured_at ASC, local_id ASC);
"#;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StoreError::Full { size: 0, max: 0 },
            Some(ErrorCode::CannotOpen | ErrorCode::ReadOnly | ErrorCode::DatabaseBusy) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// SQLite-backed store. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    codec: RecordCodec,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, codec: RecordCodec) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, codec)
    }

    pub fn open_in_memory(codec: RecordCodec) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, codec)
    }

    fn init(conn: Connection, codec: RecordCodec) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!(sealed = codec.is_sealed(), "sqlite report store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            codec,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl ReportStore for SqliteStore {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError> {
        let rows: Vec<(String, String, Vec<u8>)> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT local_id, checksum, data FROM offline_reports ORDER BY captured_at ASC, local_id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, checksum, data)| self.codec.decode(&id, &data, &checksum))
            .collect())
    }

    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError> {
        let (data, checksum) = self.codec.encode(record)?;
        let local_id = record.local_id().as_str().to_string();
        let captured_at = i64::try_from(record.captured_at().0).map_err(|_| {
            StoreError::Serialization(format!(
                "captured_at {} out of range for storage",
                record.captured_at().0
            ))
        })?;
        let status = record.status().as_str();

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO offline_reports (local_id, captured_at, status, checksum, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(local_id) DO UPDATE SET
                    status = excluded.status,
                    checksum = excluded.checksum,
                    data = excluded.data
                "#,
                params![local_id, captured_at, status, checksum, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError> {
        let id = local_id.as_str().to_string();
        let row: Option<(String, Vec<u8>)> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT checksum, data FROM offline_reports WHERE local_id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(checksum, data)| self.codec.decode(local_id.as_str(), &data, &checksum))
            .transpose()
    }

    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        let id = local_id.as_str().to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM offline_reports WHERE local_id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError> {
        let ids: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT local_id FROM offline_reports ORDER BY captured_at ASC, local_id ASC",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await?;

        ids.into_iter()
            .map(|id| {
                LocalId::new(id.as_str()).map_err(|e| StoreError::Corrupted {
                    local_id: id,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, Sealer};
    use crate::testing::sample_record;

    #[tokio::test]
    async fn roundtrip_and_order() {
        let store = SqliteStore::open_in_memory(RecordCodec::plain()).unwrap();
        let late = sample_record(2_000);
        let early = sample_record(1_000);
        store.put(&late).await.unwrap();
        store.put(&early).await.unwrap();

        let ids = store.list_ids().await.unwrap();
        assert_eq!(ids, vec![early.local_id().clone(), late.local_id().clone()]);
        assert_eq!(store.get(late.local_id()).await.unwrap(), Some(late));
    }

    #[tokio::test]
    async fn out_of_range_capture_time_is_rejected() {
        let store = SqliteStore::open_in_memory(RecordCodec::plain()).unwrap();
        let record = sample_record(u64::MAX);
        assert!(matches!(
            store.put(&record).await,
            Err(StoreError::Serialization(_))
        ));
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let record = sample_record(1_000);

        {
            let store = SqliteStore::open(&path, RecordCodec::plain()).unwrap();
            store.put(&record).await.unwrap();
        }

        let store = SqliteStore::open(&path, RecordCodec::plain()).unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].as_ref().unwrap(), &record);
    }

    #[tokio::test]
    async fn sealed_rows_need_the_same_officer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let sealer: Arc<dyn CryptoProvider> = Arc::new(Sealer::new(&[5u8; 32]).unwrap());

        let codec = RecordCodec::sealed(Arc::clone(&sealer), "reports", Some("officer-a")).unwrap();
        let store = SqliteStore::open(&path, codec).unwrap();
        store.put(&sample_record(1)).await.unwrap();
        drop(store);

        let other = RecordCodec::sealed(sealer, "reports", Some("officer-b")).unwrap();
        let store = SqliteStore::open(&path, other).unwrap();
        let loaded = store.load_all().await.unwrap();
        assert!(matches!(loaded[0], Err(StoreError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn garbage_row_is_reported_not_fatal() {
        let store = SqliteStore::open_in_memory(RecordCodec::plain()).unwrap();
        store.put(&sample_record(1)).await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO offline_reports VALUES ('bad-row', 0, 'pending', 'x', x'00')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = SqliteStore::open_in_memory(RecordCodec::plain()).unwrap();
        let record = sample_record(1);
        store.put(&record).await.unwrap();
        assert!(store.delete(record.local_id()).await.unwrap());
        assert!(!store.delete(record.local_id()).await.unwrap());
    }
}
