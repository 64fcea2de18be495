use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{RecordCodec, ReportStore, StoreError};
use crate::model::{LocalId, OfflineReportRecord};

const STORE_MAGIC: &[u8; 4] = b"SPQS";
const CURRENT_SCHEMA_VERSION: u32 = 1;
const DEFAULT_MAX_BYTES: usize = 256 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone)]
struct SnapshotRow {
    local_id: String,
    checksum: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// Whole-queue snapshot file, rewritten atomically on every mutation.
///
/// Layout: optional seal over a CBOR envelope (magic `SPQS`, schema version,
/// blake3 checksum) whose payload is the list of individually encoded rows.
pub struct SnapshotStore {
    path: PathBuf,
    codec: RecordCodec,
    max_bytes: usize,
    rows: Mutex<BTreeMap<String, SnapshotRow>>,
}

impl SnapshotStore {
    pub async fn open(path: impl Into<PathBuf>, codec: RecordCodec) -> Result<Self, StoreError> {
        Self::open_with_limit(path, codec, DEFAULT_MAX_BYTES).await
    }

    pub async fn open_with_limit(
        path: impl Into<PathBuf>,
        codec: RecordCodec,
        max_bytes: usize,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let read_path = path.clone();
        let raw = tokio::task::spawn_blocking(move || read_if_exists(&read_path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))??;

        let rows = match raw {
            None => BTreeMap::new(),
            Some(bytes) => decode_snapshot(&bytes, &codec, max_bytes)?,
        };
        debug!(path = %path.display(), rows = rows.len(), "snapshot store opened");

        Ok(Self {
            path,
            codec,
            max_bytes,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, rows: &BTreeMap<String, SnapshotRow>) -> Result<(), StoreError> {
        let bytes = encode_snapshot(rows, &self.codec)?;
        if bytes.len() > self.max_bytes {
            return Err(StoreError::Full {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Err(StoreError::CorruptedStore {
            reason: "empty file",
        }),
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn encode_snapshot(
    rows: &BTreeMap<String, SnapshotRow>,
    codec: &RecordCodec,
) -> Result<Vec<u8>, StoreError> {
    let list: Vec<&SnapshotRow> = rows.values().collect();
    let mut payload = Vec::new();
    ciborium::into_writer(&list, &mut payload)?;

    let envelope = SnapshotEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;
    codec.seal(envelope_bytes)
}

fn decode_snapshot(
    bytes: &[u8],
    codec: &RecordCodec,
    max_bytes: usize,
) -> Result<BTreeMap<String, SnapshotRow>, StoreError> {
    if bytes.len() > max_bytes {
        return Err(StoreError::Full {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let envelope_bytes = codec.open(bytes)?;
    let envelope: SnapshotEnvelope = ciborium::from_reader(&envelope_bytes[..])?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::CorruptedStore {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    let list: Vec<SnapshotRow> = ciborium::from_reader(&envelope.payload[..])?;
    let mut rows = BTreeMap::new();
    for row in list {
        if rows.contains_key(&row.local_id) {
            warn!(local_id = %row.local_id, "duplicate row in snapshot, keeping first");
            continue;
        }
        rows.insert(row.local_id.clone(), row);
    }
    Ok(rows)
}

#[async_trait]
impl ReportStore for SnapshotStore {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .map(|row| self.codec.decode(&row.local_id, &row.data, &row.checksum))
            .collect())
    }

    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError> {
        let (data, checksum) = self.codec.encode(record)?;
        let key = record.local_id().as_str().to_string();
        let row = SnapshotRow {
            local_id: key.clone(),
            checksum,
            data,
        };

        let mut rows = self.rows.lock().await;
        let previous = rows.insert(key.clone(), row);

        // Rollback on failed persist
        if let Err(e) = self.persist(&rows).await {
            match previous {
                Some(prev) => rows.insert(key, prev),
                None => rows.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError> {
        let rows = self.rows.lock().await;
        rows.get(local_id.as_str())
            .map(|row| self.codec.decode(&row.local_id, &row.data, &row.checksum))
            .transpose()
    }

    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(previous) = rows.remove(local_id.as_str()) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&rows).await {
            rows.insert(local_id.as_str().to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError> {
        let rows = self.rows.lock().await;
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

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}
