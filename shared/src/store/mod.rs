//! Durable storage backends for the offline report queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::{build_aad, CryptoError, CryptoProvider};
use crate::model::{LocalId, OfflineReportRecord};

mod memory;
mod snapshot;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use memory::MemoryStore;
pub use snapshot::SnapshotStore;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteStore;

pub(crate) const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage full: {size} bytes, max {max}")]
    Full { size: usize, max: usize },

    #[error("corrupted record {local_id}: {reason}")]
    Corrupted { local_id: String, reason: String },

    #[error("corrupted store: {reason}")]
    CorruptedStore { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Key/value persistence for queue records.
///
/// `load_all` yields per-record results so one unreadable row can be
/// quarantined without losing the rest of the queue.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError>;
    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError>;
    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError>;
    /// Returns whether a record was deleted.
    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError>;
    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError>;
}

#[async_trait]
impl<S: ReportStore + ?Sized> ReportStore for Arc<S> {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError> {
        (**self).load_all().await
    }

    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError> {
        (**self).put(record).await
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError> {
        (**self).get(local_id).await
    }

    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        (**self).delete(local_id).await
    }

    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError> {
        (**self).list_ids().await
    }
}

/// Encodes records as CBOR with a blake3 checksum, optionally sealed.
#[derive(Clone, Default)]
pub struct RecordCodec {
    sealer: Option<Arc<dyn CryptoProvider>>,
    aad: Vec<u8>,
}

impl RecordCodec {
    pub fn plain() -> Self {
        Self::default()
    }

    /// Seals payloads with AAD bound to `store_name` and the owning officer.
    pub fn sealed(
        sealer: Arc<dyn CryptoProvider>,
        store_name: &str,
        officer_id: Option<&str>,
    ) -> Result<Self, StoreError> {
        let aad = build_aad(store_name, RECORD_SCHEMA_VERSION, officer_id)?;
        Ok(Self {
            sealer: Some(sealer),
            aad,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }

    pub(crate) fn seal(&self, bytes: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        match &self.sealer {
            Some(sealer) => Ok(sealer.encrypt(&bytes, &self.aad)?),
            None => Ok(bytes),
        }
    }

    pub(crate) fn open(&self, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        match &self.sealer {
            Some(sealer) => Ok(sealer.decrypt(bytes, &self.aad)?),
            None => Ok(bytes.to_vec()),
        }
    }

    /// Returns the stored bytes and the hex checksum of the plaintext CBOR.
    pub(crate) fn encode(&self, record: &OfflineReportRecord) -> Result<(Vec<u8>, String), StoreError> {
        let mut cbor = Vec::new();
        ciborium::into_writer(record, &mut cbor)?;
        let checksum = blake3::hash(&cbor).to_hex().to_string();
        Ok((self.seal(cbor)?, checksum))
    }

    /// Any failure is reported as `Corrupted` for the given id so the caller
    /// can quarantine it.
    pub(crate) fn decode(
        &self,
        local_id: &str,
        data: &[u8],
        checksum: &str,
    ) -> Result<OfflineReportRecord, StoreError> {
        let corrupted = |reason: String| StoreError::Corrupted {
            local_id: local_id.to_string(),
            reason,
        };

        let cbor = self.open(data).map_err(|e| corrupted(e.to_string()))?;
        let actual = blake3::hash(&cbor).to_hex();
        if actual.as_str() != checksum {
            return Err(corrupted(format!(
                "checksum mismatch: expected {checksum}, got {actual}"
            )));
        }

        let record: OfflineReportRecord =
            ciborium::from_reader(&cbor[..]).map_err(|e| corrupted(e.to_string()))?;
        if record.local_id().as_str() != local_id {
            return Err(corrupted(format!(
                "row key does not match record id {}",
                record.local_id()
            )));
        }
        Ok(record)
    }
}

impl fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCodec")
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Sealer;
    use crate::testing::sample_record;

    #[test]
    fn plain_codec_roundtrip() {
        let codec = RecordCodec::plain();
        let record = sample_record(1_000);
        let (bytes, checksum) = codec.encode(&record).unwrap();
        let decoded = codec
            .decode(record.local_id().as_str(), &bytes, &checksum)
            .unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn sealed_codec_hides_plaintext() {
        let sealer: Arc<dyn CryptoProvider> = Arc::new(Sealer::new(&[3u8; 32]).unwrap());
        let codec = RecordCodec::sealed(sealer, "reports", Some("officer-1")).unwrap();
        let record = sample_record(1_000);
        let (bytes, checksum) = codec.encode(&record).unwrap();

        let (plain, _) = RecordCodec::plain().encode(&record).unwrap();
        assert_ne!(bytes, plain);
        assert_eq!(
            codec
                .decode(record.local_id().as_str(), &bytes, &checksum)
                .unwrap(),
            record
        );
    }

    #[test]
    fn decode_reports_corruption_with_id() {
        let codec = RecordCodec::plain();
        let record = sample_record(1_000);
        let (mut bytes, checksum) = codec.encode(&record).unwrap();
        bytes[0] ^= 0xff;
        let err = codec
            .decode(record.local_id().as_str(), &bytes, &checksum)
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { ref local_id, .. } if local_id == record.local_id().as_str()));
    }

    #[test]
    fn decode_rejects_mismatched_key() {
        let codec = RecordCodec::plain();
        let record = sample_record(1_000);
        let (bytes, checksum) = codec.encode(&record).unwrap();
        assert!(codec.decode("someone-else", &bytes, &checksum).is_err());
    }
}
