use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::photo::Photo;
use crate::remote::DeliveryError;
use crate::retry::RetryPolicy;
use crate::MAX_NOTES_BYTES;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid local id: {0}")]
    InvalidId(String),

    #[error("latitude must be between -90 and 90, got {0}")]
    InvalidLatitude(f64),

    #[error("longitude must be between -180 and 180, got {0}")]
    InvalidLongitude(f64),

    #[error("notes exceed {max} bytes ({len})")]
    NotesTooLong { len: usize, max: usize },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Client-generated report identifier, assigned before any server round-trip.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(String);

impl LocalId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ModelError::InvalidId("local id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "local id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "local id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The idempotency token sent with every delivery attempt of this report.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey(format!("report-{}", self.0))
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn to_rfc3339(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse_rfc3339(s: &str) -> Result<Self, ModelError> {
        let parsed = DateTime::parse_from_rfc3339(s.trim())
            .map_err(|e| ModelError::InvalidTimestamp(format!("{s}: {e}")))?;
        u64::try_from(parsed.timestamp_millis())
            .map(Self)
            .map_err(|_| ModelError::InvalidTimestamp(format!("{s}: before unix epoch")))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// Source of "now" for the sync engine; swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self(AtomicU64::new(start.0))
    }

    pub fn set(&self, t: UnixTimeMs) {
        self.0.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.0.load(Ordering::SeqCst))
    }
}

/// Validated geographic coordinates, frozen at capture time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ModelError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ModelError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ModelError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Syncing,
    Failed,
    Synced,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Syncing => "syncing",
            ReportStatus::Failed => "failed",
            ReportStatus::Synced => "synced",
        }
    }

    /// Statuses a sync pass may pick up.
    pub fn is_deliverable(self) -> bool {
        matches!(self, ReportStatus::Pending | ReportStatus::Failed)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A report as captured by the officer, before it is queued.
#[derive(Clone)]
pub struct NewReport {
    pub(crate) local_id: Option<LocalId>,
    pub(crate) photo: Photo,
    pub(crate) notes: Option<String>,
    pub(crate) coordinates: Coordinates,
    pub(crate) captured_at: UnixTimeMs,
}

impl NewReport {
    pub fn new(photo: Photo, coordinates: Coordinates, captured_at: UnixTimeMs) -> Self {
        Self {
            local_id: None,
            photo,
            notes: None,
            coordinates,
            captured_at,
        }
    }

    /// Blank notes are dropped rather than stored as empty strings.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Result<Self, ModelError> {
        let notes = notes.into();
        if notes.len() > MAX_NOTES_BYTES {
            return Err(ModelError::NotesTooLong {
                len: notes.len(),
                max: MAX_NOTES_BYTES,
            });
        }
        self.notes = if notes.trim().is_empty() {
            None
        } else {
            Some(notes)
        };
        Ok(self)
    }

    pub fn with_local_id(mut self, local_id: LocalId) -> Self {
        self.local_id = Some(local_id);
        self
    }
}

impl fmt::Debug for NewReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewReport")
            .field("local_id", &self.local_id)
            .field("photo", &self.photo)
            .field("notes_present", &self.notes.is_some())
            .field("coordinates", &self.coordinates)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// The unit of durability in the offline queue.
///
/// Captured content (photo, notes, coordinates, capture time) is private and
/// has no setters; only the queue touches the delivery fields.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineReportRecord {
    local_id: LocalId,
    photo: Photo,
    notes: Option<String>,
    coordinates: Coordinates,
    captured_at: UnixTimeMs,
    enqueued_at: UnixTimeMs,

    pub(crate) status: ReportStatus,
    pub(crate) attempt_count: u32,
    /// Failures that point at this record rather than the link or account.
    /// Only these spend the automatic retry budget.
    #[serde(default)]
    pub(crate) record_failures: u32,
    pub(crate) last_error: Option<DeliveryError>,
    pub(crate) last_attempt_at: Option<UnixTimeMs>,
    pub(crate) next_attempt_at: Option<UnixTimeMs>,
}

impl OfflineReportRecord {
    pub(crate) fn from_capture(report: NewReport, enqueued_at: UnixTimeMs) -> Self {
        Self {
            local_id: report.local_id.unwrap_or_else(LocalId::generate),
            photo: report.photo,
            notes: report.notes,
            coordinates: report.coordinates,
            captured_at: report.captured_at,
            enqueued_at,
            status: ReportStatus::Pending,
            attempt_count: 0,
            record_failures: 0,
            last_error: None,
            last_attempt_at: None,
            next_attempt_at: None,
        }
    }

    pub fn local_id(&self) -> &LocalId {
        &self.local_id
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.local_id.idempotency_key()
    }

    pub fn photo(&self) -> &Photo {
        &self.photo
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn coordinates(&self) -> Coordinates {
        self.coordinates
    }

    pub fn captured_at(&self) -> UnixTimeMs {
        self.captured_at
    }

    pub fn enqueued_at(&self) -> UnixTimeMs {
        self.enqueued_at
    }

    pub fn status(&self) -> ReportStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn record_failures(&self) -> u32 {
        self.record_failures
    }

    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    pub fn last_attempt_at(&self) -> Option<UnixTimeMs> {
        self.last_attempt_at
    }

    pub fn next_attempt_at(&self) -> Option<UnixTimeMs> {
        self.next_attempt_at
    }

    /// Failed for a reason automatic retries cannot fix; the officer has to
    /// retry or discard it explicitly.
    /// Connectivity, auth and rate-limit failures never count here.
    pub fn needs_attention(&self, policy: &RetryPolicy) -> bool {
        self.status == ReportStatus::Failed
            && (policy.exhausted(self.record_failures)
                || self
                    .last_error
                    .as_ref()
                    .is_some_and(|e| !e.category.is_retryable()))
    }

    /// Whether backoff allows an automatic attempt at `now`.
    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        match self.status {
            ReportStatus::Pending => true,
            ReportStatus::Failed => self.next_attempt_at.map_or(true, |at| now >= at),
            ReportStatus::Syncing | ReportStatus::Synced => false,
        }
    }
}

// Redact debug output because this contains evidentiary user content.
impl fmt::Debug for OfflineReportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineReportRecord")
            .field("local_id", &self.local_id)
            .field("photo", &self.photo)
            .field("notes_present", &self.notes.is_some())
            .field("coordinates", &self.coordinates)
            .field("captured_at", &self.captured_at)
            .field("status", &self.status)
            .field("attempt_count", &self.attempt_count)
            .field("record_failures", &self.record_failures)
            .field("last_error", &self.last_error)
            .finish()
    }
}
