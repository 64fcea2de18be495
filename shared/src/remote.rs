//! Remote report API seam: request/response types, error taxonomy, and the
//! trait the sync engine delivers through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{IdempotencyKey, OfflineReportRecord, UnixTimeMs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    /// The request may or may not have reached the server.
    Timeout,
    Validation,
    Unauthorized,
    Conflict,
    RateLimited,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Unauthorized
                | ErrorCategory::RateLimited
                | ErrorCategory::Server
                | ErrorCategory::Unknown
        )
    }

    /// Failures that will hit every remaining record the same way, so the
    /// pass stops instead of burning attempts.
    pub fn aborts_pass(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Unauthorized | ErrorCategory::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded, persisted description of why a delivery attempt failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub truncated: bool,
    pub at: UnixTimeMs,
}

impl DeliveryError {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        at: UnixTimeMs,
    ) -> Self {
        let mut message = message.into();
        let mut code = code.into();

        let message_truncated = message.len() > Self::MAX_MESSAGE_LENGTH;
        let code_truncated = code.len() > Self::MAX_CODE_LENGTH;

        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);

        Self {
            category,
            code,
            message,
            truncated: message_truncated || code_truncated,
            at,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for DeliveryError {}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// Maps an HTTP status from the reports endpoint onto the error taxonomy.
/// Returns `None` for success statuses.
pub fn classify_status(status: u16) -> Option<ErrorCategory> {
    match status {
        200..=299 => None,
        400 | 413 | 422 => Some(ErrorCategory::Validation),
        401 | 403 => Some(ErrorCategory::Unauthorized),
        408 | 504 => Some(ErrorCategory::Timeout),
        409 => Some(ErrorCategory::Conflict),
        429 => Some(ErrorCategory::RateLimited),
        500..=599 => Some(ErrorCategory::Server),
        _ => Some(ErrorCategory::Unknown),
    }
}

/// Body of `POST /api/reports`.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateReportRequest {
    pub image_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: String,
    pub idempotency_key: String,
    pub is_offline_submission: bool,
}

impl CreateReportRequest {
    pub fn from_record(record: &OfflineReportRecord) -> Self {
        let coords = record.coordinates();
        Self {
            image_data: record.photo().data_url(),
            notes: record.notes().map(str::to_owned),
            latitude: coords.latitude(),
            longitude: coords.longitude(),
            captured_at: record.captured_at().to_rfc3339(),
            idempotency_key: record.idempotency_key().as_str().to_owned(),
            is_offline_submission: true,
        }
    }
}

impl fmt::Debug for CreateReportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateReportRequest")
            .field("image_data_len", &self.image_data.len())
            .field("notes_present", &self.notes.is_some())
            .field("captured_at", &self.captured_at)
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

/// Server acknowledgement of a report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub report_id: Option<String>,
    /// The key had already been accepted; nothing new was created.
    pub duplicate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerProfile {
    pub id: String,
    pub full_name: Option<String>,
    pub role: String,
    pub assigned_unit_id: Option<String>,
}

impl OfficerProfile {
    pub const SECURITY_ROLE: &'static str = "security";

    pub fn is_security(&self) -> bool {
        self.role == Self::SECURITY_ROLE
    }
}

/// The remote report-creation endpoint.
#[async_trait]
pub trait ReportApi: Send + Sync {
    /// Delivers one report. Must be safe to call again with the same key.
    async fn submit(
        &self,
        key: &IdempotencyKey,
        request: &CreateReportRequest,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Profile of the signed-in officer, `None` if not provisioned yet.
    async fn current_officer(&self) -> Result<Option<OfficerProfile>, DeliveryError>;
}
