//! Offline report queue and sync engine for SiPatrol field officers.
//!
//! Reports captured without connectivity are persisted locally, then
//! delivered in capture order once the device is back online. Delivery is
//! idempotent: every report carries a key derived from its local id, so a
//! retry after a lost response never creates a second server report.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod engine;
#[cfg(feature = "http")]
pub mod http;
pub mod model;
pub mod photo;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod service;
pub mod session;
pub mod status;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

/// Upper bound on officer notes, in UTF-8 bytes.
pub const MAX_NOTES_BYTES: usize = 4096;

pub use config::{ConfigError, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor, SubscriptionId, Transition};
pub use crypto::{CryptoError, CryptoProvider, Sealer};
pub use engine::{EngineError, PassSummary, SyncEngine, SyncTrigger, TriggerOutcome};
#[cfg(feature = "http")]
pub use http::{HttpClientError, HttpReportApi};
pub use model::{
    Clock, Coordinates, IdempotencyKey, LocalId, ManualClock, ModelError, NewReport,
    OfflineReportRecord, ReportStatus, SystemClock, UnixTimeMs,
};
pub use photo::{Photo, PhotoError, PhotoFormat};
pub use queue::{QuarantinedRecord, QueueError, ReportQueue};
pub use remote::{
    CreateReportRequest, DeliveryError, DeliveryReceipt, ErrorCategory, OfficerProfile, ReportApi,
};
pub use retry::RetryPolicy;
pub use service::SyncService;
pub use session::{wait_for_officer, SessionError};
pub use status::{StatusBoard, StatusSurface, SyncStatus};
pub use store::{MemoryStore, RecordCodec, ReportStore, SnapshotStore, StoreError};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use store::SqliteStore;
