//! Durable local queue of captured reports awaiting delivery.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, SyncConfig};
use crate::model::{LocalId, ModelError, NewReport, OfflineReportRecord, ReportStatus, UnixTimeMs};
use crate::remote::{DeliveryError, ErrorCategory};
use crate::retry::RetryPolicy;
use crate::status::StatusBoard;
use crate::store::{ReportStore, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({0} reports), sync before capturing more")]
    Full(usize),

    #[error("photo too large: {size} bytes, max {max}")]
    PhotoTooLarge { size: usize, max: usize },

    #[error("duplicate report: {0}")]
    Duplicate(String),

    #[error("report not found: {0}")]
    NotFound(String),

    #[error("invalid transition for {local_id}: {from} -> {to}")]
    InvalidTransition {
        local_id: String,
        from: ReportStatus,
        to: ReportStatus,
    },

    #[error("report {0} does not need attention and cannot be discarded")]
    NotResolvable(String),

    #[error("invalid report: {0}")]
    Invalid(#[from] ModelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl QueueError {
    /// Storage failures stop the caller; everything else is about one record.
    pub fn is_storage(&self) -> bool {
        matches!(self, QueueError::Storage(_) | QueueError::Full(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantinedRecord {
    pub local_id: String,
    pub reason: String,
    pub at: UnixTimeMs,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<String, OfflineReportRecord>,
    quarantined: HashMap<String, QuarantinedRecord>,
}

/// Sorted by capture time, ties broken by local id so order is total.
fn capture_order(records: &mut [OfflineReportRecord]) {
    records.sort_by(|a, b| {
        a.captured_at()
            .cmp(&b.captured_at())
            .then_with(|| a.local_id().cmp(b.local_id()))
    });
}

fn require_status(
    record: &OfflineReportRecord,
    allowed: &[ReportStatus],
    to: ReportStatus,
) -> Result<(), QueueError> {
    if allowed.contains(&record.status()) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            local_id: record.local_id().to_string(),
            from: record.status(),
            to,
        })
    }
}

/// Owns every `OfflineReportRecord` until the server has confirmed it.
///
/// All mutations persist before they become visible; a failed write leaves
/// memory untouched.
pub struct ReportQueue {
    store: Arc<dyn ReportStore>,
    config: SyncConfig,
    policy: RetryPolicy,
    state: RwLock<QueueState>,
    status: StatusBoard,
}

impl ReportQueue {
    /// Loads the queue, recovering from an interrupted previous run:
    /// `syncing` rows become `pending`, `synced` rows are purged, and rows
    /// that cannot be decoded are quarantined instead of failing startup.
    #[instrument(skip(store, config, status))]
    pub async fn open(
        store: Arc<dyn ReportStore>,
        config: SyncConfig,
        status: StatusBoard,
        now: UnixTimeMs,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let loaded = store.load_all().await?;
        let mut state = QueueState::default();
        let mut recovered = 0usize;
        let mut purged = 0usize;

        for result in loaded {
            match result {
                Ok(mut record) => match record.status() {
                    ReportStatus::Synced => {
                        store.delete(record.local_id()).await?;
                        purged += 1;
                    }
                    ReportStatus::Syncing => {
                        Self::reset_interrupted(&mut record, now);
                        store.put(&record).await?;
                        recovered += 1;
                        state
                            .records
                            .insert(record.local_id().as_str().to_string(), record);
                    }
                    ReportStatus::Pending | ReportStatus::Failed => {
                        state
                            .records
                            .insert(record.local_id().as_str().to_string(), record);
                    }
                },
                Err(StoreError::Corrupted { local_id, reason }) => {
                    warn!(%local_id, %reason, "quarantining unreadable report");
                    state.quarantined.insert(
                        local_id.clone(),
                        QuarantinedRecord {
                            local_id,
                            reason,
                            at: now,
                        },
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        if state.records.len() > config.max_entries {
            warn!(
                count = state.records.len(),
                max = config.max_entries,
                "queue holds more reports than configured capacity"
            );
        }

        info!(
            reports = state.records.len(),
            recovered,
            purged,
            quarantined = state.quarantined.len(),
            "report queue opened"
        );

        let queue = Self {
            store,
            policy: RetryPolicy::from_config(&config),
            config,
            state: RwLock::new(state),
            status,
        };
        queue.publish(&*queue.state.read().await);
        Ok(queue)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn reset_interrupted(record: &mut OfflineReportRecord, now: UnixTimeMs) {
        record.status = ReportStatus::Pending;
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.record_failures = record.record_failures.saturating_add(1);
        record.last_error = Some(DeliveryError::new(
            ErrorCategory::Timeout,
            "interrupted",
            "delivery outcome unknown, attempt was interrupted",
            now,
        ));
        record.next_attempt_at = None;
    }

    fn publish(&self, state: &QueueState) {
        let owed = state
            .records
            .values()
            .filter(|r| r.status() != ReportStatus::Synced)
            .count();
        let attention = state
            .records
            .values()
            .filter(|r| r.needs_attention(&self.policy))
            .count();
        self.status.set_counts(owed, attention);
    }

    /// Persists a captured report. Success means the report is durable.
    #[instrument(skip(self, report, now))]
    pub async fn enqueue(
        &self,
        report: NewReport,
        now: UnixTimeMs,
    ) -> Result<OfflineReportRecord, QueueError> {
        if report.photo.len() > self.config.max_photo_bytes {
            return Err(QueueError::PhotoTooLarge {
                size: report.photo.len(),
                max: self.config.max_photo_bytes,
            });
        }

        let record = OfflineReportRecord::from_capture(report, now);
        let key = record.local_id().as_str().to_string();

        let mut state = self.state.write().await;

        if state.records.len() >= self.config.max_entries {
            warn!(max = self.config.max_entries, "queue full, rejecting capture");
            return Err(QueueError::Full(self.config.max_entries));
        }
        if state.records.contains_key(&key) {
            return Err(QueueError::Duplicate(key));
        }

        if let Err(e) = self.store.put(&record).await {
            error!(local_id = %key, error = %e, "failed to persist captured report");
            return Err(e.into());
        }

        state.records.insert(key.clone(), record.clone());
        self.publish(&state);
        info!(local_id = %key, captured_at = %record.captured_at(), "report queued");
        Ok(record)
    }

    /// Pending and failed reports, oldest capture first.
    pub async fn list_pending(&self) -> Vec<OfflineReportRecord> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .records
            .values()
            .filter(|r| r.status().is_deliverable())
            .cloned()
            .collect();
        capture_order(&mut pending);
        pending
    }

    pub async fn list_all(&self) -> Vec<OfflineReportRecord> {
        let state = self.state.read().await;
        let mut all: Vec<_> = state.records.values().cloned().collect();
        capture_order(&mut all);
        all
    }

    pub async fn needs_attention(&self) -> Vec<OfflineReportRecord> {
        let state = self.state.read().await;
        let mut stuck: Vec<_> = state
            .records
            .values()
            .filter(|r| r.needs_attention(&self.policy))
            .cloned()
            .collect();
        capture_order(&mut stuck);
        stuck
    }

    pub async fn get(&self, local_id: &LocalId) -> Option<OfflineReportRecord> {
        let state = self.state.read().await;
        state.records.get(local_id.as_str()).cloned()
    }

    /// Reports not yet confirmed by the server.
    pub async fn pending_count(&self) -> usize {
        let state = self.state.read().await;
        state
            .records
            .values()
            .filter(|r| r.status() != ReportStatus::Synced)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRecord> {
        let state = self.state.read().await;
        let mut list: Vec<_> = state.quarantined.values().cloned().collect();
        list.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        list
    }

    async fn update<F>(
        &self,
        local_id: &LocalId,
        apply: F,
    ) -> Result<OfflineReportRecord, QueueError>
    where
        F: FnOnce(&mut OfflineReportRecord) -> Result<(), QueueError>,
    {
        let mut state = self.state.write().await;
        let current = state
            .records
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.to_string()))?;

        let mut updated = current.clone();
        apply(&mut updated)?;

        if let Err(e) = self.store.put(&updated).await {
            error!(%local_id, error = %e, "failed to persist status change");
            return Err(e.into());
        }

        state
            .records
            .insert(local_id.as_str().to_string(), updated.clone());
        self.publish(&state);
        Ok(updated)
    }

    #[instrument(skip(self, now), fields(local_id = %local_id))]
    pub async fn mark_syncing(
        &self,
        local_id: &LocalId,
        now: UnixTimeMs,
    ) -> Result<OfflineReportRecord, QueueError> {
        self.update(local_id, |r| {
            require_status(
                r,
                &[ReportStatus::Pending, ReportStatus::Failed],
                ReportStatus::Syncing,
            )?;
            r.status = ReportStatus::Syncing;
            r.last_attempt_at = Some(now);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn mark_synced(&self, local_id: &LocalId) -> Result<OfflineReportRecord, QueueError> {
        let record = self
            .update(local_id, |r| {
                require_status(r, &[ReportStatus::Syncing], ReportStatus::Synced)?;
                r.status = ReportStatus::Synced;
                r.next_attempt_at = None;
                Ok(())
            })
            .await?;
        debug!("report confirmed by server");
        Ok(record)
    }

    /// Records a failed attempt and schedules the next one with backoff.
    #[instrument(skip(self, error), fields(local_id = %local_id, category = %error.category))]
    pub async fn mark_failed(
        &self,
        local_id: &LocalId,
        error: DeliveryError,
    ) -> Result<OfflineReportRecord, QueueError> {
        let policy = self.policy.clone();
        let record = self
            .update(local_id, |r| {
                require_status(r, &[ReportStatus::Syncing], ReportStatus::Failed)?;
                r.status = ReportStatus::Failed;
                r.attempt_count = r.attempt_count.saturating_add(1);
                if !error.category.aborts_pass() {
                    r.record_failures = r.record_failures.saturating_add(1);
                }
                r.next_attempt_at = Some(error.at.add_millis(policy.backoff_ms(r.attempt_count)));
                r.last_error = Some(error);
                Ok(())
            })
            .await?;

        if record.needs_attention(&self.policy) {
            warn!(
                attempts = record.attempt_count(),
                record_failures = record.record_failures(),
                "report needs officer attention, automatic retries stopped"
            );
        } else {
            debug!(
                attempts = record.attempt_count(),
                next_attempt_at = ?record.next_attempt_at(),
                "report delivery failed, will retry"
            );
        }
        Ok(record)
    }

    /// Deletes a confirmed report. Irreversible.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn remove(&self, local_id: &LocalId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.to_string()))?;
        if record.status() != ReportStatus::Synced {
            return Err(QueueError::InvalidTransition {
                local_id: local_id.to_string(),
                from: record.status(),
                to: ReportStatus::Synced,
            });
        }

        self.store.delete(local_id).await?;
        state.records.remove(local_id.as_str());
        self.publish(&state);
        debug!("report removed from queue");
        Ok(())
    }

    /// Officer-initiated retry: clears backoff and the attempt budget.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn retry(&self, local_id: &LocalId) -> Result<OfflineReportRecord, QueueError> {
        let record = self
            .update(local_id, |r| {
                require_status(
                    r,
                    &[ReportStatus::Failed, ReportStatus::Pending],
                    ReportStatus::Pending,
                )?;
                r.status = ReportStatus::Pending;
                r.attempt_count = 0;
                r.record_failures = 0;
                r.next_attempt_at = None;
                Ok(())
            })
            .await?;
        info!("report reset for retry");
        Ok(record)
    }

    /// Officer-initiated discard of a report the server will never accept.
    #[instrument(skip(self), fields(local_id = %local_id))]
    pub async fn discard(&self, local_id: &LocalId) -> Result<OfflineReportRecord, QueueError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(local_id.as_str())
            .ok_or_else(|| QueueError::NotFound(local_id.to_string()))?;
        if !record.needs_attention(&self.policy) {
            return Err(QueueError::NotResolvable(local_id.to_string()));
        }

        self.store.delete(local_id).await?;
        let removed = state.records.remove(local_id.as_str());
        self.publish(&state);
        warn!("report discarded by officer");
        removed.ok_or_else(|| QueueError::NotFound(local_id.to_string()))
    }

    /// Returns reports stranded in `syncing` (a pass died mid-record) to
    /// `pending`. Only safe while no pass is in flight.
    #[instrument(skip(self, now))]
    pub async fn recover_interrupted(&self, now: UnixTimeMs) -> Result<usize, QueueError> {
        let stranded: Vec<LocalId> = {
            let state = self.state.read().await;
            state
                .records
                .values()
                .filter(|r| r.status() == ReportStatus::Syncing)
                .map(|r| r.local_id().clone())
                .collect()
        };

        for id in &stranded {
            self.update(id, |r| {
                require_status(r, &[ReportStatus::Syncing], ReportStatus::Pending)?;
                Self::reset_interrupted(r, now);
                Ok(())
            })
            .await?;
        }
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "recovered interrupted deliveries");
        }
        Ok(stranded.len())
    }
}

impl std::fmt::Debug for ReportQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportQueue")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{new_report, FailableStore};
    use proptest::prelude::*;

    fn now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    async fn open(store: Arc<dyn ReportStore>) -> ReportQueue {
        ReportQueue::open(store, SyncConfig::default(), StatusBoard::new(), now())
            .await
            .unwrap()
    }

    fn err(category: ErrorCategory) -> DeliveryError {
        DeliveryError::new(category, "E", "failed", now())
    }

    #[tokio::test]
    async fn enqueue_assigns_id_and_pending() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let record = queue.enqueue(new_report(1_000), now()).await.unwrap();
        assert_eq!(record.status(), ReportStatus::Pending);
        assert_eq!(record.attempt_count(), 0);
        assert!(record.last_error().is_none());
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn enqueue_keeps_caller_supplied_id() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let id = LocalId::new("field-42").unwrap();
        let record = queue
            .enqueue(new_report(1).with_local_id(id.clone()), now())
            .await
            .unwrap();
        assert_eq!(record.local_id(), &id);

        let dup = queue.enqueue(new_report(2).with_local_id(id), now()).await;
        assert!(matches!(dup, Err(QueueError::Duplicate(_))));
    }

    #[tokio::test]
    async fn storage_failure_surfaces_and_leaves_nothing_behind() {
        let store = Arc::new(FailableStore::new(MemoryStore::new()));
        let queue = open(store.clone()).await;
        store.set_fail_puts(true);

        let result = queue.enqueue(new_report(1), now()).await;
        assert!(matches!(result, Err(QueueError::Storage(_))));
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_capture() {
        let config = SyncConfig {
            max_entries: 2,
            ..SyncConfig::default()
        };
        let queue = ReportQueue::open(Arc::new(MemoryStore::new()), config, StatusBoard::new(), now())
            .await
            .unwrap();
        queue.enqueue(new_report(1), now()).await.unwrap();
        queue.enqueue(new_report(2), now()).await.unwrap();
        assert!(matches!(
            queue.enqueue(new_report(3), now()).await,
            Err(QueueError::Full(2))
        ));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn list_pending_orders_by_capture_time() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        queue.enqueue(new_report(10 * 60_000), now()).await.unwrap();
        queue.enqueue(new_report(10 * 60_000 + 5 * 60_000), now()).await.unwrap();
        queue.enqueue(new_report(10 * 60_000 + 2 * 60_000), now()).await.unwrap();

        let order: Vec<u64> = queue
            .list_pending()
            .await
            .iter()
            .map(|r| r.captured_at().0)
            .collect();
        assert_eq!(order, vec![600_000, 720_000, 900_000]);
    }

    #[tokio::test]
    async fn lifecycle_pending_syncing_synced_removed() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        queue.mark_syncing(&id, now()).await.unwrap();
        assert!(queue.list_pending().await.is_empty());

        assert!(matches!(
            queue.remove(&id).await,
            Err(QueueError::InvalidTransition { .. })
        ));

        queue.mark_synced(&id).await.unwrap();
        queue.remove(&id).await.unwrap();
        assert!(queue.get(&id).await.is_none());
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_transitions_rejected() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        assert!(matches!(
            queue.mark_synced(&id).await,
            Err(QueueError::InvalidTransition { from: ReportStatus::Pending, .. })
        ));
        assert!(matches!(
            queue.mark_failed(&id, err(ErrorCategory::Server)).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        queue.mark_syncing(&id, now()).await.unwrap();
        assert!(matches!(
            queue.mark_syncing(&id, now()).await,
            Err(QueueError::InvalidTransition { from: ReportStatus::Syncing, .. })
        ));
    }

    #[tokio::test]
    async fn mark_failed_counts_and_backs_off() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        queue.mark_syncing(&id, now()).await.unwrap();
        let failed = queue.mark_failed(&id, err(ErrorCategory::Server)).await.unwrap();

        assert_eq!(failed.status(), ReportStatus::Failed);
        assert_eq!(failed.attempt_count(), 1);
        assert_eq!(failed.last_error().unwrap().category, ErrorCategory::Server);
        let next = failed.next_attempt_at().unwrap();
        assert!(next > now());
        assert!(!failed.is_due(now()));
        assert!(failed.is_due(next));
        assert_eq!(queue.list_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_status_change_is_not_applied_in_memory() {
        let store = Arc::new(FailableStore::new(MemoryStore::new()));
        let queue = open(store.clone()).await;
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        store.set_fail_puts(true);
        assert!(queue.mark_syncing(&id, now()).await.is_err());
        assert_eq!(queue.get(&id).await.unwrap().status(), ReportStatus::Pending);
    }

    #[tokio::test]
    async fn survives_restart() {
        let store = MemoryStore::new();
        let id = {
            let queue = open(Arc::new(store.clone())).await;
            queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone()
        };

        let reopened = open(Arc::new(store)).await;
        let record = reopened.get(&id).await.unwrap();
        assert_eq!(record.status(), ReportStatus::Pending);
        assert_eq!(record.captured_at(), UnixTimeMs(1));
    }

    #[tokio::test]
    async fn restart_recovers_syncing_and_purges_synced() {
        let store = MemoryStore::new();
        let (stranded, confirmed) = {
            let queue = open(Arc::new(store.clone())).await;
            let a = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();
            let b = queue.enqueue(new_report(2), now()).await.unwrap().local_id().clone();
            queue.mark_syncing(&a, now()).await.unwrap();
            queue.mark_syncing(&b, now()).await.unwrap();
            queue.mark_synced(&b).await.unwrap();
            (a, b)
        };

        let queue = open(Arc::new(store.clone())).await;
        let record = queue.get(&stranded).await.unwrap();
        assert_eq!(record.status(), ReportStatus::Pending);
        assert_eq!(record.attempt_count(), 1);
        assert_eq!(record.last_error().unwrap().category, ErrorCategory::Timeout);
        assert!(queue.get(&confirmed).await.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn corrupted_rows_are_quarantined() {
        let store = MemoryStore::new();
        let (good, bad) = {
            let queue = open(Arc::new(store.clone())).await;
            let good = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();
            let bad = queue.enqueue(new_report(2), now()).await.unwrap().local_id().clone();
            (good, bad)
        };
        store.corrupt(&bad);

        let queue = open(Arc::new(store)).await;
        assert!(queue.get(&good).await.is_some());
        assert!(queue.get(&bad).await.is_none());
        let quarantined = queue.quarantined().await;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].local_id, bad.as_str());
    }

    #[tokio::test]
    async fn validation_failure_needs_attention_and_can_be_discarded() {
        let status = StatusBoard::new();
        let queue = ReportQueue::open(
            Arc::new(MemoryStore::new()),
            SyncConfig::default(),
            status.clone(),
            now(),
        )
        .await
        .unwrap();
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        assert!(matches!(
            queue.discard(&id).await,
            Err(QueueError::NotResolvable(_))
        ));

        queue.mark_syncing(&id, now()).await.unwrap();
        queue.mark_failed(&id, err(ErrorCategory::Validation)).await.unwrap();
        assert_eq!(queue.needs_attention().await.len(), 1);
        assert_eq!(status.snapshot().needs_attention_count, 1);

        queue.discard(&id).await.unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(status.snapshot().pending_count, 0);
    }

    #[tokio::test]
    async fn exhausted_record_needs_attention_until_retried() {
        let config = SyncConfig {
            max_attempts: 2,
            ..SyncConfig::default()
        };
        let queue = ReportQueue::open(Arc::new(MemoryStore::new()), config, StatusBoard::new(), now())
            .await
            .unwrap();
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        for _ in 0..2 {
            queue.mark_syncing(&id, now()).await.unwrap();
            queue.mark_failed(&id, err(ErrorCategory::Server)).await.unwrap();
        }
        assert_eq!(queue.needs_attention().await.len(), 1);

        let retried = queue.retry(&id).await.unwrap();
        assert_eq!(retried.status(), ReportStatus::Pending);
        assert_eq!(retried.attempt_count(), 0);
        assert!(retried.is_due(now()));
        assert!(queue.needs_attention().await.is_empty());
    }

    #[tokio::test]
    async fn link_failures_do_not_spend_the_attempt_budget() {
        let config = SyncConfig {
            max_attempts: 2,
            ..SyncConfig::default()
        };
        let queue = ReportQueue::open(Arc::new(MemoryStore::new()), config, StatusBoard::new(), now())
            .await
            .unwrap();
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();

        for category in [
            ErrorCategory::Network,
            ErrorCategory::Unauthorized,
            ErrorCategory::RateLimited,
            ErrorCategory::Network,
        ] {
            queue.mark_syncing(&id, now()).await.unwrap();
            queue.mark_failed(&id, err(category)).await.unwrap();
        }
        let record = queue.get(&id).await.unwrap();
        assert_eq!(record.attempt_count(), 4);
        assert_eq!(record.record_failures(), 0);
        assert!(queue.needs_attention().await.is_empty());

        queue.mark_syncing(&id, now()).await.unwrap();
        queue.mark_failed(&id, err(ErrorCategory::Server)).await.unwrap();
        assert!(queue.needs_attention().await.is_empty());
        queue.mark_syncing(&id, now()).await.unwrap();
        queue.mark_failed(&id, err(ErrorCategory::Timeout)).await.unwrap();
        assert_eq!(queue.needs_attention().await.len(), 1);
    }

    #[tokio::test]
    async fn recover_interrupted_resets_stranded() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let id = queue.enqueue(new_report(1), now()).await.unwrap().local_id().clone();
        queue.mark_syncing(&id, now()).await.unwrap();

        assert_eq!(queue.recover_interrupted(now()).await.unwrap(), 1);
        assert_eq!(queue.get(&id).await.unwrap().status(), ReportStatus::Pending);
        assert_eq!(queue.recover_interrupted(now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn content_fields_untouched_by_delivery() {
        let queue = open(Arc::new(MemoryStore::new())).await;
        let original = queue
            .enqueue(new_report(7).with_notes("gate 3 forced").unwrap(), now())
            .await
            .unwrap();
        let id = original.local_id().clone();

        queue.mark_syncing(&id, now()).await.unwrap();
        let after = queue.mark_failed(&id, err(ErrorCategory::Server)).await.unwrap();

        assert_eq!(after.photo(), original.photo());
        assert_eq!(after.notes(), Some("gate 3 forced"));
        assert_eq!(after.coordinates(), original.coordinates());
        assert_eq!(after.captured_at(), original.captured_at());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn pending_is_always_capture_ordered(times in proptest::collection::vec(0u64..10_000, 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let order = rt.block_on(async {
                let queue = open(Arc::new(MemoryStore::new())).await;
                for t in &times {
                    queue.enqueue(new_report(*t), now()).await.unwrap();
                }
                queue.list_pending().await
            });

            let mut expected = times.clone();
            expected.sort_unstable();
            let got: Vec<u64> = order.iter().map(|r| r.captured_at().0).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
