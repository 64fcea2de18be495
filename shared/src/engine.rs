//! Drains the report queue to the remote API.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::model::{Clock, UnixTimeMs};
use crate::queue::{QueueError, ReportQueue};
use crate::remote::{CreateReportRequest, ErrorCategory, ReportApi};
use crate::status::StatusBoard;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("queue error during sync: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    ConnectivityRestored,
    Timer,
    Manual,
    Capture,
}

impl SyncTrigger {
    /// Whether this trigger retries failed reports before their backoff
    /// expires. Reconnects and explicit requests do; background ticks don't.
    pub fn bypasses_backoff(self) -> bool {
        matches!(self, SyncTrigger::ConnectivityRestored | SyncTrigger::Manual)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Timer => "timer",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Capture => "capture",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub trigger: SyncTrigger,
    /// Remote calls issued.
    pub attempted: usize,
    pub synced: usize,
    /// Of `synced`, how many the server already had.
    pub duplicates: usize,
    pub failed: usize,
    /// Not yet due, or waiting on the officer.
    pub skipped: usize,
    /// Set when the pass stopped early; remaining reports stay queued.
    pub aborted: Option<ErrorCategory>,
}

impl PassSummary {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            synced: 0,
            duplicates: 0,
            failed: 0,
            skipped: 0,
            aborted: None,
        }
    }

    pub fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A pass ran to the end (or aborted cleanly). With queued re-triggers
    /// this is the last pass run.
    Completed(PassSummary),
    /// A pass was already in flight; this trigger will run right after it.
    Coalesced,
    SkippedOffline,
}

#[derive(Default)]
struct Gate {
    running: bool,
    rerun: Option<SyncTrigger>,
}

/// Owns the gate for the duration of a trigger. Dropping it while still
/// holding the gate (error or cancelled future) clears `running` and any
/// queued re-trigger.
struct PassGuard<'a> {
    engine: &'a SyncEngine,
    holds_gate: bool,
}

impl PassGuard<'_> {
    /// Hands back the queued re-trigger, or releases the gate when there is
    /// none. Both happen under one lock so a late trigger is never dropped.
    fn next_or_release(&mut self) -> Option<SyncTrigger> {
        let Ok(mut gate) = self.engine.gate.lock() else {
            return None;
        };
        match gate.rerun.take() {
            Some(t) if self.engine.monitor.is_online() => Some(t),
            _ => {
                gate.running = false;
                self.engine.status.set_syncing(false);
                self.holds_gate = false;
                None
            }
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.holds_gate {
            if let Ok(mut gate) = self.engine.gate.lock() {
                gate.running = false;
                gate.rerun = None;
                self.engine.status.set_syncing(false);
            }
        }
        self.engine.idle.notify_waiters();
    }
}

/// Single-flight sync engine. At most one pass runs at a time; triggers that
/// arrive meanwhile collapse into one follow-up pass.
pub struct SyncEngine {
    queue: Arc<ReportQueue>,
    api: Arc<dyn ReportApi>,
    monitor: ConnectivityMonitor,
    status: StatusBoard,
    clock: Arc<dyn Clock>,
    gate: Mutex<Gate>,
    idle: Notify,
    delivered: Mutex<LruCache<String, UnixTimeMs>>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<ReportQueue>,
        api: Arc<dyn ReportApi>,
        monitor: ConnectivityMonitor,
        status: StatusBoard,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(queue.config().delivered_cache_size)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            queue,
            api,
            monitor,
            status,
            clock,
            gate: Mutex::new(Gate::default()),
            idle: Notify::new(),
            delivered: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn queue(&self) -> &Arc<ReportQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.gate.lock().map(|g| g.running).unwrap_or(false)
    }

    /// Resolves once no pass is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Starts a pass, or records the trigger for the pass in flight.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<TriggerOutcome, EngineError> {
        if !self.monitor.is_online() {
            debug!(%trigger, "offline, sync skipped");
            return Ok(TriggerOutcome::SkippedOffline);
        }

        {
            let Ok(mut gate) = self.gate.lock() else {
                return Ok(TriggerOutcome::Coalesced);
            };
            if gate.running {
                let keep = match gate.rerun {
                    Some(existing) => existing.bypasses_backoff() && !trigger.bypasses_backoff(),
                    None => false,
                };
                if !keep {
                    gate.rerun = Some(trigger);
                }
                debug!(%trigger, "sync pass in flight, trigger coalesced");
                return Ok(TriggerOutcome::Coalesced);
            }
            gate.running = true;
            self.status.set_syncing(true);
        }

        let mut guard = PassGuard {
            engine: self,
            holds_gate: true,
        };

        let mut next = trigger;
        loop {
            let summary = self.run_pass(next).await?;
            match guard.next_or_release() {
                Some(t) => next = t,
                None => return Ok(TriggerOutcome::Completed(summary)),
            }
        }
    }

    #[instrument(skip(self), fields(trigger = %trigger))]
    async fn run_pass(&self, trigger: SyncTrigger) -> Result<PassSummary, EngineError> {
        let mut summary = PassSummary::new(trigger);

        self.queue.recover_interrupted(self.clock.now()).await?;
        let pending = self.queue.list_pending().await;
        let policy = self.queue.policy().clone();
        let bypass = trigger.bypasses_backoff();
        let total = pending.len();

        debug!(pending = total, "sync pass started");

        for (position, record) in pending.into_iter().enumerate() {
            if !self.monitor.is_online() {
                info!("went offline mid-pass, stopping");
                summary.aborted = Some(ErrorCategory::Network);
                break;
            }
            if record.needs_attention(&policy) {
                summary.skipped += 1;
                continue;
            }
            // Later captures wait behind an earlier one still backing off.
            if !bypass && !record.is_due(self.clock.now()) {
                debug!(
                    local_id = %record.local_id(),
                    held = total - position - 1,
                    "oldest retryable report not due yet, holding the rest"
                );
                summary.skipped += total - position;
                break;
            }

            let local_id = record.local_id().clone();
            let key = record.idempotency_key();

            let already_delivered = self
                .delivered
                .lock()
                .map(|cache| cache.contains(key.as_str()))
                .unwrap_or(false);

            self.queue.mark_syncing(&local_id, self.clock.now()).await?;

            if already_delivered {
                debug!(%local_id, "already delivered this session, finalizing locally");
                self.queue.mark_synced(&local_id).await?;
                self.queue.remove(&local_id).await?;
                summary.synced += 1;
                summary.duplicates += 1;
                continue;
            }

            let request = CreateReportRequest::from_record(&record);
            summary.attempted += 1;

            match self.api.submit(&key, &request).await {
                Ok(receipt) => {
                    if let Ok(mut cache) = self.delivered.lock() {
                        cache.put(key.as_str().to_string(), self.clock.now());
                    }
                    self.queue.mark_synced(&local_id).await?;
                    self.queue.remove(&local_id).await?;
                    summary.synced += 1;
                    if receipt.duplicate {
                        summary.duplicates += 1;
                    }
                    info!(
                        %local_id,
                        report_id = receipt.report_id.as_deref().unwrap_or("-"),
                        duplicate = receipt.duplicate,
                        "report delivered"
                    );
                }
                Err(mut error) => {
                    // Backoff is scheduled from when the engine saw the failure.
                    error.at = self.clock.now();
                    let category = error.category;
                    warn!(%local_id, %category, code = %error.code, "report delivery failed");
                    self.status.set_last_error(Some(error.clone()));
                    self.queue.mark_failed(&local_id, error).await?;
                    summary.failed += 1;

                    if category.aborts_pass() {
                        summary.aborted = Some(category);
                        warn!(%category, "stopping sync pass, remaining reports stay queued");
                        break;
                    }
                }
            }
        }

        if summary.completed() {
            self.status.pass_completed(self.clock.now());
            if summary.failed == 0 {
                self.status.set_last_error(None);
            }
        }

        info!(
            attempted = summary.attempted,
            synced = summary.synced,
            failed = summary.failed,
            skipped = summary.skipped,
            aborted = ?summary.aborted,
            "sync pass finished"
        );
        Ok(summary)
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("running", &self.is_running())
            .field("monitor", &self.monitor)
            .finish()
    }
}
