//! Composition root: owns the monitor, queue and engine and runs the
//! background triggers between `start` and `shutdown`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, SubscriptionId};
use crate::engine::{EngineError, SyncEngine, SyncTrigger, TriggerOutcome};
use crate::model::{Clock, LocalId, NewReport, OfflineReportRecord};
use crate::queue::{QueueError, ReportQueue};
use crate::remote::ReportApi;
use crate::status::{StatusBoard, StatusSurface, SyncStatus};
use crate::store::ReportStore;

pub struct SyncService {
    queue: Arc<ReportQueue>,
    engine: Arc<SyncEngine>,
    monitor: ConnectivityMonitor,
    status: StatusBoard,
    clock: Arc<dyn Clock>,
    sync_interval: Duration,
    subscription: SubscriptionId,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// One-shot passes kicked off by capture and retry.
    triggers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Opens (and recovers) the queue. No background work starts until
    /// [`SyncService::start`].
    pub async fn open(
        store: Arc<dyn ReportStore>,
        api: Arc<dyn ReportApi>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let status = StatusBoard::new();
        let sync_interval = Duration::from_millis(config.sync_interval_ms);
        let queue = Arc::new(ReportQueue::open(store, config, status.clone(), clock.now()).await?);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&queue),
            api,
            monitor.clone(),
            status.clone(),
            Arc::clone(&clock),
        ));

        status.set_online(monitor.is_online());
        let board = status.clone();
        let subscription = monitor.subscribe(move |t| board.set_online(t.to.is_online()));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            queue,
            engine,
            monitor,
            status,
            clock,
            sync_interval,
            subscription,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            triggers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the reconnect listener and the periodic timer. Idempotent.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("task registry poisoned, sync service not started");
            return;
        };
        if !tasks.is_empty() || *self.shutdown_tx.borrow() {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let mut connectivity = self.monitor.watch();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *connectivity.borrow_and_update();
                        if status.is_online() {
                            run_trigger(&engine, SyncTrigger::ConnectivityRestored).await;
                        }
                    }
                }
            }
            debug!("connectivity listener stopped");
        }));

        let engine = Arc::clone(&self.engine);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.sync_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => run_trigger(&engine, SyncTrigger::Timer).await,
                }
            }
            debug!("sync timer stopped");
        }));

        info!(interval_ms = period.as_millis() as u64, "sync service started");
    }

    /// Persists the report, then kicks off a pass if the device is online.
    /// Returns as soon as the report is durable.
    pub async fn capture(&self, report: NewReport) -> Result<OfflineReportRecord, QueueError> {
        let record = self.queue.enqueue(report, self.clock.now()).await?;
        if self.monitor.is_online() {
            self.spawn_trigger(SyncTrigger::Capture);
        }
        Ok(record)
    }

    /// Runs a pass now, ignoring backoff.
    pub async fn sync_now(&self) -> Result<TriggerOutcome, EngineError> {
        self.engine.trigger(SyncTrigger::Manual).await
    }

    /// Officer retry of a stuck report, followed by an immediate pass.
    pub async fn retry(&self, local_id: &LocalId) -> Result<OfflineReportRecord, QueueError> {
        let record = self.queue.retry(local_id).await?;
        if self.monitor.is_online() {
            self.spawn_trigger(SyncTrigger::Manual);
        }
        Ok(record)
    }

    pub async fn discard(&self, local_id: &LocalId) -> Result<OfflineReportRecord, QueueError> {
        self.queue.discard(local_id).await
    }

    fn spawn_trigger(&self, trigger: SyncTrigger) {
        if *self.shutdown_tx.borrow() {
            return;
        }
        let Ok(mut triggers) = self.triggers.lock() else {
            warn!(%trigger, "trigger registry poisoned, pass not started");
            return;
        };
        triggers.retain(|t| !t.is_finished());

        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown_tx.subscribe();
        triggers.push(tokio::spawn(async move {
            if !*shutdown.borrow() {
                run_trigger(&engine, trigger).await;
            }
        }));
    }

    pub fn queue(&self) -> &Arc<ReportQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn surface(&self) -> StatusSurface {
        self.status.surface()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// Stops background triggers and waits for any in-flight pass.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        if let Ok(mut triggers) = self.triggers.lock() {
            tasks.append(&mut triggers);
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }

        self.engine.wait_idle().await;
        self.monitor.unsubscribe(self.subscription);
        info!("sync service stopped");
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.monitor.unsubscribe(self.subscription);
    }
}

async fn run_trigger(engine: &SyncEngine, trigger: SyncTrigger) {
    match engine.trigger(trigger).await {
        Ok(TriggerOutcome::Completed(summary)) => {
            debug!(%trigger, synced = summary.synced, failed = summary.failed, "triggered pass done");
        }
        Ok(outcome) => debug!(%trigger, ?outcome, "trigger did not start a pass"),
        Err(e) => warn!(%trigger, error = %e, "sync pass failed"),
    }
}
