use std::sync::Arc;
use std::time::Duration;

use sipatrol_shared::{ConnectivityMonitor, HttpReportApi};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Feeds the monitor from periodic reachability checks against the API.
/// The monitor only notifies on edges, so repeated results are free.
pub fn spawn(
    api: Arc<HttpReportApi>,
    monitor: ConnectivityMonitor,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let reachable = api.ping().await;
                    debug!(reachable, "connectivity probe");
                    monitor.set_online(reachable);
                }
            }
        }
    })
}
