//! Online/offline signal with edge-only notification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: Connectivity,
    pub to: Connectivity,
}

impl Transition {
    pub fn came_online(self) -> bool {
        self.to == Connectivity::Online
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(Transition) + Send + Sync>;

struct Shared {
    tx: watch::Sender<Connectivity>,
    callbacks: Mutex<BTreeMap<SubscriptionId, Callback>>,
    next_id: AtomicU64,
}

/// Last known reachability, fed by whatever platform signal the shell has.
///
/// "Online" is a link-level heuristic; a failed delivery while online is an
/// ordinary retryable failure.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    shared: Arc<Shared>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            shared: Arc::new(Shared {
                tx,
                callbacks: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn current_status(&self) -> Connectivity {
        *self.shared.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Feeds a raw signal. Returns the transition if the status changed;
    /// repeated identical signals return `None` and notify nobody.
    pub fn report(&self, status: Connectivity) -> Option<Transition> {
        let mut from = status;
        let changed = self.shared.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            from = *current;
            *current = status;
            true
        });
        if !changed {
            return None;
        }

        let transition = Transition { from, to: status };
        if transition.came_online() {
            info!("connectivity restored");
        } else {
            warn!("connectivity lost, reports will queue locally");
        }

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.shared.callbacks.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => {
                warn!("connectivity callback registry poisoned");
                Vec::new()
            }
        };
        for cb in callbacks {
            cb(transition);
        }
        Some(transition)
    }

    pub fn set_online(&self, online: bool) -> Option<Transition> {
        self.report(Connectivity::from_online(online))
    }

    /// Registers a callback invoked exactly once per transition.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Transition) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut map) = self.shared.callbacks.lock() {
            map.insert(id, Arc::new(callback));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared
            .callbacks
            .lock()
            .map(|mut map| map.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Async view of the signal. `changed()` fires on edges only.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.shared.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.current_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn repeated_signals_do_not_double_fire() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.set_online(true).is_some());
        assert!(monitor.set_online(true).is_none());
        assert!(monitor.set_online(true).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(monitor.set_online(false).is_some());
        assert!(monitor.set_online(false).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transition_carries_direction() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let t = monitor.report(Connectivity::Online).unwrap();
        assert_eq!(t.from, Connectivity::Offline);
        assert_eq!(t.to, Connectivity::Online);
        assert!(t.came_online());
        assert_eq!(monitor.current_status(), Connectivity::Online);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let monitor = ConnectivityMonitor::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let id = monitor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(monitor.unsubscribe(id));
        assert!(!monitor.unsubscribe(id));
        monitor.set_online(true);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_resubscribe() {
        let monitor = ConnectivityMonitor::default();
        let inner = monitor.clone();
        monitor.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        monitor.set_online(true);
    }

    #[tokio::test]
    async fn watch_sees_edges() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let mut rx = monitor.watch();
        monitor.set_online(false);
        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Online);
        assert!(!rx.has_changed().unwrap());
    }
}
