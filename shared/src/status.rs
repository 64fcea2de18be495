//! Read-only projection of queue and engine state for the presentation layer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::model::UnixTimeMs;
use crate::remote::DeliveryError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    /// Records still owed to the server (pending, syncing or failed).
    pub pending_count: usize,
    /// Subset of `pending_count` that will not be retried automatically.
    pub needs_attention_count: usize,
    pub is_syncing: bool,
    pub last_sync_at: Option<UnixTimeMs>,
    pub last_error: Option<DeliveryError>,
}

/// Writer side. Only the queue, engine and monitor wiring update it.
#[derive(Clone, Debug)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn surface(&self) -> StatusSurface {
        StatusSurface {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn set_counts(&self, pending: usize, needs_attention: usize) {
        self.tx.send_if_modified(|s| {
            let changed = s.pending_count != pending || s.needs_attention_count != needs_attention;
            s.pending_count = pending;
            s.needs_attention_count = needs_attention;
            changed
        });
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.is_syncing != syncing;
            s.is_syncing = syncing;
            changed
        });
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.online != online;
            s.online = online;
            changed
        });
    }

    pub(crate) fn pass_completed(&self, at: UnixTimeMs) {
        self.tx.send_modify(|s| {
            s.last_sync_at = Some(at);
        });
    }

    pub(crate) fn set_last_error(&self, error: Option<DeliveryError>) {
        self.tx.send_if_modified(|s| {
            let changed = s.last_error != error;
            s.last_error = error;
            changed
        });
    }
}

/// Reader handle given to UI code. Cannot mutate anything.
#[derive(Clone, Debug)]
pub struct StatusSurface {
    rx: watch::Receiver<SyncStatus>,
}

impl StatusSurface {
    pub fn snapshot(&self) -> SyncStatus {
        self.rx.borrow().clone()
    }

    /// Waits for the next change and returns the new state. `None` once the
    /// board has been dropped.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ErrorCategory;

    #[test]
    fn surface_sees_updates() {
        let board = StatusBoard::new();
        let surface = board.surface();

        board.set_counts(3, 1);
        board.set_syncing(true);
        board.set_online(true);

        let s = surface.snapshot();
        assert_eq!(s.pending_count, 3);
        assert_eq!(s.needs_attention_count, 1);
        assert!(s.is_syncing);
        assert!(s.online);
        assert_eq!(s.last_sync_at, None);
    }

    #[tokio::test]
    async fn changed_fires_only_on_real_change() {
        let board = StatusBoard::new();
        let mut surface = board.surface();

        board.set_counts(0, 0);
        board.pass_completed(UnixTimeMs(5));
        let s = surface.changed().await.unwrap();
        assert_eq!(s.last_sync_at, Some(UnixTimeMs(5)));
        assert_eq!(s.pending_count, 0);
    }

    #[test]
    fn last_error_roundtrips() {
        let board = StatusBoard::new();
        let err = DeliveryError::new(ErrorCategory::Network, "connect", "down", UnixTimeMs(1));
        board.set_last_error(Some(err.clone()));
        assert_eq!(board.snapshot().last_error, Some(err));
        board.set_last_error(None);
        assert_eq!(board.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn changed_returns_none_after_board_dropped() {
        let board = StatusBoard::new();
        let mut surface = board.surface();
        drop(board);
        assert_eq!(surface.changed().await, None);
    }
}
