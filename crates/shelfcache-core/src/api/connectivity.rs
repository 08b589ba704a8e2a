//! Online/offline signal shared between the host application and the façade.

use std::sync::Arc;

use tokio::sync::watch;

/// Cheap-to-clone handle on the connectivity flag.
///
/// The host application reports network changes with `set_online`; the
/// façade reads the flag per request and watches it to replay the offline
/// queue on reconnect.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Update the flag. Watchers are only woken by an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Number of live subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
