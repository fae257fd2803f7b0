use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
    None,
}

/// Device-level reachability as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub reachable: bool,
    pub connection: ConnectionType,
}

impl NetworkStatus {
    pub fn online(connection: ConnectionType) -> Self {
        Self {
            reachable: true,
            connection,
        }
    }

    pub fn offline() -> Self {
        Self {
            reachable: false,
            connection: ConnectionType::None,
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online(ConnectionType::Unknown)
    }
}

/// Wraps the device connectivity API: a push-style change feed plus a
/// synchronous "is reachable" query. Clones observe the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Follow a platform change feed. Must be called inside a tokio runtime.
    pub fn from_stream(
        initial: NetworkStatus,
        changes: impl Stream<Item = NetworkStatus> + Send + 'static,
    ) -> Self {
        let monitor = Self::new(initial);
        let feed = monitor.clone();
        tokio::spawn(async move {
            let mut changes = Box::pin(changes);
            while let Some(status) = changes.next().await {
                feed.report(status);
            }
        });
        monitor
    }

    /// Record a platform notification. Repeats of the current status are
    /// not re-broadcast.
    pub fn report(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.reachable != status.reachable {
                info!(
                    reachable = status.reachable,
                    connection = ?status.connection,
                    "network reachability changed"
                );
            }
            *current = status;
            true
        });
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.tx.borrow().reachable
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::default())
    }
}
