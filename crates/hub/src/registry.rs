//! Identity → live connection map.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{Connection, Role};
use crate::error::HubError;
use crate::wait;

/// Tracks which connection currently speaks for each participant identity.
///
/// Last writer wins: a reconnecting participant overwrites its own stale
/// entry, and removal only happens if the caller still owns the entry.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    changed: watch::Sender<u64>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            connections: RwLock::new(HashMap::new()),
            changed,
        }
    }

    /// Registers `conn` under its identity, returning the connection it replaced.
    pub async fn register(&self, conn: Connection) -> Option<Connection> {
        let previous = self
            .connections
            .write()
            .await
            .insert(conn.identity().to_string(), conn.clone());
        wait::notify(&self.changed);

        debug!(
            identity = %conn.identity(),
            conn = %conn.id(),
            replaced = previous.is_some(),
            "stored connection"
        );
        previous
    }

    /// Returns the current connection for `identity`.
    pub async fn lookup(&self, identity: &str) -> Option<Connection> {
        self.connections.read().await.get(identity).cloned()
    }

    /// Removes `conn` if it is still the registered connection for its identity.
    ///
    /// Returns `false` for a stale handle that has already been superseded.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let removed = {
            let mut map = self.connections.write().await;
            match map.get(conn.identity()) {
                Some(current) if current.id() == conn.id() => {
                    map.remove(conn.identity());
                    true
                }
                _ => false,
            }
        };
        if removed {
            wait::notify(&self.changed);
        } else {
            debug!(identity = %conn.identity(), conn = %conn.id(), "ignoring stale unregister");
        }
        removed
    }

    /// Waits until `identity` is registered.
    ///
    /// A zero `timeout` performs a single lookup and reports
    /// [`HubError::NotConnected`] if the identity is absent.
    pub async fn wait_for(
        &self,
        identity: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Connection, HubError> {
        if timeout.is_zero() {
            return self
                .lookup(identity)
                .await
                .ok_or_else(|| HubError::NotConnected {
                    identity: identity.to_string(),
                });
        }
        let what = format!("'{identity}' to connect");
        wait::wait_until(
            &self.changed,
            move || self.lookup(identity),
            timeout,
            cancel,
            &what,
        )
        .await
    }

    /// Returns every registered connection.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Returns the registered connections playing `role`.
    pub async fn with_role(&self, role: Role) -> Vec<Connection> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.role() == role)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
