use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;
use crate::connection::LogicalConnection;
use crate::identity::ConnectionIdentity;

/// All logical connections of a node that are not closed yet, by identity.
///
/// NB: This lock is never held while waiting for a connection's lock, and only guards the map
///  itself.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<ConnectionIdentity, Arc<LogicalConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    /// Returns `false` if there is already a connection with the same identity
    pub async fn insert(&self, conn: Arc<LogicalConnection>) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(conn.identity()) {
            return false;
        }
        debug!("registering connection {}", conn.identity());
        connections.insert(conn.identity().clone(), conn);
        true
    }

    pub async fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<LogicalConnection>> {
        self.connections.read().await
            .get(identity)
            .cloned()
    }

    #[cfg(test)]
    pub async fn remove(&self, identity: &ConnectionIdentity) -> Option<Arc<LogicalConnection>> {
        let result = self.connections.write().await
            .remove(identity);
        if result.is_some() {
            debug!("deregistered connection {}", identity);
        }
        result
    }

    /// Removes the connection if it is the one registered under its identity
    pub async fn deregister(&self, conn: &LogicalConnection) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(conn.identity()) {
            Some(registered) if std::ptr::eq(Arc::as_ptr(registered), conn) => {
                connections.remove(conn.identity());
                debug!("deregistered connection {}", conn.identity());
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn identities(&self) -> Vec<ConnectionIdentity> {
        self.connections.read().await
            .keys()
            .cloned()
            .collect()
    }
}
