//! Connection registry
//!
//! Tracks every live connection and which one currently holds the producer
//! routing slot. This is the only shared mutable structure in the hub.

use std::collections::HashMap;
use std::sync::Arc;

use relaydesk_shared::Role;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::{Connection, Liveness};
use crate::error::{HubError, HubResult};

#[derive(Default)]
struct RegistryInner {
    /// All active connections indexed by session_id
    connections: HashMap<Uuid, Arc<Connection>>,
    /// Session holding the producer slot (last registration wins)
    producer: Option<Uuid>,
}

/// Registry of live relay connections, cheap to clone and share
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly upgraded connection; it has no role yet
    pub async fn accept(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn.session_id, Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            total_connections = inner.connections.len(),
            "Relay connection accepted"
        );

        conn
    }

    /// Assign the handshake role.
    ///
    /// A producer takes over the routing slot. The previous producer keeps its
    /// socket but no longer receives unicast traffic.
    pub async fn handshake(&self, session_id: &Uuid, role: Role) -> HubResult<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let conn = inner
            .connections
            .get(session_id)
            .cloned()
            .ok_or(HubError::UnknownConnection)?;

        conn.assign_role(role)?;

        if role == Role::Producer {
            let previous = inner.producer.replace(*session_id);
            if let Some(previous) = previous.filter(|p| p != session_id) {
                tracing::info!(
                    session_id = %session_id,
                    superseded = %previous,
                    "Producer slot taken over"
                );
            }
        }

        tracing::info!(
            session_id = %session_id,
            role = %role,
            "Relay handshake completed"
        );

        Ok(conn)
    }

    /// Remove a connection. Returns it if it was still registered.
    ///
    /// Clears the producer slot only when this connection holds it.
    pub async fn disconnect(&self, session_id: &Uuid) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.remove(session_id)?;

        if inner.producer == Some(*session_id) {
            inner.producer = None;
            tracing::info!(session_id = %session_id, "Producer slot vacated");
        }

        if conn.liveness() == Liveness::Open {
            conn.mark_closed();
        }

        tracing::info!(
            session_id = %session_id,
            role = ?conn.role(),
            remaining_connections = inner.connections.len(),
            "Relay connection removed"
        );

        Some(conn)
    }

    /// Get a connection by session ID
    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner.connections.get(session_id).cloned()
    }

    /// Current producer-slot holder
    pub async fn producer(&self) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .producer
            .and_then(|id| inner.connections.get(&id))
            .cloned()
    }

    /// Every connection that completed a viewer handshake
    pub async fn viewers(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|c| c.role() == Some(Role::Viewer))
            .cloned()
            .collect()
    }

    /// Get total number of active connections
    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.connections.len()
    }

    /// Point-in-time counts by role
    pub async fn census(&self) -> RegistryCensus {
        let inner = self.inner.read().await;
        let mut census = RegistryCensus {
            connections: inner.connections.len(),
            producer_connected: inner.producer.is_some(),
            ..Default::default()
        };

        for conn in inner.connections.values() {
            match conn.role() {
                Some(Role::Viewer) => census.viewers += 1,
                Some(Role::Producer) => census.producers += 1,
                None => census.awaiting_handshake += 1,
            }
        }

        census
    }
}

/// Connection counts by role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryCensus {
    pub connections: usize,
    pub viewers: usize,
    /// Includes superseded producers that are still connected
    pub producers: usize,
    pub awaiting_handshake: usize,
    pub producer_connected: bool,
}
