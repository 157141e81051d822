//! Relay state shared across all connections
//!
//! Bundles the connection registry with the router built on top of it.

use std::sync::Arc;

use super::registry::{ConnectionRegistry, RegistryCensus};
use super::router::{EventRouter, RouterStats};

/// Relay state shared across all connections
#[derive(Clone)]
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub router: Arc<EventRouter>,
}

impl RelayState {
    /// Build relay state around an existing registry
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            router: Arc::new(EventRouter::new(registry.clone())),
            registry,
        }
    }

    /// Get statistics about the relay
    pub async fn get_stats(&self) -> RelayStats {
        RelayStats {
            registry: self.registry.census().await,
            routing: self.router.stats(),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(ConnectionRegistry::new())
    }
}

/// Statistics about relay connections and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub registry: RegistryCensus,
    pub routing: RouterStats,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::Connection;
    use relaydesk_shared::Role;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_stats() {
        let state = RelayState::default();
        let (tx, _rx) = mpsc::channel(1);

        let conn = state.registry.accept(Connection::new(tx)).await;
        state
            .registry
            .handshake(&conn.session_id, Role::Producer)
            .await
            .unwrap();

        let stats = state.get_stats().await;
        assert_eq!(stats.registry.connections, 1);
        assert!(stats.registry.producer_connected);
        assert_eq!(stats.routing.routed, 0);
    }
}
