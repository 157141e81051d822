//! Event routing
//!
//! Decides which connections receive a frame based on the sender's role and
//! the event kind, then queues it on each recipient without waiting. A
//! recipient whose queue is full is dropped instead of stalling the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relaydesk_shared::{encode_frame, Event, Route};

use super::connection::{Connection, DeliveryError, Frame};
use super::registry::ConnectionRegistry;
use crate::error::{HubError, HubResult};

/// Result of routing a single event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Recipients the frame was queued for
    pub delivered: usize,
    /// Recipients dropped because their queue was full
    pub evicted: usize,
    /// Producer-addressed traffic with no producer registered
    pub dropped: bool,
}

/// Running totals exposed on the stats endpoint
#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    delivered: AtomicU64,
    dropped_without_producer: AtomicU64,
    evicted: AtomicU64,
}

/// Snapshot of router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped_without_producer: u64,
    pub evicted: u64,
}

/// Routes events between producer and viewers
pub struct EventRouter {
    registry: ConnectionRegistry,
    counters: RouterCounters,
}

impl EventRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            counters: RouterCounters::default(),
        }
    }

    /// Route an event received from `sender`.
    ///
    /// Fails only when the sender has not completed a handshake or sends a
    /// second one; the caller drops the connection in that case.
    pub async fn route(&self, sender: &Connection, event: &Event) -> HubResult<RouteOutcome> {
        let role = sender
            .role()
            .ok_or(HubError::HandshakeRequired(event.kind()))?;
        let route = event.route(role).ok_or(HubError::DuplicateHandshake)?;

        let frame: Frame = Arc::from(encode_frame(event)?);
        let mut outcome = RouteOutcome::default();

        let mut recipients = Vec::new();
        if matches!(route, Route::Producer | Route::ProducerAndPeers) {
            match self.registry.producer().await {
                Some(producer) => recipients.push(producer),
                None => outcome.dropped = true,
            }
        }
        if matches!(route, Route::Viewers | Route::Peers | Route::ProducerAndPeers) {
            let include_sender = route == Route::Viewers;
            recipients.extend(
                self.registry
                    .viewers()
                    .await
                    .into_iter()
                    .filter(|c| include_sender || c.session_id != sender.session_id),
            );
        }

        for conn in recipients {
            match conn.deliver(Arc::clone(&frame)) {
                Ok(()) => outcome.delivered += 1,
                Err(DeliveryError::Full) => {
                    outcome.evicted += 1;
                    tracing::warn!(
                        session_id = %conn.session_id,
                        role = ?conn.role(),
                        "Outbound queue full, dropping slow connection"
                    );
                    conn.close(HubError::SlowConsumer);
                    self.registry.disconnect(&conn.session_id).await;
                }
                Err(DeliveryError::Closed) => {
                    tracing::debug!(
                        session_id = %conn.session_id,
                        "Skipping connection that is already closing"
                    );
                }
            }
        }

        self.record(&outcome);

        tracing::debug!(
            session_id = %sender.session_id,
            event_type = event.kind(),
            conversation_id = ?event.conversation_id(),
            route = ?route,
            recipients = outcome.delivered,
            evicted = outcome.evicted,
            "Routed event"
        );
        if outcome.dropped {
            tracing::debug!(
                session_id = %sender.session_id,
                event_type = event.kind(),
                "No producer registered, dropping producer-bound event"
            );
        }

        Ok(outcome)
    }

    fn record(&self, outcome: &RouteOutcome) {
        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.counters
            .evicted
            .fetch_add(outcome.evicted as u64, Ordering::Relaxed);
        if outcome.dropped {
            self.counters
                .dropped_without_producer
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_without_producer: self
                .counters
                .dropped_without_producer
                .load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relaydesk_shared::{ConversationId, Message, MessageBody, Origin, Role};
    use time::macros::datetime;
    use tokio::sync::mpsc;

    async fn join(
        registry: &ConnectionRegistry,
        role: Role,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = registry.accept(Connection::new(tx)).await;
        registry.handshake(&conn.session_id, role).await.unwrap();
        (conn, rx)
    }

    fn message(origin: Origin, text: &str) -> Event {
        Event::NewMessage {
            message: Message {
                id: None,
                conversation_id: ConversationId(7),
                created_at: datetime!(2024-05-01 10:00:00 UTC),
                body: MessageBody::text(text),
                origin,
                automated: false,
            },
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_producer_broadcasts_to_viewers() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (a, mut rx_a) = join(&registry, Role::Producer, 8).await;
        let (_b, mut rx_b) = join(&registry, Role::Viewer, 8).await;
        let (_c, mut rx_c) = join(&registry, Role::Viewer, 8).await;

        let outcome = router.route(&a, &message(Origin::Customer, "hi")).await.unwrap();

        assert_eq!(outcome.delivered, 2);
        assert_eq!(drain(&mut rx_a), 0);
        assert_eq!(drain(&mut rx_b), 1);
        assert_eq!(drain(&mut rx_c), 1);
    }

    #[tokio::test]
    async fn test_viewer_reply_reaches_producer_only() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, Role::Producer, 8).await;
        let (b, mut rx_b) = join(&registry, Role::Viewer, 8).await;
        let (_c, mut rx_c) = join(&registry, Role::Viewer, 8).await;

        router.route(&b, &message(Origin::Operator, "on it")).await.unwrap();

        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 0);
        assert_eq!(drain(&mut rx_c), 0);
    }

    #[tokio::test]
    async fn test_reply_without_producer_is_dropped() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (b, _rx_b) = join(&registry, Role::Viewer, 8).await;

        let outcome = router.route(&b, &message(Origin::Operator, "hello?")).await.unwrap();

        assert!(outcome.dropped);
        assert_eq!(outcome.delivered, 0);
        assert_eq!(router.stats().dropped_without_producer, 1);
    }

    #[tokio::test]
    async fn test_read_receipt_reaches_other_viewers() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, Role::Producer, 8).await;
        let (b, mut rx_b) = join(&registry, Role::Viewer, 8).await;
        let (_c, mut rx_c) = join(&registry, Role::Viewer, 8).await;

        router
            .route(&b, &Event::mark_read(ConversationId(7)))
            .await
            .unwrap();

        assert_eq!(drain(&mut rx_a), 0);
        assert_eq!(drain(&mut rx_b), 0);
        assert_eq!(drain(&mut rx_c), 1);
    }

    #[tokio::test]
    async fn test_toggle_reaches_producer_and_peers() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, Role::Producer, 8).await;
        let (b, mut rx_b) = join(&registry, Role::Viewer, 8).await;
        let (_c, mut rx_c) = join(&registry, Role::Viewer, 8).await;

        let toggle = Event::AutomationUpdate {
            conversation_id: ConversationId(7),
            automated_replies_enabled: false,
        };
        let outcome = router.route(&b, &toggle).await.unwrap();

        assert_eq!(outcome.delivered, 2);
        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 0);
        assert_eq!(drain(&mut rx_c), 1);
    }

    #[tokio::test]
    async fn test_slow_viewer_is_evicted() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (a, _rx_a) = join(&registry, Role::Producer, 8).await;
        let (slow, _rx_slow) = join(&registry, Role::Viewer, 1).await;
        let (_fast, mut rx_fast) = join(&registry, Role::Viewer, 8).await;

        router.route(&a, &message(Origin::Customer, "one")).await.unwrap();
        let outcome = router.route(&a, &message(Origin::Customer, "two")).await.unwrap();

        assert_eq!(outcome.evicted, 1);
        assert_eq!(drain(&mut rx_fast), 2);
        assert!(registry.get(&slow.session_id).await.is_none());
        assert_eq!(slow.close_reason(), Some(&HubError::SlowConsumer));
    }

    #[tokio::test]
    async fn test_unregistered_sender_rejected() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (tx, _rx) = mpsc::channel(1);
        let anonymous = registry.accept(Connection::new(tx)).await;

        let result = router.route(&anonymous, &Event::mark_read(ConversationId(1))).await;
        assert_eq!(result, Err(HubError::HandshakeRequired("status_update")));
    }

    #[tokio::test]
    async fn test_repeated_handshake_rejected() {
        let registry = ConnectionRegistry::new();
        let router = EventRouter::new(registry.clone());
        let (b, _rx) = join(&registry, Role::Viewer, 1).await;

        let result = router.route(&b, &Event::Handshake { role: Role::Producer }).await;
        assert_eq!(result, Err(HubError::DuplicateHandshake));
    }
}
