//! End-to-end tests: a real relay hub, raw WebSocket producers, and sync
//! managers playing operator consoles.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use futures::{SinkExt, StreamExt};
use relaydesk_hub::websocket::registry::RegistryCensus;
use relaydesk_hub::{serve, AppState, Config};
use relaydesk_shared::{ConversationId, Event, Message, MessageBody, MessageId, Origin, Role};
use relaydesk_sync::{
    Connector, Link, ReconnectPolicy, SyncConfig, SyncError, SyncManager, SyncResult, SyncSnapshot,
    SyncStatus, WsConnector,
};
use time::macros::datetime;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHAT: ConversationId = ConversationId(7);
const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Utilities
// ============================================================================

async fn start_hub() -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(Config::default());

    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state, std::future::pending()).await;
    });

    (addr, state)
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 50,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: false,
        },
        ..SyncConfig::default()
    }
}

fn console(addr: SocketAddr) -> SyncManager {
    let connector = Arc::new(WsConnector::new(format!("ws://{}/ws", addr)));
    SyncManager::spawn(&sync_config(), connector, None)
}

async fn producer(addr: SocketAddr) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    let handshake = serde_json::to_string(&Event::Handshake {
        role: Role::Producer,
    })
    .unwrap();
    ws.send(WsMessage::Text(handshake)).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, event: &Event) {
    let json = serde_json::to_string(event).unwrap();
    ws.send(WsMessage::Text(json)).await.unwrap();
}

async fn recv_event(ws: &mut Ws) -> Event {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_census(state: &AppState, check: impl Fn(&RegistryCensus) -> bool) {
    for _ in 0..500 {
        if check(&state.relay.registry.census().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached expected state");
}

async fn wait_for_snapshot(manager: &SyncManager, check: impl Fn(&SyncSnapshot) -> bool) -> SyncSnapshot {
    for _ in 0..500 {
        let snapshot = manager.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sync state never reached expected shape");
}

fn customer_message(id: i64, text: &str) -> Event {
    Event::NewMessage {
        message: Message {
            id: Some(MessageId(id)),
            conversation_id: CHAT,
            created_at: datetime!(2024-05-01 10:00:00 UTC),
            body: MessageBody::text(text),
            origin: Origin::Customer,
            automated: false,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn customer_message_reaches_console_and_reply_reaches_producer() {
    let (addr, state) = start_hub().await;
    let mut bot = producer(addr).await;
    let manager = console(addr);

    manager.connect().await.unwrap();
    wait_for_census(&state, |c| c.viewers == 1 && c.producer_connected).await;

    send(&mut bot, &customer_message(1, "where is my order?")).await;
    let snapshot = wait_for_snapshot(&manager, |s| s.conversation(CHAT).is_some()).await;
    assert!(snapshot.conversation(CHAT).unwrap().waiting);
    assert_eq!(snapshot.counters.pending, 1);

    manager.reply(CHAT, "Checking now").unwrap();
    let Event::NewMessage { message } = recv_event(&mut bot).await else {
        panic!("producer expected a reply");
    };
    assert_eq!(message.origin, Origin::Operator);
    assert_eq!(message.body, MessageBody::text("Checking now"));

    let snapshot = manager.snapshot().await.unwrap();
    assert!(!snapshot.conversation(CHAT).unwrap().waiting);

    manager.shutdown().await;
}

#[tokio::test]
async fn read_receipt_reaches_other_console() {
    let (addr, state) = start_hub().await;
    let mut bot = producer(addr).await;
    let first = console(addr);
    let second = console(addr);

    first.connect().await.unwrap();
    second.connect().await.unwrap();
    wait_for_census(&state, |c| c.viewers == 2 && c.producer_connected).await;

    send(&mut bot, &customer_message(1, "hello?")).await;
    wait_for_snapshot(&second, |s| s.conversation(CHAT).is_some_and(|c| c.waiting)).await;

    first.mark_read(CHAT).unwrap();
    wait_for_snapshot(&second, |s| s.conversation(CHAT).is_some_and(|c| !c.waiting)).await;
}

/// Refuses every attempt until opened
struct Gate {
    inner: WsConnector,
    open: AtomicBool,
}

#[async_trait]
impl Connector for Gate {
    async fn connect(&self) -> SyncResult<Link> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        self.inner.connect().await
    }
}

#[tokio::test]
async fn replies_sent_offline_arrive_in_order_after_reconnect() {
    let (addr, state) = start_hub().await;
    let mut bot = producer(addr).await;
    wait_for_census(&state, |c| c.producer_connected).await;

    let gate = Arc::new(Gate {
        inner: WsConnector::new(format!("ws://{}/ws", addr)),
        open: AtomicBool::new(false),
    });
    let manager = SyncManager::spawn(&sync_config(), gate.clone(), None);

    for text in ["one", "two", "three"] {
        manager.reply(CHAT, text).unwrap();
    }
    let snapshot = manager.snapshot().await.unwrap();
    assert_eq!(snapshot.queued, 3);
    assert_ne!(snapshot.status, SyncStatus::Ready);

    gate.open.store(true, Ordering::SeqCst);
    manager.wait_for_status(|s| s.is_ready()).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        if let Event::NewMessage { message } = recv_event(&mut bot).await {
            received.push(message.body.preview());
        }
    }
    assert_eq!(received, vec!["one", "two", "three"]);

    let snapshot = wait_for_snapshot(&manager, |s| s.queued == 0).await;
    assert_eq!(snapshot.conversation(CHAT).unwrap().last_message.as_ref().unwrap().text, "three");
}
