//! WebSocket handler for Axum
//!
//! Runs the two-phase relay protocol on each connection: the first frame must
//! be a handshake declaring the role, every later frame is routed. Any
//! protocol violation drops only the offending connection.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt, Stream};
use relaydesk_shared::{decode_frame, Event, Role};
use tokio::sync::mpsc;

use crate::error::{HubError, HubResult};
use crate::state::AppState;

use super::connection::{Connection, Frame};

/// Time the writer gets to flush a close frame after the session ends
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Close frame reasons are limited to 123 bytes by RFC 6455
const MAX_CLOSE_REASON: usize = 123;

/// WebSocket handler - upgrades HTTP connection to WebSocket
///
/// Connections arrive already authorized; the relay only classifies them.
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    tracing::debug!("Relay connection upgrade requested");

    // Leave headroom above the frame limit so oversized frames reach
    // `decode_frame` and get a proper close code instead of a transport error.
    let limit = app_state.config.max_frame_bytes.saturating_mul(2);
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, app_state))
}

/// Handle individual relay connection
async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded queue: a reader that falls this far behind is dropped
    let (tx, mut rx) = mpsc::channel::<Frame>(app_state.config.outbound_queue_capacity);

    let registry = app_state.relay.registry.clone();
    let conn = registry.accept(Connection::new(tx)).await;
    let session_id = conn.session_id;

    // Spawn task to send frames to the peer
    let writer_conn = Arc::clone(&conn);
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_conn.closed() => break,
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.to_string())).await.is_err() {
                        return; // Connection closed
                    }
                }
            }
        }

        if let Some(reason) = writer_conn.close_reason() {
            let _ = sender.send(Message::Close(Some(close_frame(reason)))).await;
        }
        let _ = sender.close().await;
    });

    let reason = run_session(&app_state, &conn, &mut receiver).await;

    if reason.is_protocol_violation() {
        tracing::warn!(
            session_id = %session_id,
            role = ?conn.role(),
            error = %reason,
            "Dropping connection after protocol violation"
        );
    } else {
        tracing::info!(
            session_id = %session_id,
            role = ?conn.role(),
            reason = %reason,
            "Relay connection closing"
        );
    }

    conn.close(reason);
    registry.disconnect(&session_id).await;

    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
    conn.mark_closed();
}

/// Drive one connection until it ends; returns why it ended
async fn run_session<S>(app_state: &AppState, conn: &Connection, receiver: &mut S) -> HubError
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let max_frame_bytes = app_state.config.max_frame_bytes;

    // Phase 1: handshake
    let handshake = tokio::time::timeout(
        app_state.config.handshake_timeout,
        await_handshake(receiver, max_frame_bytes),
    )
    .await;
    let role = match handshake {
        Ok(Ok(role)) => role,
        Ok(Err(e)) => return e,
        Err(_) => return HubError::HandshakeTimeout,
    };
    if let Err(e) = app_state.relay.registry.handshake(&conn.session_id, role).await {
        return e;
    }

    // Phase 2: routed traffic
    loop {
        let msg = tokio::select! {
            _ = conn.closed() => {
                return conn.close_reason().cloned().unwrap_or(HubError::Shutdown);
            }
            msg = receiver.next() => msg,
        };

        let event = match decode_message(msg, max_frame_bytes) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => return e,
        };

        if let Err(e) = app_state.relay.router.route(conn, &event).await {
            return e;
        }
    }
}

/// Read frames until the handshake arrives
async fn await_handshake<S>(receiver: &mut S, max_frame_bytes: usize) -> HubResult<Role>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        match decode_message(receiver.next().await, max_frame_bytes)? {
            Some(Event::Handshake { role }) => return Ok(role),
            Some(other) => return Err(HubError::HandshakeRequired(other.kind())),
            None => continue,
        }
    }
}

/// Turn a transport message into an event. `Ok(None)` for control frames.
fn decode_message(
    msg: Option<Result<Message, axum::Error>>,
    max_frame_bytes: usize,
) -> HubResult<Option<Event>> {
    match msg {
        None | Some(Ok(Message::Close(_))) => Err(HubError::PeerClosed),
        Some(Err(e)) => Err(HubError::Transport(e.to_string())),
        Some(Ok(Message::Text(text))) => Ok(Some(decode_frame(&text, max_frame_bytes)?)),
        Some(Ok(Message::Binary(_))) => Err(HubError::BinaryFrame),
        // Axum answers pings itself
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(None),
    }
}

fn close_frame(reason: &HubError) -> CloseFrame<'static> {
    let mut text = reason.to_string();
    if text.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }

    CloseFrame {
        code: reason.close_code(),
        reason: Cow::Owned(text),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relaydesk_shared::SchemaError;

    const LIMIT: usize = 1024;

    #[test]
    fn test_control_frames_are_skipped() {
        let result = decode_message(Some(Ok(Message::Ping(vec![1]))), LIMIT);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_binary_frame_is_violation() {
        let result = decode_message(Some(Ok(Message::Binary(vec![0, 1]))), LIMIT);
        assert_eq!(result, Err(HubError::BinaryFrame));
    }

    #[test]
    fn test_end_of_stream_is_peer_close() {
        assert_eq!(decode_message(None, LIMIT), Err(HubError::PeerClosed));
    }

    #[test]
    fn test_malformed_text_is_violation() {
        let result = decode_message(Some(Ok(Message::Text("{".to_string()))), LIMIT);
        assert!(matches!(
            result,
            Err(HubError::InvalidFrame(SchemaError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_handshake_must_come_first() {
        let frames = vec![
            Ok(Message::Ping(vec![])),
            Ok(Message::Text(
                r#"{"type":"conversation_deleted","conversation_id":4}"#.to_string(),
            )),
        ];
        let mut stream = futures::stream::iter(frames);

        let result = await_handshake(&mut stream, LIMIT).await;
        assert_eq!(
            result,
            Err(HubError::HandshakeRequired("conversation_deleted"))
        );
    }

    #[tokio::test]
    async fn test_handshake_role_parsed() {
        let frames = vec![Ok(Message::Text(
            r#"{"type":"handshake","role":"viewer"}"#.to_string(),
        ))];
        let mut stream = futures::stream::iter(frames);

        assert_eq!(await_handshake(&mut stream, LIMIT).await, Ok(Role::Viewer));
    }

    #[test]
    fn test_close_reason_truncated() {
        let long = HubError::Transport("x".repeat(400));
        let frame = close_frame(&long);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(frame.code, 1011);
    }
}
