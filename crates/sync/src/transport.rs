//! Relay transport
//!
//! A `Connector` opens one link to the relay hub. The manager owns the link
//! and treats it as a sink of outgoing events and a stream of incoming ones,
//! so tests can substitute an in-memory pair for the WebSocket.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use relaydesk_shared::{decode_frame, encode_frame, Event};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

pub type EventSink = Pin<Box<dyn Sink<Event, Error = SyncError> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = SyncResult<Event>> + Send>>;

/// One open connection to the relay
pub struct Link {
    pub sink: EventSink,
    /// Ends when the relay closes the connection
    pub stream: EventStream,
}

impl Link {
    pub fn new(
        sink: impl Sink<Event, Error = SyncError> + Send + 'static,
        stream: impl Stream<Item = SyncResult<Event>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens links to the relay hub
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> SyncResult<Link>;
}

/// WebSocket connector for the relay hub
pub struct WsConnector {
    url: String,
    token: Option<String>,
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            url: url.into(),
            token: None,
            connect_timeout: defaults.connect_timeout,
            max_frame_bytes: defaults.max_frame_bytes,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.relay_url.clone(),
            token: config.relay_token.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> SyncResult<Link> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| SyncError::InvalidRequest("token is not a valid header value".into()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| SyncError::Timeout)??;

        tracing::debug!(url = %self.url, "Relay transport open");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(SyncError::from)
            .with(|event: Event| async move { Ok::<_, SyncError>(WsMessage::Text(encode_frame(&event)?)) });

        let max_frame_bytes = self.max_frame_bytes;
        let stream = stream
            .map(move |msg| decode_message(msg, max_frame_bytes))
            .take_while(|item| futures::future::ready(!matches!(item, Some(Err(SyncError::Closed)))))
            .filter_map(futures::future::ready);

        Ok(Link::new(sink, stream))
    }
}

/// Turn a transport message into an event. `None` for control frames.
fn decode_message(
    msg: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    max_frame_bytes: usize,
) -> Option<SyncResult<Event>> {
    match msg {
        Ok(WsMessage::Text(text)) => Some(decode_frame(&text, max_frame_bytes).map_err(SyncError::from)),
        Ok(WsMessage::Close(frame)) => {
            if let Some(frame) = frame {
                tracing::info!(code = u16::from(frame.code), reason = %frame.reason, "Relay closed the connection");
            }
            Some(Err(SyncError::Closed))
        }
        // The relay only speaks text; tungstenite answers pings itself
        Ok(WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
        Err(e) => Some(Err(SyncError::from(e))),
    }
}
