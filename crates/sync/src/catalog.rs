//! Durable store reads
//!
//! The relay carries only live deltas. After every (re)connect, and when an
//! update names a conversation the session has never seen, the manager
//! reloads authoritative state through the REST API.

use std::time::Duration;

use async_trait::async_trait;
use relaydesk_shared::{
    ChatStats, ConversationId, ConversationState, Message, MessageBody, MessageId, Origin,
};
use reqwest::Client;
use serde::de::{self, DeserializeOwned, Unexpected};
use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;

use crate::error::SyncResult;

/// Request timeout for catalog reads
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Authoritative conversation data
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn conversations(&self) -> SyncResult<Vec<ConversationState>>;
    async fn messages(&self, conversation_id: ConversationId) -> SyncResult<Vec<Message>>;
    async fn stats(&self) -> SyncResult<ChatStats>;
}

/// Catalog backed by the chat REST API
pub struct HttpCatalog {
    client: Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn conversations(&self) -> SyncResult<Vec<ConversationState>> {
        let rows: Vec<ChatRow> = self.get("/chats").await?;
        Ok(rows.into_iter().map(ConversationState::from).collect())
    }

    async fn messages(&self, conversation_id: ConversationId) -> SyncResult<Vec<Message>> {
        let rows: Vec<MessageRow> = self
            .get(&format!("/chats/{}/messages", conversation_id))
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn stats(&self) -> SyncResult<ChatStats> {
        let row: StatsRow = self.get("/stats").await?;
        Ok(row.into())
    }
}

// =============================================================================
// Row shapes returned by the API
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChatRow {
    id: i64,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    waiting: bool,
    #[serde(default)]
    ai: bool,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<ChatRow> for ConversationState {
    fn from(row: ChatRow) -> Self {
        let mut state = ConversationState::new(ConversationId(row.id));
        state.label = row.uuid.unwrap_or_default();
        state.waiting = row.waiting;
        state.automated_replies_enabled = row.ai;
        state.tags = row.tags.unwrap_or_default().into_iter().collect();
        state
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MessageType {
    Question,
    Answer,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default)]
    message: String,
    message_type: MessageType,
    #[serde(default)]
    ai: bool,
    #[serde(default)]
    image_url: Option<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let origin = match row.message_type {
            MessageType::Question => Origin::Customer,
            MessageType::Answer if row.ai => Origin::Automated,
            MessageType::Answer => Origin::Operator,
        };
        let body = match row.image_url {
            Some(url) => MessageBody::Image {
                url,
                caption: Some(row.message).filter(|c| !c.is_empty()),
            },
            None => MessageBody::Text { text: row.message },
        };

        Message {
            id: Some(MessageId(row.id)),
            conversation_id: ConversationId(row.chat_id),
            created_at: row.created_at,
            body,
            origin,
            automated: row.ai,
        }
    }
}

/// SQL `COUNT(*)` arrives as a string from some drivers
fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(|_| {
            de::Error::invalid_value(Unexpected::Str(&s), &"a non-negative integer count")
        }),
    }
}

#[derive(Debug, Deserialize)]
struct StatsRow {
    #[serde(deserialize_with = "count")]
    total: u64,
    #[serde(deserialize_with = "count")]
    pending: u64,
    #[serde(deserialize_with = "count")]
    ai: u64,
}

impl From<StatsRow> for ChatStats {
    fn from(row: StatsRow) -> Self {
        ChatStats {
            total: row.total,
            pending: row.pending,
            automated: row.ai,
        }
    }
}
