//! Domain types used across Relaydesk

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Conversation ID as issued by the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message ID as issued by the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Participants
// =============================================================================

/// Role a connection declares in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Operator console; receives broadcasts, sends replies and toggles
    Viewer,
    /// Automated-reply agent; emits customer traffic, receives replies
    Producer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Viewer => f.write_str("viewer"),
            Role::Producer => f.write_str("producer"),
        }
    }
}

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Operator,
    Customer,
    Automated,
}

impl Origin {
    /// Customer messages sort before replies sharing the same timestamp.
    fn tiebreak(self) -> u8 {
        match self {
            Origin::Customer => 0,
            Origin::Operator | Origin::Automated => 1,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Message content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// Text shown in the conversation list preview
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { text } => text.clone(),
            MessageBody::Image { caption: Some(caption), .. } if !caption.is_empty() => caption.clone(),
            MessageBody::Image { .. } => "[image]".to_string(),
        }
    }
}

/// A single chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Absent on operator replies that have not been persisted yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub body: MessageBody,
    pub origin: Origin,
    #[serde(default)]
    pub automated: bool,
}

impl Message {
    /// Total order used for a conversation's message list:
    /// creation time first, then customer before operator/automated.
    pub fn order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.origin.tiebreak().cmp(&other.origin.tiebreak()))
    }

    /// Whether two values describe the same message.
    ///
    /// Identifiers decide when both sides carry one. Otherwise the pair
    /// (timestamp, body) is compared.
    pub fn is_same_message(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.created_at == other.created_at && self.body == other.body,
        }
    }

    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            text: self.body.preview(),
            at: self.created_at,
        }
    }
}

/// Last-message preview shown in the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

// =============================================================================
// Conversations
// =============================================================================

/// Per-chat state held by an operator session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: ConversationId,
    #[serde(default)]
    pub label: String,
    /// True while an operator reply is owed
    #[serde(default)]
    pub waiting: bool,
    #[serde(default)]
    pub automated_replies_enabled: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
}

impl ConversationState {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            label: String::new(),
            waiting: false,
            automated_replies_enabled: false,
            tags: BTreeSet::new(),
            last_message: None,
        }
    }
}

/// Dashboard-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub total: u64,
    pub pending: u64,
    pub automated: u64,
}

impl ChatStats {
    /// Counters derived from a conversation list
    pub fn from_conversations<'a>(conversations: impl IntoIterator<Item = &'a ConversationState>) -> Self {
        conversations.into_iter().fold(Self::default(), |mut stats, c| {
            stats.total += 1;
            if c.waiting {
                stats.pending += 1;
            }
            if c.automated_replies_enabled {
                stats.automated += 1;
            }
            stats
        })
    }
}
