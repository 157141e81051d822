//! Relay event types, routing table and frame validation
//!
//! Every frame on the relay is one JSON object whose `type` field names the
//! event kind. The first frame on a connection is always a `handshake`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::{ChatStats, ConversationId, Message, MessageBody, Role};

/// Upper bound on tags carried by a single conversation
pub const MAX_TAGS: usize = 32;

/// Upper bound on a single tag's length in characters
pub const MAX_TAG_LEN: usize = 64;

// =============================================================================
// Events
// =============================================================================

/// The wire unit exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Declares the sender's role; first frame only
    Handshake { role: Role },

    /// A message was written in a conversation
    NewMessage { message: Message },

    /// Waiting flag changed; viewers also send it as a read receipt
    StatusUpdate {
        conversation_id: ConversationId,
        waiting: bool,
    },

    /// Automated replies toggled for a conversation
    AutomationUpdate {
        conversation_id: ConversationId,
        automated_replies_enabled: bool,
    },

    /// Conversation removed from the store
    ConversationDeleted { conversation_id: ConversationId },

    /// Full replacement of dashboard counters
    StatsUpdate { stats: ChatStats },

    /// Full replacement of a conversation's tag set
    TagsUpdated {
        conversation_id: ConversationId,
        tags: BTreeSet<String>,
    },
}

/// Where the hub delivers an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Every viewer connection
    Viewers,
    /// The registered producer only
    Producer,
    /// Every viewer except the sender
    Peers,
    /// The producer and every viewer except the sender
    ProducerAndPeers,
}

impl Event {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Handshake { .. } => "handshake",
            Event::NewMessage { .. } => "new_message",
            Event::StatusUpdate { .. } => "status_update",
            Event::AutomationUpdate { .. } => "automation_update",
            Event::ConversationDeleted { .. } => "conversation_deleted",
            Event::StatsUpdate { .. } => "stats_update",
            Event::TagsUpdated { .. } => "tags_updated",
        }
    }

    /// Conversation this event targets, if any
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Event::NewMessage { message } => Some(message.conversation_id),
            Event::StatusUpdate { conversation_id, .. }
            | Event::AutomationUpdate { conversation_id, .. }
            | Event::ConversationDeleted { conversation_id }
            | Event::TagsUpdated { conversation_id, .. } => Some(*conversation_id),
            Event::Handshake { .. } | Event::StatsUpdate { .. } => None,
        }
    }

    /// Read receipt for a conversation
    pub fn mark_read(conversation_id: ConversationId) -> Self {
        Event::StatusUpdate {
            conversation_id,
            waiting: false,
        }
    }

    /// Routing decision for a frame sent by a connection holding `sender`.
    ///
    /// Returns `None` for handshakes, which are never routed.
    pub fn route(&self, sender: Role) -> Option<Route> {
        match (sender, self) {
            (_, Event::Handshake { .. }) => None,
            (Role::Producer, _) => Some(Route::Viewers),
            (Role::Viewer, Event::NewMessage { .. }) => Some(Route::Producer),
            (Role::Viewer, Event::AutomationUpdate { .. }) => Some(Route::ProducerAndPeers),
            (Role::Viewer, _) => Some(Route::Peers),
        }
    }

    /// Check field-level constraints serde cannot express
    pub fn validate(&self) -> Result<(), SchemaError> {
        if let Some(id) = self.conversation_id() {
            check_conversation_id(id)?;
        }

        match self {
            Event::NewMessage { message } => validate_message(message),
            Event::TagsUpdated { tags, .. } => validate_tags(tags),
            Event::StatsUpdate { stats } => {
                if stats.pending > stats.total {
                    return Err(SchemaError::InconsistentStats("pending exceeds total"));
                }
                if stats.automated > stats.total {
                    return Err(SchemaError::InconsistentStats("automated exceeds total"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn check_conversation_id(id: ConversationId) -> Result<(), SchemaError> {
    if id.0 <= 0 {
        return Err(SchemaError::InvalidConversationId(id.0));
    }
    Ok(())
}

fn validate_message(message: &Message) -> Result<(), SchemaError> {
    if let Some(id) = message.id {
        if id.0 <= 0 {
            return Err(SchemaError::InvalidMessageId(id.0));
        }
    }

    let empty = match &message.body {
        MessageBody::Text { text } => text.trim().is_empty(),
        MessageBody::Image { url, .. } => url.trim().is_empty(),
    };
    if empty {
        return Err(SchemaError::EmptyBody);
    }

    Ok(())
}

fn validate_tags(tags: &BTreeSet<String>) -> Result<(), SchemaError> {
    if tags.len() > MAX_TAGS {
        return Err(SchemaError::TooManyTags(tags.len()));
    }

    for tag in tags {
        if tag.is_empty() || tag.trim() != tag || tag.chars().count() > MAX_TAG_LEN {
            return Err(SchemaError::InvalidTag(tag.clone()));
        }
    }

    Ok(())
}

// =============================================================================
// Frame Codec
// =============================================================================

/// Parse and validate a text frame
pub fn decode_frame(text: &str, max_bytes: usize) -> Result<Event, SchemaError> {
    if text.len() > max_bytes {
        return Err(SchemaError::TooLarge {
            size: text.len(),
            limit: max_bytes,
        });
    }

    let event: Event =
        serde_json::from_str(text).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    event.validate()?;
    Ok(event)
}

/// Serialize an event into a text frame
pub fn encode_frame(event: &Event) -> Result<String, SchemaError> {
    serde_json::to_string(event).map_err(|e| SchemaError::Encode(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{MessageId, Origin};
    use time::macros::datetime;

    const LIMIT: usize = 64 * 1024;

    #[test]
    fn test_handshake_deserialization() {
        let json = r#"{"type":"handshake","role":"producer"}"#;
        let event = decode_frame(json, LIMIT).unwrap();
        assert_eq!(event, Event::Handshake { role: Role::Producer });
    }

    #[test]
    fn test_new_message_deserialization() {
        let json = r#"{
            "type": "new_message",
            "message": {
                "id": 11,
                "conversation_id": 7,
                "created_at": "2024-05-01T10:00:00Z",
                "body": {"kind": "text", "text": "hi"},
                "origin": "customer"
            }
        }"#;

        match decode_frame(json, LIMIT).unwrap() {
            Event::NewMessage { message } => {
                assert_eq!(message.id, Some(MessageId(11)));
                assert_eq!(message.conversation_id, ConversationId(7));
                assert_eq!(message.created_at, datetime!(2024-05-01 10:00:00 UTC));
                assert_eq!(message.origin, Origin::Customer);
                assert!(!message.automated);
            }
            other => panic!("Expected NewMessage event, got {:?}", other),
        }
    }

    #[test]
    fn test_status_update_serialization() {
        let event = Event::mark_read(ConversationId(3));
        let json = encode_frame(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"status_update","conversation_id":3,"waiting":false}"#
        );
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let err = decode_frame(r#"{"type":"frontend"}"#, LIMIT).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn test_non_json_is_malformed() {
        let err = decode_frame("hello", LIMIT).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let json = r#"{"type":"handshake","role":"viewer"}"#;
        let err = decode_frame(json, 8).unwrap_err();
        assert!(matches!(err, SchemaError::TooLarge { limit: 8, .. }));
    }

    #[test]
    fn test_non_positive_conversation_id_rejected() {
        let json = r#"{"type":"conversation_deleted","conversation_id":0}"#;
        assert_eq!(
            decode_frame(json, LIMIT).unwrap_err(),
            SchemaError::InvalidConversationId(0)
        );
    }

    #[test]
    fn test_blank_message_rejected() {
        let json = r#"{
            "type": "new_message",
            "message": {
                "conversation_id": 7,
                "created_at": "2024-05-01T10:00:00Z",
                "body": {"kind": "text", "text": "   "},
                "origin": "operator"
            }
        }"#;
        assert_eq!(decode_frame(json, LIMIT).unwrap_err(), SchemaError::EmptyBody);
    }

    #[test]
    fn test_padded_tag_rejected() {
        let json = r#"{"type":"tags_updated","conversation_id":2,"tags":["vip"," urgent"]}"#;
        assert_eq!(
            decode_frame(json, LIMIT).unwrap_err(),
            SchemaError::InvalidTag(" urgent".to_string())
        );
    }

    #[test]
    fn test_duplicate_tags_collapse() {
        let json = r#"{"type":"tags_updated","conversation_id":2,"tags":["vip","vip","billing"]}"#;
        match decode_frame(json, LIMIT).unwrap() {
            Event::TagsUpdated { tags, .. } => assert_eq!(tags.len(), 2),
            other => panic!("Expected TagsUpdated event, got {:?}", other),
        }
    }

    #[test]
    fn test_inconsistent_stats_rejected() {
        let json = r#"{"type":"stats_update","stats":{"total":1,"pending":2,"automated":0}}"#;
        assert!(matches!(
            decode_frame(json, LIMIT).unwrap_err(),
            SchemaError::InconsistentStats(_)
        ));
    }

    #[test]
    fn test_routing_table() {
        let reply = Event::NewMessage {
            message: Message {
                id: None,
                conversation_id: ConversationId(7),
                created_at: datetime!(2024-05-01 10:00:00 UTC),
                body: MessageBody::text("on it"),
                origin: Origin::Operator,
                automated: false,
            },
        };
        let toggle = Event::AutomationUpdate {
            conversation_id: ConversationId(7),
            automated_replies_enabled: true,
        };
        let read = Event::mark_read(ConversationId(7));

        assert_eq!(reply.route(Role::Producer), Some(Route::Viewers));
        assert_eq!(reply.route(Role::Viewer), Some(Route::Producer));
        assert_eq!(toggle.route(Role::Viewer), Some(Route::ProducerAndPeers));
        assert_eq!(read.route(Role::Viewer), Some(Route::Peers));
        assert_eq!(read.route(Role::Producer), Some(Route::Viewers));
        assert_eq!(Event::Handshake { role: Role::Viewer }.route(Role::Viewer), None);
    }
}
