//! Error types for the relay wire schema

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid conversation id: {0}")]
    InvalidConversationId(i64),

    #[error("Invalid message id: {0}")]
    InvalidMessageId(i64),

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Invalid tag: {0:?}")]
    InvalidTag(String),

    #[error("Too many tags: {0}")]
    TooManyTags(usize),

    #[error("Inconsistent stats: {0}")]
    InconsistentStats(&'static str),

    #[error("Serialization failed: {0}")]
    Encode(String),
}
