//! Read-only views handed to subscribers

use relaydesk_shared::{ChatStats, ConversationId, ConversationState, Message};

/// Relay link status as seen by the operator session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No link. `gave_up` is set once the reconnect budget is spent.
    Disconnected { gave_up: bool },
    /// Opening the transport; `attempt` counts from 1 within an outage
    Connecting { attempt: u32 },
    Handshaking,
    Ready,
    /// The manager was closed and will not reconnect
    Closed,
}

impl SyncStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, SyncStatus::Ready)
    }
}

/// Everything a UI needs to render one frame
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    /// Waiting conversations first, then most recent activity
    pub conversations: Vec<ConversationState>,
    pub open_conversation: Option<ConversationId>,
    /// Ordered messages of the open conversation
    pub messages: Vec<Message>,
    /// Counters derived from the local conversation list
    pub counters: ChatStats,
    /// Last counters pushed by the relay
    pub stats: Option<ChatStats>,
    /// Local events waiting for the link to come back
    pub queued: usize,
}

impl SyncSnapshot {
    pub fn conversation(&self, id: ConversationId) -> Option<&ConversationState> {
        self.conversations.iter().find(|c| c.id == id)
    }
}
