//! Read-lease renewal for the open conversation
//!
//! While a conversation is open the operator keeps re-asserting that it has
//! been read. The schedule is driven by the caller's clock so it can be
//! tested without sleeping.

use std::time::Duration;

use relaydesk_shared::{ConversationId, Event};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Lease {
    conversation_id: ConversationId,
    next_due: Instant,
}

#[derive(Debug)]
pub struct LeaseRenewal {
    interval: Duration,
    lease: Option<Lease>,
}

impl LeaseRenewal {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            lease: None,
        }
    }

    /// Take the lease on `conversation_id`, replacing any previous one.
    ///
    /// Returns the read receipt to send right away.
    pub fn start(&mut self, conversation_id: ConversationId, now: Instant) -> Event {
        self.lease = Some(Lease {
            conversation_id,
            next_due: now + self.interval,
        });
        Event::mark_read(conversation_id)
    }

    pub fn stop(&mut self) {
        self.lease = None;
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.lease.map(|l| l.conversation_id)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.lease.map(|l| l.next_due)
    }

    /// Renewal receipt if one is due at `now`.
    ///
    /// Missed ticks are not replayed; the next one is scheduled a full
    /// interval after `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Event> {
        let lease = self.lease.as_mut()?;
        if now < lease.next_due {
            return None;
        }
        lease.next_due = now + self.interval;
        Some(Event::mark_read(lease.conversation_id))
    }
}
