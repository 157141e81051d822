//! Outbound event queue
//!
//! Holds locally originated events until the relay link accepts them.
//! Events leave strictly in the order they were queued, and an event is only
//! removed once the transport took it.

use std::collections::VecDeque;

use relaydesk_shared::Event;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    events: VecDeque<Event>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event behind everything already waiting
    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Oldest waiting event, left in place until the send succeeds
    pub fn front(&self) -> Option<&Event> {
        self.events.front()
    }

    /// Drop the oldest event after it was handed to the transport
    pub fn pop_front(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relaydesk_shared::ConversationId;

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new();
        for id in 1..=3 {
            queue.push(Event::mark_read(ConversationId(id)));
        }

        let order: Vec<_> = queue.iter().filter_map(Event::conversation_id).collect();
        assert_eq!(order, vec![ConversationId(1), ConversationId(2), ConversationId(3)]);

        assert_eq!(queue.front(), Some(&Event::mark_read(ConversationId(1))));
        queue.pop_front();
        assert_eq!(queue.front(), Some(&Event::mark_read(ConversationId(2))));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_front_is_not_removed() {
        let mut queue = OutboundQueue::new();
        queue.push(Event::mark_read(ConversationId(1)));

        // A failed send leaves the event in place for the next link
        assert!(queue.front().is_some());
        assert!(queue.front().is_some());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop_front(), Some(Event::mark_read(ConversationId(1))));
        assert!(queue.is_empty());
    }
}
