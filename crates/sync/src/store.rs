//! Local conversation store
//!
//! Holds the operator's view of every conversation and applies live relay
//! events to it. Merges are idempotent: an event delivered any number of
//! times, in any order relative to its duplicates, converges to the same
//! state. Authoritative reloads from the durable store correct drift.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use relaydesk_shared::{
    ChatStats, ConversationId, ConversationState, Event, Message, MessagePreview, Origin,
};

use crate::snapshot::{SyncSnapshot, SyncStatus};

/// Most buffered updates held at once; the oldest are dropped beyond this
const MAX_PENDING: usize = 512;

/// What applying an event did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Targets a conversation not known yet; held until a reload
    Buffered,
}

/// Outcome of an authoritative conversation list reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub conversations: usize,
    /// Local conversations the reload no longer lists
    pub removed: usize,
    /// Buffered updates applied because their conversation appeared
    pub resolved: usize,
    /// Buffered updates dropped because their conversation is still unknown
    pub discarded: usize,
}

/// Values this console sent that the durable store may not reflect yet
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LocalEdits {
    waiting: Option<bool>,
    automated_replies_enabled: Option<bool>,
    tags: Option<BTreeSet<String>>,
}

impl LocalEdits {
    fn is_empty(&self) -> bool {
        self.waiting.is_none() && self.automated_replies_enabled.is_none() && self.tags.is_none()
    }

    /// Lay edits over reloaded values. An edit the reload agrees with is done.
    fn reconcile(&mut self, conversation: &mut ConversationState) {
        overlay(&mut self.waiting, &mut conversation.waiting);
        overlay(
            &mut self.automated_replies_enabled,
            &mut conversation.automated_replies_enabled,
        );
        overlay(&mut self.tags, &mut conversation.tags);
    }
}

#[derive(Debug, Default)]
pub struct SyncStore {
    conversations: HashMap<ConversationId, ConversationState>,
    messages: HashMap<ConversationId, Vec<Message>>,
    /// Updates for unknown conversations, in arrival order
    pending: VecDeque<Event>,
    edits: HashMap<ConversationId, LocalEdits>,
    open: Option<ConversationId>,
    stats: Option<ChatStats>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one relay event
    pub fn apply(&mut self, event: &Event) -> Applied {
        match event {
            // Viewers never receive handshakes
            Event::Handshake { .. } => Applied::Unchanged,
            Event::NewMessage { message } => self.apply_message(message),
            Event::StatusUpdate {
                conversation_id,
                waiting,
            } => {
                forget(&mut self.edits, *conversation_id, |e| e.waiting = None);
                self.update(event, *conversation_id, |c| set(&mut c.waiting, *waiting))
            }
            Event::AutomationUpdate {
                conversation_id,
                automated_replies_enabled,
            } => {
                forget(&mut self.edits, *conversation_id, |e| {
                    e.automated_replies_enabled = None
                });
                self.update(event, *conversation_id, |c| {
                    set(&mut c.automated_replies_enabled, *automated_replies_enabled)
                })
            }
            Event::TagsUpdated {
                conversation_id,
                tags,
            } => {
                forget(&mut self.edits, *conversation_id, |e| e.tags = None);
                self.update(event, *conversation_id, |c| set(&mut c.tags, tags.clone()))
            }
            Event::ConversationDeleted { conversation_id } => self.delete(*conversation_id),
            Event::StatsUpdate { stats } => {
                if set(&mut self.stats, Some(*stats)) {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }
        }
    }

    /// Merge an event this console sent.
    ///
    /// The relay never echoes it back and the durable store may lag behind,
    /// so the sent value is kept over later reloads until one confirms it or
    /// a relay event for the same field supersedes it.
    pub fn apply_local(&mut self, event: &Event) -> Applied {
        let applied = self.apply(event);
        if applied == Applied::Buffered {
            return applied;
        }

        match event {
            Event::StatusUpdate {
                conversation_id,
                waiting,
            } => self.edits_mut(*conversation_id).waiting = Some(*waiting),
            Event::AutomationUpdate {
                conversation_id,
                automated_replies_enabled,
            } => {
                self.edits_mut(*conversation_id).automated_replies_enabled =
                    Some(*automated_replies_enabled)
            }
            Event::TagsUpdated {
                conversation_id,
                tags,
            } => self.edits_mut(*conversation_id).tags = Some(tags.clone()),
            Event::NewMessage { message } => {
                let id = message.conversation_id;
                let newest = self
                    .messages(id)
                    .last()
                    .is_some_and(|m| m.is_same_message(message));
                if newest {
                    self.edits_mut(id).waiting = Some(message.origin == Origin::Customer);
                }
            }
            _ => {}
        }
        applied
    }

    fn edits_mut(&mut self, id: ConversationId) -> &mut LocalEdits {
        self.edits.entry(id).or_default()
    }

    fn apply_message(&mut self, message: &Message) -> Applied {
        let id = message.conversation_id;
        let created = !self.conversations.contains_key(&id);
        let conversation = self
            .conversations
            .entry(id)
            .or_insert_with(|| ConversationState::new(id));

        let mut changed = created;
        changed |= set(&mut conversation.last_message, Some(message.preview()));

        let messages = self.messages.entry(id).or_default();
        match messages.iter_mut().find(|m| m.is_same_message(message)) {
            Some(existing) => {
                // Echo of a local reply: adopt the store-issued id
                if existing.id.is_none() && message.id.is_some() {
                    existing.id = message.id;
                    changed = true;
                }
            }
            None => {
                let at = messages.partition_point(|m| m.order(message) != Ordering::Greater);
                messages.insert(at, message.clone());
                // Only the newest message under the ordering key decides
                if at + 1 == messages.len() {
                    conversation.waiting = message.origin == Origin::Customer;
                    forget(&mut self.edits, id, |e| e.waiting = None);
                }
                changed = true;
            }
        }

        if created {
            self.resolve_pending();
        }

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    fn update<F>(&mut self, event: &Event, id: ConversationId, update: F) -> Applied
    where
        F: FnOnce(&mut ConversationState) -> bool,
    {
        let Some(conversation) = self.conversations.get_mut(&id) else {
            tracing::debug!(
                conversation_id = %id,
                event_type = event.kind(),
                "Buffering update for unknown conversation"
            );
            if self.pending.len() >= MAX_PENDING {
                if let Some(dropped) = self.pending.pop_front() {
                    tracing::warn!(
                        conversation_id = ?dropped.conversation_id(),
                        event_type = dropped.kind(),
                        limit = MAX_PENDING,
                        "Update buffer full, dropping oldest"
                    );
                }
            }
            self.pending.push_back(event.clone());
            return Applied::Buffered;
        };

        if update(conversation) {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    fn delete(&mut self, id: ConversationId) -> Applied {
        let mut changed = self.conversations.remove(&id).is_some();
        changed |= self.messages.remove(&id).is_some();
        self.edits.remove(&id);

        let before = self.pending.len();
        self.pending.retain(|e| e.conversation_id() != Some(id));
        changed |= self.pending.len() != before;

        if self.open == Some(id) {
            self.open = None;
            changed = true;
        }

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// Apply buffered updates whose conversation is now known
    fn resolve_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let (ready, waiting): (VecDeque<Event>, VecDeque<Event>) = pending.into_iter().partition(|e| {
            e.conversation_id()
                .is_some_and(|id| self.conversations.contains_key(&id))
        });
        self.pending = waiting;

        for event in &ready {
            self.apply(event);
        }
        ready.len()
    }

    /// Replace the conversation list with an authoritative reload.
    ///
    /// Flags and tags come from the reload unless this console sent a value
    /// the reload does not show yet. A local preview survives when it is
    /// newer than the one reported. Buffered updates still unresolved
    /// afterwards are discarded.
    pub fn apply_refresh(&mut self, list: Vec<ConversationState>) -> RefreshReport {
        let mut fresh = HashMap::with_capacity(list.len());
        for mut conversation in list {
            if let Some(local) = self.conversations.get(&conversation.id) {
                conversation.last_message =
                    newer(conversation.last_message.take(), local.last_message.clone());
            }
            if let Some(edits) = self.edits.get_mut(&conversation.id) {
                edits.reconcile(&mut conversation);
            }
            fresh.insert(conversation.id, conversation);
        }

        let removed = self
            .conversations
            .keys()
            .filter(|id| !fresh.contains_key(id))
            .count();
        self.conversations = fresh;
        self.messages
            .retain(|id, _| self.conversations.contains_key(id));
        self.edits
            .retain(|id, edits| self.conversations.contains_key(id) && !edits.is_empty());
        if self.open.is_some_and(|id| !self.conversations.contains_key(&id)) {
            self.open = None;
        }

        let resolved = self.resolve_pending();
        let discarded = self.pending.len();
        for event in self.pending.drain(..) {
            tracing::warn!(
                conversation_id = ?event.conversation_id(),
                event_type = event.kind(),
                "Discarding update for conversation missing from reload"
            );
        }

        RefreshReport {
            conversations: self.conversations.len(),
            removed,
            resolved,
            discarded,
        }
    }

    /// Replace a conversation's messages with an authoritative reload.
    ///
    /// Local messages the reload does not contain yet (unpersisted replies,
    /// live events newer than the fetch) are kept.
    pub fn load_messages(&mut self, id: ConversationId, mut fetched: Vec<Message>) {
        if let Some(local) = self.messages.get(&id) {
            let unmatched: Vec<Message> = local
                .iter()
                .filter(|m| !fetched.iter().any(|f| f.is_same_message(m)))
                .cloned()
                .collect();
            fetched.extend(unmatched);
        }
        fetched.sort_by(|a, b| a.order(b));

        if let (Some(conversation), Some(last)) = (self.conversations.get_mut(&id), fetched.last()) {
            conversation.last_message =
                newer(Some(last.preview()), conversation.last_message.take());
        }
        self.messages.insert(id, fetched);
    }

    pub fn set_stats(&mut self, stats: ChatStats) {
        self.stats = Some(stats);
    }

    pub fn stats(&self) -> Option<ChatStats> {
        self.stats
    }

    pub fn open(&mut self, id: Option<ConversationId>) {
        self.open = id;
    }

    pub fn open_conversation(&self) -> Option<ConversationId> {
        self.open
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&ConversationState> {
        self.conversations.get(&id)
    }

    pub fn messages(&self, id: ConversationId) -> &[Message] {
        self.messages.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Updates waiting for their conversation to appear
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Waiting conversations first, then latest activity, then newest id
    pub fn conversation_list(&self) -> Vec<ConversationState> {
        let mut list: Vec<_> = self.conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.waiting
                .cmp(&a.waiting)
                .then_with(|| activity(b).cmp(&activity(a)))
                .then_with(|| b.id.cmp(&a.id))
        });
        list
    }

    pub fn counters(&self) -> ChatStats {
        ChatStats::from_conversations(self.conversations.values())
    }

    pub fn snapshot(&self, status: SyncStatus, queued: usize) -> SyncSnapshot {
        SyncSnapshot {
            status,
            conversations: self.conversation_list(),
            open_conversation: self.open,
            messages: self
                .open
                .map(|id| self.messages(id).to_vec())
                .unwrap_or_default(),
            counters: self.counters(),
            stats: self.stats,
            queued,
        }
    }
}

/// Overwrite `slot` and report whether it changed
fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn activity(conversation: &ConversationState) -> Option<time::OffsetDateTime> {
    conversation.last_message.as_ref().map(|p| p.at)
}

/// Later of two previews; `primary` wins ties
fn newer(primary: Option<MessagePreview>, other: Option<MessagePreview>) -> Option<MessagePreview> {
    match (primary, other) {
        (Some(p), Some(o)) if o.at > p.at => Some(o),
        (Some(p), _) => Some(p),
        (None, o) => o,
    }
}


/// Clear one edited field once the relay reports a newer value for it
fn forget<F>(edits: &mut HashMap<ConversationId, LocalEdits>, id: ConversationId, clear: F)
where
    F: FnOnce(&mut LocalEdits),
{
    if let Some(entry) = edits.get_mut(&id) {
        clear(entry);
        if entry.is_empty() {
            edits.remove(&id);
        }
    }
}

fn overlay<T: Clone + PartialEq>(edit: &mut Option<T>, reloaded: &mut T) {
    let Some(value) = edit.as_ref() else {
        return;
    };
    if value == reloaded {
        *edit = None;
    } else {
        *reloaded = value.clone();
    }
}
