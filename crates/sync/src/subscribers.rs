//! Snapshot subscribers
//!
//! Handlers run in subscription order on the sync task. Dispatch holds a
//! reentrant lock, so a handler may subscribe, unsubscribe or close the
//! manager from inside its own callback, while any other thread calling
//! `clear` waits for the dispatch in progress. Once `clear` returns no
//! handler is invoked again.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::snapshot::SyncSnapshot;

pub type Handler = Arc<dyn Fn(&SyncSnapshot) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Handlers = Vec<(Subscription, Handler)>;

#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    handlers: Arc<ReentrantMutex<RefCell<Handlers>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Handler) -> Subscription {
        let id = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().borrow_mut().push((id, handler));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let guard = self.handlers.lock();
        let mut handlers = guard.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.handlers.lock().borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().borrow().is_empty()
    }

    /// Invoke every handler once, in subscription order.
    ///
    /// A handler removed by an earlier handler in the same round is skipped;
    /// one added during the round first runs on the next call.
    pub fn notify(&self, snapshot: &SyncSnapshot) {
        let guard = self.handlers.lock();
        let round: Handlers = guard.borrow().clone();

        for (id, handler) in round {
            let live = guard.borrow().iter().any(|(current, _)| *current == id);
            if live {
                handler(snapshot);
            }
        }
    }
}
