//! Relay connection management
//!
//! Represents one live transport session: its identity, the role declared in
//! its handshake, its liveness, and the bounded queue feeding its writer task.

use std::sync::{Arc, OnceLock};

use relaydesk_shared::Role;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::HubError;

/// A pre-encoded text frame, shared across every recipient of a broadcast
pub type Frame = Arc<str>;

/// Liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    /// Dropped by the hub; the writer is flushing a close frame
    Closing,
    Closed,
}

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Queue is at capacity: the reader is too slow
    Full,
    /// Writer has gone away or the connection is no longer open
    Closed,
}

/// Represents an active relay connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Role declared by the handshake; unset until then
    role: OnceLock<Role>,

    /// Channel feeding this connection's writer task
    sender: mpsc::Sender<Frame>,

    liveness: watch::Sender<Liveness>,

    /// Reason recorded by the first call to `close`
    close_reason: OnceLock<HubError>,
}

impl Connection {
    /// Create a new connection in `open` state with no role
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        let (liveness, _) = watch::channel(Liveness::Open);
        Self {
            session_id: Uuid::new_v4(),
            role: OnceLock::new(),
            sender,
            liveness,
            close_reason: OnceLock::new(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    /// Record the handshake role. Fails if a role was already assigned.
    pub fn assign_role(&self, role: Role) -> Result<(), HubError> {
        self.role.set(role).map_err(|_| HubError::DuplicateHandshake)
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Queue a frame without waiting
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the writer to send a close frame and stop.
    ///
    /// Only the first reason is kept; later calls are no-ops.
    pub fn close(&self, reason: HubError) {
        let _ = self.close_reason.set(reason);
        self.liveness.send_if_modified(|state| {
            if *state == Liveness::Open {
                *state = Liveness::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Mark the session finished
    pub fn mark_closed(&self) {
        self.liveness.send_replace(Liveness::Closed);
    }

    pub fn close_reason(&self) -> Option<&HubError> {
        self.close_reason.get()
    }

    /// Resolves once the connection leaves the `open` state
    pub async fn closed(&self) {
        let mut rx = self.liveness.subscribe();
        let _ = rx.wait_for(|state| *state != Liveness::Open).await;
    }
}
