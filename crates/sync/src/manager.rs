//! Sync manager
//!
//! One background task owns the local store, the outbound queue and the
//! relay link. `SyncManager` is a cheap handle to it: commands travel over an
//! unbounded channel, so sending never waits on the network.
//!
//! Link lifecycle:
//! 1. open the transport and send a viewer handshake
//! 2. flush queued events in order
//! 3. reload authoritative state, then apply live events on top
//! 4. on loss, back off and retry until the attempt budget is spent

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relaydesk_shared::{ConversationId, Event, Message, MessageBody, Origin, Role};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::Catalog;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lease::LeaseRenewal;
use crate::queue::OutboundQueue;
use crate::reconnect::ReconnectSchedule;
use crate::snapshot::{SyncSnapshot, SyncStatus};
use crate::store::{Applied, SyncStore};
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::transport::{Connector, Link};

enum Command {
    Connect(oneshot::Sender<SyncResult<()>>),
    ForceReconnect,
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Local(Local),
}

/// Commands handled the same way whether or not a link is up
enum Local {
    Send(Event),
    Open(ConversationId),
    CloseConversation,
    Refresh,
}

/// Handle to the operator-side sync task
pub struct SyncManager {
    commands: mpsc::UnboundedSender<Command>,
    subscribers: SubscriberRegistry,
    status: watch::Receiver<SyncStatus>,
    shutdown: watch::Sender<bool>,
    /// Events accepted by `send` and not yet taken by the transport
    outstanding: Arc<AtomicUsize>,
    outbound_limit: Option<usize>,
    task: Option<JoinHandle<()>>,
}

impl SyncManager {
    /// Start the sync task. Must be called inside a Tokio runtime.
    ///
    /// Nothing connects until `connect` or the first `send`.
    pub fn spawn(
        config: &SyncConfig,
        connector: Arc<dyn Connector>,
        catalog: Option<Arc<dyn Catalog>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected { gave_up: false });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscribers = SubscriberRegistry::new();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let actor = Actor {
            connector,
            catalog,
            commands: commands_rx,
            shutdown: shutdown_rx,
            status: status_tx,
            subscribers: subscribers.clone(),
            outstanding: Arc::clone(&outstanding),
            store: SyncStore::new(),
            queue: OutboundQueue::new(),
            lease: LeaseRenewal::new(config.lease_interval),
            schedule: ReconnectSchedule::new(config.reconnect.clone()),
            waiters: Vec::new(),
            refresh_needed: false,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            subscribers,
            status: status_rx,
            shutdown: shutdown_tx,
            outstanding,
            outbound_limit: config.outbound_queue_limit,
            task: Some(task),
        }
    }

    fn command(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::ShutDown)
    }

    /// Open the relay link and wait for the handshake.
    ///
    /// Resolves immediately when already connected. Fails with
    /// `RetriesExhausted` once the attempt budget is spent.
    pub async fn connect(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| SyncError::ShutDown)?
    }

    /// Apply an event locally and deliver it to the relay.
    ///
    /// Never waits: without a link the event is queued and goes out, in
    /// order, after the next successful handshake.
    pub fn send(&self, event: Event) -> SyncResult<()> {
        if matches!(event, Event::Handshake { .. }) {
            return Err(SyncError::InvalidRequest(
                "handshakes are sent by the manager".into(),
            ));
        }
        event.validate()?;

        match self.outbound_limit {
            Some(limit) => {
                self.outstanding
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < limit).then_some(n + 1)
                    })
                    .map_err(SyncError::QueueFull)?;
            }
            None => {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.command(Command::Local(Local::Send(event))).inspect_err(|_| {
            release(&self.outstanding);
        })
    }

    /// Send an operator reply in `conversation_id`
    pub fn reply(&self, conversation_id: ConversationId, text: impl Into<String>) -> SyncResult<()> {
        self.send(Event::NewMessage {
            message: Message {
                id: None,
                conversation_id,
                created_at: OffsetDateTime::now_utc(),
                body: MessageBody::text(text),
                origin: Origin::Operator,
                automated: false,
            },
        })
    }

    pub fn set_automation(&self, conversation_id: ConversationId, enabled: bool) -> SyncResult<()> {
        self.send(Event::AutomationUpdate {
            conversation_id,
            automated_replies_enabled: enabled,
        })
    }

    pub fn mark_read(&self, conversation_id: ConversationId) -> SyncResult<()> {
        self.send(Event::mark_read(conversation_id))
    }

    /// Select a conversation: load its messages, mark it read and keep the
    /// read lease renewed while it stays open
    pub fn open_conversation(&self, conversation_id: ConversationId) -> SyncResult<()> {
        self.command(Command::Local(Local::Open(conversation_id)))
    }

    pub fn close_conversation(&self) -> SyncResult<()> {
        self.command(Command::Local(Local::CloseConversation))
    }

    /// Reload conversations, counters and open messages from the catalog
    pub fn refresh(&self) -> SyncResult<()> {
        self.command(Command::Local(Local::Refresh))
    }

    /// Reset the attempt budget and reconnect now
    pub fn force_reconnect(&self) -> SyncResult<()> {
        self.command(Command::ForceReconnect)
    }

    /// Current state, after every command sent before this call was handled
    pub async fn snapshot(&self) -> SyncResult<SyncSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| SyncError::ShutDown)
    }

    /// Register a handler called with a fresh snapshot after every change
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(Arc::new(handler))
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.subscribers.unsubscribe(subscription)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for_status<F>(&self, mut predicate: F) -> SyncResult<SyncStatus>
    where
        F: FnMut(&SyncStatus) -> bool,
    {
        let mut status = self.status.clone();
        let current = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SyncError::ShutDown)?;
        Ok(*current)
    }

    /// Stop syncing.
    ///
    /// Handlers are removed before this returns and are never called again.
    /// The task then stops reconnecting and closes the link.
    pub fn close(&self) {
        self.subscribers.clear();
        self.shutdown.send_replace(true);
    }

    /// `close`, then wait for the task to finish
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Sync task failed");
            }
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn release(outstanding: &AtomicUsize) {
    let _ = outstanding.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// A dropped handle counts as a shutdown request
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

enum Phase {
    /// No link and no attempt in progress
    Idle,
    Connect { immediate: bool },
    Live(Link),
    Stop,
}

struct Actor {
    connector: Arc<dyn Connector>,
    catalog: Option<Arc<dyn Catalog>>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
    subscribers: SubscriberRegistry,
    outstanding: Arc<AtomicUsize>,
    store: SyncStore,
    queue: OutboundQueue,
    lease: LeaseRenewal,
    schedule: ReconnectSchedule,
    /// Callers of `connect` waiting for the next handshake
    waiters: Vec<oneshot::Sender<SyncResult<()>>>,
    /// An update named an unknown conversation
    refresh_needed: bool,
}

impl Actor {
    async fn run(mut self) {
        tracing::debug!("Sync task started");

        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect { immediate } => self.establish(immediate).await,
                Phase::Live(link) => self.live(link).await,
                Phase::Stop => break,
            };
        }

        self.finish();
    }

    async fn idle(&mut self) -> Phase {
        loop {
            let command = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Phase::Stop,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else {
                return Phase::Stop;
            };

            match command {
                Command::Connect(done) => {
                    if self.schedule.exhausted() {
                        let _ = done.send(Err(SyncError::RetriesExhausted(self.schedule.attempts())));
                    } else {
                        self.waiters.push(done);
                        return Phase::Connect { immediate: true };
                    }
                }
                Command::ForceReconnect => {
                    self.schedule.reset();
                    return Phase::Connect { immediate: true };
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Local(local) => {
                    let wants_link = matches!(local, Local::Send(_));
                    // Without a link nothing can fail here
                    let _ = self.on_local(local, None).await;
                    if wants_link && !self.schedule.exhausted() {
                        return Phase::Connect { immediate: true };
                    }
                }
            }
        }
    }

    /// Run connect attempts until one succeeds, the budget runs out, or the
    /// manager closes
    async fn establish(&mut self, immediate: bool) -> Phase {
        let mut delay = (!immediate).then(|| self.schedule.policy().base_delay);

        loop {
            if let Some(delay) = delay.take() {
                self.set_status(SyncStatus::Disconnected { gave_up: false });
                if !self.backoff(delay).await {
                    return Phase::Stop;
                }
            }

            let attempt = self.schedule.attempts() + 1;
            self.set_status(SyncStatus::Connecting { attempt });

            let connector = Arc::clone(&self.connector);
            let connected = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Phase::Stop,
                connected = connector.connect() => connected,
            };

            let result = match connected {
                Ok(mut link) => {
                    self.set_status(SyncStatus::Handshaking);
                    link.sink
                        .send(Event::Handshake { role: Role::Viewer })
                        .await
                        .map(|()| link)
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(link) => return self.on_ready(link).await,
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        transient = e.is_transient(),
                        "Relay connect attempt failed"
                    );
                    match self.schedule.record_failure() {
                        Some(next) => delay = Some(next),
                        None => return self.give_up(),
                    }
                }
            }
        }
    }

    /// Wait out a reconnect delay while still serving commands.
    ///
    /// Returns false if the manager closed.
    async fn backoff(&mut self, delay: Duration) -> bool {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Connect(done)) => self.waiters.push(done),
                    Some(Command::ForceReconnect) => {
                        self.schedule.reset();
                        return true;
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Local(local)) => {
                        let _ = self.on_local(local, None).await;
                    }
                },
            }
        }
    }

    async fn on_ready(&mut self, mut link: Link) -> Phase {
        self.schedule.reset();
        self.set_status(SyncStatus::Ready);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        tracing::info!(queued = self.queue.len(), "Relay link ready");

        if let Err(e) = self.flush(&mut link).await {
            tracing::warn!(error = %e, "Relay link lost while flushing queued events");
            return self.link_lost();
        }

        // Catch up on whatever happened while offline
        self.refresh().await;
        if let Some(id) = self.lease.conversation() {
            let receipt = self.lease.start(id, Instant::now());
            if self.store.conversation(id).is_some() {
                self.store.apply_local(&receipt);
            }
            if let Err(e) = link.sink.send(receipt).await {
                tracing::warn!(error = %e, "Relay link lost while renewing read lease");
                return self.link_lost();
            }
        }
        self.publish();

        Phase::Live(link)
    }

    async fn live(&mut self, mut link: Link) -> Phase {
        loop {
            let lease_due = self.lease.next_due();

            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => {
                    let _ = link.sink.close().await;
                    return Phase::Stop;
                }
                frame = link.stream.next() => match frame {
                    Some(Ok(event)) => self.receive(event),
                    Some(Err(SyncError::Schema(e))) => {
                        tracing::warn!(error = %e, "Ignoring malformed frame from relay");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Relay link failed");
                        return self.link_lost();
                    }
                    None => {
                        tracing::info!("Relay link closed");
                        return self.link_lost();
                    }
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = link.sink.close().await;
                        return Phase::Stop;
                    };
                    match command {
                        Command::Connect(done) => {
                            let _ = done.send(Ok(()));
                        }
                        Command::ForceReconnect => {
                            let _ = link.sink.close().await;
                            self.schedule.reset();
                            return Phase::Connect { immediate: true };
                        }
                        Command::Snapshot(reply) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Command::Local(local) => {
                            if let Err(e) = self.on_local(local, Some(&mut link)).await {
                                tracing::warn!(error = %e, "Relay link failed while sending");
                                return self.link_lost();
                            }
                        }
                    }
                }
                _ = sleep_until_due(lease_due) => {
                    if let Some(receipt) = self.lease.poll(Instant::now()) {
                        if self.store.apply_local(&receipt) == Applied::Changed {
                            self.publish();
                        }
                        if let Err(e) = link.sink.send(receipt).await {
                            tracing::warn!(error = %e, "Relay link lost while renewing read lease");
                            return self.link_lost();
                        }
                    }
                }
            }

            if self.refresh_needed {
                self.refresh().await;
                self.publish();
            }
        }
    }

    /// Merge one event from the relay
    fn receive(&mut self, event: Event) {
        let applied = self.store.apply(&event);
        tracing::debug!(
            event_type = event.kind(),
            conversation_id = ?event.conversation_id(),
            applied = ?applied,
            "Applied relay event"
        );

        if applied == Applied::Buffered && self.catalog.is_some() {
            self.refresh_needed = true;
        }
        self.sync_lease();
        self.publish();
    }

    async fn on_local(&mut self, local: Local, link: Option<&mut Link>) -> SyncResult<()> {
        match local {
            Local::Send(event) => {
                self.store.apply_local(&event);
                self.sync_lease();
                self.queue.push(event);

                let result = match link {
                    Some(link) => self.flush(link).await,
                    None => Ok(()),
                };
                self.publish();
                result
            }
            Local::Open(id) => {
                self.store.open(Some(id));
                if let Some(catalog) = self.catalog.clone() {
                    match catalog.messages(id).await {
                        Ok(messages) => self.store.load_messages(id, messages),
                        Err(e) => {
                            tracing::warn!(conversation_id = %id, error = %e, "Failed to load messages");
                        }
                    }
                }

                let receipt = self.lease.start(id, Instant::now());
                if self.store.conversation(id).is_some() {
                    self.store.apply_local(&receipt);
                }
                self.publish();

                // Offline, the lease is re-asserted once the link is back
                match link {
                    Some(link) => link.sink.send(receipt).await,
                    None => Ok(()),
                }
            }
            Local::CloseConversation => {
                self.store.open(None);
                self.lease.stop();
                self.publish();
                Ok(())
            }
            Local::Refresh => {
                self.refresh().await;
                self.publish();
                Ok(())
            }
        }
    }

    /// Send queued events in order; each leaves the queue only once sent
    async fn flush(&mut self, link: &mut Link) -> SyncResult<()> {
        while let Some(event) = self.queue.front().cloned() {
            link.sink.send(event).await?;
            self.queue.pop_front();
            release(&self.outstanding);
        }
        Ok(())
    }

    /// Reload authoritative state from the catalog.
    ///
    /// Failures are logged and leave the local view as it was.
    async fn refresh(&mut self) {
        self.refresh_needed = false;
        let Some(catalog) = self.catalog.clone() else {
            return;
        };

        let (conversations, stats) = tokio::join!(catalog.conversations(), catalog.stats());
        match conversations {
            Ok(list) => {
                let report = self.store.apply_refresh(list);
                tracing::info!(
                    conversations = report.conversations,
                    removed = report.removed,
                    resolved = report.resolved,
                    discarded = report.discarded,
                    "Reloaded conversation list"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Failed to reload conversation list"),
        }
        match stats {
            Ok(stats) => self.store.set_stats(stats),
            Err(e) => tracing::warn!(error = %e, "Failed to reload stats"),
        }

        if let Some(id) = self.store.open_conversation() {
            match catalog.messages(id).await {
                Ok(messages) => self.store.load_messages(id, messages),
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Failed to reload messages");
                }
            }
        }
        self.sync_lease();
    }

    /// Drop the lease if its conversation is no longer open
    fn sync_lease(&mut self) {
        if self.lease.conversation().is_some()
            && self.lease.conversation() != self.store.open_conversation()
        {
            self.lease.stop();
        }
    }

    fn link_lost(&mut self) -> Phase {
        self.set_status(SyncStatus::Disconnected { gave_up: false });
        Phase::Connect { immediate: false }
    }

    fn give_up(&mut self) -> Phase {
        let attempts = self.schedule.attempts();
        tracing::error!(
            attempts,
            queued = self.queue.len(),
            "Relay unreachable, waiting for a forced reconnect"
        );

        self.set_status(SyncStatus::Disconnected { gave_up: true });
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::RetriesExhausted(attempts)));
        }
        Phase::Idle
    }

    fn set_status(&mut self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::debug!(status = ?status, "Sync status changed");
            self.publish();
        }
    }

    fn snapshot(&self) -> SyncSnapshot {
        self.store.snapshot(*self.status.borrow(), self.queue.len())
    }

    fn publish(&self) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.notify(&self.snapshot());
    }

    fn finish(mut self) {
        self.subscribers.clear();
        self.status.send_replace(SyncStatus::Closed);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::ShutDown));
        }

        if !self.queue.is_empty() {
            tracing::warn!(dropped = self.queue.len(), "Sync stopped with unsent events");
        }
        tracing::info!("Sync task stopped");
    }
}
