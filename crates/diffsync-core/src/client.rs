//! Client sync engine
//!
//! Owns the client's working copy of one room and runs the sync cycle:
//! diff the working copy against the shadow, send the pending edits, apply
//! the server's reply. At most one cycle is in flight; `schedule` calls made
//! while a cycle runs collapse into a single follow-up cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::diff::{DiffEngine, JsonPatchEngine};
use crate::error::{SyncError, SyncResult};
use crate::message::EditReply;
use crate::state::SyncState;
use crate::transport::Transport;
use crate::Document;

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No session
    Disconnected,
    /// Waiting for the join reply
    Joining,
    /// Session established, no cycle running
    Idle,
    /// A cycle is waiting for the server
    Syncing,
}

/// Events emitted by the sync client
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Status changed
    StatusChanged(SyncStatus),
    /// Joined the room
    Connected,
    /// A cycle completed
    Synced { applied: usize },
    /// The working copy changed from remote edits
    DocumentUpdated,
    /// A cycle or join failed
    Error(String),
}

/// Differential sync client for a single room
pub struct SyncClient<T, E = JsonPatchEngine> {
    transport: T,
    engine: E,
    room: String,
    /// `None` until the first successful join
    state: Mutex<Option<SyncState>>,
    /// A cycle has been requested and not started yet
    scheduled: AtomicBool,
    /// Held for the duration of a cycle
    cycle: Mutex<()>,
    status: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SyncClient<T> {
    /// Create a client using the JSON Patch engine
    pub fn new(transport: T, room: impl Into<String>) -> Self {
        Self::with_engine(transport, JsonPatchEngine, room)
    }
}

impl<T: Transport, E: DiffEngine> SyncClient<T, E> {
    pub fn with_engine(transport: T, engine: E, room: impl Into<String>) -> Self {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            transport,
            engine,
            room: room.into(),
            state: Mutex::new(None),
            scheduled: AtomicBool::new(false),
            cycle: Mutex::new(()),
            status: status_tx,
            status_rx,
            event_tx,
            event_rx: Some(event_rx),
            listener: std::sync::Mutex::new(None),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the current status
    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Join the room and seed the session from its document
    ///
    /// Calling it again re-joins and reseeds, discarding unsent local
    /// changes. Server pushes trigger `schedule` once initialized.
    pub async fn initialize(self: &Arc<Self>) -> SyncResult<()> {
        let cycle = self.cycle.lock().await;
        self.set_status(SyncStatus::Joining);

        let document = match self.transport.join(&self.room).await {
            Ok(document) => document,
            Err(e) => {
                warn!(room = %self.room, "Join failed: {}", e);
                self.set_status(SyncStatus::Disconnected);
                self.emit(SyncEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        *self.state.lock().await = Some(SyncState::new(document));
        self.set_status(SyncStatus::Idle);
        self.emit(SyncEvent::Connected);
        self.start_listener();
        drop(cycle);

        info!(room = %self.room, "Joined room");
        self.resume_scheduled().await;
        Ok(())
    }

    /// Request a sync cycle
    ///
    /// Returns `Ok(false)` when the request was folded into a cycle that is
    /// already running, or when there is no session yet. Otherwise runs
    /// cycles until no request is left and returns `Ok(true)`; if any of
    /// them failed the first error is returned instead.
    pub async fn schedule(&self) -> SyncResult<bool> {
        self.scheduled.store(true, Ordering::SeqCst);

        let mut ran = false;
        let mut failure = None;
        loop {
            let Ok(guard) = self.cycle.try_lock() else {
                // The running cycle will pick the request up
                return Ok(false);
            };

            while self.scheduled.swap(false, Ordering::SeqCst) {
                match self.run_cycle().await {
                    Ok(true) => ran = true,
                    Ok(false) => return Ok(false),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            drop(guard);

            // A request may have arrived between the last swap and the unlock
            if !self.scheduled.load(Ordering::SeqCst) {
                break;
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(ran),
        }
    }

    /// Run one cycle now
    ///
    /// Returns `Ok(false)` without doing anything when there is no session
    /// or a cycle is already running.
    pub async fn sync_with_server(&self) -> SyncResult<bool> {
        let Ok(cycle) = self.cycle.try_lock() else {
            return Ok(false);
        };
        let result = self.run_cycle().await;
        drop(cycle);

        self.resume_scheduled().await;
        result
    }

    /// Mutate the working copy and schedule a cycle
    pub async fn update<F>(&self, mutate: F) -> SyncResult<bool>
    where
        F: FnOnce(&mut Document),
    {
        {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(|| self.invalid_session())?;
            mutate(state.working_copy_mut());
        }
        self.schedule().await
    }

    /// Snapshot of the working copy
    pub async fn document(&self) -> SyncResult<Document> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| state.working_copy().clone())
            .ok_or_else(|| self.invalid_session())
    }

    /// `(local_version, remote_version)`
    pub async fn versions(&self) -> SyncResult<(u64, u64)> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(SyncState::versions)
            .ok_or_else(|| self.invalid_session())
    }

    /// One cycle; the caller holds the cycle lock
    ///
    /// A rejected batch is recovered from and re-sent once, re-diffed
    /// against the realigned shadow.
    async fn run_cycle(&self) -> SyncResult<bool> {
        let mut retried = false;
        let result = loop {
            let prepared = {
                let mut guard = self.state.lock().await;
                match guard.as_mut() {
                    Some(state) => state.prepare_edits(&self.engine, &self.room),
                    None if retried => Err(self.invalid_session()),
                    None => return Ok(false),
                }
            };
            let message = match prepared {
                Ok(message) => message,
                Err(e) => break Err(e),
            };
            let sent_version = message.local_version;

            self.set_status(SyncStatus::Syncing);
            debug!(
                room = %self.room,
                edits = message.edits.len(),
                local_version = message.local_version,
                server_version = message.server_version,
                "Sending edits"
            );

            match self.transport.send_edit(message).await {
                Ok(EditReply::Accepted(reply)) => {
                    let mut guard = self.state.lock().await;
                    break match guard.as_mut() {
                        Some(state) => state
                            .apply_server_edits(&self.engine, &reply)
                            .map(|outcome| outcome.applied),
                        None => Err(self.invalid_session()),
                    };
                }
                Ok(EditReply::Rejected(rejection)) => {
                    {
                        let mut guard = self.state.lock().await;
                        if let Some(state) = guard.as_mut() {
                            let restored = state.recover_from_rejection(&rejection);
                            debug!(room = %self.room, restored, "Recovered from rejection");
                        }
                    }
                    if !retried {
                        retried = true;
                        info!(
                            room = %self.room,
                            reason = %rejection.reason,
                            "Edit rejected, resending"
                        );
                        continue;
                    }
                    break Err(SyncError::RejectedEdit {
                        expected: rejection.local_version,
                        received: sent_version,
                    });
                }
                Err(e) => break Err(e),
            }
        };

        self.set_status(SyncStatus::Idle);
        match result {
            Ok(applied) => {
                self.emit(SyncEvent::Synced { applied });
                if applied > 0 {
                    self.emit(SyncEvent::DocumentUpdated);
                }
                Ok(true)
            }
            Err(e) => {
                warn!(room = %self.room, "Sync cycle failed: {}", e);
                self.emit(SyncEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Run requests that were folded into a cycle this caller just finished
    ///
    /// Failures are reported through the event stream.
    async fn resume_scheduled(&self) {
        if self.scheduled.load(Ordering::SeqCst) {
            let _ = self.schedule().await;
        }
    }

    /// Forward server pushes to `schedule`
    fn start_listener(self: &Arc<Self>) {
        let Ok(mut listener) = self.listener.lock() else {
            return;
        };
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let Some(mut updates) = self.transport.take_updates() else {
            return;
        };

        let client: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            while updates.recv().await.is_some() {
                let Some(client) = client.upgrade() else {
                    break;
                };
                if let Err(e) = client.schedule().await {
                    debug!(room = %client.room, "Push-triggered sync failed: {}", e);
                }
            }
        }));
    }

    fn set_status(&self, status: SyncStatus) {
        let _ = self.status.send(status);
        self.emit(SyncEvent::StatusChanged(status));
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn invalid_session(&self) -> SyncError {
        SyncError::InvalidSession {
            room: self.room.clone(),
        }
    }
}

impl<T, E> Drop for SyncClient<T, E> {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}
