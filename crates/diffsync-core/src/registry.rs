//! Room registry
//!
//! Maps room ids to their canonical document and per-member shadow states.
//! Rooms are loaded through the data adapter on first reference; concurrent
//! first references share a single load through a per-room `OnceCell`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard, OnceCell};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::message::EditMessage;
use crate::server::ConnectionId;
use crate::state::ShadowState;
use crate::storage::{AdapterError, DataAdapter};
use crate::Document;

/// A connection's membership in a room
#[derive(Debug)]
pub(crate) struct Member {
    pub(crate) shadow: ShadowState,
    pub(crate) push: mpsc::UnboundedSender<EditMessage>,
}

/// Mutable part of a room, guarded by the room lock
#[derive(Debug)]
pub(crate) struct RoomState {
    pub(crate) document: Document,
    pub(crate) members: HashMap<ConnectionId, Member>,
    /// Set once the room left the registry; holders must look it up again
    pub(crate) evicted: bool,
}

/// A room: the canonical document and its members
#[derive(Debug)]
pub struct Room {
    id: String,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(id: &str, document: Document) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(RoomState {
                document,
                members: HashMap::new(),
                evicted: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the canonical document
    pub async fn document(&self) -> Document {
        self.state.lock().await.document.clone()
    }

    /// Connections currently joined to the room
    pub async fn members(&self) -> Vec<ConnectionId> {
        self.state.lock().await.members.keys().copied().collect()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}

type RoomCell = Arc<OnceCell<Arc<Room>>>;

/// Owns every room the server currently holds in memory
pub struct SessionRegistry<A> {
    adapter: Arc<A>,
    rooms: Mutex<HashMap<String, RoomCell>>,
}

impl<A: DataAdapter> SessionRegistry<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter: Arc::new(adapter),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Get a room, loading it through the adapter if it is not cached
    ///
    /// A failed load caches nothing; the next call tries again.
    pub async fn get_room(&self, id: &str) -> SyncResult<Arc<Room>> {
        let cell = {
            let mut rooms = self.rooms.lock().await;
            rooms.entry(id.to_string()).or_default().clone()
        };

        match cell.get_or_try_init(|| self.load(id)).await {
            Ok(room) => Ok(room.clone()),
            Err(e) => {
                let mut rooms = self.rooms.lock().await;
                if let Some(current) = rooms.get(id) {
                    if Arc::ptr_eq(current, &cell) && !cell.initialized() {
                        rooms.remove(id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Get a room only if it is already loaded
    pub async fn cached(&self, id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().await;
        rooms.get(id).and_then(|cell| cell.get()).cloned()
    }

    /// Number of loaded rooms
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.values().filter(|cell| cell.initialized()).count()
    }

    /// Store and drop a room that has no members left
    ///
    /// Returns whether the room was evicted. If storing fails the room
    /// stays cached and the error is returned. Only the room's own lock is
    /// held while storing.
    pub async fn evict_if_empty(&self, id: &str) -> SyncResult<bool> {
        let Some(room) = self.cached(id).await else {
            return Ok(false);
        };

        {
            let mut state = room.lock().await;
            if state.evicted || !state.members.is_empty() {
                return Ok(false);
            }

            self.store(id, state.document.clone()).await?;
            state.evicted = true;
        }
        self.discard(&room).await;

        info!(room = id, "Evicted empty room");
        Ok(true)
    }

    /// Drop an evicted room from the map unless it was already replaced
    pub(crate) async fn discard(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.lock().await;
        let current = rooms.get(room.id()).and_then(|cell| cell.get());
        if current.is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room.id());
        }
    }

    /// Store every loaded room's document
    ///
    /// Each room stays locked until its document is stored, so a later
    /// store of the same room cannot be overtaken. Returns the number of
    /// rooms stored.
    pub async fn flush(&self) -> SyncResult<usize> {
        let loaded: Vec<Arc<Room>> = {
            let rooms = self.rooms.lock().await;
            rooms.values().filter_map(|cell| cell.get()).cloned().collect()
        };

        let mut stored = 0;
        for room in loaded {
            let state = room.lock().await;
            if state.evicted {
                continue;
            }
            self.store(room.id(), state.document.clone()).await?;
            stored += 1;
        }

        debug!(rooms = stored, "Flushed rooms");
        Ok(stored)
    }

    async fn load(&self, id: &str) -> SyncResult<Arc<Room>> {
        let adapter = self.adapter.clone();
        let room = id.to_string();

        let document = tokio::task::spawn_blocking(move || adapter.get_document(&room))
            .await
            .map_err(|e| adapter_failure(id, AdapterError::Unavailable(e.to_string())))?
            .map_err(|source| adapter_failure(id, source))?;

        info!(room = id, "Loaded room");
        Ok(Arc::new(Room::new(id, document)))
    }

    async fn store(&self, id: &str, document: Document) -> SyncResult<()> {
        let adapter = self.adapter.clone();
        let room = id.to_string();

        tokio::task::spawn_blocking(move || adapter.store_document(&room, &document))
            .await
            .map_err(|e| adapter_failure(id, AdapterError::Unavailable(e.to_string())))?
            .map_err(|source| adapter_failure(id, source))
    }
}

fn adapter_failure(room: &str, source: AdapterError) -> SyncError {
    SyncError::AdapterFailure {
        room: room.to_string(),
        source,
    }
}
