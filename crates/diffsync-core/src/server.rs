//! Server sync engine
//!
//! Holds one `ShadowState` per (connection, room) and reconciles each
//! client's batches against the room's canonical document. When a batch
//! changes the document every other member is sent an `updated-doc` preview;
//! their own shadow states only advance in their own exchanges.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::diff::{DiffEngine, JsonPatchEngine};
use crate::error::{SyncError, SyncResult};
use crate::message::{EditMessage, EditReply, Rejection, Side};
use crate::registry::{Member, RoomState, SessionRegistry};
use crate::state::ShadowState;
use crate::storage::DataAdapter;
use crate::Document;

/// Identifies one client connection
pub type ConnectionId = Uuid;

/// Server behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Store and drop a room when its last member leaves
    pub evict_empty_rooms: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            evict_empty_rooms: true,
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            evict_empty_rooms: config.evict_empty_rooms,
        }
    }
}

#[derive(Debug)]
struct Connection {
    push: mpsc::UnboundedSender<EditMessage>,
    rooms: HashSet<String>,
}

/// Differential sync server for any number of rooms
pub struct SyncServer<A, E = JsonPatchEngine> {
    registry: SessionRegistry<A>,
    engine: E,
    options: ServerOptions,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl<A: DataAdapter> SyncServer<A> {
    /// Create a server using the JSON Patch engine
    pub fn new(adapter: A) -> Self {
        Self::with_engine(adapter, JsonPatchEngine)
    }
}

impl<A: DataAdapter, E: DiffEngine> SyncServer<A, E> {
    pub fn with_engine(adapter: A, engine: E) -> Self {
        Self {
            registry: SessionRegistry::new(adapter),
            engine,
            options: ServerOptions::default(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ServerOptions {
        self.options
    }

    pub fn adapter(&self) -> &A {
        self.registry.adapter()
    }

    pub fn registry(&self) -> &SessionRegistry<A> {
        &self.registry
    }

    /// Register a new connection
    ///
    /// The receiver yields the `updated-doc` pushes for every room the
    /// connection joins.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<EditMessage>) {
        let id = Uuid::new_v4();
        let (push, updates) = mpsc::unbounded_channel();

        self.connections.lock().await.insert(
            id,
            Connection {
                push,
                rooms: HashSet::new(),
            },
        );

        debug!(connection = %id, "Connection registered");
        (id, updates)
    }

    /// Join `room`, returning its canonical document
    ///
    /// Joining again replaces the connection's shadow state for the room.
    pub async fn join(&self, conn: ConnectionId, room: &str) -> SyncResult<Document> {
        if !self.connections.lock().await.contains_key(&conn) {
            return Err(invalid_session(room));
        }

        let document = loop {
            let handle = self.registry.get_room(room).await?;
            let mut state = handle.lock().await;
            if state.evicted {
                // Lost a race with eviction; look the room up again
                drop(state);
                self.registry.discard(&handle).await;
                continue;
            }

            // Checked under the room lock so a concurrent disconnect either
            // sees this room or makes the join fail
            let push = {
                let mut connections = self.connections.lock().await;
                let connection = connections
                    .get_mut(&conn)
                    .ok_or_else(|| invalid_session(room))?;
                connection.rooms.insert(room.to_string());
                connection.push.clone()
            };

            let document = state.document.clone();
            let member = Member {
                shadow: ShadowState::new(&document),
                push,
            };
            if state.members.insert(conn, member).is_some() {
                debug!(connection = %conn, room, "Re-joined, session reseeded");
            }
            break document;
        };

        info!(connection = %conn, room, "Client joined room");
        Ok(document)
    }

    /// Reconcile a client's batch and answer with the server's edits
    pub async fn receive_edit(
        &self,
        conn: ConnectionId,
        message: EditMessage,
    ) -> SyncResult<EditMessage> {
        self.process_edit(conn, message).await.map_err(|refusal| refusal.error)
    }

    /// `receive_edit` for transports: rejections become a reply
    pub async fn handle_edit(
        &self,
        conn: ConnectionId,
        message: EditMessage,
    ) -> SyncResult<EditReply> {
        let room = message.room.clone();
        match self.process_edit(conn, message).await {
            Ok(reply) => Ok(EditReply::Accepted(reply)),
            Err(Refusal {
                error: e @ (SyncError::RejectedEdit { .. } | SyncError::Patch(_)),
                versions: Some((local_version, remote_version)),
            }) => Ok(EditReply::Rejected(Rejection {
                room,
                local_version: remote_version,
                server_version: local_version,
                reason: e.to_string(),
            })),
            Err(refusal) => Err(refusal.error),
        }
    }

    async fn process_edit(
        &self,
        conn: ConnectionId,
        message: EditMessage,
    ) -> Result<EditMessage, Refusal> {
        let room = self
            .registry
            .cached(&message.room)
            .await
            .ok_or_else(|| invalid_session(&message.room))?;

        let mut guard = room.lock().await;
        let state = &mut *guard;
        if state.evicted {
            return Err(invalid_session(&message.room).into());
        }

        let member = state
            .members
            .get_mut(&conn)
            .ok_or_else(|| invalid_session(&message.room))?;

        let before = message.has_changes().then(|| state.document.clone());

        let reconciled = member.shadow.reconcile(
            &self.engine,
            &mut state.document,
            Side::Server.inbound(&message),
            &message.edits,
        );
        let outcome = match reconciled {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    connection = %conn,
                    room = %message.room,
                    local_version = message.local_version,
                    server_version = message.server_version,
                    "Rejected edit: {}",
                    e
                );
                // A rejected batch leaves the session as it was
                return Err(Refusal {
                    error: e,
                    versions: Some((
                        member.shadow.local_version(),
                        member.shadow.remote_version(),
                    )),
                });
            }
        };

        let reply = member
            .shadow
            .prepare(&self.engine, Side::Server, &message.room, &state.document)?;

        debug!(
            connection = %conn,
            room = %message.room,
            applied = outcome.applied,
            restored = outcome.restored,
            conflicts = outcome.conflicts,
            replying = reply.edits.len(),
            "Accepted edit"
        );

        let changed = before.is_some_and(|before| before != state.document);
        if changed {
            self.notify_others(conn, &message.room, state);
        }

        Ok(reply)
    }

    /// Remove a connection from every room it joined
    ///
    /// Rooms left without members are evicted when enabled. A failed store
    /// keeps the room cached and is logged.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some(connection) = self.connections.lock().await.remove(&conn) else {
            return;
        };

        for room_id in &connection.rooms {
            let Some(room) = self.registry.cached(room_id).await else {
                continue;
            };

            let empty = {
                let mut state = room.lock().await;
                state.members.remove(&conn);
                state.members.is_empty()
            };

            if empty && self.options.evict_empty_rooms {
                if let Err(e) = self.registry.evict_if_empty(room_id).await {
                    error!(room = %room_id, "Failed to store room on eviction: {}", e);
                }
            }
        }

        info!(connection = %conn, "Client disconnected");
    }

    /// Store every loaded room through the adapter
    pub async fn flush(&self) -> SyncResult<usize> {
        self.registry.flush().await
    }

    /// Canonical document of a loaded room
    pub async fn document(&self, room: &str) -> Option<Document> {
        let room = self.registry.cached(room).await?;
        Some(room.document().await)
    }

    /// Connections joined to a loaded room
    pub async fn members(&self, room: &str) -> Vec<ConnectionId> {
        match self.registry.cached(room).await {
            Some(room) => room.members().await,
            None => Vec::new(),
        }
    }

    /// The server's `(local_version, remote_version)` for a member
    pub async fn session_versions(&self, conn: ConnectionId, room: &str) -> Option<(u64, u64)> {
        let room = self.registry.cached(room).await?;
        let state = room.lock().await;
        state
            .members
            .get(&conn)
            .map(|m| (m.shadow.local_version(), m.shadow.remote_version()))
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    /// Push a preview of the new document to every member but `sender`
    fn notify_others(&self, sender: ConnectionId, room: &str, state: &RoomState) {
        for (id, member) in &state.members {
            if *id == sender {
                continue;
            }
            let Some(preview) = member
                .shadow
                .preview(&self.engine, Side::Server, room, &state.document)
            else {
                continue;
            };
            if member.push.send(preview).is_err() {
                debug!(connection = %id, room, "Push receiver gone");
            }
        }
    }
}

impl<A, E> std::fmt::Debug for SyncServer<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Why a batch was not accepted, with the member's versions at that moment
struct Refusal {
    error: SyncError,
    /// `(local_version, remote_version)` when the batch reached the session
    versions: Option<(u64, u64)>,
}

impl From<SyncError> for Refusal {
    fn from(error: SyncError) -> Self {
        Self {
            error,
            versions: None,
        }
    }
}

fn invalid_session(room: &str) -> SyncError {
    SyncError::InvalidSession {
        room: room.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncState;
    use crate::storage::MemoryAdapter;
    use serde_json::json;

    fn server_with(room: &str, document: Document) -> SyncServer<MemoryAdapter> {
        SyncServer::new(MemoryAdapter::with_documents([(room.to_string(), document)]))
    }

    #[tokio::test]
    async fn test_join_returns_document() {
        let server = server_with("notes", json!({"a": 1}));
        let (conn, _updates) = server.connect().await;

        let document = server.join(conn, "notes").await.unwrap();

        assert_eq!(document, json!({"a": 1}));
        assert_eq!(server.members("notes").await, vec![conn]);
        assert_eq!(server.session_versions(conn, "notes").await, Some((0, 0)));
    }

    #[tokio::test]
    async fn test_edit_before_join_is_invalid_session() {
        let server = server_with("notes", json!({}));
        let (conn, _updates) = server.connect().await;

        let message = Side::Client.outbound("notes", Vec::new(), 0, 0);
        let err = server.receive_edit(conn, message).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidSession { .. }));

        let unknown = Uuid::new_v4();
        let err = server.join(unknown, "notes").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidSession { .. }));
    }

    #[tokio::test]
    async fn test_edit_reaches_other_member() {
        let engine = JsonPatchEngine;
        let server = server_with("shared", json!({"a": 1}));
        let (conn_a, _updates_a) = server.connect().await;
        let (conn_b, mut updates_b) = server.connect().await;

        let mut client_a = SyncState::new(server.join(conn_a, "shared").await.unwrap());
        let client_b = SyncState::new(server.join(conn_b, "shared").await.unwrap());

        client_a.working_copy_mut()["a"] = json!(2);
        let outbound = client_a.prepare_edits(&engine, "shared").unwrap();
        let reply = server.receive_edit(conn_a, outbound).await.unwrap();
        client_a.apply_server_edits(&engine, &reply).unwrap();

        assert_eq!(server.document("shared").await, Some(json!({"a": 2})));

        let push = updates_b.try_recv().unwrap();
        let mut seen_by_b = client_b.working_copy().clone();
        for edit in &push.edits {
            engine.apply(&mut seen_by_b, &edit.diff).unwrap();
        }
        assert_eq!(seen_by_b, json!({"a": 2}));

        // Server record for A matches A's own counters
        let (server_local, server_remote) = server.session_versions(conn_a, "shared").await.unwrap();
        assert_eq!(client_a.versions(), (server_remote, server_local));

        // B's session has not moved
        assert_eq!(server.session_versions(conn_b, "shared").await, Some((0, 0)));
    }

    #[tokio::test]
    async fn test_stale_batch_rejected_without_change() {
        let engine = JsonPatchEngine;
        let server = server_with("notes", json!({"a": 1}));
        let (conn, _updates) = server.connect().await;
        let mut client = SyncState::new(server.join(conn, "notes").await.unwrap());

        client.working_copy_mut()["a"] = json!(2);
        let first = client.prepare_edits(&engine, "notes").unwrap();
        let mut stale = first.clone();
        server.receive_edit(conn, first).await.unwrap();

        stale.edits[0].diff = engine.diff(&json!({"a": 1}), &json!({"a": 42}));
        let err = server.receive_edit(conn, stale.clone()).await.unwrap_err();
        assert!(matches!(err, SyncError::RejectedEdit { .. }));
        assert_eq!(server.document("notes").await, Some(json!({"a": 2})));

        match server.handle_edit(conn, stale).await.unwrap() {
            EditReply::Rejected(rejection) => {
                assert_eq!(rejection.local_version, 1);
                assert_eq!(rejection.server_version, 0);
            }
            EditReply::Accepted(_) => panic!("Expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_members_converge() {
        let engine = JsonPatchEngine;
        let server = server_with("shared", json!({}));
        let (conn_a, _ua) = server.connect().await;
        let (conn_b, _ub) = server.connect().await;
        let mut a = SyncState::new(server.join(conn_a, "shared").await.unwrap());
        let mut b = SyncState::new(server.join(conn_b, "shared").await.unwrap());

        a.working_copy_mut()["from_a"] = json!(1);
        b.working_copy_mut()["from_b"] = json!(2);

        for _ in 0..2 {
            let reply = server
                .receive_edit(conn_a, a.prepare_edits(&engine, "shared").unwrap())
                .await
                .unwrap();
            a.apply_server_edits(&engine, &reply).unwrap();

            let reply = server
                .receive_edit(conn_b, b.prepare_edits(&engine, "shared").unwrap())
                .await
                .unwrap();
            b.apply_server_edits(&engine, &reply).unwrap();
        }

        let expected = json!({"from_a": 1, "from_b": 2});
        assert_eq!(server.document("shared").await, Some(expected.clone()));
        assert_eq!(a.working_copy(), &expected);
        assert_eq!(b.working_copy(), &expected);
    }

    #[tokio::test]
    async fn test_last_leave_evicts_and_stores() {
        let engine = JsonPatchEngine;
        let server = server_with("notes", json!({}));
        let (conn, _updates) = server.connect().await;
        let mut client = SyncState::new(server.join(conn, "notes").await.unwrap());

        client.working_copy_mut()["saved"] = json!(true);
        let outbound = client.prepare_edits(&engine, "notes").unwrap();
        server.receive_edit(conn, outbound).await.unwrap();

        server.disconnect(conn).await;

        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.adapter().stored("notes"), Some(json!({"saved": true})));
    }

    #[tokio::test]
    async fn test_eviction_can_be_disabled() {
        let server = server_with("notes", json!({})).with_options(ServerOptions {
            evict_empty_rooms: false,
        });
        let (conn, _updates) = server.connect().await;
        server.join(conn, "notes").await.unwrap();

        server.disconnect(conn).await;

        assert_eq!(server.room_count().await, 1);
        assert!(server.members("notes").await.is_empty());
        assert_eq!(server.flush().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyed_array_edit_follows_element() {
        let engine = JsonPatchEngine;
        let server = server_with("list", json!({"list": [{"id": 1, "v": 0}, {"id": 2, "v": 0}]}));
        let (conn_a, _ua) = server.connect().await;
        let (conn_b, _ub) = server.connect().await;
        let mut a = SyncState::new(server.join(conn_a, "list").await.unwrap());
        let mut b = SyncState::new(server.join(conn_b, "list").await.unwrap());

        b.working_copy_mut()["list"]
            .as_array_mut()
            .unwrap()
            .insert(0, json!({"id": 3, "v": 0}));
        let reply = server
            .receive_edit(conn_b, b.prepare_edits(&engine, "list").unwrap())
            .await
            .unwrap();
        b.apply_server_edits(&engine, &reply).unwrap();

        // A still sees element 2 at index 1
        a.working_copy_mut()["list"][1]["v"] = json!(99);
        let reply = server
            .receive_edit(conn_a, a.prepare_edits(&engine, "list").unwrap())
            .await
            .unwrap();
        a.apply_server_edits(&engine, &reply).unwrap();

        let expected = json!({"list": [{"id": 3, "v": 0}, {"id": 1, "v": 0}, {"id": 2, "v": 99}]});
        assert_eq!(server.document("list").await, Some(expected.clone()));
        assert_eq!(a.working_copy(), &expected);
    }

    #[tokio::test]
    async fn test_conflicting_edit_is_not_half_applied() {
        let engine = JsonPatchEngine;
        let server = server_with("notes", json!({"a": {"x": 1}, "b": 1}));
        let (conn_a, _ua) = server.connect().await;
        let (conn_b, _ub) = server.connect().await;
        let mut a = SyncState::new(server.join(conn_a, "notes").await.unwrap());
        let mut b = SyncState::new(server.join(conn_b, "notes").await.unwrap());

        b.working_copy_mut().as_object_mut().unwrap().remove("a");
        let reply = server
            .receive_edit(conn_b, b.prepare_edits(&engine, "notes").unwrap())
            .await
            .unwrap();
        b.apply_server_edits(&engine, &reply).unwrap();

        a.working_copy_mut()["a"]["x"] = json!(2);
        a.working_copy_mut()["b"] = json!(2);
        let reply = server
            .receive_edit(conn_a, a.prepare_edits(&engine, "notes").unwrap())
            .await
            .unwrap();
        a.apply_server_edits(&engine, &reply).unwrap();

        // A's diff touched the removed object, so none of it landed
        assert_eq!(server.document("notes").await, Some(json!({"b": 1})));
        assert_eq!(a.working_copy(), &json!({"b": 1}));
    }

    #[tokio::test]
    async fn test_join_racing_disconnect_leaves_no_member() {
        let server = server_with("notes", json!({})).with_options(ServerOptions {
            evict_empty_rooms: false,
        });

        for _ in 0..20 {
            let (conn, _updates) = server.connect().await;
            let (joined, ()) = tokio::join!(server.join(conn, "notes"), server.disconnect(conn));

            if let Err(e) = joined {
                assert!(matches!(e, SyncError::InvalidSession { .. }));
            }
            assert!(server.members("notes").await.is_empty());
        }
    }
}
