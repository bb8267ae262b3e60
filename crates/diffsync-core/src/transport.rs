//! Client transport
//!
//! A transport carries one client's requests to the server and the server's
//! pushes back. `LocalTransport` talks to a `SyncServer` in the same process;
//! `net::WsTransport` goes over a WebSocket.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::diff::DiffEngine;
use crate::error::SyncResult;
use crate::message::{EditMessage, EditReply};
use crate::server::{ConnectionId, SyncServer};
use crate::storage::DataAdapter;
use crate::Document;

/// Request/response channel from a client to the server
pub trait Transport: Send + Sync + 'static {
    /// Join a room, returning its canonical document
    fn join(&self, room: &str) -> impl Future<Output = SyncResult<Document>> + Send;

    /// Send a batch and wait for the server's reply
    fn send_edit(&self, message: EditMessage)
        -> impl Future<Output = SyncResult<EditReply>> + Send;

    /// Take the stream of `updated-doc` pushes (only once)
    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<EditMessage>>;
}

/// Transport that calls straight into a `SyncServer`
pub struct LocalTransport<A, E> {
    server: Arc<SyncServer<A, E>>,
    id: ConnectionId,
    updates: Mutex<Option<mpsc::UnboundedReceiver<EditMessage>>>,
}

impl<A: DataAdapter, E: DiffEngine> LocalTransport<A, E> {
    /// Register a connection with the server
    pub async fn connect(server: Arc<SyncServer<A, E>>) -> Self {
        let (id, updates) = server.connect().await;
        Self {
            server,
            id,
            updates: Mutex::new(Some(updates)),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Leave every joined room
    pub async fn close(&self) {
        self.server.disconnect(self.id).await;
    }
}

impl<A: DataAdapter, E: DiffEngine> Transport for LocalTransport<A, E> {
    async fn join(&self, room: &str) -> SyncResult<Document> {
        self.server.join(self.id, room).await
    }

    async fn send_edit(&self, message: EditMessage) -> SyncResult<EditReply> {
        self.server.handle_edit(self.id, message).await
    }

    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<EditMessage>> {
        self.updates.lock().ok().and_then(|mut updates| updates.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_transport_join_and_close() {
        let server = Arc::new(SyncServer::new(MemoryAdapter::new()));
        let transport = LocalTransport::connect(server.clone()).await;

        assert_eq!(transport.join("notes").await.unwrap(), json!({}));
        assert_eq!(server.members("notes").await, vec![transport.connection_id()]);

        assert!(transport.take_updates().is_some());
        assert!(transport.take_updates().is_none());

        transport.close().await;
        assert_eq!(server.room_count().await, 0);
    }
}
