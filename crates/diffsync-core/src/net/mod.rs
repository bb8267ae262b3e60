//! WebSocket front-end
//!
//! Frames are JSON text messages: clients send `ClientMessage`s, the server
//! answers each request with a `ServerMessage` carrying the same `requestId`
//! and pushes `updated-doc` messages in between.

pub mod client;
pub mod server;

pub use client::WsTransport;
pub use server::serve;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::client::{SyncClient, SyncEvent};
    use crate::error::SyncError;
    use crate::server::SyncServer;
    use crate::storage::MemoryAdapter;
    use crate::transport::Transport;

    async fn start_server() -> (String, Arc<SyncServer<MemoryAdapter>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = Arc::new(SyncServer::new(MemoryAdapter::new()));
        tokio::spawn(serve(listener, server.clone()));
        (url, server)
    }

    #[tokio::test]
    async fn test_clients_converge_over_websocket() {
        let (url, server) = start_server().await;

        let a = Arc::new(SyncClient::new(
            WsTransport::connect(&url).await.unwrap(),
            "shared",
        ));
        let mut b = SyncClient::new(WsTransport::connect(&url).await.unwrap(), "shared");
        let mut b_events = b.take_events().unwrap();
        let b = Arc::new(b);

        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        a.update(|doc| doc["list"] = json!([1, 2, 3])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = b_events.recv().await {
                if matches!(event, SyncEvent::DocumentUpdated) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(b.document().await.unwrap(), json!({"list": [1, 2, 3]}));
        assert_eq!(
            server.document("shared").await,
            Some(json!({"list": [1, 2, 3]}))
        );
    }

    #[tokio::test]
    async fn test_dropped_connection_leaves_room() {
        let (url, server) = start_server().await;

        let transport = WsTransport::connect(&url).await.unwrap();
        transport.join("notes").await.unwrap();
        assert_eq!(server.members("notes").await.len(), 1);

        transport.close().await;
        drop(transport);

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.room_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.adapter().stored("notes"), Some(json!({})));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        // Accept the handshake, then hang up
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });

        let transport = WsTransport::connect(&url).await.unwrap();
        let err = transport.join("notes").await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }
}
