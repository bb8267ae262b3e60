//! WebSocket server

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::diff::DiffEngine;
use crate::error::{SyncError, SyncResult};
use crate::message::{ClientMessage, EditReply, ServerMessage};
use crate::server::{ConnectionId, SyncServer};
use crate::storage::DataAdapter;

/// Accept WebSocket connections and serve them from `server`
///
/// Runs until accepting fails. Each connection gets its own task and is
/// disconnected from the server when the socket closes.
pub async fn serve<A, E>(listener: TcpListener, server: Arc<SyncServer<A, E>>) -> SyncResult<()>
where
    A: DataAdapter,
    E: DiffEngine,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Sync server listening");
    }

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, server).await {
                debug!(%peer, "Connection ended with error: {}", e);
            }
        });
    }
}

async fn handle_connection<A, E>(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<SyncServer<A, E>>,
) -> SyncResult<()>
where
    A: DataAdapter,
    E: DiffEngine,
{
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let (conn, mut updates) = server.connect().await;
    info!(%peer, connection = %conn, "Client connected");

    // Replies and pushes share the socket through one writer
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(reply) = replies.recv() => reply,
                Some(push) = updates.recv() => ServerMessage::UpdatedDoc { message: push },
                else => break,
            };
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut result = Ok(());
    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let reply = match ClientMessage::decode(&text) {
                    Ok(request) => dispatch(&server, conn, request).await,
                    Err(e) => ServerMessage::Error {
                        request_id: None,
                        message: e.to_string(),
                    },
                };
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(connection = %conn, "Ignoring binary frame");
            }
            _ => {}
        }
    }

    // Disconnecting drops the push sender; the writer drains and exits
    server.disconnect(conn).await;
    drop(reply_tx);
    let _ = writer.await;
    info!(%peer, connection = %conn, "Client disconnected");

    result
}

async fn dispatch<A, E>(
    server: &SyncServer<A, E>,
    conn: ConnectionId,
    request: ClientMessage,
) -> ServerMessage
where
    A: DataAdapter,
    E: DiffEngine,
{
    match request {
        ClientMessage::Join { request_id, room } => match server.join(conn, &room).await {
            Ok(document) => ServerMessage::Joined {
                request_id,
                document,
            },
            Err(e) => ServerMessage::Error {
                request_id: Some(request_id),
                message: e.to_string(),
            },
        },
        ClientMessage::SendEdit {
            request_id,
            message,
        } => match server.handle_edit(conn, message).await {
            Ok(EditReply::Accepted(message)) => ServerMessage::Edits {
                request_id,
                message,
            },
            Ok(EditReply::Rejected(rejection)) => ServerMessage::Rejected {
                request_id,
                rejection,
            },
            Err(e) => ServerMessage::Error {
                request_id: Some(request_id),
                message: e.to_string(),
            },
        },
    }
}
