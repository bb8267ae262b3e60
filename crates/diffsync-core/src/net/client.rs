//! WebSocket transport
//!
//! Requests are correlated with replies by `requestId`. A reader task routes
//! replies to the waiting request and pushes to the update stream; when the
//! connection goes away every outstanding request fails with
//! `ConnectionClosed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::message::{ClientMessage, EditMessage, EditReply, ServerMessage};
use crate::transport::Transport;
use crate::Document;

/// Outstanding requests; `None` once the connection is gone
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<ServerMessage>>>>>;

/// Transport over a WebSocket connection to `diffsync serve`
pub struct WsTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_request: AtomicU64,
    updates: Mutex<Option<mpsc::UnboundedReceiver<EditMessage>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to a sync server
    pub async fn connect(url: &str) -> SyncResult<Self> {
        debug!("Connecting to {}", url);
        let (ws_stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outbox) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (push_tx, updates) = mpsc::unbounded_channel();

        let routes = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("WebSocket read failed: {}", e);
                        break;
                    }
                };

                match ServerMessage::decode(&text) {
                    Ok(ServerMessage::UpdatedDoc { message }) => {
                        let _ = push_tx.send(message);
                    }
                    Ok(reply) => route_reply(&routes, reply),
                    Err(e) => warn!("Failed to decode server message: {}", e),
                }
            }

            // Dropping the senders fails every waiting request
            if let Ok(mut routes) = routes.lock() {
                routes.take();
            }
        });

        info!("Connected to {}", url);
        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            next_request: AtomicU64::new(1),
            updates: Mutex::new(Some(updates)),
            reader,
            writer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a close frame; outstanding requests fail once the server hangs up
    pub async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    async fn request<F>(&self, build: F) -> SyncResult<ServerMessage>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let text = build(request_id).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| SyncError::ConnectionClosed)?;
            pending
                .as_mut()
                .ok_or(SyncError::ConnectionClosed)?
                .insert(request_id, reply_tx);
        }

        if self.outgoing.send(Message::Text(text)).is_err() {
            self.forget(request_id);
            return Err(SyncError::ConnectionClosed);
        }

        reply_rx.await.map_err(|_| SyncError::ConnectionClosed)
    }

    fn forget(&self, request_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(routes) = pending.as_mut() {
                routes.remove(&request_id);
            }
        }
    }
}

impl Transport for WsTransport {
    async fn join(&self, room: &str) -> SyncResult<Document> {
        let reply = self
            .request(|request_id| ClientMessage::Join {
                request_id,
                room: room.to_string(),
            })
            .await?;

        match reply {
            ServerMessage::Joined { document, .. } => Ok(document),
            ServerMessage::Error { message, .. } => Err(SyncError::Remote(message)),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_edit(&self, message: EditMessage) -> SyncResult<EditReply> {
        let reply = self
            .request(|request_id| ClientMessage::SendEdit {
                request_id,
                message,
            })
            .await?;

        match reply {
            ServerMessage::Edits { message, .. } => Ok(EditReply::Accepted(message)),
            ServerMessage::Rejected { rejection, .. } => Ok(EditReply::Rejected(rejection)),
            ServerMessage::Error { message, .. } => Err(SyncError::Remote(message)),
            other => Err(unexpected(&other)),
        }
    }

    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<EditMessage>> {
        self.updates.lock().ok().and_then(|mut updates| updates.take())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn route_reply(pending: &Pending, reply: ServerMessage) {
    let Some(request_id) = reply.request_id() else {
        if let ServerMessage::Error { message, .. } = &reply {
            warn!("Server error: {}", message);
        }
        return;
    };

    let waiting = pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.as_mut().and_then(|routes| routes.remove(&request_id)));

    match waiting {
        Some(reply_tx) => {
            let _ = reply_tx.send(reply);
        }
        None => debug!(request_id, "Reply for unknown request"),
    }
}

fn unexpected(reply: &ServerMessage) -> SyncError {
    SyncError::Transport(format!("Unexpected reply: {:?}", reply))
}
