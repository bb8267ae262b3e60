//! Sync protocol message types
//!
//! Version fields are named from the client's point of view in every
//! direction: `localVersion` is always the client's counter and
//! `serverVersion` always the server's.
//!
//! The WebSocket envelopes (`ClientMessage`, `ServerMessage`) are JSON
//! objects tagged by `type`, correlating requests and replies by
//! `requestId`.

use serde::{Deserialize, Serialize};

use crate::diff::Diff;
use crate::error::SyncResult;
use crate::Document;

/// A single versioned diff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    /// Sender's own version the diff was computed from
    pub base_version: u64,
    /// The structural difference
    pub diff: Diff,
}

/// A versioned batch of edits for one room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub room: String,
    /// Unacknowledged edits, oldest first
    pub edits: Vec<Edit>,
    /// The client's counter
    pub local_version: u64,
    /// The server's counter
    pub server_version: u64,
}

/// Direction-independent view of an inbound batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundVersions {
    /// Sender's record of the receiver's counter
    pub view_of_receiver: u64,
    /// Sender's own counter the batch was built from
    pub sender_base: u64,
}

/// Which end of the protocol a state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Read an inbound message's versions from this side's point of view
    pub fn inbound(self, message: &EditMessage) -> InboundVersions {
        match self {
            Side::Client => InboundVersions {
                view_of_receiver: message.local_version,
                sender_base: message.server_version,
            },
            Side::Server => InboundVersions {
                view_of_receiver: message.server_version,
                sender_base: message.local_version,
            },
        }
    }

    /// Build an outbound message from this side's own and peer counters
    pub fn outbound(
        self,
        room: &str,
        edits: Vec<Edit>,
        own_base: u64,
        peer_version: u64,
    ) -> EditMessage {
        let (local_version, server_version) = match self {
            Side::Client => (own_base, peer_version),
            Side::Server => (peer_version, own_base),
        };
        EditMessage {
            room: room.to_string(),
            edits,
            local_version,
            server_version,
        }
    }
}

impl EditMessage {
    /// Whether any edit in the batch carries a non-empty diff
    pub fn has_changes(&self) -> bool {
        self.edits.iter().any(|edit| !edit.diff.is_empty())
    }
}

/// The server's authoritative record, sent back when a batch is rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub room: String,
    /// Server's record of the client's counter
    pub local_version: u64,
    /// Server's own counter for this client
    pub server_version: u64,
    pub reason: String,
}

/// Reply to a `send-edit` request
#[derive(Debug, Clone)]
pub enum EditReply {
    /// The batch was applied; carries the server's outstanding edits
    Accepted(EditMessage),
    /// The batch was rejected; nothing was applied
    Rejected(Rejection),
}

/// Messages sent by a client over WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room and receive its document
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "requestId")]
        request_id: u64,
        room: String,
    },

    /// Send local edits and receive the server's edits
    #[serde(rename = "send-edit")]
    SendEdit {
        #[serde(rename = "requestId")]
        request_id: u64,
        message: EditMessage,
    },
}

/// Messages sent by the server over WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reply to `join` with the room's document
    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "requestId")]
        request_id: u64,
        document: Document,
    },

    /// Reply to `send-edit` after the batch was applied
    #[serde(rename = "edits")]
    Edits {
        #[serde(rename = "requestId")]
        request_id: u64,
        message: EditMessage,
    },

    /// Reply to `send-edit` when the batch was rejected
    #[serde(rename = "rejected")]
    Rejected {
        #[serde(rename = "requestId")]
        request_id: u64,
        rejection: Rejection,
    },

    /// Push: the room's document changed
    #[serde(rename = "updated-doc")]
    UpdatedDoc { message: EditMessage },

    /// Request failed
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
        message: String,
    },
}

impl ClientMessage {
    /// Encode message as a JSON string
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode message from JSON
    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    /// Encode message as a JSON string
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode message from JSON
    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Request this message answers, if any
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Joined { request_id, .. }
            | ServerMessage::Edits { request_id, .. }
            | ServerMessage::Rejected { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::UpdatedDoc { .. } => None,
        }
    }
}
