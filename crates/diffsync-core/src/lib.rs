//! diffsync Core Library
//!
//! This crate keeps a client's copy and a server's copy of a JSON document
//! eventually consistent using differential synchronization: each side keeps
//! a shadow of the last agreed state, diffs its working copy against the
//! shadow, and exchanges only the difference.
//!
//! # Architecture
//!
//! - **Shadow state**: per-peer versions, shadow, backup shadow and pending edits
//! - **Client**: runs the "propose local changes, apply remote changes" cycle
//! - **Server**: reconciles each client's edits against the canonical document
//!   of its room and notifies the other members
//!
//! # Quick Start
//!
//! ```text
//! let server = Arc::new(SyncServer::new(MemoryAdapter::new()));
//! let transport = LocalTransport::connect(server.clone()).await;
//! let client = Arc::new(SyncClient::new(transport, "room-1"));
//!
//! client.initialize().await?;
//! client.update(|doc| doc["title"] = json!("hello")).await?;
//! ```
//!
//! # Modules
//!
//! - `diff`: diff engine seam and the JSON Patch implementation
//! - `state`: shadow state and version reconciliation
//! - `message`: wire types exchanged between client and server
//! - `client`: client sync engine
//! - `server`: server sync engine
//! - `registry`: room registry on the server
//! - `transport`: client transport seam and the in-process transport
//! - `net`: WebSocket server and transport
//! - `storage`: data adapters for room documents
//! - `config`: application configuration

pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod message;
pub mod net;
pub mod registry;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;

pub use client::{SyncClient, SyncEvent, SyncStatus};
pub use config::Config;
pub use diff::{Diff, DiffEngine, JsonPatchEngine};
pub use error::{SyncError, SyncResult};
pub use message::{Edit, EditMessage, EditReply, Rejection};
pub use net::{serve, WsTransport};
pub use registry::{Room, SessionRegistry};
pub use server::{ConnectionId, ServerOptions, SyncServer};
pub use state::{ShadowState, SyncState};
pub use storage::{AdapterError, DataAdapter, FileAdapter, MemoryAdapter};
pub use transport::{LocalTransport, Transport};

/// A synchronized document: an arbitrary JSON tree
pub type Document = serde_json::Value;
