//! Data adapters
//!
//! The server loads a room's canonical document through a `DataAdapter`
//! when the room is first referenced and stores it back when the room is
//! evicted or flushed.
//!
//! - `MemoryAdapter`: keeps documents in a map, nothing survives a restart
//! - `FileAdapter`: one JSON file per room, written atomically

pub mod error;
pub mod file;
pub mod memory;

pub use error::{AdapterError, AdapterResult};
pub use file::FileAdapter;
pub use memory::MemoryAdapter;

use crate::Document;

/// Loads and stores room documents
///
/// Calls block; the server runs them on the blocking thread pool.
pub trait DataAdapter: Send + Sync + 'static {
    /// Load the document for `room`, creating an empty object on first reference
    fn get_document(&self, room: &str) -> AdapterResult<Document>;

    /// Persist the document for `room`
    fn store_document(&self, room: &str, document: &Document) -> AdapterResult<()>;
}
