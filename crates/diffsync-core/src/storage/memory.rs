//! In-memory data adapter

use std::collections::HashMap;
use std::sync::Mutex;

use super::{AdapterError, AdapterResult, DataAdapter};
use crate::Document;

/// Keeps room documents in a map
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    documents: Mutex<HashMap<String, Document>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with some rooms already populated
    pub fn with_documents<I>(documents: I) -> Self
    where
        I: IntoIterator<Item = (String, Document)>,
    {
        Self {
            documents: Mutex::new(documents.into_iter().collect()),
        }
    }

    /// The last stored document for `room`, without creating it
    pub fn stored(&self, room: &str) -> Option<Document> {
        self.documents
            .lock()
            .ok()
            .and_then(|documents| documents.get(room).cloned())
    }

    fn lock(&self) -> AdapterResult<std::sync::MutexGuard<'_, HashMap<String, Document>>> {
        self.documents
            .lock()
            .map_err(|_| AdapterError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl DataAdapter for MemoryAdapter {
    fn get_document(&self, room: &str) -> AdapterResult<Document> {
        let mut documents = self.lock()?;
        let document = documents
            .entry(room.to_string())
            .or_insert_with(|| Document::Object(Default::default()))
            .clone();
        Ok(document)
    }

    fn store_document(&self, room: &str, document: &Document) -> AdapterResult<()> {
        self.lock()?.insert(room.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_reference_creates_empty_object() {
        let adapter = MemoryAdapter::new();
        assert!(adapter.stored("notes").is_none());

        assert_eq!(adapter.get_document("notes").unwrap(), json!({}));
        assert_eq!(adapter.stored("notes"), Some(json!({})));
    }

    #[test]
    fn test_store_then_get() {
        let adapter = MemoryAdapter::new();
        adapter
            .store_document("notes", &json!({"title": "hello"}))
            .unwrap();

        assert_eq!(
            adapter.get_document("notes").unwrap(),
            json!({"title": "hello"})
        );
        // Other rooms are independent
        assert_eq!(adapter.get_document("other").unwrap(), json!({}));
    }

    #[test]
    fn test_with_documents() {
        let adapter = MemoryAdapter::with_documents([("seeded".to_string(), json!({"a": 1}))]);
        assert_eq!(adapter.get_document("seeded").unwrap(), json!({"a": 1}));
    }
}
