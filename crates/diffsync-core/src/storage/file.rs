//! File-backed data adapter
//!
//! Each room is stored as a JSON file in a single directory. Room ids are
//! arbitrary strings, so file names use their URL-safe base64 encoding.
//! Writes go to a temporary file first and are renamed into place, so a
//! room file is never left partially written.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::debug;

use super::{AdapterError, AdapterResult, DataAdapter};
use crate::Document;

/// Stores one JSON file per room under a directory
#[derive(Debug, Clone)]
pub struct FileAdapter {
    dir: PathBuf,
}

impl FileAdapter {
    /// Create an adapter rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> AdapterResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| AdapterError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the room files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds `room`'s document
    pub fn room_path(&self, room: &str) -> PathBuf {
        self.dir
            .join(format!("room-{}.json", URL_SAFE_NO_PAD.encode(room)))
    }
}

impl DataAdapter for FileAdapter {
    fn get_document(&self, room: &str) -> AdapterResult<Document> {
        let path = self.room_path(room);

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(room, path = %path.display(), "Creating room file");
                let document = Document::Object(Default::default());
                self.store_document(room, &document)?;
                return Ok(document);
            }
            Err(e) => return Err(AdapterError::from_read(e, path)),
        };

        serde_json::from_str(&text).map_err(|e| AdapterError::InvalidFormat {
            path,
            details: e.to_string(),
        })
    }

    fn store_document(&self, room: &str, document: &Document) -> AdapterResult<()> {
        let path = self.room_path(room);
        let bytes = serde_json::to_vec_pretty(document).map_err(|e| AdapterError::InvalidFormat {
            path: path.clone(),
            details: e.to_string(),
        })?;
        atomic_write(&path, &bytes)
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
fn atomic_write(path: &Path, data: &[u8]) -> AdapterResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AdapterError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // Same directory, so the rename stays on one filesystem
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| AdapterError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| AdapterError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| AdapterError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| AdapterError::AtomicWriteFailed {
        from: temp_path,
        to: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_first_reference_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(temp_dir.path().join("rooms")).unwrap();

        let path = adapter.room_path("notes");
        assert!(!path.exists());

        assert_eq!(adapter.get_document("notes").unwrap(), json!({}));
        assert!(path.exists());
    }

    #[test]
    fn test_store_survives_new_adapter() {
        let temp_dir = TempDir::new().unwrap();
        let document = json!({"title": "hello", "items": [1, 2, 3]});

        {
            let adapter = FileAdapter::new(temp_dir.path()).unwrap();
            adapter.store_document("notes", &document).unwrap();
        }

        let adapter = FileAdapter::new(temp_dir.path()).unwrap();
        assert_eq!(adapter.get_document("notes").unwrap(), document);
    }

    #[test]
    fn test_room_ids_map_to_safe_file_names() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(temp_dir.path()).unwrap();

        for room in ["", "a/b", "../escape", "spaces and ünïcode"] {
            let path = adapter.room_path(room);
            assert_eq!(path.parent(), Some(temp_dir.path()));

            adapter.store_document(room, &json!({"room": room})).unwrap();
            assert_eq!(adapter.get_document(room).unwrap(), json!({"room": room}));
        }
    }

    #[test]
    fn test_corrupt_file_is_invalid_format() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(temp_dir.path()).unwrap();
        fs::write(adapter.room_path("broken"), "{not json").unwrap();

        let err = adapter.get_document("broken").unwrap_err();
        assert!(matches!(err, AdapterError::InvalidFormat { .. }));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("file.json");

        atomic_write(&nested_path, b"{}").unwrap();

        assert!(nested_path.exists());
        assert!(!nested_path.with_extension("tmp").exists());
    }
}
