//! Durable blob storage for cache and outbox snapshots.
//!
//! The storage collaborator is deliberately small: it saves and loads one opaque JSON document.
//! A save either lands or it doesn't; partial writes are not modeled, matching file-replace
//! semantics. Storage failures are never fatal to the components using it — in-memory state stays
//! authoritative and the next successful persist catches up.
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::Result;

/// Durable storage for a single JSON document.
pub trait Storage: Send + Sync {
    /// Persist `document`, replacing any previous one.
    fn save(&self, document: &Value) -> Result<()>;

    /// Load the previously persisted document, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Value>>;

    /// Remove the persisted document.
    fn clear(&self) -> Result<()>;
}

/// File-backed [`Storage`]. Writes go to a sibling temp file first and are moved into place with a
/// rename, so a crash mid-write leaves the previous document intact.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Create storage backed by the file at `path`. Parent directories must exist.
    pub fn new(path: impl Into<PathBuf>) -> FileStorage {
        FileStorage { path: path.into() }
    }
}

impl Storage for FileStorage {
    fn save(&self, document: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, &bytes)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory [`Storage`], for tests and clients that opt out of persistence.
#[derive(Default)]
pub struct InMemoryStorage {
    document: Mutex<Option<Value>>,
}

impl InMemoryStorage {
    /// Create empty in-memory storage.
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

impl Storage for InMemoryStorage {
    fn save(&self, document: &Value) -> Result<()> {
        *self
            .document
            .lock()
            .expect("thread holding storage lock should not panic") = Some(document.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>> {
        Ok(self
            .document
            .lock()
            .expect("thread holding storage lock should not panic")
            .clone())
    }

    fn clear(&self) -> Result<()> {
        *self
            .document
            .lock()
            .expect("thread holding storage lock should not panic") = None;
        Ok(())
    }
}
