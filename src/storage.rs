//! Pluggable persistence for the remembered device id.
//!
//! Storage is a best-effort cache, never load-bearing: every provider
//! swallows its own failures with a warning so a broken disk can never break
//! a connect.

use std::path::PathBuf;
use std::sync::{Mutex as StdMutex, PoisonError};

use tracing::warn;

/// A single optional string slot holding the remembered device id
pub trait DeviceIdStore: Send + Sync {
    /// Read the remembered id, if any.
    fn get(&self) -> Option<String>;

    /// Remember an id.
    fn set(&self, id: &str);

    /// Forget the remembered id.
    fn remove(&self);
}

/// In-memory slot; forgets everything when dropped
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: StdMutex<Option<String>>,
}

impl MemoryStore {
    /// Create an empty in-memory slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceIdStore for MemoryStore {
    fn get(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, id: &str) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
    }

    fn remove(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// File-backed slot surviving process restarts
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a slot backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceIdStore for FileStore {
    fn get(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                if id.is_empty() {
                    None
                } else {
                    Some(id.to_string())
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("failed to read device id from {:?}: {e}", self.path);
                None
            }
        }
    }

    fn set(&self, id: &str) {
        if let Err(e) = std::fs::write(&self.path, id) {
            warn!("failed to persist device id to {:?}: {e}", self.path);
        }
    }

    fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to clear device id at {:?}: {e}", self.path),
        }
    }
}

/// Slot that remembers nothing; disables persistence entirely
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl DeviceIdStore for NoopStore {
    fn get(&self) -> Option<String> {
        None
    }

    fn set(&self, _id: &str) {}

    fn remove(&self) {}
}
