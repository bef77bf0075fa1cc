//! Key/value persistence for channel data.
//!
//! Each channel owns exactly one key (`type/channel_id`), so implementations need no
//! cross-key coordination. Writes are synchronous: a successful `set` means the record
//! is durable for that backend.

use crate::error::FabricError;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub trait DataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, FabricError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), FabricError>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, FabricError> {
        let records = self
            .records
            .lock()
            .map_err(|e| FabricError::Store(e.to_string()))?;
        Ok(records.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), FabricError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| FabricError::Store(e.to_string()))?;
        records.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per key: `<root>/<key>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, FabricError> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(FabricError::Store(format!("invalid store key {key:?}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl DataStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, FabricError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| FabricError::Store(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FabricError::Io(e)),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), FabricError> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| FabricError::Store(e.to_string()))?;
        fs::write(&path, text)?;
        debug!(%key, path = %path.display(), "Stored");
        Ok(())
    }
}
