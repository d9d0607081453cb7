// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cursor persistence.
//!
//! Cursors live in a flat namespace keyed by [`StreamKey::state_key`], values
//! are the raw forward tokens. Three backends are available: in-memory, one
//! file per key, and an embedded sled database.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::errors::StoreError;
use crate::model::StreamKey;

/// Key/value storage for opaque string values.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a consistent map of strings.
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content.trim_end_matches(['\n', '\r']).to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Cursor tree inside an embedded sled database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
}

const CURSOR_TREE: &str = "cursors";

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let db = sled::Config::new().path(path).open()?;
        Self::from_db(db)
    }

    /// In-memory database, discarded on drop.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(CURSOR_TREE)?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl StateStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(String::from_utf8(value.to_vec())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }
}

/// Per-stream forward tokens on top of a [`StateStore`].
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn StateStore>,
    legacy_base: Option<PathBuf>,
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore")
            .field("legacy_base", &self.legacy_base)
            .finish_non_exhaustive()
    }
}

impl CursorStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            legacy_base: None,
        }
    }

    /// Enables migration from the legacy layout, where each cursor lived in
    /// its own file named `<legacy_base>_<group>_<stream>`.
    #[must_use]
    pub fn with_legacy_migration(mut self, legacy_base: impl Into<PathBuf>) -> Self {
        self.legacy_base = Some(legacy_base.into());
        self
    }

    pub fn get(&self, key: &StreamKey) -> Result<Option<String>, StoreError> {
        let state_key = key.state_key();
        if let Some(base) = &self.legacy_base {
            self.migrate_legacy(base, &state_key)?;
        }
        self.store.get(&state_key)
    }

    pub fn put(&self, key: &StreamKey, token: &str) -> Result<(), StoreError> {
        debug!(group = %key.group, stream = %key.stream, "storing cursor");
        self.store.put(&key.state_key(), token)
    }

    fn migrate_legacy(&self, base: &Path, state_key: &str) -> Result<(), StoreError> {
        let mut file_name = base.as_os_str().to_os_string();
        file_name.push("_");
        file_name.push(state_key);
        let legacy_path = PathBuf::from(file_name);

        let content = match fs::read_to_string(&legacy_path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let token = content.trim_end_matches(['\n', '\r']);
        if !token.is_empty() {
            self.store.put(state_key, token)?;
        }
        fs::remove_file(&legacy_path)?;
        info!(path = %legacy_path.display(), key = state_key, "migrated legacy cursor file");
        Ok(())
    }
}
