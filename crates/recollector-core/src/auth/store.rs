//! Persistent key-value storage for the session.
//!
//! The session writes through to one of these on every transition so a
//! restarted client can hydrate from the same state. Writes are last-write-wins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Keychain service name used by [`KeyringStore`]
const SERVICE_NAME: &str = "recollector";

/// Session file name in the cache directory
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    AccessToken,
    RefreshToken,
    UserEmail,
}

impl StoreKey {
    pub const ALL: [StoreKey; 3] = [
        StoreKey::AccessToken,
        StoreKey::RefreshToken,
        StoreKey::UserEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::AccessToken => "JWT_USER_TOKEN",
            StoreKey::RefreshToken => "JWT_REFRESH_TOKEN",
            StoreKey::UserEmail => "USER_EMAIL",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: StoreKey) -> Result<Option<String>>;

    fn set(&self, key: StoreKey, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: StoreKey) -> Result<()>;

    /// Remove every key the session uses.
    fn clear(&self) -> Result<()> {
        for key in StoreKey::ALL {
            self.delete(key)?;
        }
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<StoreKey, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>> {
        Ok(self.entries()?.get(&key).cloned())
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<()> {
        self.entries()?.insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: StoreKey) -> Result<()> {
        self.entries()?.remove(&key);
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// JSON map on disk, rewritten whole on every change.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session file {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove session file")?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("File store lock poisoned"))?;
        let mut map = self.read_map()?;
        f(&mut map);
        self.write_map(&map)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>> {
        Ok(self.read_map()?.remove(key.as_str()))
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<()> {
        self.modify(|map| {
            map.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn delete(&self, key: StoreKey) -> Result<()> {
        self.modify(|map| {
            map.remove(key.as_str());
        })
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// OS keychain, one entry per key under the `recollector` service.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl KeyringStore {
    fn entry(key: StoreKey) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key.as_str()).context("Failed to create keyring entry")
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: StoreKey) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve value from keychain"),
        }
    }

    fn set(&self, key: StoreKey, value: &str) -> Result<()> {
        Self::entry(key)?
            .set_password(value)
            .context("Failed to store value in keychain")
    }

    fn delete(&self, key: StoreKey) -> Result<()> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete value from keychain"),
        }
    }
}

// ============================================================================
// Backend selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Keyring,
    #[default]
    File,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StoreBackend::Keyring),
            "file" => Ok(StoreBackend::File),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow!("Unknown store backend: {}", other)),
        }
    }
}

impl StoreBackend {
    pub fn open(self, cache_dir: &Path) -> Arc<dyn KeyValueStore> {
        debug!(backend = ?self, "Opening session store");
        match self {
            StoreBackend::Keyring => Arc::new(KeyringStore),
            StoreBackend::File => Arc::new(FileStore::new(cache_dir)),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
