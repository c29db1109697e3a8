//! # Key-Value Storage
//!
//! The match history only needs `write`, `read` with a default and
//! `remove`. A full store must say so explicitly rather than silently
//! dropping the write.

use std::collections::BTreeMap;

use crate::error::{StorageError, StorageResult};

/// Persistent key-value store.
pub trait Storage {
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Full`] if a new key does not fit.
    fn write(&mut self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Returns the value under `key`.
    fn read(&self, key: &str) -> Option<Vec<u8>>;

    /// Removes `key`. Returns true if it existed.
    fn remove(&mut self, key: &str) -> bool;

    /// Returns the value under `key`, or `default` if absent.
    fn read_or(&self, key: &str, default: &[u8]) -> Vec<u8> {
        self.read(key).unwrap_or_else(|| default.to_vec())
    }

    /// Reads a single byte value.
    fn read_u8(&self, key: &str, default: u8) -> u8 {
        self.read(key)
            .and_then(|bytes| bytes.first().copied())
            .unwrap_or(default)
    }
}

/// Bounded in-memory store.
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
    capacity: usize,
}

impl MemoryStorage {
    /// Creates a store holding at most `capacity` keys.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Number of keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::with_capacity(512)
    }
}

impl Storage for MemoryStorage {
    fn write(&mut self, key: &str, value: &[u8]) -> StorageResult<()> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            return Err(StorageError::Full { capacity: self.capacity });
        }
        self.entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}
