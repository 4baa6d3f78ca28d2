//! Key/value persistence capability.
//!
//! The core only needs "get and put a value by key" from its host. sled
//! trees provide it on disk, [`MemoryStore`] in tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from a key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value has the wrong shape for the key.
    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Byte-level store with `u64` helpers.
///
/// JSON values go through [`get_json`] and [`put_json`], which also work
/// on a [`SharedStore`].
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Reads a big-endian `u64`.
    fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.get_raw(key)? {
            Some(bytes) => {
                let arr: [u8; 8] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StoreError::Corrupt {
                            key: key.to_string(),
                            reason: format!("expected 8 bytes, found {}", bytes.len()),
                        })?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.put_raw(key, &value.to_be_bytes())
    }
}

/// Reads a JSON value stored under `key`.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get_raw(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Stores `value` as JSON under `key`.
pub fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put_raw(key, &bytes)
}

/// Shared store handle.
pub type SharedStore = Arc<dyn KeyValueStore>;

impl KeyValueStore for sled::Tree {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.insert(key.as_bytes(), value)?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
