//! Key-value store abstraction used to persist Raft hard state
//! (`raft_log`). `MemoryKvStore` backs tests; `FileKvStore` backs real
//! deployments by replaying a write-ahead log of the same `BatchOp`s into
//! an in-memory map on open.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for metadata persistence.
///
/// This trait abstracts over the storage backend, allowing the metadata
/// service to use an in-memory store for testing and a NVMe-backed store
/// for production.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Scan a range of keys [start, end), returning (key, value) pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// This is the Phase 1 implementation. It does not persist data across restarts.
/// Production will use A1's NVMe block store with atomic writes (D10).
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let result: Vec<_> = data
            .range::<Vec<u8>, _>((
                Bound::Included(start.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// A `KvStore` that survives a restart: every `put`/`delete`/`write_batch`
/// is appended to a log file as a length-prefixed `bincode`-encoded
/// `BatchOp`, then applied to an in-memory map mirroring `MemoryKvStore`.
/// `open` replays the log file from the start to rebuild the map.
pub struct FileKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<std::fs::File>,
}

#[derive(serde::Serialize, serde::Deserialize)]
enum WalOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl FileKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut data = BTreeMap::new();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let mut cursor = &bytes[..];
            while !cursor.is_empty() {
                if cursor.len() < 4 {
                    break;
                }
                let len = u32::from_le_bytes(cursor[..4].try_into().unwrap()) as usize;
                cursor = &cursor[4..];
                if cursor.len() < len {
                    break;
                }
                let op: WalOp = bincode::deserialize(&cursor[..len])
                    .map_err(|e| MetaError::Corrupt(e.to_string()))?;
                match op {
                    WalOp::Put(k, v) => {
                        data.insert(k, v);
                    }
                    WalOp::Delete(k) => {
                        data.remove(&k);
                    }
                }
                cursor = &cursor[len..];
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            data: RwLock::new(data),
            log: Mutex::new(file),
        })
    }

    fn append(&self, ops: &[WalOp]) -> Result<(), MetaError> {
        let mut log = self.log.lock().map_err(|e| MetaError::KvError(e.to_string()))?;
        for op in ops {
            let encoded = bincode::serialize(op).map_err(|e| MetaError::Corrupt(e.to_string()))?;
            log.write_all(&(encoded.len() as u32).to_le_bytes())?;
            log.write_all(&encoded)?;
        }
        log.flush()?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.append(&[WalOp::Put(key.clone(), value.clone())])?;
        let mut data = self.data.write().map_err(|e| MetaError::KvError(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.append(&[WalOp::Delete(key.to_vec())])?;
        let mut data = self.data.write().map_err(|e| MetaError::KvError(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::KvError(e.to_string()))?;
        let result = data
            .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let wal_ops: Vec<WalOp> = ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => WalOp::Put(key.clone(), value.clone()),
                BatchOp::Delete { key } => WalOp::Delete(key.clone()),
            })
            .collect();
        self.append(&wal_ops)?;
        let mut data = self.data.write().map_err(|e| MetaError::KvError(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
