//! Digest-keyed object store with refcounts and open counts (C1).
//!
//! A `StoredObject` is born on first upload of its digest and destroyed
//! once both `replica_count` and `open_count` drop to zero. The map
//! itself is guarded by a single reader-writer lock; per-object counters
//! are atomics so `Get`/`Remove` don't need to upgrade to a write lock
//! on the common path.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::digest::{Digest, DigestHasher};
use crate::error::{StorageError, StorageResult};

/// A single digest-addressed object tracked by this node.
#[derive(Debug)]
pub struct StoredObject {
    size_bytes: u64,
    replica_count: AtomicU64,
    open_count: AtomicU64,
}

impl StoredObject {
    fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            replica_count: AtomicU64::new(1),
            open_count: AtomicU64::new(0),
        }
    }

    /// Size of the object's bytes on disk.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Current logical reference count (paths + replica obligations).
    pub fn replica_count(&self) -> u64 {
        self.replica_count.load(Ordering::SeqCst)
    }

    /// Current count of in-flight downloads.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }
}

/// A handle to an open object; dropping it releases the open count.
pub struct ObjectHandle {
    digest: Digest,
    path: PathBuf,
    store: Arc<ContentStoreInner>,
}

impl ObjectHandle {
    /// Path to the backing file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digest this handle was opened for.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if let Some(obj) = self.store.objects.read().get(&self.digest) {
            obj.open_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct ContentStoreInner {
    data_prefix: PathBuf,
    objects: RwLock<HashMap<Digest, StoredObject>>,
    total_bytes: AtomicU64,
}

/// The per-node content store. Cheaply cloneable; all clones share state.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<ContentStoreInner>,
}

impl ContentStore {
    /// Open a content store rooted at `data_prefix`, rescanning any
    /// objects already present on disk (boot recovery; there is no
    /// separate index file).
    pub fn open(data_prefix: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_prefix = data_prefix.into();
        std::fs::create_dir_all(&data_prefix)?;
        let store = Self {
            inner: Arc::new(ContentStoreInner {
                data_prefix,
                objects: RwLock::new(HashMap::new()),
                total_bytes: AtomicU64::new(0),
            }),
        };
        store.rescan()?;
        Ok(store)
    }

    fn rescan(&self) -> StorageResult<()> {
        let mut count = 0u64;
        for entry in std::fs::read_dir(&self.inner.data_prefix)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let digest = Digest::from_encoded(name.to_string_lossy().into_owned());
            let size = entry.metadata()?.len();
            self.add_local(digest, size);
            count += 1;
        }
        debug!(count, path = %self.inner.data_prefix.display(), "content store rescan complete");
        Ok(())
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        self.inner.data_prefix.join(digest.as_str())
    }

    /// Stream `bytes` to disk, computing its digest on the fly. If an
    /// object with the resulting digest already exists, the temporary
    /// file is discarded and the existing object's replica count is
    /// incremented instead.
    pub fn add(&self, bytes: &[u8]) -> StorageResult<Digest> {
        let mut hasher = DigestHasher::new();
        hasher.update(bytes);
        let digest = hasher.finish();

        {
            let objects = self.inner.objects.read();
            if let Some(obj) = objects.get(&digest) {
                obj.replica_count.fetch_add(1, Ordering::SeqCst);
                debug!(digest = %digest, "add: deduplicated against existing object");
                return Ok(digest);
            }
        }

        let tmp_path = self.inner.data_prefix.join(format!(".tmp-{}", uuid_like()));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(bytes)?;
            tmp.sync_all()?;
        }
        let final_path = self.object_path(&digest);
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StorageError::Corrupt {
                digest: digest.as_str().to_string(),
                reason: format!("rename into place failed: {e}"),
            });
        }

        // Re-check under the write lock: another `add()` for the same digest
        // may have raced us between the read-lock dedup check above and
        // here. Check-and-insert must happen atomically under one lock
        // acquisition, or the loser's bytes get double-counted while its
        // replica_count bump is silently dropped.
        let mut objects = self.inner.objects.write();
        if let Some(obj) = objects.get(&digest) {
            obj.replica_count.fetch_add(1, Ordering::SeqCst);
            debug!(digest = %digest, "add: deduplicated against object inserted by a concurrent writer");
        } else {
            objects.insert(digest.clone(), StoredObject::new(bytes.len() as u64));
            self.inner
                .total_bytes
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
            debug!(digest = %digest, bytes = bytes.len(), "add: stored new object");
        }
        Ok(digest)
    }

    /// Open a handle to `digest`, incrementing its open count. The
    /// handle's `Drop` decrements it again.
    pub fn get(&self, digest: &Digest) -> StorageResult<ObjectHandle> {
        let objects = self.inner.objects.read();
        let obj = objects.get(digest).ok_or_else(|| StorageError::NotFound {
            digest: digest.as_str().to_string(),
        })?;
        obj.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(ObjectHandle {
            digest: digest.clone(),
            path: self.object_path(digest),
            store: self.inner.clone(),
        })
    }

    /// Decrement the replica count for `digest`. When it reaches zero
    /// and nothing holds it open, the backing file and entry are
    /// removed. Fails with `Busy` if `open_count > 0` at the terminal
    /// step, `NotFound` if the digest is unknown.
    pub fn remove(&self, digest: &Digest) -> StorageResult<()> {
        let mut objects = self.inner.objects.write();
        let remaining = {
            let obj = objects.get(digest).ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })?;
            obj.replica_count.fetch_sub(1, Ordering::SeqCst) - 1
        };
        if remaining > 0 {
            return Ok(());
        }
        let open_count = objects.get(digest).map(|o| o.open_count()).unwrap_or(0);
        if open_count > 0 {
            objects.get(digest).unwrap().replica_count.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Busy {
                digest: digest.as_str().to_string(),
                open_count,
            });
        }
        let obj = objects.remove(digest).expect("checked present above");
        drop(objects);
        if let Err(e) = std::fs::remove_file(self.object_path(digest)) {
            warn!(digest = %digest, error = %e, "failed to unlink object during remove");
        }
        self.inner
            .total_bytes
            .fetch_sub(obj.size_bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Register a pre-existing object discovered at boot by scanning
    /// `data_prefix`. A no-op (beyond incrementing the byte total) if
    /// the digest is already known.
    pub fn add_local(&self, digest: Digest, size_bytes: u64) {
        let mut objects = self.inner.objects.write();
        if objects.contains_key(&digest) {
            return;
        }
        objects.insert(digest, StoredObject::new(size_bytes));
        self.inner.total_bytes.fetch_add(size_bytes, Ordering::SeqCst);
    }

    /// True if this node currently has an entry for `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.inner.objects.read().contains_key(digest)
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::SeqCst)
    }

    /// Number of distinct objects stored.
    pub fn object_count(&self) -> usize {
        self.inner.objects.read().len()
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let digest = store.add(b"payload").unwrap();
        let handle = store.get(&digest).unwrap();
        let bytes = std::fs::read(handle.path()).unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[test]
    fn duplicate_add_increments_replica_count_without_extra_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d1 = store.add(b"same bytes").unwrap();
        let d2 = store.add(b"same bytes").unwrap();
        assert_eq!(d1, d2);
        let objects = store.inner.objects.read();
        assert_eq!(objects.get(&d1).unwrap().replica_count(), 2);
    }

    #[test]
    fn remove_drops_to_zero_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let digest = store.add(b"bye").unwrap();
        store.remove(&digest).unwrap();
        assert!(!store.contains(&digest));
    }

    #[test]
    fn remove_busy_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let digest = store.add(b"held open").unwrap();
        let handle = store.get(&digest).unwrap();
        let err = store.remove(&digest).unwrap_err();
        assert!(matches!(err, StorageError::Busy { .. }));
        drop(handle);
        store.remove(&digest).unwrap();
    }

    #[test]
    fn remove_unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let err = store.remove(&Digest::from_encoded("nope")).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn reopen_rescans_existing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let digest = {
            let store = ContentStore::open(dir.path()).unwrap();
            store.add(b"persisted").unwrap()
        };
        let reopened = ContentStore::open(dir.path()).unwrap();
        assert!(reopened.contains(&digest));
    }
}
