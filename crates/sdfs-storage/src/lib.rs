#![warn(missing_docs)]

//! SDFS per-node storage subsystem: the content store (C1) and the node's
//! HTTP data-plane server.

/// Digest-keyed object store with refcounts and open counts (C1).
pub mod content_store;
/// Content digests shared between streaming uploads and boot rescans.
pub mod digest;
/// Storage error type.
pub mod error;
/// Node-side HTTP endpoints and the heartbeat emitter.
pub mod server;

pub use content_store::{ContentStore, ObjectHandle, StoredObject};
pub use digest::{Digest, DigestHasher};
pub use error::{StorageError, StorageResult};
