//! Error types for the per-node content store (C1).

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for content store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// No object exists for the given digest.
    #[error("object not found: {digest}")]
    NotFound {
        /// The digest that was not found.
        digest: String,
    },

    /// `Remove` was called while `open_count > 0`.
    #[error("object busy: {digest} has {open_count} open reader(s)")]
    Busy {
        /// The digest that is still in use.
        digest: String,
        /// Number of open handles preventing removal.
        open_count: u64,
    },

    /// The temporary file could not be renamed into place, or the bytes
    /// on disk don't match the digest computed while streaming them.
    #[error("corrupt object {digest}: {reason}")]
    Corrupt {
        /// Digest of the object found corrupt.
        digest: String,
        /// Description of the corruption.
        reason: String,
    },
}
