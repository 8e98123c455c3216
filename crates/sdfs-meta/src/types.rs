use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a storage node. Assigned randomly (32-bit) when an unknown
/// address first sends a heartbeat; uniqueness is checked against the
/// existing registry before the assignment is committed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        NodeId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a master in the consensus cluster. Chosen randomly by each
/// master at startup; duplicate registration is rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Raft term number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(t: u64) -> Self {
        Term(t)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Raft log index. The log is 1-indexed; index 0 is a sentinel with
/// term 0 that is never applied.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;
    fn add(self, rhs: u64) -> LogIndex {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;
    fn sub(self, rhs: u64) -> LogIndex {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// A content digest: SHA-256 of the object's bytes, base64-encoded with
/// `/` rewritten to `_` for URL safety. Used as the primary key of the
/// content store and as the identity of a namespace `File`'s content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Computes the digest of a complete byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        use sha2::Digest as _;
        let hash = sha2::Sha256::digest(bytes);
        Self::from_sha256(&hash)
    }

    fn from_sha256(hash: &[u8]) -> Self {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(hash);
        Digest(encoded.replace('/', "_"))
    }

    /// Wraps an already-encoded digest string (e.g. read back from a
    /// filename on disk).
    pub fn from_encoded(s: impl Into<String>) -> Self {
        Digest(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A streaming digest accumulator — fed chunks as they arrive so the
/// content store can compute a digest without buffering the whole upload.
#[derive(Default)]
pub struct DigestHasher(sha2::Sha256);

impl DigestHasher {
    pub fn new() -> Self {
        Self(<sha2::Sha256 as sha2::Digest>::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        use sha2::Digest as _;
        self.0.update(chunk);
    }

    pub fn finish(self) -> Digest {
        use sha2::Digest as _;
        Digest::from_sha256(&self.0.finalize())
    }
}

/// Errors surfaced by the metadata state machine (namespace, consensus,
/// node registry). Mirrors the abstract error kinds of the system: a
/// request handler maps these to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("path '{0}' not found")]
    NotFound(String),

    #[error("path '{path}' exists with a different digest")]
    Conflict { path: String },

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("directory '{0}' is not empty")]
    DirectoryNotEmpty(String),

    #[error("not the Raft leader")]
    NotLeader {
        leader_hint: Option<PeerId>,
        leader_address: Option<String>,
    },

    #[error("duplicate peer id {0}")]
    DuplicatePeer(PeerId),

    #[error("unknown command type tag {0}")]
    UnknownTypeTag(i32),

    #[error("corrupt log entry: {0}")]
    Corrupt(String),

    #[error("kv store error: {0}")]
    KvError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetaError>;
