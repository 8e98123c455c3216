//! Content digests, computed the same way `sdfs-meta` computes them
//! (SHA-256, standard base64, `/` mapped to `_` so the encoding is safe
//! as a filename and a URL path segment). Duplicated here rather than
//! depending on `sdfs-meta` because a storage node is a standalone
//! process with no namespace or consensus state.

use std::fmt;

/// A content digest, stable across nodes and masters for the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of a complete byte slice.
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

    /// Wrap an already-encoded digest string (e.g. read back from a
    /// filename on disk, or from a request path segment).
    pub fn from_encoded(s: impl Into<String>) -> Self {
        Digest(s.into())
    }

    /// The encoded digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Streaming digest computation, used while tee-ing an upload to disk so
/// the digest is known without a second read pass.
pub struct DigestHasher(sha2::Sha256);

impl DigestHasher {
    /// Start a new streaming hash.
    pub fn new() -> Self {
        use sha2::Digest as _;
        Self(sha2::Sha256::new())
    }

    /// Feed the next chunk of bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        use sha2::Digest as _;
        self.0.update(chunk);
    }

    /// Finish and produce the digest.
    pub fn finish(self) -> Digest {
        use sha2::Digest as _;
        Digest::from_sha256(&self.0.finalize())
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}
