//! Chunk addressing, checksums and acknowledgments.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::session::SessionId;

/// Zero-based position of a chunk within an upload.
pub type ChunkIndex = u32;

/// Length of a hex-encoded SHA-256 digest.
const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumError {
    #[error("checksum must be {SHA256_HEX_LEN} hex characters, got {0}")]
    BadLength(usize),

    #[error("checksum contains non-hex characters")]
    NotHex,
}

/// Lowercase hex SHA-256 digest of some bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Hash a payload.
    pub fn compute(data: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(data)))
    }

    /// Parse a client-supplied digest. Uppercase hex is accepted and normalized.
    pub fn parse(s: &str) -> Result<Self, ChecksumError> {
        let s = s.trim();
        if s.len() != SHA256_HEX_LEN {
            return Err(ChecksumError::BadLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::NotHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Check a payload against this digest.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental hasher used while streaming an assembled artifact.
#[derive(Default)]
pub struct ChecksumHasher {
    inner: Sha256,
    bytes: u64,
}

impl ChecksumHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize(self) -> Checksum {
        Checksum(format!("{:x}", self.inner.finalize()))
    }
}

/// Acknowledgment returned for every accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkAck {
    pub session_id: SessionId,
    pub index: ChunkIndex,
    /// Number of distinct chunks received so far
    pub received: u32,
    /// Number of chunks the session expects
    pub expected: u32,
    /// True when the index had already been received and nothing changed
    pub duplicate: bool,
    /// Indices still missing, ascending
    pub missing_indices: Vec<ChunkIndex>,
}

impl ChunkAck {
    pub fn is_last(&self) -> bool {
        self.received == self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_compute_known_vector() {
        let sum = Checksum::compute(b"abc");
        assert_eq!(
            sum.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(sum.verify(b"abc"));
        assert!(!sum.verify(b"abd"));
    }

    #[test]
    fn test_checksum_parse_normalizes_case() {
        let upper = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        let parsed = Checksum::parse(upper).unwrap();
        assert_eq!(parsed, Checksum::compute(b"abc"));
    }

    #[test]
    fn test_checksum_parse_rejects_garbage() {
        assert_eq!(Checksum::parse("abc"), Err(ChecksumError::BadLength(3)));
        let not_hex = "z".repeat(64);
        assert_eq!(Checksum::parse(&not_hex), Err(ChecksumError::NotHex));
    }

    #[test]
    fn test_hasher_matches_one_shot() {
        let mut hasher = ChecksumHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.len(), 11);
        assert_eq!(hasher.finalize(), Checksum::compute(b"hello world"));
    }
}
