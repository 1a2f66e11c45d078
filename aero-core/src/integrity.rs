//! Integrity: whole-file SHA-256, computed incrementally on both ends of a transfer.

use sha2::{Digest, Sha256};

/// Hash a single buffer. Returns the 32-byte digest.
pub fn hash_chunk(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Incremental SHA-256 over a byte stream, fed chunk by chunk.
#[derive(Clone, Default)]
pub struct StreamChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl StreamChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Lowercase hex digest, the form carried in `FileMeta::sha256`.
    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Case-insensitive comparison of hex digests.
pub fn checksum_matches(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}
