//! Hashing primitives: SHA3-256 for lookup/reference hashes and Merkle nodes,
//! SHA-1 for content hashes.

use crate::error::Result;
use sha1::Sha1;
use sha3::{Digest, Sha3_256};
use std::io::Read;

/// Lowercase hex SHA3-256 of a string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Lowercase hex SHA3-256 of raw bytes.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha3_256::digest(data))
}

/// Lookup hash of a reference: `sha3(allocation_id + ":" + path)`.
pub fn reference_lookup(allocation_id: &str, path: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(allocation_id.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Streaming SHA-1 hasher producing the hex content hash of a file.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha1,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the hasher and return the hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }

    /// Hash everything a reader yields.
    pub fn hash_reader<R: Read>(mut reader: R) -> Result<String> {
        let mut hasher = Self::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize_hex())
    }
}
