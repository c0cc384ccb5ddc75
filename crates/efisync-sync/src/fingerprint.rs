//! SHA-256 content fingerprints computed in fixed-size chunks

use std::path::Path;

use efisync_core::domain::Fingerprint;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Read size used when hashing files from disk
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Incremental fingerprint of a byte stream
#[derive(Clone, Default)]
pub struct StreamingFingerprint {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingFingerprint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes fed so far
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finish(self) -> (Fingerprint, u64) {
        (Fingerprint::from_digest(&self.hasher.finalize()), self.bytes)
    }
}

/// Fingerprint of an in-memory buffer
#[must_use]
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(&Sha256::digest(data))
}

/// Fingerprint a file on disk, returning the digest and the bytes read
pub async fn hash_file(path: &Path) -> std::io::Result<(Fingerprint, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut fp = StreamingFingerprint::new();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        fp.update(&buf[..n]);
    }
    Ok(fp.finish())
}
