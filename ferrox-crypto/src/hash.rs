//! Consensus hashing helpers. All consensus hashes are blake3 over the
//! concatenation of their parts; `HashWriter` gives the `H(label | a | b)`
//! computations one shape. The HTLC hash lock is SHA-256 by contract.

use blake3::Hasher;
use ferrox_shared_types::Hash;
use sha2::{Digest, Sha256};

/// Incremental writer for tagged consensus hashes.
pub struct HashWriter {
    hasher: Hasher,
}

impl HashWriter {
    pub fn new() -> Self {
        HashWriter { hasher: Hasher::new() }
    }

    /// Start a writer with a domain label.
    pub fn tagged(label: &str) -> Self {
        let mut writer = HashWriter::new();
        writer.write(label.as_bytes());
        writer
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.write(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn finalize(&self) -> Hash {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// blake3 over raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    *blake3::hash(bytes).as_bytes()
}

/// SHA-256 over raw bytes.
pub fn sha256(bytes: &[u8]) -> Hash {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// 20-byte identifier hash: truncated blake3.
pub fn hash160(bytes: &[u8]) -> [u8; 20] {
    let digest = blake3::hash(bytes);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    out
}
