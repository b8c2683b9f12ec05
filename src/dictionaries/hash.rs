//! SHA-256 dictionary hashes, as sent in `Available-Dictionary`.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// The length of a dictionary hash in bytes.
pub const HASH_LEN: usize = 32;

/// The SHA-256 hash of a dictionary's raw bytes.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct DictionaryHash([u8; HASH_LEN]);

impl DictionaryHash {
    /// Hash some dictionary bytes.
    pub fn digest(data: &[u8]) -> DictionaryHash {
        DictionaryHash(Sha256::digest(data).into())
    }

    /// Parse a structured-field byte sequence of the form `:<base64>:`.
    ///
    /// Returns `None` for anything which isn't exactly a 32-byte hash.
    pub fn from_header_value(value: &str) -> Option<DictionaryHash> {
        let encoded = value.trim().strip_prefix(':')?.strip_suffix(':')?;
        let decoded = STANDARD.decode(encoded).ok()?;
        let bytes: [u8; HASH_LEN] = decoded.try_into().ok()?;
        Some(DictionaryHash(bytes))
    }

    /// Format as a structured-field byte sequence.
    pub fn to_header_value(&self) -> String {
        format!(":{}:", STANDARD.encode(self.0))
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for DictionaryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
