//! The hash type used by Rekkord (keyed blake3, 32 bytes).
//!
//! Every blob is named by a keyed BLAKE3 of its plaintext. The key is the
//! repository salt with the last byte XOR-ed with the blob type tag, which
//! binds names both to the repository and to the semantic type of the blob.

use std::{fmt, str::FromStr};

pub const HASH_SIZE: usize = 32;

/// Content hash naming a blob in the repository.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

#[derive(thiserror::Error, Debug)]
pub enum HashParseError {
    #[error("invalid hash length: expected 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Keyed hash of `plaintext` under the repository salt, perturbed by the
    /// blob type tag (`key[31] ^= tag`).
    pub fn keyed(salt: &[u8; 32], type_tag: u8, plaintext: &[u8]) -> Self {
        let mut key = *salt;
        key[31] ^= type_tag;

        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(plaintext);
        Hash(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 3 hex characters of the hash, the 12-bit bucket prefix used by
    /// the `blobs/<xxx>/<hash>` store layout (4096 buckets).
    pub fn prefix3(&self) -> String {
        let mut prefix = hex::encode(&self.0[..2]);
        prefix.truncate(3);
        prefix
    }

    /// Shortened hex form for log messages.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * HASH_SIZE {
            return Err(HashParseError::InvalidLength(s.len()));
        }
        let bytes = hex::decode(s)?;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(Hash(hash))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(value: [u8; HASH_SIZE]) -> Self {
        Hash(value)
    }
}

impl From<Hash> for [u8; HASH_SIZE] {
    fn from(value: Hash) -> Self {
        value.0
    }
}
