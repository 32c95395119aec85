//! The object-store contract consumed by the repository engine.
//!
//! A store maps short printable keys to opaque byte objects. Back-ends only
//! need this narrow surface; everything repository-shaped (encryption,
//! content addressing, caching) sits above it.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};

use crate::hash::Hash;

pub type StoreResult<T> = Result<T, StoreError>;

pub type KeyStream = Box<dyn Stream<Item = StoreResult<String>> + Send + Unpin + 'static>;
pub type ByteStream = Box<dyn Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("transient store failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            io::ErrorKind::PermissionDenied => StoreError::AccessDenied,
            io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted => {
                StoreError::Transient(err.into())
            }
            _ => StoreError::Other(err.into()),
        }
    }
}

pub struct StoreFeatures {
    /// Whether the store renames atomically. Stores without rename must make
    /// `write` itself atomic (single-shot upload).
    pub supports_rename: bool,
}

#[async_trait]
pub trait Store: std::fmt::Debug + Send + Sync + 'static {
    fn features(&self) -> StoreFeatures;

    /// Reads a whole object.
    async fn read(&self, path: &str) -> StoreResult<Bytes>;

    /// Writes an object from a stream of byte chunks, returning the number of
    /// bytes written. Overwrites silently.
    async fn write(&self, path: &str, data: ByteStream) -> StoreResult<u64>;

    /// Convenience wrapper around [`Store::write`] for in-memory payloads.
    async fn write_bytes(&self, path: &str, bytes: Bytes) -> StoreResult<u64> {
        let stream = stream::once(std::future::ready(Ok(bytes)));
        self.write(path, Box::new(stream)).await
    }

    /// Removes an object. Removing a missing object is not an error.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Atomically renames an object. Only called when
    /// [`StoreFeatures::supports_rename`] is set.
    async fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Streams the keys of every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<KeyStream>;

    /// Tests whether an object exists without fetching it.
    async fn stat(&self, path: &str) -> StoreResult<bool>;

    /// Creates a key namespace on stores that require one (directories on
    /// filesystem-like stores). A no-op on prefix-only stores.
    async fn create_namespace(&self, _path: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Removes an empty key namespace. A no-op on prefix-only stores.
    async fn delete_namespace(&self, _path: &str) -> StoreResult<()> {
        Ok(())
    }
}

/// Store key layout used by every repository.
pub mod layout {
    use super::Hash;

    /// Sealed repository id object.
    pub const REPO_SECRET: &str = "rekkord";

    pub const BLOB_PREFIX: &str = "blobs/";
    pub const KEY_PREFIX: &str = "keys/";
    pub const TAG_PREFIX: &str = "tags/";
    pub const TMP_PREFIX: &str = "tmp/";

    /// `blobs/<xxx>/<hash>`, bucketed by the 12-bit hex prefix.
    pub fn blob(hash: &Hash) -> String {
        format!("{}{}/{}", BLOB_PREFIX, hash.prefix3(), hash)
    }

    pub fn user_namespace(username: &str) -> String {
        format!("{KEY_PREFIX}{username}")
    }

    pub fn full_key(username: &str) -> String {
        format!("{KEY_PREFIX}{username}/full")
    }

    pub fn write_key(username: &str) -> String {
        format!("{KEY_PREFIX}{username}/write")
    }

    pub fn tag(name: &str) -> String {
        format!("{TAG_PREFIX}{name}")
    }

    pub fn tmp(name: &str) -> String {
        format!("{TMP_PREFIX}{name}.tmp")
    }
}
