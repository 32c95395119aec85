//! Core Rekkord types and algorithms.
//!
//! This crate defines everything wire-stable that the repository engine and
//! the store back-ends share:
//!
//! - Content hashes (`hash::Hash`) and their type-salted derivation
//! - Blob types and record layouts (`format`)
//! - The content-defined splitter (`splitter`)
//! - LZ4 frame compression around blob bodies (`compress`)
//! - The per-blob crypto envelope and sealed boxes (`envelope`, `sealed`)
//! - Password-wrapped key records and repository secrets (`keys`)
//! - The object-store contract and key layout (`store`)
//!
//! These formats are persisted in repositories; changes to them are format
//! changes. The engine crate (`rekkord_repo`) builds the pipelines on top.

pub mod compress;
pub mod envelope;
pub mod format;
pub mod hash;
pub mod keys;
pub mod sealed;
pub mod splitter;
pub mod store;

// --- Core public surface ---

pub use envelope::{BLOB_SPLIT, EnvelopeError, INTRO_SIZE, open_blob, seal_blob};
pub use format::{
    BLOB_VERSION, BlobType, ChunkRef, DirectoryHeader, ENTRY_READABLE, ENTRY_STATED, EntryKind,
    EntryRecord, FormatError, SNAPSHOT_NAME_SIZE, SnapshotHeader, hash_blob,
};
pub use hash::{HASH_SIZE, Hash};
pub use splitter::Splitter;
pub use store::{ByteStream, KeyStream, Store, StoreError, StoreFeatures, StoreResult, layout};
