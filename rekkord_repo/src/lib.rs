//! # Rekkord repository engine
//!
//! Content-addressed, deduplicating, encrypted backups on top of a plain
//! object store. Everything is an immutable *blob* named by a keyed hash of
//! its plaintext; snapshots are blobs referencing directory blobs referencing
//! file and chunk blobs, sealed per-blob to the repository public key.
//!
//! ## Layers
//! 1. `repository` – authentication, access modes, blob/tag I/O.
//! 2. `cache`      – local redb stat cache (known objects, file fingerprints).
//! 3. `put` / `get` – the ingest and restore pipelines.
//! 4. `list`       – snapshot enumeration and object listing.
//!
//! Holders of the write key can only ingest; reading anything back requires
//! the full key.

mod cache;
mod error;
mod get;
mod list;
mod put;
mod repository;

pub use cache::StatRow;
pub use error::{Error, Result};
pub use get::GetSettings;
pub use list::{ListSettings, ObjectInfo, ObjectKind, SnapshotInfo};
pub use put::{PutOutcome, PutSettings};
pub use repository::{DEFAULT_USER, Mode, Repository, RepositoryOptions, TagInfo, UserInfo};
