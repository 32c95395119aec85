//! Local stat cache backed by redb.
//!
//! Two tables: `objects` remembers store keys known to exist, `stats` maps
//! absolute source paths to their last ingested fingerprint and hash. The
//! database file name is derived from `blake3(repo_id ‖ url)` so caches for
//! different repositories coexist in one directory.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::Result;

const OBJECTS: TableDefinition<&str, ()> = TableDefinition::new("objects");
const STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");

/// Fingerprint of one ingested file. When all four metadata fields match the
/// filesystem, the cached hash is reused without reading the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatRow {
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub size: i64,
    pub hash: [u8; 32],
}

pub(crate) struct StatCache {
    db: Arc<Database>,
    misses: AtomicU32,
}

impl StatCache {
    pub fn open(dir: &Path, id: &[u8; 32], url: &str) -> anyhow::Result<StatCache> {
        std::fs::create_dir_all(dir)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(id);
        hasher.update(url.as_bytes());
        let cache_id = hasher.finalize();

        let filename = dir.join(format!("{}.redb", cache_id.to_hex()));
        tracing::debug!("cache file: {}", filename.display());

        let db = Database::create(&filename)?;

        // Make sure both tables exist before the first read transaction.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(OBJECTS)?;
            let _ = txn.open_table(STATS)?;
        }
        txn.commit()?;

        Ok(StatCache {
            db: Arc::new(db),
            misses: AtomicU32::new(0),
        })
    }

    pub async fn contains_object(&self, key: &str) -> Result<bool> {
        let db = self.db.clone();
        let key = key.to_owned();

        let found = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let txn = db.begin_read()?;
            let table = txn.open_table(OBJECTS)?;
            Ok(table.get(key.as_str())?.is_some())
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(found)
    }

    pub async fn insert_object(&self, key: String) -> Result<()> {
        self.insert_objects(vec![key]).await
    }

    pub async fn insert_objects(&self, keys: Vec<String>) -> Result<()> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(OBJECTS)?;
                for key in &keys {
                    table.insert(key.as_str(), ())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(())
    }

    /// Replaces the whole `objects` table, dropping stale stats too.
    pub async fn rebuild_objects(&self, keys: Vec<String>) -> Result<()> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            txn.delete_table(OBJECTS)?;
            txn.delete_table(STATS)?;
            {
                let mut table = txn.open_table(OBJECTS)?;
                for key in &keys {
                    table.insert(key.as_str(), ())?;
                }
                let _ = txn.open_table(STATS)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.rebuild_objects(Vec::new()).await
    }

    pub async fn get_stat(&self, path: String) -> Result<Option<StatRow>> {
        let db = self.db.clone();

        let row = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<StatRow>> {
            let txn = db.begin_read()?;
            let table = txn.open_table(STATS)?;

            let row = table
                .get(path.as_str())?
                .map(|guard| postcard::from_bytes::<StatRow>(guard.value()))
                .transpose()?;
            Ok(row)
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(row)
    }

    /// Upserts a batch of fingerprints in one transaction, typically one
    /// batch per ingested directory.
    pub async fn put_stats(&self, rows: Vec<(String, StatRow)>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(STATS)?;
                for (path, row) in &rows {
                    let bytes = postcard::to_allocvec(row)?;
                    table.insert(path.as_str(), bytes.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(())
    }

    /// Records one "cache said missing, store said present" event and returns
    /// the consecutive count.
    pub fn record_miss(&self) -> u32 {
        self.misses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_misses(&self) {
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for StatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCache").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn objects_round_trip() {
        let dir = tempdir().unwrap();
        let cache = StatCache::open(dir.path(), &[1u8; 32], "mem://a").unwrap();

        assert!(!cache.contains_object("blobs/aaa/x").await.unwrap());
        cache.insert_object("blobs/aaa/x".to_owned()).await.unwrap();
        assert!(cache.contains_object("blobs/aaa/x").await.unwrap());

        cache.clear().await.unwrap();
        assert!(!cache.contains_object("blobs/aaa/x").await.unwrap());
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let dir = tempdir().unwrap();
        let cache = StatCache::open(dir.path(), &[2u8; 32], "mem://b").unwrap();

        let row = StatRow {
            mtime: 1_700_000_000_000,
            btime: 0,
            mode: 0o644,
            size: 42,
            hash: [7u8; 32],
        };
        cache
            .put_stats(vec![("/src/file".to_owned(), row)])
            .await
            .unwrap();

        assert_eq!(cache.get_stat("/src/file".to_owned()).await.unwrap(), Some(row));
        assert_eq!(cache.get_stat("/src/other".to_owned()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rebuild_replaces_objects_and_drops_stats() {
        let dir = tempdir().unwrap();
        let cache = StatCache::open(dir.path(), &[3u8; 32], "mem://c").unwrap();

        cache.insert_object("stale".to_owned()).await.unwrap();
        cache
            .put_stats(vec![(
                "/src/file".to_owned(),
                StatRow {
                    mtime: 0,
                    btime: 0,
                    mode: 0,
                    size: 0,
                    hash: [0u8; 32],
                },
            )])
            .await
            .unwrap();

        cache
            .rebuild_objects(vec!["fresh".to_owned()])
            .await
            .unwrap();

        assert!(!cache.contains_object("stale").await.unwrap());
        assert!(cache.contains_object("fresh").await.unwrap());
        assert_eq!(cache.get_stat("/src/file".to_owned()).await.unwrap(), None);
    }

    #[test]
    fn caches_for_different_repositories_use_different_files() {
        let dir = tempdir().unwrap();

        let _a = StatCache::open(dir.path(), &[1u8; 32], "mem://same").unwrap();
        let _b = StatCache::open(dir.path(), &[2u8; 32], "mem://same").unwrap();

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }
}
