#![allow(dead_code)]

use std::sync::Arc;

use rekkord_repo::{Repository, RepositoryOptions};
use rekkord_store_memory::MemoryStore;
use tempfile::TempDir;

pub const FULL_PWD: &str = "full horse battery";
pub const WRITE_PWD: &str = "write horse battery";

pub struct TestRepo {
    pub repo: Repository,
    pub store: Arc<MemoryStore>,
    /// Keeps the cache directory alive for the duration of the test.
    pub cache_dir: TempDir,
}

/// Opens a repository over a fresh memory store.
///
/// `cache_check_percent` is 0 for deterministic tests and 100 for the cache
/// consistency tests that want every exists-check verified.
pub fn open_repo(cache_check_percent: u8) -> TestRepo {
    let store = Arc::new(MemoryStore::new());
    let cache_dir = TempDir::new().unwrap();

    let options = RepositoryOptions {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        cache_check_percent,
        ..RepositoryOptions::default()
    };
    let repo = Repository::open(store.clone(), "mem://test", options);

    TestRepo {
        repo,
        store,
        cache_dir,
    }
}

pub async fn init_repo(cache_check_percent: u8) -> TestRepo {
    let test = open_repo(cache_check_percent);
    test.repo.init(FULL_PWD, WRITE_PWD).await.unwrap();
    test
}

/// Creates a scratch source tree from `(relative path, content)` pairs.
pub fn write_tree(files: &[(&str, &[u8])]) -> TempDir {
    let root = TempDir::new().unwrap();

    for (path, content) in files {
        let full = root.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, content).unwrap();
    }

    root
}

/// Where a snapshot restore of `source` lands under `dest`: snapshot entries
/// carry the absolute source path with the leading separator stripped.
pub fn restored_root(dest: &std::path::Path, source: &std::path::Path) -> std::path::PathBuf {
    let absolute = std::path::absolute(source).unwrap();
    dest.join(absolute.strip_prefix("/").unwrap())
}
