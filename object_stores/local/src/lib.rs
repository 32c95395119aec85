use std::path::{Path, PathBuf};

use anyhow::anyhow;
use bytes::Bytes;
use futures::stream;
use rekkord_core::store::{
    ByteStream, KeyStream, Store, StoreError, StoreFeatures, StoreResult,
};
use tokio::fs::File;
use tokio_util::io::StreamReader;
use walkdir::WalkDir;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LocalStoreConfig {
    pub root: String,
}

/// Object store rooted at a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn create(config: LocalStoreConfig) -> Self {
        LocalStore {
            root: config.root.into(),
        }
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Self {
        LocalStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        if path.starts_with('/') || path.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StoreError::Other(anyhow!(
                "invalid store key '{path}': must be a relative path without '..'"
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait::async_trait]
impl Store for LocalStore {
    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            supports_rename: true,
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Bytes> {
        let full = self.resolve(path)?;
        let bytes = tokio::fs::read(&full).await?;
        Ok(Bytes::from(bytes))
    }

    async fn write(&self, path: &str, data: ByteStream) -> StoreResult<u64> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&full).await?;
        let mut reader = StreamReader::new(data);
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;

        Ok(written)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let old = self.resolve(from)?;
        let new = self.resolve(to)?;

        if let Some(parent) = new.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old, &new).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<KeyStream> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();

        let keys = tokio::task::spawn_blocking(move || -> StoreResult<Vec<String>> {
            let mut keys = Vec::new();

            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.io_error().map(|io| io.kind())
                        == Some(std::io::ErrorKind::NotFound) => continue,
                    Err(err) => return Err(StoreError::Other(err.into())),
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|err| StoreError::Other(err.into()))?;
                let Some(key) = relative.to_str() else {
                    continue;
                };

                if key.starts_with(&prefix) {
                    keys.push(key.to_owned());
                }
            }

            Ok(keys)
        })
        .await
        .map_err(|err| StoreError::Other(err.into()))??;

        Ok(Box::new(stream::iter(keys.into_iter().map(Ok))))
    }

    async fn stat(&self, path: &str) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn create_namespace(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn delete_namespace(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_dir(&full).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_rename_is_atomic_publish() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path());

        store
            .write_bytes("tmp/in-flight.tmp", Bytes::from_static(b"ciphertext"))
            .await
            .unwrap();
        store
            .rename("tmp/in-flight.tmp", "blobs/abc/final")
            .await
            .unwrap();

        assert!(!store.stat("tmp/in-flight.tmp").await.unwrap());
        assert_eq!(
            store.read("blobs/abc/final").await.unwrap(),
            Bytes::from_static(b"ciphertext")
        );
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path());

        assert!(store.read("../escape").await.is_err());
        assert!(store.read("/absolute").await.is_err());
        assert!(store.read("a/../b").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_keys_under_prefix() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path());

        for key in ["blobs/aaa/one", "blobs/bbb/two", "tags/three"] {
            store
                .write_bytes(key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let mut keys: Vec<String> = store
            .list("blobs/")
            .await
            .unwrap()
            .map(|key| key.unwrap())
            .collect()
            .await;
        keys.sort();

        assert_eq!(keys, vec!["blobs/aaa/one", "blobs/bbb/two"]);
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path());

        assert!(matches!(
            store.read("blobs/aaa/missing").await,
            Err(StoreError::NotFound)
        ));
        assert!(!store.stat("blobs/aaa/missing").await.unwrap());
        store.delete("blobs/aaa/missing").await.unwrap();
    }
}
