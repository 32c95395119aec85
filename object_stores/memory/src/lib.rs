use bytes::Bytes;
use dashmap::DashMap;
use futures::{TryStreamExt, stream};
use rekkord_core::store::{
    ByteStream, KeyStream, Store, StoreError, StoreFeatures, StoreResult,
};

/// In-memory object store, primarily for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects whose key starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .count()
    }

    /// Flips one bit of a stored object, for tamper tests.
    pub fn flip_bit(&self, path: &str, offset: usize) {
        let mut entry = self
            .objects
            .get_mut(path)
            .unwrap_or_else(|| panic!("no object at '{path}'"));

        let mut bytes = entry.value().to_vec();
        bytes[offset] ^= 0x01;
        *entry.value_mut() = Bytes::from(bytes);
    }

    /// Removes an object behind the repository's back, for cache tests.
    pub fn remove_quietly(&self, path: &str) {
        self.objects.remove(path);
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            supports_rename: true,
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Bytes> {
        let object = self.objects.get(path).ok_or(StoreError::NotFound)?;
        Ok(object.clone())
    }

    async fn write(&self, path: &str, data: ByteStream) -> StoreResult<u64> {
        let chunks: Vec<Bytes> = data.try_collect().await?;
        let bytes = Bytes::from(chunks.concat());
        let len = bytes.len() as u64;

        self.objects.insert(path.to_owned(), bytes);
        Ok(len)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.objects.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        if from == to {
            return Ok(());
        }

        let (_, value) = self.objects.remove(from).ok_or(StoreError::NotFound)?;
        self.objects.insert(to.to_owned(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<KeyStream> {
        let keys: Vec<StoreResult<String>> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| Ok(entry.key().clone()))
            .collect();

        Ok(Box::new(stream::iter(keys)))
    }

    async fn stat(&self, path: &str) -> StoreResult<bool> {
        Ok(self.objects.contains_key(path))
    }
}
