//! Repository access: authentication, modes, blob and tag I/O.
//!
//! A `Repository` wraps an object store with the crypto envelope and the
//! local stat cache. Key material lives in one shared state that is wiped on
//! [`Repository::lock`]; write-only holders keep the public key, full holders
//! also keep the secret key.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use rand::Rng;
use rekkord_core::envelope::{open_blob, seal_blob};
use rekkord_core::format::{BlobType, hash_blob};
use rekkord_core::hash::Hash;
use rekkord_core::keys::{self, KeyError};
use rekkord_core::sealed;
use rekkord_core::store::{Store, StoreError, StoreResult, layout};
use zeroize::Zeroize;

use crate::cache::StatCache;
use crate::error::{Error, Result};

pub const DEFAULT_USER: &str = "default";

/// Access level of an opened repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No key material loaded.
    Locked,
    /// Public key only: can ingest, cannot read back.
    WriteOnly,
    /// Secret key loaded: full access.
    Full,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Locked => "Locked",
            Mode::WriteOnly => "WriteOnly",
            Mode::Full => "Full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Directory for the local stat cache. `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    /// Percentage of exists-checks verified against the store (0-100).
    pub cache_check_percent: u8,
    /// Bound on concurrent tasks in the put/get pipelines.
    pub tasks: usize,
    /// Attempts for transient store failures before giving up.
    pub retries: u32,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        RepositoryOptions {
            cache_dir: None,
            cache_check_percent: 2,
            tasks: (4 * cores).min(64),
            retries: 9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserInfo {
    pub username: String,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub struct TagInfo {
    /// Tag object name under `tags/`.
    pub name: String,
    pub hash: Hash,
    pub payload: Vec<u8>,
}

struct AuthState {
    mode: Mode,
    pkey: [u8; 32],
    skey: [u8; 32],
}

impl AuthState {
    fn locked() -> Self {
        AuthState {
            mode: Mode::Locked,
            pkey: [0u8; 32],
            skey: [0u8; 32],
        }
    }
}

impl Drop for AuthState {
    fn drop(&mut self) {
        self.pkey.zeroize();
        self.skey.zeroize();
    }
}

struct RepoInner {
    store: Arc<dyn Store>,
    url: String,
    options: RepositoryOptions,
    auth: RwLock<AuthState>,
    cache: RwLock<Option<Arc<StatCache>>>,
}

/// Handle to an open repository. Clones share the same state.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(buf.as_mut_slice());
    hex::encode(buf)
}

pub(crate) fn unix_time_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn check_username(username: &str) -> Result<()> {
    let valid_char =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-');

    if username.is_empty() {
        return Err(Error::InvalidInput("username cannot be empty".to_owned()));
    }
    if username.len() > 32 {
        return Err(Error::InvalidInput(
            "username cannot have more than 32 characters".to_owned(),
        ));
    }
    if !username.chars().all(valid_char) {
        return Err(Error::InvalidInput(
            "username must only contain lowercase alphanumeric, '_', '.' or '-' characters"
                .to_owned(),
        ));
    }

    Ok(())
}

fn is_username(username: &str) -> bool {
    check_username(username).is_ok()
}

impl Repository {
    pub fn open(store: Arc<dyn Store>, url: impl Into<String>, options: RepositoryOptions) -> Self {
        Repository {
            inner: Arc::new(RepoInner {
                store,
                url: url.into(),
                options,
                auth: RwLock::new(AuthState::locked()),
                cache: RwLock::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn mode(&self) -> Mode {
        self.inner.auth.read().unwrap().mode
    }

    pub(crate) fn task_limit(&self) -> usize {
        self.inner.options.tasks
    }

    pub(crate) fn cache(&self) -> Option<Arc<StatCache>> {
        self.inner.cache.read().unwrap().clone()
    }

    /// Repository salt, mixed into every hash. Equal to the public key bytes.
    pub fn salt(&self) -> Result<[u8; 32]> {
        self.require_write()
    }

    /// The 32-byte master key. Only available in full mode; handle with care.
    pub fn master_key(&self) -> Result<[u8; 32]> {
        let (skey, _) = self.require_full()?;
        Ok(skey)
    }

    pub(crate) fn require_write(&self) -> Result<[u8; 32]> {
        let auth = self.inner.auth.read().unwrap();
        match auth.mode {
            Mode::WriteOnly | Mode::Full => Ok(auth.pkey),
            Mode::Locked => Err(Error::AccessDenied),
        }
    }

    /// Returns `(skey, pkey)`; fails unless the full key is loaded.
    pub(crate) fn require_full(&self) -> Result<([u8; 32], [u8; 32])> {
        let auth = self.inner.auth.read().unwrap();
        match auth.mode {
            Mode::Full => Ok((auth.skey, auth.pkey)),
            Mode::WriteOnly | Mode::Locked => Err(Error::AccessDenied),
        }
    }

    /// Wipes key material and closes the cache.
    pub fn lock(&self) {
        *self.inner.auth.write().unwrap() = AuthState::locked();
        *self.inner.cache.write().unwrap() = None;
    }

    /// Retries transient store failures with jittered exponential backoff.
    pub(crate) async fn retry<T, F, Fut>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay = Duration::from_millis(200);
        let mut attempt = 0;

        loop {
            match op().await {
                Err(StoreError::Transient(err)) if attempt + 1 < self.inner.options.retries => {
                    attempt += 1;
                    tracing::warn!("transient store failure (attempt {attempt}): {err}");

                    let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
                other => return other,
            }
        }
    }

    // --- Initialization and authentication ---

    /// Initializes an empty repository and creates the `default` user.
    pub async fn init(&self, full_pwd: &str, write_pwd: &str) -> Result<()> {
        if self.mode() != Mode::Locked {
            return Err(Error::InvalidInput("repository is already open".to_owned()));
        }
        if self.retry(|| self.inner.store.stat(layout::REPO_SECRET)).await? {
            return Err(Error::InvalidInput(format!(
                "repository '{}' looks already initialized",
                self.inner.url
            )));
        }

        // Drop created objects again if anything fails past this point.
        match self.init_inner(full_pwd, write_pwd).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.inner.store.delete(layout::REPO_SECRET).await;
                let _ = self.inner.store.delete(&layout::full_key(DEFAULT_USER)).await;
                let _ = self.inner.store.delete(&layout::write_key(DEFAULT_USER)).await;
                self.lock();
                Err(err)
            }
        }
    }

    async fn init_inner(&self, full_pwd: &str, write_pwd: &str) -> Result<()> {
        let (skey, pkey) = sealed::generate_keypair();
        *self.inner.auth.write().unwrap() = AuthState {
            mode: Mode::Full,
            pkey,
            skey,
        };

        // Random repository id, sealed and used to name the local cache.
        let id: [u8; 32] = rand::random();
        self.write_secret(layout::REPO_SECRET, &id, false).await?;
        self.open_cache(&id).await?;

        self.inner
            .store
            .create_namespace(&layout::user_namespace(DEFAULT_USER))
            .await?;
        self.write_key_record(&layout::full_key(DEFAULT_USER), full_pwd, &skey)
            .await?;
        self.write_key_record(&layout::write_key(DEFAULT_USER), write_pwd, &pkey)
            .await?;

        Ok(())
    }

    /// Opens the repository with a username and password. The write record is
    /// probed first, so a password that only opens it yields WriteOnly mode.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        match self.authenticate_inner(username, password).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.lock();
                Err(err)
            }
        }
    }

    async fn authenticate_inner(&self, username: &str, password: &str) -> Result<()> {
        if self.mode() != Mode::Locked {
            return Err(Error::InvalidInput("repository is already open".to_owned()));
        }
        self.check_repository().await?;

        let write_path = layout::write_key(username);
        let full_path = layout::full_key(username);

        if !self.retry(|| self.inner.store.stat(&write_path)).await? {
            tracing::error!("user '{username}' does not exist");
            return Err(Error::NotFound);
        }

        let state = match self.read_key_record(&write_path, password).await {
            Ok(pkey) => AuthState {
                mode: Mode::WriteOnly,
                pkey,
                skey: [0u8; 32],
            },
            Err(Error::AccessDenied) | Err(Error::NotFound) => {
                match self.read_key_record(&full_path, password).await {
                    Ok(skey) => AuthState {
                        mode: Mode::Full,
                        pkey: sealed::derive_public_key(&skey),
                        skey,
                    },
                    Err(Error::AccessDenied) | Err(Error::NotFound) => {
                        tracing::error!("failed to open repository (wrong password?)");
                        return Err(Error::AccessDenied);
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        *self.inner.auth.write().unwrap() = state;

        let id = self.read_repository_id().await?;
        self.open_cache(&id).await?;

        Ok(())
    }

    /// Opens the repository with the raw 32-byte master key.
    pub async fn authenticate_key(&self, master: &[u8; 32]) -> Result<()> {
        if self.mode() != Mode::Locked {
            return Err(Error::InvalidInput("repository is already open".to_owned()));
        }
        self.check_repository().await?;

        *self.inner.auth.write().unwrap() = AuthState {
            mode: Mode::Full,
            pkey: sealed::derive_public_key(master),
            skey: *master,
        };

        match self.read_repository_id().await {
            Ok(id) => self.open_cache(&id).await?,
            Err(err) => {
                self.lock();
                return Err(err);
            }
        }

        Ok(())
    }

    async fn check_repository(&self) -> Result<()> {
        if self.retry(|| self.inner.store.stat(layout::REPO_SECRET)).await? {
            Ok(())
        } else {
            tracing::error!(
                "repository '{}' is not initialized or not valid",
                self.inner.url
            );
            Err(Error::NotFound)
        }
    }

    async fn read_repository_id(&self) -> Result<[u8; 32]> {
        let payload = self.read_secret(layout::REPO_SECRET).await?;
        payload
            .try_into()
            .map_err(|_| Error::Corruption("malformed repository id".to_owned()))
    }

    /// Replaces the repository id, detaching every existing local cache.
    pub async fn change_id(&self) -> Result<()> {
        self.require_write()?;

        let id: [u8; 32] = rand::random();
        self.write_secret(layout::REPO_SECRET, &id, true).await?;

        *self.inner.cache.write().unwrap() = None;
        self.open_cache(&id).await?;

        Ok(())
    }

    async fn open_cache(&self, id: &[u8; 32]) -> Result<()> {
        let Some(dir) = self.inner.options.cache_dir.clone() else {
            return Ok(());
        };

        let id = *id;
        let url = self.inner.url.clone();
        let cache = tokio::task::spawn_blocking(move || StatCache::open(&dir, &id, &url)).await??;

        *self.inner.cache.write().unwrap() = Some(Arc::new(cache));
        Ok(())
    }

    // --- User management ---

    pub async fn init_user(
        &self,
        username: &str,
        full_pwd: Option<&str>,
        write_pwd: Option<&str>,
        force: bool,
    ) -> Result<()> {
        check_username(username)?;
        if full_pwd.is_none() && write_pwd.is_none() {
            return Err(Error::InvalidInput(format!(
                "cannot create user '{username}' without any password"
            )));
        }

        let (skey, pkey) = if full_pwd.is_some() {
            self.require_full()?
        } else {
            ([0u8; 32], self.require_write()?)
        };

        let full_path = layout::full_key(username);
        let write_path = layout::write_key(username);

        let exists = self.retry(|| self.inner.store.stat(&full_path)).await?
            || self.retry(|| self.inner.store.stat(&write_path)).await?;
        if exists {
            if force {
                tracing::warn!("overwriting existing user '{username}'");
            } else {
                return Err(Error::InvalidInput(format!(
                    "user '{username}' already exists"
                )));
            }
        }

        self.inner.store.delete(&full_path).await?;
        self.inner.store.delete(&write_path).await?;

        self.inner
            .store
            .create_namespace(&layout::user_namespace(username))
            .await?;
        if let Some(pwd) = full_pwd {
            self.write_key_record(&full_path, pwd, &skey).await?;
        }
        if let Some(pwd) = write_pwd {
            self.write_key_record(&write_path, pwd, &pkey).await?;
        }

        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        check_username(username)?;

        let full_path = layout::full_key(username);
        let write_path = layout::write_key(username);

        let exists = self.retry(|| self.inner.store.stat(&full_path)).await?
            || self.retry(|| self.inner.store.stat(&write_path)).await?;
        if !exists {
            let _ = self
                .inner
                .store
                .delete_namespace(&layout::user_namespace(username))
                .await;
            tracing::error!("user '{username}' does not exist");
            return Err(Error::NotFound);
        }

        self.inner.store.delete(&full_path).await?;
        self.inner.store.delete(&write_path).await?;
        self.inner
            .store
            .delete_namespace(&layout::user_namespace(username))
            .await?;

        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<UserInfo>> {
        let keys: Vec<String> = self
            .inner
            .store
            .list(layout::KEY_PREFIX)
            .await?
            .try_collect()
            .await?;

        let mut users: Vec<UserInfo> = Vec::new();
        for key in keys {
            let Some(rest) = key.strip_prefix(layout::KEY_PREFIX) else {
                continue;
            };
            let Some((username, record)) = rest.split_once('/') else {
                continue;
            };
            if !is_username(username) || (record != "write" && record != "full") {
                continue;
            }

            match users.iter_mut().find(|user| user.username == username) {
                Some(user) => {
                    if record == "full" {
                        user.mode = Mode::Full;
                    }
                }
                None => users.push(UserInfo {
                    username: username.to_owned(),
                    mode: if record == "full" {
                        Mode::Full
                    } else {
                        Mode::WriteOnly
                    },
                }),
            }
        }

        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    // --- Key records and secrets ---

    async fn write_key_record(&self, path: &str, password: &str, payload: &[u8; 32]) -> Result<()> {
        let record = keys::wrap_key(password, payload)?;
        self.write_direct(path, Bytes::from(record), false).await?;
        Ok(())
    }

    async fn read_key_record(&self, path: &str, password: &str) -> Result<[u8; 32]> {
        let record = self.retry(|| self.inner.store.read(path)).await?;
        let payload = keys::unwrap_key(password, &record)?;
        Ok(payload)
    }

    async fn write_secret(&self, path: &str, payload: &[u8], overwrite: bool) -> Result<()> {
        let pkey = self.require_write()?;
        let blob = keys::seal_secret(&pkey, payload)?;
        self.write_direct(path, Bytes::from(blob), overwrite).await?;
        Ok(())
    }

    async fn read_secret(&self, path: &str) -> Result<Vec<u8>> {
        let pkey = self.require_write()?;
        let blob = self.retry(|| self.inner.store.read(path)).await?;
        let payload = keys::open_secret(&pkey, &blob).map_err(|err| match err {
            KeyError::Decrypt => Error::AccessDenied,
            other => other.into(),
        })?;
        Ok(payload)
    }

    /// Writes a small object in place, optionally refusing to overwrite.
    async fn write_direct(&self, path: &str, data: Bytes, overwrite: bool) -> Result<u64> {
        if !overwrite && self.retry(|| self.inner.store.stat(path)).await? {
            return Err(Error::InvalidInput(format!("'{path}' already exists")));
        }
        self.upload(path, data).await
    }

    /// Uploads through `tmp/` plus rename when the store supports it, so a
    /// crashed upload never leaves a partial object under its final key.
    async fn upload(&self, path: &str, data: Bytes) -> Result<u64> {
        let store = &self.inner.store;

        if store.features().supports_rename {
            let tmp = layout::tmp(&random_hex(8));

            let written = match self.retry(|| store.write_bytes(&tmp, data.clone())).await {
                Ok(written) => written,
                Err(err) => {
                    let _ = store.delete(&tmp).await;
                    return Err(err.into());
                }
            };
            if let Err(err) = self.retry(|| store.rename(&tmp, path)).await {
                let _ = store.delete(&tmp).await;
                return Err(err.into());
            }

            Ok(written)
        } else {
            Ok(self.retry(|| store.write_bytes(path, data.clone())).await?)
        }
    }

    // --- Blob and tag I/O ---

    /// Exists-check that prefers the local cache, verifying a sample of
    /// answers against the store. A positive cache answer contradicted by the
    /// store is a data-loss hazard and aborts the operation.
    pub(crate) async fn test_fast(&self, path: &str) -> Result<bool> {
        let Some(cache) = self.cache() else {
            return Ok(self.retry(|| self.inner.store.stat(path)).await?);
        };

        let should_exist = cache.contains_object(path).await?;

        let sample = rand::rng().random_range(0..100u32);
        if sample < self.inner.options.cache_check_percent as u32 {
            let really_exists = self.retry(|| self.inner.store.stat(path)).await?;

            if really_exists && !should_exist {
                if cache.record_miss() >= 4 {
                    self.rebuild_cache().await?;
                    cache.reset_misses();
                }
                return Ok(really_exists);
            } else if should_exist && !really_exists {
                cache.clear().await?;
                tracing::error!(
                    "the local cache database was mismatched and could have resulted in missing data in the backup"
                );
                tracing::error!("you must start over to fix this situation");
                return Err(Error::CacheInconsistent);
            }
        }

        Ok(should_exist)
    }

    /// Repopulates the object cache from a full store listing.
    pub async fn rebuild_cache(&self) -> Result<()> {
        let Some(cache) = self.cache() else {
            return Err(Error::InvalidInput("cache is not open".to_owned()));
        };

        let keys: Vec<String> = self.inner.store.list("").await?.try_collect().await?;
        cache.rebuild_objects(keys).await?;

        Ok(())
    }

    /// Fetches, decrypts and verifies one blob. Requires the full key.
    pub async fn read_blob(&self, hash: Hash) -> Result<(BlobType, Vec<u8>)> {
        let (skey, salt) = self.require_full()?;

        let path = layout::blob(&hash);
        let data = self.retry(|| self.inner.store.read(&path)).await?;

        let verified = tokio::task::spawn_blocking(move || -> Result<(BlobType, Vec<u8>)> {
            let (ty, plaintext) = open_blob(&skey, &data)?;

            let expected = hash_blob(&salt, ty, &plaintext);
            if expected != hash {
                return Err(Error::Corruption(format!(
                    "hash mismatch for blob '{hash}'"
                )));
            }

            Ok((ty, plaintext))
        })
        .await??;

        Ok(verified)
    }

    /// Seals and uploads one blob unless it is already present. Returns the
    /// number of ciphertext bytes written, 0 when the blob was deduplicated.
    pub async fn write_blob(&self, hash: Hash, ty: BlobType, plaintext: Bytes) -> Result<u64> {
        let pkey = self.require_write()?;

        let path = layout::blob(&hash);
        if self.test_fast(&path).await? {
            return Ok(0);
        }

        let sealed =
            tokio::task::spawn_blocking(move || seal_blob(&pkey, ty, &plaintext)).await??;

        let written = self.upload(&path, Bytes::from(sealed)).await?;

        if let Some(cache) = self.cache() {
            if let Err(err) = cache.insert_object(path).await {
                tracing::warn!("failed to record uploaded blob in cache: {err}");
            }
        }

        Ok(written)
    }

    /// Writes a tag object for a snapshot: the sealed hash followed by a
    /// sealed payload, under a random name retried on collision.
    pub async fn write_tag(&self, hash: Hash, payload: &[u8]) -> Result<u64> {
        let pkey = self.require_write()?;

        let mut blob = sealed::seal(&pkey, hash.as_bytes())?;
        blob.extend_from_slice(&sealed::seal(&pkey, payload)?);
        let blob = Bytes::from(blob);

        for _ in 0..1000 {
            let path = layout::tag(&random_hex(8));

            if self.retry(|| self.inner.store.stat(&path)).await? {
                continue;
            }
            return self.upload(&path, blob.clone()).await;
        }

        Err(Error::Other(anyhow::anyhow!(
            "failed to create tag for '{hash}'"
        )))
    }

    /// Lists and unseals every tag. Requires the full key; malformed tags are
    /// skipped with a warning.
    pub async fn list_tags(&self) -> Result<Vec<TagInfo>> {
        let (skey, _) = self.require_full()?;

        let keys: Vec<String> = self
            .inner
            .store
            .list(layout::TAG_PREFIX)
            .await?
            .try_collect()
            .await?;

        let mut tags = Vec::with_capacity(keys.len());
        for key in keys {
            let data = match self.retry(|| self.inner.store.read(&key)).await {
                Ok(data) => data,
                Err(StoreError::NotFound) => continue,
                Err(err) => return Err(err.into()),
            };

            const SEALED_HASH_LEN: usize = 32 + sealed::SEAL_OVERHEAD;
            if data.len() < SEALED_HASH_LEN {
                tracing::error!("malformed tag file '{key}' (ignoring)");
                continue;
            }

            let hash = match sealed::open(&skey, &data[..SEALED_HASH_LEN]) {
                Ok(bytes) if bytes.len() == 32 => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&bytes);
                    Hash::from_bytes(hash)
                }
                _ => {
                    tracing::error!("failed to unseal tag '{key}' (ignoring)");
                    continue;
                }
            };

            let payload = match sealed::open(&skey, &data[SEALED_HASH_LEN..]) {
                Ok(payload) => payload,
                Err(_) => {
                    tracing::error!("failed to unseal tag payload '{key}' (ignoring)");
                    continue;
                }
            };

            let name = key
                .strip_prefix(layout::TAG_PREFIX)
                .unwrap_or(&key)
                .to_owned();
            tags.push(TagInfo {
                name,
                hash,
                payload,
            });
        }

        Ok(tags)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("url", &self.inner.url)
            .field("mode", &self.mode().name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_validation() {
        assert!(check_username("backup-host.01_a").is_ok());

        assert!(check_username("").is_err());
        assert!(check_username("Upper").is_err());
        assert!(check_username("with space").is_err());
        assert!(check_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn random_hex_length_and_charset() {
        let name = random_hex(8);
        assert_eq!(name.len(), 16);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
