//! The get pipeline: expand a root blob back into files and directories.
//!
//! Files are rebuilt through unique temp siblings: space is reserved up
//! front, chunks are fetched in parallel and written at their offsets, then
//! the file is fsynced and renamed over the destination. A directory's own
//! metadata is applied only after all of its children are in place.

use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use filetime::FileTime;
use futures::future::BoxFuture;
use rekkord_core::format::{BlobType, EntryKind, EntryRecord, SnapshotHeader, parse_directory, parse_file};
use rekkord_core::hash::Hash;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::repository::{Repository, random_hex};

#[derive(Debug, Clone, Copy, Default)]
pub struct GetSettings {
    /// Overwrite existing destinations instead of aborting.
    pub force: bool,
    /// Restore file ownership (uid/gid) too; needs the privilege to do so.
    pub chown: bool,
    /// When restoring a snapshot, extract basenames only instead of
    /// recreating the stored absolute paths.
    pub flat: bool,
}

#[derive(Clone, Copy)]
struct ExtractOptions {
    allow_separators: bool,
    flatten: bool,
}

struct GetContext {
    repo: Repository,
    chown: bool,

    entry_limit: Arc<Semaphore>,
    chunk_limit: Arc<Semaphore>,

    restored: AtomicI64,
}

/// Applies stored metadata to a restored path. Failures are warnings, the
/// restored content is kept.
fn apply_metadata(path: &Path, entry: &EntryRecord, chown: bool) {
    use std::os::unix::fs::PermissionsExt;

    if chown
        && let Err(err) = std::os::unix::fs::chown(path, Some(entry.uid), Some(entry.gid))
    {
        tracing::warn!("failed to change owner of '{}': {err}", path.display());
    }

    let permissions = std::fs::Permissions::from_mode(entry.mode);
    if let Err(err) = std::fs::set_permissions(path, permissions) {
        tracing::warn!("failed to set permissions of '{}': {err}", path.display());
    }

    let mtime = FileTime::from_unix_time(entry.mtime / 1000, (entry.mtime % 1000) as u32 * 1_000_000);
    if let Err(err) = filetime::set_file_mtime(path, mtime) {
        tracing::warn!("failed to set mtime of '{}': {err}", path.display());
    }
}

async fn create_symlink(target: &Path, link: &Path, overwrite: bool) -> Result<()> {
    match tokio::fs::symlink(target, link).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && overwrite => {
            let meta = tokio::fs::symlink_metadata(link).await?;
            if meta.file_type().is_symlink() {
                tokio::fs::remove_file(link).await?;
            }
            tokio::fs::symlink(target, link).await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn directory_is_empty(path: &Path) -> Result<bool> {
    let mut reader = tokio::fs::read_dir(path).await?;
    Ok(reader.next_entry().await?.is_none())
}

/// Creates the destination directory, refusing to reuse a non-empty one
/// unless `force` is set.
async fn prepare_destination(dest: &Path, force: bool) -> Result<()> {
    match tokio::fs::create_dir(dest).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let meta = tokio::fs::metadata(dest).await?;
            if !meta.is_dir() {
                return Err(Error::InvalidInput(format!(
                    "'{}' already exists and is not a directory",
                    dest.display()
                )));
            }
            if !force && !directory_is_empty(dest).await? {
                return Err(Error::InvalidInput(format!(
                    "directory '{}' exists and is not empty",
                    dest.display()
                )));
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Opens a unique `dest.<random>` sibling with exclusive create.
async fn create_temp_sibling(dest: &Path) -> Result<(PathBuf, std::fs::File)> {
    for _ in 0..1000 {
        let mut name = dest
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", random_hex(6)));
        let tmp = dest.with_file_name(name);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
        {
            Ok(file) => return Ok((tmp, file.into_std().await)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(Error::Other(anyhow::anyhow!(
        "cannot create temporary file for '{}'",
        dest.display()
    )))
}

impl GetContext {
    fn new(repo: Repository, settings: &GetSettings) -> Arc<Self> {
        let tasks = repo.task_limit();

        Arc::new(GetContext {
            repo,
            chown: settings.chown,
            entry_limit: Arc::new(Semaphore::new(tasks)),
            chunk_limit: Arc::new(Semaphore::new(tasks)),
            restored: AtomicI64::new(0),
        })
    }

    /// Restores one file from a File or Chunk blob, scatter-writing chunks
    /// at their recorded offsets. On fatal errors the temp sibling is left
    /// behind for diagnosis.
    async fn get_file(
        self: &Arc<Self>,
        hash: Hash,
        ty: BlobType,
        blob: &[u8],
        dest: &Path,
    ) -> Result<i64> {
        use std::os::unix::fs::FileExt;

        let (tmp_path, file) = create_temp_sibling(dest).await?;
        let file = Arc::new(file);

        let file_len = match ty {
            BlobType::File => {
                let (entries, total) = parse_file(blob)
                    .map_err(|_| Error::Corruption(format!("malformed file blob '{hash}'")))?;

                if let Some(last) = entries.last()
                    && last.offset + last.len as i64 != total
                {
                    return Err(Error::Corruption(format!("file size mismatch for '{hash}'")));
                }

                {
                    let file = Arc::clone(&file);
                    tokio::task::spawn_blocking(move || file.set_len(total as u64)).await??;
                }

                let mut set: JoinSet<Result<()>> = JoinSet::new();
                for entry in entries {
                    let ctx = Arc::clone(self);
                    let file = Arc::clone(&file);

                    set.spawn(async move {
                        let _permit = ctx
                            .chunk_limit
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(anyhow::Error::from)?;

                        let (ty, data) = ctx.repo.read_blob(entry.hash).await?;
                        if ty != BlobType::Chunk {
                            return Err(Error::Corruption(format!(
                                "blob '{}' is not a Chunk",
                                entry.hash
                            )));
                        }
                        if data.len() != entry.len as usize {
                            return Err(Error::Corruption(format!(
                                "chunk size mismatch for '{}'",
                                entry.hash
                            )));
                        }

                        tokio::task::spawn_blocking(move || {
                            file.write_all_at(&data, entry.offset as u64)
                        })
                        .await??;

                        Ok(())
                    });
                }

                while let Some(joined) = set.join_next().await {
                    joined??;
                }

                total
            }
            BlobType::Chunk => {
                let data = blob.to_vec();
                let len = data.len() as i64;
                let file = Arc::clone(&file);
                tokio::task::spawn_blocking(move || file.write_all_at(&data, 0)).await??;
                len
            }
            _ => {
                return Err(Error::Corruption(format!("blob '{hash}' is not a File")));
            }
        };

        {
            let file = Arc::clone(&file);
            tokio::task::spawn_blocking(move || file.sync_all()).await??;
        }
        tokio::fs::rename(&tmp_path, dest).await?;

        self.restored.fetch_add(file_len, Ordering::Relaxed);
        Ok(file_len)
    }

    /// Extracts every readable entry of a directory body into `dest_dir`,
    /// then applies the directory's own metadata.
    fn extract_entries(
        self: &Arc<Self>,
        body: Vec<u8>,
        options: ExtractOptions,
        dest_dir: PathBuf,
        dir_meta: Option<EntryRecord>,
    ) -> BoxFuture<'static, Result<()>> {
        let ctx = Arc::clone(self);

        Box::pin(async move {
            let (_, entries) = parse_directory(&body, options.allow_separators)?;

            let mut set: JoinSet<Result<()>> = JoinSet::new();

            for entry in entries {
                if entry.kind == EntryKind::Unknown || !entry.is_readable() {
                    continue;
                }

                let filename = if options.flatten {
                    let basename = entry.name.rsplit('/').next().unwrap_or(&entry.name);
                    dest_dir.join(basename)
                } else {
                    dest_dir.join(&entry.name)
                };

                // Snapshot roots encode absolute paths, so intermediate
                // directories may not exist yet.
                if options.allow_separators
                    && !options.flatten
                    && let Some(parent) = filename.parent()
                {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let ctx = Arc::clone(&ctx);
                set.spawn(async move {
                    match entry.kind {
                        EntryKind::Directory => {
                            let (ty, blob) = ctx.repo.read_blob(entry.hash).await?;
                            if ty != BlobType::Directory {
                                return Err(Error::Corruption(format!(
                                    "blob '{}' is not a Directory",
                                    entry.hash
                                )));
                            }

                            match tokio::fs::create_dir(&filename).await {
                                Ok(()) => {}
                                Err(err)
                                    if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                                Err(err) => return Err(err.into()),
                            }

                            let child_options = ExtractOptions {
                                allow_separators: false,
                                flatten: false,
                            };
                            ctx.extract_entries(blob, child_options, filename, Some(entry))
                                .await?;
                        }
                        EntryKind::File => {
                            let _permit = ctx
                                .entry_limit
                                .clone()
                                .acquire_owned()
                                .await
                                .map_err(anyhow::Error::from)?;

                            let (ty, blob) = ctx.repo.read_blob(entry.hash).await?;
                            if ty != BlobType::File && ty != BlobType::Chunk {
                                return Err(Error::Corruption(format!(
                                    "blob '{}' is not a File",
                                    entry.hash
                                )));
                            }

                            ctx.get_file(entry.hash, ty, &blob, &filename).await?;
                            apply_metadata(&filename, &entry, ctx.chown);
                        }
                        EntryKind::Link => {
                            let (ty, blob) = ctx.repo.read_blob(entry.hash).await?;
                            if ty != BlobType::Link {
                                return Err(Error::Corruption(format!(
                                    "blob '{}' is not a Link",
                                    entry.hash
                                )));
                            }

                            let target = PathBuf::from(std::ffi::OsString::from_vec(blob));
                            create_symlink(&target, &filename, true).await?;
                        }
                        EntryKind::Unknown => {}
                    }

                    Ok(())
                });
            }

            while let Some(joined) = set.join_next().await {
                joined??;
            }

            // Children done, now the directory's own metadata can stick.
            if let Some(meta) = dir_meta {
                apply_metadata(&dest_dir, &meta, ctx.chown);
            }

            Ok(())
        })
    }
}

impl Repository {
    /// Restores the object named by `hash` to `dest`. Returns the number of
    /// file bytes restored.
    pub async fn get(&self, hash: Hash, settings: &GetSettings, dest: &Path) -> Result<i64> {
        let (ty, blob) = self.read_blob(hash).await?;
        let ctx = GetContext::new(self.clone(), settings);

        match ty {
            BlobType::Chunk | BlobType::File => {
                if !settings.force && tokio::fs::try_exists(dest).await? {
                    return Err(Error::InvalidInput(format!(
                        "file '{}' already exists",
                        dest.display()
                    )));
                }

                ctx.get_file(hash, ty, &blob, dest).await?;
            }
            BlobType::Directory => {
                prepare_destination(dest, settings.force).await?;

                let options = ExtractOptions {
                    allow_separators: false,
                    flatten: false,
                };
                ctx.extract_entries(blob, options, dest.to_path_buf(), None)
                    .await?;
            }
            BlobType::Snapshot => {
                prepare_destination(dest, settings.force).await?;

                if blob.len() <= SnapshotHeader::SIZE {
                    return Err(Error::Corruption(format!("malformed snapshot blob '{hash}'")));
                }
                let body = blob[SnapshotHeader::SIZE..].to_vec();

                let options = ExtractOptions {
                    allow_separators: true,
                    flatten: settings.flat,
                };
                ctx.extract_entries(body, options, dest.to_path_buf(), None)
                    .await?;
            }
            BlobType::Link => {
                let target = PathBuf::from(std::ffi::OsString::from_vec(blob));
                create_symlink(&target, dest, settings.force).await?;
            }
        }

        Ok(ctx.restored.load(Ordering::Relaxed))
    }
}
