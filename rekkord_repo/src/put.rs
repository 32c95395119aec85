//! The put pipeline: walk source trees, chunk files, seal blobs bottom-up.
//!
//! Directories are enumerated into entry records in enumeration order; child
//! tasks fill in hashes as they complete and the directory blob is sealed
//! only after all of them finish. Chunk uploads for one file run in parallel
//! and are reassembled by ordinal. The stat cache short-circuits files whose
//! metadata fingerprint is unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use futures::future::BoxFuture;
use rekkord_core::format::{
    BlobType, ChunkRef, DirectoryHeader, ENTRY_READABLE, ENTRY_STATED, EntryKind, EntryRecord,
    SNAPSHOT_NAME_SIZE, SnapshotHeader, hash_blob,
};
use rekkord_core::hash::Hash;
use rekkord_core::splitter::Splitter;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::StatRow;
use crate::error::{Error, Result};
use crate::repository::{Repository, unix_time_millis};

const CHUNK_AVERAGE: usize = 2 * 1024 * 1024;
const CHUNK_MIN: usize = 1024 * 1024;
const CHUNK_MAX: usize = 8 * 1024 * 1024;

const FILE_BIG_SIZE: usize = 64 * 1024 * 1024;
const FILE_DEFAULT_SIZE: usize = 2 * CHUNK_MAX;
const FILE_BIG_LIMIT: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct PutSettings {
    /// Snapshot name; required unless `raw` is set.
    pub name: Option<String>,
    pub follow_symlinks: bool,
    /// Store the single source object without snapshot or tag.
    pub raw: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    /// Snapshot hash, or the object hash in raw mode.
    pub hash: Hash,
    /// Total plaintext bytes covered by the snapshot.
    pub size: i64,
    /// Ciphertext bytes actually uploaded, 0 for fully deduplicated runs.
    pub written: i64,
}

#[derive(Debug, Clone, Copy)]
struct FileFingerprint {
    mtime: i64,
    btime: i64,
    mode: u32,
    size: i64,
}

enum FileOutcome {
    Stored { hash: Hash, size: i64 },
    Unreadable,
}

struct DirOutcome {
    hash: Hash,
    readable: bool,
    subdirs: i64,
    size: i64,
    entries: i64,
}

enum Patch {
    Dir(DirOutcome),
    File(FileOutcome),
    Link(Option<Hash>),
    None,
}

struct PutContext {
    repo: Repository,
    salt: [u8; 32],
    salt8: u64,
    follow_symlinks: bool,

    stat_size: AtomicI64,
    stat_written: AtomicI64,
    stat_entries: AtomicI64,

    // Walk tasks (whole files, links) and chunk uploads are bounded
    // separately so neither can starve the other.
    walk_limit: Arc<Semaphore>,
    chunk_limit: Arc<Semaphore>,
    big_limit: Arc<Semaphore>,
}

fn metadata_times(meta: &std::fs::Metadata) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;

    let mtime = meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000;
    let btime = meta
        .created()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);

    (mtime, btime)
}

fn fill_entry_metadata(entry: &mut EntryRecord, meta: &std::fs::Metadata) {
    use std::os::unix::fs::MetadataExt;

    let (mtime, btime) = metadata_times(meta);
    entry.flags |= ENTRY_STATED;
    entry.mtime = mtime;
    entry.btime = btime;
    entry.mode = meta.mode() & 0o7777;
    entry.uid = meta.uid();
    entry.gid = meta.gid();
}

fn fingerprint_of(entry: &EntryRecord) -> FileFingerprint {
    FileFingerprint {
        mtime: entry.mtime,
        btime: entry.btime,
        mode: entry.mode,
        size: entry.size,
    }
}

impl PutContext {
    fn new(repo: Repository, follow_symlinks: bool) -> Result<Arc<Self>> {
        let salt = repo.salt()?;
        let salt8 = u64::from_le_bytes(salt[..8].try_into().unwrap());
        let tasks = repo.task_limit();

        Ok(Arc::new(PutContext {
            repo,
            salt,
            salt8,
            follow_symlinks,
            stat_size: AtomicI64::new(0),
            stat_written: AtomicI64::new(0),
            stat_entries: AtomicI64::new(0),
            walk_limit: Arc::new(Semaphore::new(tasks)),
            chunk_limit: Arc::new(Semaphore::new(tasks)),
            big_limit: Arc::new(Semaphore::new(FILE_BIG_LIMIT)),
        }))
    }

    fn put_directory(self: &Arc<Self>, dirname: PathBuf) -> BoxFuture<'static, Result<DirOutcome>> {
        let ctx = Arc::clone(self);

        Box::pin(async move {
            let mut reader = match tokio::fs::read_dir(&dirname).await {
                Ok(reader) => reader,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                    ) =>
                {
                    tracing::warn!("failed to enumerate '{}': {err}", dirname.display());
                    return Ok(DirOutcome {
                        hash: Hash::ZERO,
                        readable: false,
                        subdirs: 0,
                        size: 0,
                        entries: 0,
                    });
                }
                Err(err) => return Err(err.into()),
            };

            // Enumerate and stat entries, in enumeration order.
            let mut entries: Vec<EntryRecord> = Vec::new();
            let mut paths: Vec<PathBuf> = Vec::new();
            let mut subdirs = 0i64;
            let mut total_entries = 0i64;

            loop {
                let next = match reader.next_entry().await {
                    Ok(next) => next,
                    Err(err) => {
                        tracing::warn!(
                            "failed while enumerating '{}': {err}",
                            dirname.display()
                        );
                        break;
                    }
                };
                let Some(dirent) = next else { break };

                let name_os = dirent.file_name();
                let Some(name) = name_os.to_str() else {
                    tracing::warn!(
                        "ignoring entry with non UTF-8 name in '{}'",
                        dirname.display()
                    );
                    continue;
                };
                let path = dirname.join(name);

                let mut entry = EntryRecord::new(EntryKind::Unknown, name.to_owned());

                let stat = if ctx.follow_symlinks {
                    tokio::fs::metadata(&path).await
                } else {
                    tokio::fs::symlink_metadata(&path).await
                };
                match stat {
                    Ok(meta) => {
                        fill_entry_metadata(&mut entry, &meta);

                        if meta.is_dir() {
                            entry.kind = EntryKind::Directory;
                            subdirs += 1;
                            total_entries += 1;
                        } else if meta.is_file() {
                            entry.kind = EntryKind::File;
                            entry.size = meta.len() as i64;
                            total_entries += 1;
                        } else if meta.file_type().is_symlink() {
                            entry.kind = EntryKind::Link;
                            total_entries += 1;
                        } else {
                            tracing::warn!("ignoring special file '{}'", path.display());
                        }
                    }
                    Err(err) => {
                        tracing::warn!("failed to stat '{}': {err}", path.display());
                    }
                }

                entries.push(entry);
                paths.push(path);
            }

            // Process children concurrently; directory hashes, file hashes
            // and link hashes are patched in once their tasks complete.
            let mut set: JoinSet<Result<(usize, Patch)>> = JoinSet::new();

            for (index, entry) in entries.iter().enumerate() {
                let path = paths[index].clone();

                match entry.kind {
                    EntryKind::Directory => {
                        let child = ctx.put_directory(path);
                        set.spawn(async move { Ok((index, Patch::Dir(child.await?))) });
                    }
                    EntryKind::File => {
                        let ctx = Arc::clone(&ctx);
                        let fingerprint = fingerprint_of(entry);
                        set.spawn(async move {
                            let outcome = ctx.put_file(path, fingerprint).await?;
                            Ok((index, Patch::File(outcome)))
                        });
                    }
                    EntryKind::Link => {
                        let ctx = Arc::clone(&ctx);
                        set.spawn(async move {
                            let hash = ctx.put_link(path).await?;
                            Ok((index, Patch::Link(hash)))
                        });
                    }
                    EntryKind::Unknown => {
                        set.spawn(async move { Ok((index, Patch::None)) });
                    }
                }
            }

            let mut total_size = 0i64;
            let mut rows: Vec<(String, StatRow)> = Vec::new();
            let mut first_error: Option<Error> = None;

            // A failed child fails the run, but siblings are left to finish:
            // their blobs stay valid and deduplicate the next attempt.
            while let Some(joined) = set.join_next().await {
                let (index, patch) = match joined.map_err(Error::from).and_then(|res| res) {
                    Ok(ok) => ok,
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        continue;
                    }
                };
                let entry = &mut entries[index];

                match patch {
                    Patch::Dir(child) => {
                        entry.hash = child.hash;
                        if child.readable {
                            entry.flags |= ENTRY_READABLE;
                            entry.size = child.subdirs;
                        }
                        total_size += child.size;
                        total_entries += child.entries;
                    }
                    Patch::File(FileOutcome::Stored { hash, size }) => {
                        entry.hash = hash;
                        entry.flags |= ENTRY_READABLE;
                        total_size += size;

                        if let Some(path) = paths[index].to_str() {
                            rows.push((
                                path.to_owned(),
                                StatRow {
                                    mtime: entry.mtime,
                                    btime: entry.btime,
                                    mode: entry.mode,
                                    size: entry.size,
                                    hash: (*entry.hash.as_bytes()),
                                },
                            ));
                        }
                    }
                    Patch::File(FileOutcome::Unreadable) => {}
                    Patch::Link(Some(hash)) => {
                        entry.hash = hash;
                        entry.flags |= ENTRY_READABLE;
                    }
                    Patch::Link(None) => {}
                    Patch::None => {}
                }
            }

            if let Some(err) = first_error {
                return Err(err);
            }

            // Seal the directory blob: header, records, trailing length.
            let mut body = Vec::with_capacity(
                DirectoryHeader::SIZE
                    + entries.iter().map(EntryRecord::encoded_size).sum::<usize>()
                    + 8,
            );
            DirectoryHeader {
                size: total_size,
                entries: total_entries,
            }
            .encode(&mut body);
            for entry in &entries {
                entry.encode(&mut body);
            }
            body.extend_from_slice(&total_size.to_le_bytes());

            let hash = hash_blob(&ctx.salt, BlobType::Directory, &body);
            let body_len = body.len() as i64;
            let written = ctx
                .repo
                .write_blob(hash, BlobType::Directory, Bytes::from(body))
                .await?;

            ctx.stat_size.fetch_add(body_len, Ordering::Relaxed);
            ctx.stat_written.fetch_add(written as i64, Ordering::Relaxed);

            if let Some(cache) = ctx.repo.cache() {
                cache.put_stats(rows).await?;
            }

            Ok(DirOutcome {
                hash,
                readable: true,
                subdirs,
                size: total_size,
                entries: total_entries,
            })
        })
    }

    async fn put_file(
        self: Arc<Self>,
        path: PathBuf,
        fingerprint: FileFingerprint,
    ) -> Result<FileOutcome> {
        let _walk = self
            .walk_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(anyhow::Error::from)?;

        // Unchanged fingerprint: reuse the cached hash without reading.
        if let Some(cache) = self.repo.cache()
            && let Some(key) = path.to_str()
            && let Some(row) = cache.get_stat(key.to_owned()).await?
            && row.mtime == fingerprint.mtime
            && row.btime == fingerprint.btime
            && row.mode == fingerprint.mode
            && row.size == fingerprint.size
        {
            tracing::trace!("skipping unchanged file '{}'", path.display());
            self.stat_size.fetch_add(fingerprint.size, Ordering::Relaxed);
            return Ok(FileOutcome::Stored {
                hash: Hash::from_bytes(row.hash),
                size: fingerprint.size,
            });
        }

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::warn!("failed to open '{}': {err}", path.display());
                return Ok(FileOutcome::Unreadable);
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!("storing file '{}'", path.display());

        // A few big files at a time get a buffer sized for their whole
        // content; everyone else chunks through a small one.
        let big_permit = self.big_limit.clone().try_acquire_owned().ok();
        let capacity = if big_permit.is_some() {
            (fingerprint.size.max(0) as usize).clamp(CHUNK_MAX, FILE_BIG_SIZE)
        } else {
            FILE_DEFAULT_SIZE
        };

        let mut splitter = Splitter::new(CHUNK_AVERAGE, CHUNK_MIN, CHUNK_MAX, self.salt8);
        let mut fill = vec![0u8; capacity];
        let mut filled = 0usize;
        let mut eof = false;

        let mut chunks: Vec<Option<ChunkRef>> = Vec::new();
        let mut file_size = 0i64;
        let mut file_written = 0i64;

        while !(eof && filled == 0) {
            while filled < capacity && !eof {
                let read = file.read(&mut fill[filled..]).await?;
                if read == 0 {
                    eof = true;
                } else {
                    filled += read;
                    file_size += read as i64;
                }
            }

            // Cut chunks and upload them in parallel; the entry list is
            // indexed by chunk ordinal so completion order does not matter.
            let mut set: JoinSet<Result<(usize, ChunkRef, u64)>> = JoinSet::new();

            let consumed = splitter.process(&fill[..filled], eof, |index, offset, chunk| {
                debug_assert_eq!(index, chunks.len());
                chunks.push(None);

                let data = Bytes::copy_from_slice(chunk);
                let ctx = Arc::clone(&self);

                set.spawn(async move {
                    let _permit = ctx
                        .chunk_limit
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(anyhow::Error::from)?;

                    let hash = hash_blob(&ctx.salt, BlobType::Chunk, &data);
                    let entry = ChunkRef {
                        hash,
                        offset: offset as i64,
                        len: data.len() as i32,
                    };

                    let written = ctx.repo.write_blob(hash, BlobType::Chunk, data).await?;
                    Ok((index, entry, written))
                });
            });

            let mut first_error: Option<Error> = None;
            while let Some(joined) = set.join_next().await {
                match joined.map_err(Error::from).and_then(|res| res) {
                    Ok((index, entry, written)) => {
                        chunks[index] = Some(entry);
                        file_written += written as i64;
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }

            fill.copy_within(consumed..filled, 0);
            filled -= consumed;
        }

        let chunks: Vec<ChunkRef> = chunks
            .into_iter()
            .map(|chunk| chunk.ok_or_else(|| Error::Other(anyhow::anyhow!("missing chunk"))))
            .collect::<Result<_>>()?;

        // A single-chunk file is stored as the chunk itself.
        let hash = if chunks.len() == 1 {
            chunks[0].hash
        } else {
            let mut body = Vec::with_capacity(chunks.len() * ChunkRef::SIZE + 8);
            for chunk in &chunks {
                chunk.encode(&mut body);
            }
            body.extend_from_slice(&file_size.to_le_bytes());

            let hash = hash_blob(&self.salt, BlobType::File, &body);
            let written = self
                .repo
                .write_blob(hash, BlobType::File, Bytes::from(body))
                .await?;
            file_written += written as i64;
            hash
        };

        self.stat_size.fetch_add(file_size, Ordering::Relaxed);
        self.stat_written.fetch_add(file_written, Ordering::Relaxed);

        Ok(FileOutcome::Stored {
            hash,
            size: file_size,
        })
    }

    async fn put_link(self: &Arc<Self>, path: PathBuf) -> Result<Option<Hash>> {
        use std::os::unix::ffi::OsStrExt;

        let _walk = self
            .walk_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(anyhow::Error::from)?;

        let target = match tokio::fs::read_link(&path).await {
            Ok(target) => target,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::warn!("failed to read symbolic link '{}': {err}", path.display());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let bytes = target.as_os_str().as_bytes();
        let hash = hash_blob(&self.salt, BlobType::Link, bytes);
        let written = self
            .repo
            .write_blob(hash, BlobType::Link, Bytes::copy_from_slice(bytes))
            .await?;

        self.stat_size.fetch_add(bytes.len() as i64, Ordering::Relaxed);
        self.stat_written.fetch_add(written as i64, Ordering::Relaxed);

        Ok(Some(hash))
    }
}

impl Repository {
    /// Ingests the given source paths into the repository.
    ///
    /// Unless `raw` is requested, a snapshot blob referencing every source is
    /// written and a tag object published for it.
    pub async fn put(&self, settings: &PutSettings, sources: &[PathBuf]) -> Result<PutOutcome> {
        self.require_write()?;

        if sources.is_empty() {
            return Err(Error::InvalidInput("no source to back up".to_owned()));
        }
        if settings.raw {
            if settings.name.is_some() {
                return Err(Error::InvalidInput(
                    "cannot use snapshot name in raw mode".to_owned(),
                ));
            }
            if sources.len() != 1 {
                return Err(Error::InvalidInput(
                    "only one object can be saved in raw mode".to_owned(),
                ));
            }
        } else {
            let name = settings.name.as_deref().unwrap_or_default();
            if name.is_empty() {
                return Err(Error::InvalidInput("snapshot name cannot be empty".to_owned()));
            }
            if name.len() >= SNAPSHOT_NAME_SIZE {
                return Err(Error::InvalidInput(format!(
                    "snapshot name '{name}' is too long (limit is {} bytes)",
                    SNAPSHOT_NAME_SIZE - 1
                )));
            }
        }

        let ctx = PutContext::new(self.clone(), settings.follow_symlinks)?;

        // One record per requested source, under its absolute path with the
        // root separator stripped.
        let mut records: Vec<EntryRecord> = Vec::new();

        for source in sources {
            let absolute = std::path::absolute(source)?;
            let name = absolute
                .to_str()
                .ok_or_else(|| {
                    Error::InvalidInput(format!("path '{}' is not valid UTF-8", source.display()))
                })?
                .trim_start_matches('/')
                .to_owned();
            if name.is_empty() {
                return Err(Error::InvalidInput(
                    "cannot back up the filesystem root".to_owned(),
                ));
            }

            let meta = tokio::fs::metadata(&absolute).await?;
            let mut entry = EntryRecord::new(EntryKind::Unknown, name);
            fill_entry_metadata(&mut entry, &meta);

            if meta.is_dir() {
                entry.kind = EntryKind::Directory;

                let outcome = ctx.put_directory(absolute.clone()).await?;
                if !outcome.readable {
                    return Err(Error::InvalidInput(format!(
                        "cannot enumerate '{}'",
                        absolute.display()
                    )));
                }
                entry.hash = outcome.hash;
                entry.size = outcome.subdirs;
                entry.flags |= ENTRY_READABLE;

                ctx.stat_entries
                    .fetch_add(1 + outcome.entries, Ordering::Relaxed);
            } else if meta.is_file() {
                entry.kind = EntryKind::File;
                entry.size = meta.len() as i64;

                let fingerprint = fingerprint_of(&entry);
                match Arc::clone(&ctx).put_file(absolute.clone(), fingerprint).await? {
                    FileOutcome::Stored { hash, .. } => {
                        entry.hash = hash;
                        entry.flags |= ENTRY_READABLE;

                        if let Some(cache) = self.cache()
                            && let Some(key) = absolute.to_str()
                        {
                            cache
                                .put_stats(vec![(
                                    key.to_owned(),
                                    StatRow {
                                        mtime: entry.mtime,
                                        btime: entry.btime,
                                        mode: entry.mode,
                                        size: entry.size,
                                        hash: *entry.hash.as_bytes(),
                                    },
                                )])
                                .await?;
                        }
                    }
                    FileOutcome::Unreadable => {
                        return Err(Error::InvalidInput(format!(
                            "cannot read '{}'",
                            absolute.display()
                        )));
                    }
                }
            } else {
                return Err(Error::InvalidInput(format!(
                    "cannot back up special file '{}'",
                    absolute.display()
                )));
            }

            records.push(entry);
        }

        let total_size = ctx.stat_size.load(Ordering::Relaxed);
        let total_written = ctx.stat_written.load(Ordering::Relaxed);
        let total_entries = ctx.stat_entries.load(Ordering::Relaxed);

        if settings.raw {
            return Ok(PutOutcome {
                hash: records[0].hash,
                size: total_size,
                written: total_written,
            });
        }

        // Seal the run: snapshot blob plus tag object.
        let header = SnapshotHeader {
            time: unix_time_millis(),
            name: settings.name.clone().unwrap_or_default(),
            size: total_size,
            storage: total_written,
        };

        let mut body = Vec::new();
        header.encode(&mut body)?;
        DirectoryHeader {
            size: total_size,
            entries: total_entries,
        }
        .encode(&mut body);
        for record in &records {
            record.encode(&mut body);
        }
        body.extend_from_slice(&total_size.to_le_bytes());

        let hash = hash_blob(&ctx.salt, BlobType::Snapshot, &body);
        let payload_len = header.tag_payload_len();
        let payload = body[..payload_len].to_vec();

        let mut written = total_written;
        written += self
            .write_blob(hash, BlobType::Snapshot, Bytes::from(body))
            .await? as i64;
        written += self.write_tag(hash, &payload).await? as i64;

        Ok(PutOutcome {
            hash,
            size: total_size,
            written,
        })
    }
}
