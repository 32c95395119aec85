//! Snapshot enumeration and hierarchical object listing.

use futures::StreamExt;
use futures::future::BoxFuture;
use rekkord_core::format::{
    BlobType, EntryKind, EntryRecord, SnapshotHeader, parse_directory, parse_tag_payload,
};
use rekkord_core::hash::Hash;

use crate::error::{Error, Result};
use crate::repository::Repository;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Name of the tag object referencing this snapshot.
    pub tag: String,
    pub hash: Hash,
    pub name: String,
    /// Milliseconds since the epoch.
    pub time: i64,
    /// Plaintext bytes covered by the snapshot.
    pub size: i64,
    /// Ciphertext bytes uploaded when the snapshot was taken.
    pub storage: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListSettings {
    /// Directory recursion depth; 0 lists the first level only, negative
    /// values recurse without limit.
    pub max_depth: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Snapshot,
    Directory,
    File,
    Link,
    Unknown,
}

/// One listed object, flattened in depth-first order.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub hash: Hash,
    pub depth: i32,
    pub kind: ObjectKind,
    /// None for the synthetic snapshot root.
    pub name: Option<String>,
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub readable: bool,
    /// Ciphertext bytes, snapshots only.
    pub storage: i64,
    /// Direct children, directories and snapshots only.
    pub children: i64,
    /// Resolved target, links only.
    pub link_target: Option<String>,
}

fn object_from_entry(entry: &EntryRecord, depth: i32) -> ObjectInfo {
    ObjectInfo {
        hash: entry.hash,
        depth,
        kind: match entry.kind {
            EntryKind::Directory => ObjectKind::Directory,
            EntryKind::File => ObjectKind::File,
            EntryKind::Link => ObjectKind::Link,
            EntryKind::Unknown => ObjectKind::Unknown,
        },
        name: Some(entry.name.clone()),
        mtime: entry.mtime,
        btime: entry.btime,
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        size: entry.size,
        readable: entry.is_readable(),
        storage: 0,
        children: 0,
        link_target: None,
    }
}

fn recurse_entries(
    repo: Repository,
    settings: ListSettings,
    body: Vec<u8>,
    allow_separators: bool,
    depth: i32,
) -> BoxFuture<'static, Result<Vec<ObjectInfo>>> {
    Box::pin(async move {
        let (_, entries) = parse_directory(&body, allow_separators)?;
        let limit = repo.task_limit();

        // One sub-listing per entry, resolved concurrently but collected in
        // enumeration order.
        let listings = futures::stream::iter(entries.into_iter().map(|entry| {
            let repo = repo.clone();

            async move {
                let mut object = object_from_entry(&entry, depth);
                let mut children: Vec<ObjectInfo> = Vec::new();

                match entry.kind {
                    EntryKind::Directory if entry.is_readable() => {
                        let (ty, blob) = repo.read_blob(entry.hash).await?;
                        if ty != BlobType::Directory {
                            return Err(Error::Corruption(format!(
                                "blob '{}' is not a Directory",
                                entry.hash
                            )));
                        }

                        if settings.max_depth < 0 || depth < settings.max_depth {
                            children = recurse_entries(
                                repo.clone(),
                                settings,
                                blob,
                                false,
                                depth + 1,
                            )
                            .await?;
                            object.children = children
                                .iter()
                                .filter(|child| child.depth == depth + 1)
                                .count() as i64;
                        }
                    }
                    EntryKind::Link if entry.is_readable() => {
                        object.link_target = Some(repo.read_link(entry.hash).await?);
                    }
                    _ => {}
                }

                let mut objects = Vec::with_capacity(1 + children.len());
                objects.push(object);
                objects.extend(children);
                Ok(objects)
            }
        }))
        .buffered(limit)
        .collect::<Vec<Result<Vec<ObjectInfo>>>>()
        .await;

        let mut objects = Vec::new();
        for listing in listings {
            objects.extend(listing?);
        }
        Ok(objects)
    })
}

impl Repository {
    /// Lists every snapshot in the repository, sorted by time.
    pub async fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let tags = self.list_tags().await?;
        let limit = self.task_limit();

        let snapshots: Vec<Option<SnapshotInfo>> = futures::stream::iter(tags.into_iter().map(
            |tag| {
                let repo = self.clone();

                async move {
                    let (_time, name) = match parse_tag_payload(&tag.payload) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::error!("malformed tag '{}' ({err}), ignoring", tag.name);
                            return None;
                        }
                    };

                    match repo.read_blob(tag.hash).await {
                        Ok((BlobType::Snapshot, blob)) => match SnapshotHeader::decode(&blob) {
                            Ok(header) => Some(SnapshotInfo {
                                tag: tag.name,
                                hash: tag.hash,
                                name: header.name,
                                time: header.time,
                                size: header.size,
                                storage: header.storage + blob.len() as i64,
                            }),
                            Err(err) => {
                                tracing::error!(
                                    "malformed snapshot blob '{}' ({err}), ignoring",
                                    tag.hash
                                );
                                None
                            }
                        },
                        Ok((ty, _)) => {
                            tracing::error!(
                                "blob '{}' is not a Snapshot but a {} (ignoring)",
                                tag.hash,
                                ty.name()
                            );
                            None
                        }
                        Err(err) => {
                            tracing::error!(
                                "failed to read snapshot '{name}' ({err}), ignoring"
                            );
                            None
                        }
                    }
                }
            },
        ))
        .buffer_unordered(limit)
        .collect()
        .await;

        let mut snapshots: Vec<SnapshotInfo> = snapshots.into_iter().flatten().collect();
        snapshots.sort_by_key(|snapshot| snapshot.time);

        Ok(snapshots)
    }

    /// Recursively lists the objects under a Snapshot or Directory blob.
    pub async fn list(&self, hash: Hash, settings: &ListSettings) -> Result<Vec<ObjectInfo>> {
        let (ty, blob) = self.read_blob(hash).await?;

        match ty {
            BlobType::Directory => {
                recurse_entries(self.clone(), *settings, blob, false, 0).await
            }
            BlobType::Snapshot => {
                if blob.len() <= SnapshotHeader::SIZE {
                    return Err(Error::Corruption(format!("malformed snapshot blob '{hash}'")));
                }
                let header = SnapshotHeader::decode(&blob)?;
                let body = blob[SnapshotHeader::SIZE..].to_vec();

                let children =
                    recurse_entries(self.clone(), *settings, body, true, 1).await?;

                let mut objects = Vec::with_capacity(1 + children.len());
                objects.push(ObjectInfo {
                    hash,
                    depth: 0,
                    kind: ObjectKind::Snapshot,
                    name: (!header.name.is_empty()).then_some(header.name),
                    mtime: header.time,
                    btime: header.time,
                    mode: 0,
                    uid: 0,
                    gid: 0,
                    size: header.size,
                    readable: true,
                    storage: header.storage,
                    children: children.iter().filter(|child| child.depth == 1).count() as i64,
                    link_target: None,
                });
                objects.extend(children);

                Ok(objects)
            }
            other => Err(Error::InvalidInput(format!(
                "expected Snapshot or Directory blob, not {}",
                other.name()
            ))),
        }
    }

    /// Reads a Link blob and returns its target.
    pub async fn read_link(&self, hash: Hash) -> Result<String> {
        let (ty, blob) = self.read_blob(hash).await?;
        if ty != BlobType::Link {
            return Err(Error::Corruption(format!("blob '{hash}' is not a Link")));
        }

        String::from_utf8(blob)
            .map_err(|_| Error::Corruption(format!("link target of '{hash}' is not UTF-8")))
    }

    /// Resolves an identifier to a root hash: a full hex hash, or the name
    /// of the most recent snapshot carrying it.
    pub async fn locate(&self, identifier: &str) -> Result<Hash> {
        if let Ok(hash) = identifier.parse::<Hash>() {
            return Ok(hash);
        }

        let snapshots = self.snapshots().await?;
        snapshots
            .into_iter()
            .rev()
            .find(|snapshot| snapshot.name == identifier)
            .map(|snapshot| snapshot.hash)
            .ok_or(Error::NotFound)
    }
}
