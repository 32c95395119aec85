//! End-to-end put/get scenarios over the in-memory store.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{WRITE_PWD, init_repo, restored_root, write_tree};
use filetime::FileTime;
use futures::StreamExt;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use rekkord_core::format::{BlobType, hash_blob};
use rekkord_core::layout;
use rekkord_core::store::Store;
use rekkord_repo::{
    DEFAULT_USER, Error, GetSettings, ListSettings, ObjectKind, PutSettings,
};
use tempfile::TempDir;

fn snapshot_settings(name: &str) -> PutSettings {
    PutSettings {
        name: Some(name.to_owned()),
        ..PutSettings::default()
    }
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn empty_file_snapshot() {
    let test = init_repo(0).await;
    let source = write_tree(&[("empty", b"")]);

    let outcome = test
        .repo
        .put(&snapshot_settings("s"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // Directory blob, empty File blob and snapshot blob; no chunks.
    assert_eq!(test.store.count("blobs/"), 3);
    assert_eq!(test.store.count("tags/"), 1);

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    let restored = test
        .repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    assert_eq!(restored, 0);
    let restored_file = restored_root(&out, source.path()).join("empty");
    assert_eq!(std::fs::metadata(&restored_file).unwrap().len(), 0);
}

#[tokio::test]
async fn single_chunk_file_shares_the_chunk_hash() {
    let test = init_repo(0).await;
    let content = b"hello, world\n";
    let source = write_tree(&[("hello.txt", content)]);

    let outcome = test
        .repo
        .put(&snapshot_settings("s2"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // The file is stored as its only chunk, no File blob in between.
    let salt = test.repo.salt().unwrap();
    let chunk_hash = hash_blob(&salt, BlobType::Chunk, content);
    assert_eq!(test.store.count(&layout::blob(&chunk_hash)), 1);
    assert_eq!(test.store.count("blobs/"), 3);

    let objects = test
        .repo
        .list(outcome.hash, &ListSettings { max_depth: -1 })
        .await
        .unwrap();
    let file = objects
        .iter()
        .find(|object| object.kind == ObjectKind::File)
        .unwrap();
    assert_eq!(file.hash, chunk_hash);

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let restored_file = restored_root(&out, source.path()).join("hello.txt");
    assert_eq!(std::fs::read(&restored_file).unwrap(), content);
}

#[tokio::test]
async fn multi_chunk_file_round_trip() {
    let test = init_repo(0).await;
    let content = random_bytes(10 * 1024 * 1024, 0x5EED);
    let source = write_tree(&[("big.bin", &content)]);

    let outcome = test
        .repo
        .put(&snapshot_settings("big"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // 10 MiB of incompressible data must split into several chunks, so the
    // store holds chunks + File blob + directory + snapshot.
    assert!(
        test.store.count("blobs/") > 4,
        "expected several chunk blobs, got {}",
        test.store.count("blobs/")
    );
    assert!(outcome.size as usize >= content.len());

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    let restored = test
        .repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();
    assert_eq!(restored as usize, content.len());

    let restored_file = restored_root(&out, source.path()).join("big.bin");
    assert_eq!(std::fs::read(&restored_file).unwrap(), content);
}

#[tokio::test]
async fn identical_files_are_deduplicated() {
    let test = init_repo(0).await;
    let content = random_bytes(2 * 1024 * 1024, 42);
    let source = write_tree(&[("a/file", &content), ("b/file", &content)]);

    let outcome = test
        .repo
        .put(&snapshot_settings("s4"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let objects = test
        .repo
        .list(outcome.hash, &ListSettings { max_depth: -1 })
        .await
        .unwrap();
    let files: Vec<_> = objects
        .iter()
        .filter(|object| object.kind == ObjectKind::File)
        .collect();

    assert_eq!(files.len(), 2);
    assert_eq!(
        files[0].hash, files[1].hash,
        "identical contents must share one stored object"
    );

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let root = restored_root(&out, source.path());
    assert_eq!(std::fs::read(root.join("a/file")).unwrap(), content);
    assert_eq!(std::fs::read(root.join("b/file")).unwrap(), content);
}

#[tokio::test]
async fn raw_put_is_idempotent_and_writes_nothing_new() {
    let test = init_repo(0).await;
    let source = write_tree(&[
        ("docs/readme.txt", b"read me".as_slice()),
        ("data.bin", &random_bytes(3 * 1024 * 1024, 7)),
    ]);

    let raw = PutSettings {
        raw: true,
        ..PutSettings::default()
    };

    let first = test
        .repo
        .put(&raw, &[source.path().to_path_buf()])
        .await
        .unwrap();
    let blobs_after_first = test.store.count("blobs/");
    assert!(first.written > 0);

    let second = test
        .repo
        .put(&raw, &[source.path().to_path_buf()])
        .await
        .unwrap();

    assert_eq!(second.hash, first.hash);
    assert_eq!(second.written, 0, "second run must deduplicate everything");
    assert_eq!(test.store.count("blobs/"), blobs_after_first);
    assert_eq!(test.store.count("tags/"), 0, "raw mode writes no tag");
}

#[tokio::test]
async fn raw_mode_input_validation() {
    let test = init_repo(0).await;
    let source = write_tree(&[("f", b"x")]);
    let path = source.path().to_path_buf();

    let named_raw = PutSettings {
        raw: true,
        name: Some("nope".to_owned()),
        ..PutSettings::default()
    };
    assert!(matches!(
        test.repo.put(&named_raw, &[path.clone()]).await.unwrap_err(),
        Error::InvalidInput(_)
    ));

    let raw = PutSettings {
        raw: true,
        ..PutSettings::default()
    };
    assert!(matches!(
        test.repo
            .put(&raw, &[path.clone(), path.clone()])
            .await
            .unwrap_err(),
        Error::InvalidInput(_)
    ));

    assert!(matches!(
        test.repo
            .put(&PutSettings::default(), &[path])
            .await
            .unwrap_err(),
        Error::InvalidInput(_)
    ));
}

#[tokio::test]
async fn write_only_ingest_full_restore() {
    let test = init_repo(0).await;
    let content = random_bytes(64 * 1024, 3);
    let source = write_tree(&[("x/data.bin", &content)]);

    test.repo.lock();
    test.repo.authenticate(DEFAULT_USER, WRITE_PWD).await.unwrap();

    let outcome = test
        .repo
        .put(&snapshot_settings("wo"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // The write key alone cannot open anything again.
    assert!(matches!(
        test.repo.read_blob(outcome.hash).await.unwrap_err(),
        Error::AccessDenied
    ));
    assert!(matches!(
        test.repo.snapshots().await.unwrap_err(),
        Error::AccessDenied
    ));

    test.repo.lock();
    test.repo
        .authenticate(DEFAULT_USER, common::FULL_PWD)
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let restored_file = restored_root(&out, source.path()).join("x/data.bin");
    assert_eq!(std::fs::read(&restored_file).unwrap(), content);
}

#[tokio::test]
async fn tampered_blob_fails_restore() {
    let test = init_repo(0).await;
    let source = write_tree(&[
        ("a.txt", b"alpha".as_slice()),
        ("b/большой.bin", &random_bytes(100 * 1024, 9)),
    ]);

    let outcome = test
        .repo
        .put(&snapshot_settings("s6"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // A clean restore works.
    let dest = TempDir::new().unwrap();
    test.repo
        .get(outcome.hash, &GetSettings::default(), &dest.path().join("ok"))
        .await
        .unwrap();

    // Flip one bit inside the cipher stream of any stored blob: every blob
    // written by this snapshot is on the restore path.
    let mut keys: Vec<String> = test
        .store
        .list("blobs/")
        .await
        .unwrap()
        .map(|key| key.unwrap())
        .collect()
        .await;
    keys.sort();
    test.store.flip_bit(&keys[0], 110);

    let err = test
        .repo
        .get(outcome.hash, &GetSettings::default(), &dest.path().join("bad"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Corruption(_)),
        "expected corruption, got {err:?}"
    );
}

#[tokio::test]
async fn cache_contradicted_by_missing_blob_aborts() {
    let test = init_repo(100).await;
    let content = b"cache guard probe";
    let source = write_tree(&[("probe", content)]);

    test.repo
        .put(&snapshot_settings("first"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    // Delete the probe's chunk behind the repository's back, then touch the
    // source so the next run re-chunks it.
    let salt = test.repo.salt().unwrap();
    let chunk_hash = hash_blob(&salt, BlobType::Chunk, content);
    test.store.remove_quietly(&layout::blob(&chunk_hash));

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(source.path().join("probe"), content).unwrap();

    let err = test
        .repo
        .put(&snapshot_settings("second"), &[source.path().to_path_buf()])
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::CacheInconsistent),
        "expected the data-loss guard, got {err:?}"
    );
    assert_eq!(test.store.count("tags/"), 1, "no tag for the aborted run");
}

#[tokio::test]
async fn metadata_survives_the_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let test = init_repo(0).await;
    let source = write_tree(&[("script.sh", b"#!/bin/sh\n".as_slice())]);

    let file = source.path().join("script.sh");
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o750)).unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

    let outcome = test
        .repo
        .put(&snapshot_settings("meta"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let restored_file = restored_root(&out, source.path()).join("script.sh");
    let meta = std::fs::metadata(&restored_file).unwrap();

    assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
    let mtime = FileTime::from_last_modification_time(&meta);
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);
}

#[tokio::test]
async fn symlinks_round_trip_as_links() {
    let test = init_repo(0).await;
    let source = write_tree(&[("file.txt", b"content".as_slice())]);
    std::os::unix::fs::symlink("file.txt", source.path().join("link")).unwrap();

    let outcome = test
        .repo
        .put(&snapshot_settings("links"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let objects = test
        .repo
        .list(outcome.hash, &ListSettings { max_depth: -1 })
        .await
        .unwrap();
    let link = objects
        .iter()
        .find(|object| object.kind == ObjectKind::Link)
        .unwrap();
    assert_eq!(link.link_target.as_deref(), Some("file.txt"));

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let restored_link = restored_root(&out, source.path()).join("link");
    let target = std::fs::read_link(&restored_link).unwrap();
    assert_eq!(target, PathBuf::from("file.txt"));
}

#[tokio::test]
async fn unreadable_entries_keep_the_snapshot_going() {
    let test = init_repo(0).await;
    let source = write_tree(&[("ok.txt", b"fine".as_slice())]);

    // A dangling symlink is storable: the link blob records the literal
    // target, whether or not it resolves.
    std::os::unix::fs::symlink("nowhere", source.path().join("dangling")).unwrap();

    let outcome = test
        .repo
        .put(&snapshot_settings("partial"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    test.repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    let root = restored_root(&out, source.path());
    assert_eq!(std::fs::read(root.join("ok.txt")).unwrap(), b"fine");
    assert_eq!(
        std::fs::read_link(root.join("dangling")).unwrap(),
        PathBuf::from("nowhere")
    );
}

#[tokio::test]
async fn snapshots_are_listed_and_located_by_name() {
    let test = init_repo(0).await;
    let source = write_tree(&[("f", b"1")]);

    let first = test
        .repo
        .put(&snapshot_settings("nightly"), &[source.path().to_path_buf()])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    std::fs::write(source.path().join("f"), b"22").unwrap();
    let second = test
        .repo
        .put(&snapshot_settings("weekly"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let snapshots = test.repo.snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0].time <= snapshots[1].time);

    let names: Vec<&str> = snapshots
        .iter()
        .map(|snapshot| snapshot.name.as_str())
        .collect();
    assert!(names.contains(&"nightly"));
    assert!(names.contains(&"weekly"));

    assert_eq!(test.repo.locate("weekly").await.unwrap(), second.hash);
    assert_eq!(
        test.repo.locate(&first.hash.to_hex()).await.unwrap(),
        first.hash
    );
    assert!(matches!(
        test.repo.locate("never-taken").await.unwrap_err(),
        Error::NotFound
    ));
}

#[tokio::test]
async fn restore_refuses_nonempty_destination_without_force() {
    let test = init_repo(0).await;
    let source = write_tree(&[("f", b"data")]);

    let outcome = test
        .repo
        .put(&snapshot_settings("s"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("out");
    std::fs::create_dir(&out).unwrap();
    std::fs::write(out.join("occupied"), b"already here").unwrap();

    assert!(matches!(
        test.repo
            .get(outcome.hash, &GetSettings::default(), &out)
            .await
            .unwrap_err(),
        Error::InvalidInput(_)
    ));

    let force = GetSettings {
        force: true,
        ..GetSettings::default()
    };
    test.repo.get(outcome.hash, &force, &out).await.unwrap();
    let restored_file = restored_root(&out, source.path()).join("f");
    assert_eq!(std::fs::read(&restored_file).unwrap(), b"data");
}

#[tokio::test]
async fn raw_single_file_restores_to_a_file() {
    let test = init_repo(0).await;
    let content = random_bytes(128 * 1024, 77);
    let source = write_tree(&[("single.bin", &content)]);

    let raw = PutSettings {
        raw: true,
        ..PutSettings::default()
    };
    let outcome = test
        .repo
        .put(&raw, &[source.path().join("single.bin")])
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let out = dest.path().join("restored.bin");
    let restored = test
        .repo
        .get(outcome.hash, &GetSettings::default(), &out)
        .await
        .unwrap();

    assert_eq!(restored as usize, content.len());
    assert_eq!(std::fs::read(&out).unwrap(), content);
}

#[tokio::test]
async fn list_respects_max_depth() {
    let test = init_repo(0).await;
    let source = write_tree(&[("top/mid/leaf.txt", b"leaf".as_slice())]);

    let outcome = test
        .repo
        .put(&snapshot_settings("deep"), &[source.path().to_path_buf()])
        .await
        .unwrap();

    let shallow = test
        .repo
        .list(outcome.hash, &ListSettings { max_depth: 1 })
        .await
        .unwrap();
    assert!(
        shallow
            .iter()
            .all(|object| object.kind != ObjectKind::File),
        "depth 1 must stop above the leaf file"
    );

    let deep = test
        .repo
        .list(outcome.hash, &ListSettings { max_depth: -1 })
        .await
        .unwrap();
    let leaf = deep
        .iter()
        .find(|object| object.kind == ObjectKind::File)
        .unwrap();
    assert_eq!(leaf.name.as_deref(), Some("leaf.txt"));
    assert_eq!(leaf.size, 4);
}
