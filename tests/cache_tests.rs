#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::time::Duration;

use bytes::Bytes;
use mount0::fs::cache::{CachePolicy, CacheProvider};
use mount0::fs::{FsError, OpenFlags, Provider, ROOT_INO, SetAttr};

use common::{FaultyProvider, dyn_of, memory, page_plus, read_at, write_file};

async fn content(provider: &dyn Provider, name: &str) -> Vec<u8> {
    let stat = provider.lookup(ROOT_INO, OsStr::new(name)).await.unwrap();
    let size = u32::try_from(stat.size).unwrap();
    read_at(provider, stat.ino, 0, size.max(1)).await.unwrap().to_vec()
}

/// Poll until `name` on `provider` holds `expected`, or panic after a second.
async fn eventually(provider: &dyn Provider, name: &str, expected: &[u8]) {
    for _ in 0..200 {
        if content(provider, name).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{name} never became {expected:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_through_lands_on_both_tiers() {
    let master = memory();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);

    write_file(&cache, ROOT_INO, "f", b"through").await;

    assert_eq!(content(master.as_ref(), "f").await, b"through");
    assert_eq!(content(slave.as_ref(), "f").await, b"through");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_back_acknowledges_once_the_slave_has_it() {
    let master = FaultyProvider::new();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteBack);

    let created = cache
        .create(ROOT_INO, OsStr::new("f"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    master.fail_writes(true);

    let written = cache
        .write(created.stat.ino, created.fh, 0, Bytes::from_static(b"later"))
        .await
        .unwrap();
    assert_eq!(written, 5, "the failing master does not hold up the caller");

    let back = cache.read(created.stat.ino, created.fh, 0, 5).await.unwrap();
    assert_eq!(&back[..], b"later");
    assert_eq!(content(slave.as_ref(), "f").await, b"later");
    cache.release(created.stat.ino, created.fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_drains_deferred_master_writes() {
    let master = memory();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteBack);

    write_file(&cache, ROOT_INO, "f", b"deferred").await;

    assert_eq!(content(master.as_ref(), "f").await, b"deferred");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_writes_reach_the_master_in_order() {
    let master = memory();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteBack);

    let created = cache
        .create(ROOT_INO, OsStr::new("f"), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    for chunk in [&b"aaaaaaaa"[..], b"bbbbbb", b"cccc", b"dd"] {
        cache
            .write(created.stat.ino, created.fh, 0, Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
    }
    cache.flush(created.stat.ino, created.fh, 0).await.unwrap();

    assert_eq!(content(master.as_ref(), "f").await, b"ddccbbaa");
    cache.release(created.stat.ino, created.fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_slave_read_falls_back_and_repopulates() {
    let master = memory();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);

    let stat = write_file(&cache, ROOT_INO, "f", b"authoritative").await;
    let slave_copy = slave.lookup(ROOT_INO, OsStr::new("f")).await.unwrap();
    slave
        .setattr(slave_copy.ino, None, SetAttr::truncate(0))
        .await
        .unwrap();

    // Keep the handle open: the slave is refilled through it in the background.
    let fh = cache.open(stat.ino, OpenFlags::RDONLY).await.unwrap();
    let back = cache.read(stat.ino, fh, 0, 13).await.unwrap();
    assert_eq!(&back[..], b"authoritative");
    eventually(slave.as_ref(), "f", b"authoritative").await;
    cache.release(stat.ino, fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_slave_is_bypassed_on_read() {
    let master = memory();
    let slave = FaultyProvider::new();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);

    let stat = write_file(&cache, ROOT_INO, "f", b"from master").await;
    slave.fail_reads(true);

    let back = read_at(&cache, stat.ino, 0, 11).await.unwrap();
    assert_eq!(&back[..], b"from master");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entries_only_on_the_master_are_visible() {
    let master = memory();
    let slave = memory();
    write_file(master.as_ref(), ROOT_INO, "cold", b"not cached").await;
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);

    let stat = cache.lookup(ROOT_INO, OsStr::new("cold")).await.unwrap();
    assert_eq!(stat.size, 10);
    let back = read_at(&cache, stat.ino, 0, 10).await.unwrap();
    assert_eq!(&back[..], b"not cached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_failure_fails_the_mutation() {
    let master = FaultyProvider::new();
    let slave = memory();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);
    master.fail_writes(true);

    let err = cache
        .mkdir(ROOT_INO, OsStr::new("d"), 0o755)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::IoFailure(_)), "got {err:?}");
    assert!(matches!(
        slave.lookup(ROOT_INO, OsStr::new("d")).await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_readdirplus_hands_back_skipped_lookups() {
    let master = FaultyProvider::new();
    let slave = FaultyProvider::new();
    let cache = CacheProvider::new(dyn_of(&master), dyn_of(&slave), CachePolicy::WriteThrough);
    for name in ["a", "b", "c"] {
        let stat = write_file(&cache, ROOT_INO, name, b"x").await;
        cache.forget(stat.ino, 1).await;
    }

    assert_eq!(page_plus(&cache, ROOT_INO, 2).await, vec![OsString::from("c")]);
    assert_eq!(master.outstanding_lookups(), 0);
    assert_eq!(slave.outstanding_lookups(), 0);
}
