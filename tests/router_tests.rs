#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use mount0::fs::router::RouterProvider;
use mount0::fs::{FsError, Provider as _, ROOT_INO};

use common::{FaultyProvider, dyn_of, memory, names, page_plus, read_at, write_file};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_mount_shadows_same_named_entry() {
    let a = memory();
    let b = memory();
    write_file(a.as_ref(), ROOT_INO, "notes.txt", b"from a").await;
    a.mkdir(ROOT_INO, OsStr::new("archive"), 0o755).await.unwrap();
    write_file(b.as_ref(), ROOT_INO, "old.txt", b"from b").await;

    let router = RouterProvider::new();
    router.handle("/", dyn_of(&a)).unwrap();
    router.handle("/archive", dyn_of(&b)).unwrap();

    assert_eq!(
        names(&router, ROOT_INO).await,
        vec![OsString::from("archive"), OsString::from("notes.txt")],
        "the root lists each name once"
    );

    let archive = router.lookup(ROOT_INO, OsStr::new("archive")).await.unwrap();
    assert!(archive.is_dir());
    assert_eq!(names(&router, archive.ino).await, vec![OsString::from("old.txt")]);

    let old = router.lookup(archive.ino, OsStr::new("old.txt")).await.unwrap();
    let data = read_at(&router, old.ino, 0, 64).await.unwrap();
    assert_eq!(&data[..], b"from b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn intermediate_segments_are_synthetic_directories() {
    let deep = memory();
    write_file(deep.as_ref(), ROOT_INO, "leaf", b"x").await;

    let router = RouterProvider::new();
    router.handle("/mnt/data/deep", dyn_of(&deep)).unwrap();

    assert_eq!(names(&router, ROOT_INO).await, vec![OsString::from("mnt")]);
    let mnt = router.lookup(ROOT_INO, OsStr::new("mnt")).await.unwrap();
    assert!(mnt.is_dir());
    let data = router.lookup(mnt.ino, OsStr::new("data")).await.unwrap();
    let deep_dir = router.lookup(data.ino, OsStr::new("deep")).await.unwrap();
    assert_eq!(names(&router, deep_dir.ino).await, vec![OsString::from("leaf")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn longest_prefix_wins() {
    let a = memory();
    let b = memory();
    let router = RouterProvider::new();
    router.handle("/", dyn_of(&a)).unwrap();
    router.handle("/archive/", dyn_of(&b)).unwrap();

    assert_eq!(
        router.mount_paths(),
        vec![PathBuf::from("/archive"), PathBuf::from("/")]
    );
    let (_, mounted_at) = router.resolve_path("/archive/2019/x.txt").unwrap();
    assert_eq!(mounted_at, PathBuf::from("/archive"));
    let (_, mounted_at) = router.resolve_path("/archived").unwrap();
    assert_eq!(mounted_at, PathBuf::from("/"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_relative_mounts_are_rejected() {
    let router = RouterProvider::new();
    router.handle("/data", dyn_of(&memory())).unwrap();

    assert!(matches!(
        router.handle("/data/", dyn_of(&memory())),
        Err(FsError::AlreadyExists)
    ));
    assert!(matches!(
        router.handle("data", dyn_of(&memory())),
        Err(FsError::InvalidArgument)
    ));
    assert!(router.unhandle("/data").is_some());
    assert!(router.unhandle("/data").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_mount_rename_is_exdev() {
    let a = memory();
    let b = memory();
    write_file(a.as_ref(), ROOT_INO, "f", b"1").await;

    let router = RouterProvider::new();
    router.handle("/", dyn_of(&a)).unwrap();
    router.handle("/b", dyn_of(&b)).unwrap();
    let b_dir = router.lookup(ROOT_INO, OsStr::new("b")).await.unwrap();

    let err = router
        .rename(ROOT_INO, OsStr::new("f"), b_dir.ino, OsStr::new("f"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::CrossDevice), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmounted_root_is_an_empty_directory() {
    let router = RouterProvider::new();
    let root = router.getattr(ROOT_INO, None).await.unwrap();
    assert!(root.is_dir());
    assert!(names(&router, ROOT_INO).await.is_empty());
    assert!(matches!(
        router.lookup(ROOT_INO, OsStr::new("nope")).await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_readdirplus_hands_back_skipped_lookups() {
    let backend = FaultyProvider::new();
    let router = RouterProvider::new();
    router.handle("/", dyn_of(&backend)).unwrap();
    for name in ["a", "b", "c"] {
        let stat = write_file(&router, ROOT_INO, name, b"x").await;
        router.forget(stat.ino, 1).await;
    }

    assert_eq!(page_plus(&router, ROOT_INO, 2).await, vec![OsString::from("c")]);
    assert_eq!(backend.outstanding_lookups(), 0);
}
