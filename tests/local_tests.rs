#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::fs;

use mount0::fs::local::LocalProvider;
use mount0::fs::{FsError, Provider as _, ROOT_INO};

use common::{names, read_at, write_file};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_land_in_the_host_directory() {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalProvider::new(dir.path()).unwrap();

    let stat = write_file(&local, ROOT_INO, "hello.txt", b"on disk").await;
    assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"on disk");

    let back = read_at(&local, stat.ino, 3, 16).await.unwrap();
    assert_eq!(&back[..], b"disk");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_files_are_visible() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/existing"), b"already here").unwrap();
    let local = LocalProvider::new(dir.path()).unwrap();

    let root = local.getattr(ROOT_INO, None).await.unwrap();
    assert_eq!(root.ino, ROOT_INO, "the export root is always the root inode");

    let sub = local.lookup(ROOT_INO, OsStr::new("sub")).await.unwrap();
    assert!(sub.is_dir());
    assert_eq!(names(&local, sub.ino).await, vec![OsString::from("existing")]);

    let file = local.lookup(sub.ino, OsStr::new("existing")).await.unwrap();
    assert_eq!(file.size, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_moves_and_respects_noreplace() {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalProvider::new(dir.path()).unwrap();
    write_file(&local, ROOT_INO, "a", b"1").await;
    write_file(&local, ROOT_INO, "b", b"2").await;
    let sub = local.mkdir(ROOT_INO, OsStr::new("sub"), 0o755).await.unwrap();

    local
        .rename(ROOT_INO, OsStr::new("a"), sub.ino, OsStr::new("moved"), 0)
        .await
        .unwrap();
    assert!(!dir.path().join("a").exists());
    assert_eq!(fs::read(dir.path().join("sub/moved")).unwrap(), b"1");

    let err = local
        .rename(sub.ino, OsStr::new("moved"), ROOT_INO, OsStr::new("b"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists), "got {err:?}");

    let err = local
        .rename(ROOT_INO, OsStr::new("b"), ROOT_INO, OsStr::new("c"), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NotSupported), "exchange is not offered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_and_rmdir_remove_host_entries() {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalProvider::new(dir.path()).unwrap();
    write_file(&local, ROOT_INO, "gone", b"x").await;
    let sub = local.mkdir(ROOT_INO, OsStr::new("d"), 0o755).await.unwrap();
    write_file(&local, sub.ino, "inner", b"y").await;

    local.unlink(ROOT_INO, OsStr::new("gone")).await.unwrap();
    assert!(!dir.path().join("gone").exists());

    let err = local.rmdir(ROOT_INO, OsStr::new("d")).await.unwrap_err();
    assert!(matches!(err, FsError::NotEmpty), "got {err:?}");

    local.unlink(sub.ino, OsStr::new("inner")).await.unwrap();
    local.rmdir(ROOT_INO, OsStr::new("d")).await.unwrap();
    assert!(names(&local, ROOT_INO).await.is_empty());
}

#[test]
fn exporting_a_file_is_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    assert!(matches!(
        LocalProvider::new(file.path()),
        Err(FsError::NotADirectory)
    ));
}
