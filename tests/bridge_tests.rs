#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::ffi::OsString;
use std::sync::Arc;

use bytes::Bytes;
use mount0::fs::bridge::{MountError, ProtocolBridge, Reply, Request};
use mount0::fs::memory::MemoryProvider;
use mount0::fs::{Errno, OpenFlags, ROOT_INO};

fn bridge() -> ProtocolBridge {
    ProtocolBridge::new(Arc::new(MemoryProvider::new()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_name_replies_enoent() {
    let bridge = bridge();
    let reply = bridge
        .dispatch(Request::Lookup {
            parent: ROOT_INO,
            name: OsString::from("absent"),
        })
        .await;
    assert_eq!(reply, Err(Errno(libc::ENOENT)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_io_through_dispatch() {
    let bridge = bridge();
    let Ok(Reply::Created(created)) = bridge
        .dispatch(Request::Create {
            parent: ROOT_INO,
            name: OsString::from("hello"),
            mode: 0o644,
            flags: OpenFlags::RDWR,
        })
        .await
    else {
        panic!("create did not reply Created");
    };
    let (ino, fh) = (created.stat.ino, created.fh);

    let written = bridge
        .dispatch(Request::Write {
            ino,
            fh,
            offset: 0,
            data: Bytes::from_static(b"hi there"),
        })
        .await;
    assert_eq!(written, Ok(Reply::Written(8)));

    let read = bridge
        .dispatch(Request::Read {
            ino,
            fh,
            offset: 3,
            size: 64,
        })
        .await;
    assert_eq!(read, Ok(Reply::Data(Bytes::from_static(b"there"))));

    assert_eq!(
        bridge.dispatch(Request::Release { ino, fh }).await,
        Ok(Reply::None)
    );
    let Ok(Reply::Attr(attr)) = bridge.dispatch(Request::GetAttr { ino, fh: None }).await else {
        panic!("getattr did not reply Attr");
    };
    assert_eq!(attr.size, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn xattr_size_query_and_short_buffer() {
    let bridge = bridge();
    let set = bridge
        .dispatch(Request::SetXattr {
            ino: ROOT_INO,
            name: OsString::from("user.tag"),
            value: b"blue".to_vec(),
            flags: 0,
        })
        .await;
    assert_eq!(set, Ok(Reply::None));

    let get = |size| Request::GetXattr {
        ino: ROOT_INO,
        name: OsString::from("user.tag"),
        size,
    };
    assert_eq!(bridge.dispatch(get(0)).await, Ok(Reply::XattrSize(4)));
    assert_eq!(bridge.dispatch(get(2)).await, Err(Errno(libc::ERANGE)));
    assert_eq!(
        bridge.dispatch(get(16)).await,
        Ok(Reply::Xattr(b"blue".to_vec()))
    );

    assert_eq!(
        bridge
            .dispatch(Request::ListXattr {
                ino: ROOT_INO,
                size: 0
            })
            .await,
        Ok(Reply::XattrSize(9)),
        "names are NUL terminated"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_requests_round_trip() {
    let bridge = bridge();
    let Ok(Reply::Entry(dir)) = bridge
        .dispatch(Request::MkDir {
            parent: ROOT_INO,
            name: OsString::from("d"),
            mode: 0o755,
        })
        .await
    else {
        panic!("mkdir did not reply Entry");
    };
    assert!(dir.is_dir());

    let Ok(Reply::Opened(fh)) = bridge
        .dispatch(Request::OpenDir {
            ino: ROOT_INO,
            flags: OpenFlags::RDONLY,
        })
        .await
    else {
        panic!("opendir did not reply Opened");
    };
    let Ok(Reply::Entries(entries)) = bridge
        .dispatch(Request::ReadDir {
            ino: ROOT_INO,
            fh,
            offset: 0,
        })
        .await
    else {
        panic!("readdir did not reply Entries");
    };
    assert!(entries.iter().any(|e| e.name == "d"));

    assert_eq!(
        bridge
            .dispatch(Request::RmDir {
                parent: ROOT_INO,
                name: OsString::from("d"),
            })
            .await,
        Ok(Reply::None)
    );
    assert_eq!(
        bridge
            .dispatch(Request::ReleaseDir { ino: ROOT_INO, fh })
            .await,
        Ok(Reply::None)
    );
}

#[test]
fn unmounting_an_idle_bridge_is_an_error() {
    let bridge = bridge();
    assert!(!bridge.is_mounted());
    assert!(bridge.mount_point().is_none());
    assert!(matches!(bridge.unmount(), Err(MountError::NotMounted)));
}
