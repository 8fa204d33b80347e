#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use mount0::config::{ComposeError, MountConfig};
use mount0::fs::{Provider as _, ROOT_INO};

use common::{names, read_at, write_file};

const STACK: &str = r#"
[backends.scratch]
type = "memory"

[backends.left]
type = "memory"

[backends.right]
type = "memory"

[backends.mirror]
type = "raid"
level = 1
members = ["left", "right"]

[backends.vault]
type = "encrypted"
provider = "mirror"
password = "open sesame"
salt = "bW91bnQwLXRlc3Qtc2FsdA=="

[[mappings]]
path = "/"
backend = "scratch"

[[mappings]]
path = "/secure"
backend = "vault"

[[mappings]]
path = "/raw"
backend = "mirror"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stacked_backends_share_one_instance() {
    let router = MountConfig::from_toml(STACK).unwrap().build().unwrap();
    assert_eq!(
        router.mount_paths(),
        vec![
            PathBuf::from("/secure"),
            PathBuf::from("/raw"),
            PathBuf::from("/")
        ]
    );

    let secure = router.lookup(ROOT_INO, OsStr::new("secure")).await.unwrap();
    write_file(&router, secure.ino, "note", b"sealed").await;

    let back_stat = router.lookup(secure.ino, OsStr::new("note")).await.unwrap();
    assert_eq!(back_stat.size, 6);
    let back = read_at(&router, back_stat.ino, 0, 6).await.unwrap();
    assert_eq!(&back[..], b"sealed");

    // The mirror mapped at /raw is the same instance the vault writes through.
    let raw = router.lookup(ROOT_INO, OsStr::new("raw")).await.unwrap();
    assert_eq!(names(&router, raw.ino).await, vec![OsString::from("note")]);
    let framed = router.lookup(raw.ino, OsStr::new("note")).await.unwrap();
    assert!(framed.size > 6, "the mirror holds the framed ciphertext");
}

#[test]
fn unknown_member_names_its_referrer() {
    let config = MountConfig::from_toml(
        r#"
        [backends.r]
        type = "raid"
        level = 1
        members = ["present", "missing"]

        [backends.present]
        type = "memory"

        [[mappings]]
        path = "/"
        backend = "r"
        "#,
    )
    .unwrap();
    let Err(ComposeError::UnknownBackend {
        name,
        referenced_by,
    }) = config.build()
    else {
        panic!("expected an unknown backend error");
    };
    assert_eq!(name, "missing");
    assert_eq!(referenced_by, "backend 'r'");
}

#[test]
fn bad_salt_is_reported() {
    let config = MountConfig::from_toml(
        r#"
        [backends.m]
        type = "memory"

        [backends.e]
        type = "encrypted"
        provider = "m"
        password = "pw"
        salt = "not base64!"

        [[mappings]]
        path = "/"
        backend = "e"
        "#,
    )
    .unwrap();
    assert!(matches!(
        config.build(),
        Err(ComposeError::InvalidSalt { .. })
    ));
}

#[test]
fn building_without_mappings_fails() {
    let config = MountConfig::from_toml("[backends.m]\ntype = \"memory\"\n").unwrap();
    assert!(matches!(config.build(), Err(ComposeError::NoMappings)));
}
