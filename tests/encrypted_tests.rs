#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;

use bytes::Bytes;
use mount0::fs::encrypted::{CipherKind, EncryptedProvider, OVERHEAD};
use mount0::fs::{FsError, OpenFlags, Provider as _, ROOT_INO, SetAttr};
use secrecy::SecretString;

use common::{dyn_of, memory, read_at, write_file};

const SALT: &[u8] = b"mount0-test-salt";

fn encrypted(inner: &std::sync::Arc<mount0::fs::memory::MemoryProvider>) -> EncryptedProvider {
    EncryptedProvider::new(
        dyn_of(inner),
        SecretString::from("correct horse battery staple".to_owned()),
        CipherKind::Aes256Gcm,
        Some(SALT.to_vec()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_round_trips_and_is_opaque_underneath() {
    let inner = memory();
    let enc = encrypted(&inner);
    let plaintext = b"the quick brown fox";

    let stat = write_file(&enc, ROOT_INO, "secret", plaintext).await;
    assert_eq!(
        enc.getattr(stat.ino, None).await.unwrap().size,
        plaintext.len() as u64,
        "size is reported without framing"
    );

    let raw = inner.lookup(ROOT_INO, OsStr::new("secret")).await.unwrap();
    assert_eq!(raw.size, (plaintext.len() + OVERHEAD) as u64);
    let stored = read_at(inner.as_ref(), raw.ino, 0, 256).await.unwrap();
    assert!(
        !stored.windows(plaintext.len()).any(|w| w == plaintext),
        "plaintext must not reach the backend"
    );

    let back = read_at(&enc, stat.ino, 0, u32::try_from(plaintext.len()).unwrap())
        .await
        .unwrap();
    assert_eq!(&back[..], plaintext);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_ciphertext_fails_to_decrypt() {
    let inner = memory();
    let enc = encrypted(&inner);
    let stat = write_file(&enc, ROOT_INO, "secret", b"do not touch").await;

    let raw = inner.lookup(ROOT_INO, OsStr::new("secret")).await.unwrap();
    let fh = inner.open(raw.ino, OpenFlags::RDWR).await.unwrap();
    let byte = inner.read(raw.ino, fh, OVERHEAD as u64, 1).await.unwrap();
    inner
        .write(raw.ino, fh, OVERHEAD as u64, Bytes::from(vec![byte[0] ^ 0xff]))
        .await
        .unwrap();
    inner.release(raw.ino, fh).await.unwrap();

    let err = read_at(&enc, stat.ino, 0, 12).await.unwrap_err();
    assert!(matches!(err, FsError::DecryptionFailed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_password_and_salt_reopen_existing_content() {
    let inner = memory();
    let stat = write_file(&encrypted(&inner), ROOT_INO, "kept", b"across restarts").await;

    let reopened = encrypted(&inner);
    let found = reopened.lookup(ROOT_INO, OsStr::new("kept")).await.unwrap();
    assert_eq!(found.ino, stat.ino, "inode numbers pass through");
    let back = read_at(&reopened, found.ino, 0, 15).await.unwrap();
    assert_eq!(&back[..], b"across restarts");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncation_accounts_for_framing() {
    let inner = memory();
    let enc = encrypted(&inner);
    let stat = write_file(&enc, ROOT_INO, "t", b"0123456789").await;

    let attr = enc.setattr(stat.ino, None, SetAttr::truncate(4)).await.unwrap();
    assert_eq!(attr.size, 4);
    let raw = inner.getattr(stat.ino, None).await.unwrap();
    assert_eq!(raw.size, 4 + OVERHEAD as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn names_and_directories_pass_through() {
    let inner = memory();
    let enc = encrypted(&inner);
    let dir = enc.mkdir(ROOT_INO, OsStr::new("plain-name"), 0o755).await.unwrap();
    assert!(dir.is_dir());
    assert!(inner.lookup(ROOT_INO, OsStr::new("plain-name")).await.unwrap().is_dir());
}
