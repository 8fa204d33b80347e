//! Transparent content encryption.
//!
//! Every `write` is sealed independently with AES-GCM under a fresh random 16-byte IV and stored
//! at the same offset as `[IV][tag][ciphertext]`. A `read` fetches the requested length plus the
//! framing overhead and opens it again. Partial overwrites of an earlier frame are not supported:
//! files must be read back with the same boundaries they were written with.
//!
//! Inode numbers pass through unchanged; the layer wraps a single backend.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::{Aes128, Aes256};
use aes_gcm::{AesGcm, Tag};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::RngCore as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::{
    Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileKind, FileLock, FileStat, Forget,
    FsError, Ino, OpenFlags, Provider, SetAttr, StatFs,
};

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const FALLOC_FL_PUNCH_HOLE: i32 = 0x02;

/// Bytes of framing added to every write.
pub const OVERHEAD: usize = IV_LEN + TAG_LEN;

/// Length of a freshly drawn salt.
pub const SALT_LEN: usize = 16;

/// Authenticated cipher used to seal file content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    #[default]
    Aes256Gcm,
    Aes128Gcm,
}

impl CipherKind {
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 32,
            Self::Aes128Gcm => 16,
        }
    }
}

enum Cipher {
    Aes256(Box<AesGcm<Aes256, U16>>),
    Aes128(Box<AesGcm<Aes128, U16>>),
}

impl Cipher {
    fn new(kind: CipherKind, key: &[u8]) -> Result<Self, FsError> {
        let invalid = |_| FsError::InvalidArgument;
        Ok(match kind {
            CipherKind::Aes256Gcm => Self::Aes256(Box::new(
                AesGcm::<Aes256, U16>::new_from_slice(key).map_err(invalid)?,
            )),
            CipherKind::Aes128Gcm => Self::Aes128(Box::new(
                AesGcm::<Aes128, U16>::new_from_slice(key).map_err(invalid)?,
            )),
        })
    }

    fn seal(&self, iv: &[u8], buf: &mut [u8]) -> Result<Tag<U16>, FsError> {
        let nonce = GenericArray::from_slice(iv);
        match self {
            Self::Aes256(c) => c.encrypt_in_place_detached(nonce, &[], buf),
            Self::Aes128(c) => c.encrypt_in_place_detached(nonce, &[], buf),
        }
        .map_err(|_| FsError::io())
    }

    fn open(&self, iv: &[u8], buf: &mut [u8], tag: &[u8]) -> Result<(), FsError> {
        let nonce = GenericArray::from_slice(iv);
        let tag = Tag::<U16>::from_slice(tag);
        match self {
            Self::Aes256(c) => c.decrypt_in_place_detached(nonce, &[], buf, tag),
            Self::Aes128(c) => c.decrypt_in_place_detached(nonce, &[], buf, tag),
        }
        .map_err(|_| FsError::DecryptionFailed)
    }
}

/// Encrypts file content written through it and decrypts it on the way back.
pub struct EncryptedProvider {
    inner: DynProvider,
    password: SecretString,
    kind: CipherKind,
    salt: Vec<u8>,
    cipher: OnceCell<Cipher>,
}

impl EncryptedProvider {
    /// Wrap `inner`. Without a `salt` a random one is drawn, so ciphertext written by this
    /// instance is only readable by it.
    #[must_use]
    pub fn new(
        inner: DynProvider,
        password: SecretString,
        kind: CipherKind,
        salt: Option<Vec<u8>>,
    ) -> Self {
        let salt = salt.unwrap_or_else(|| {
            let mut salt = vec![0_u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            salt
        });
        Self {
            inner,
            password,
            kind,
            salt,
            cipher: OnceCell::new(),
        }
    }

    /// The derived cipher. scrypt runs once, on the blocking pool.
    async fn cipher(&self) -> Result<&Cipher, FsError> {
        self.cipher
            .get_or_try_init(|| async {
                let password = self.password.expose_secret().to_owned();
                let salt = self.salt.clone();
                let kind = self.kind;
                debug!(cipher = ?kind, "deriving content key");
                let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt, kind))
                    .await
                    .map_err(|e| FsError::IoFailure(Some(std::io::Error::other(e))))??;
                Cipher::new(kind, &key)
            })
            .await
    }

    async fn encrypt(&self, data: &[u8]) -> Result<Bytes, FsError> {
        let cipher = self.cipher().await?;
        let mut iv = [0_u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut body = data.to_vec();
        let tag = cipher.seal(&iv, &mut body)?;

        let mut frame = BytesMut::with_capacity(OVERHEAD + body.len());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    async fn decrypt(&self, frame: &[u8]) -> Result<Bytes, FsError> {
        if frame.len() < OVERHEAD {
            return Err(FsError::DecryptionFailed);
        }
        let cipher = self.cipher().await?;
        let (iv, rest) = frame.split_at(IV_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);
        let mut text = body.to_vec();
        cipher.open(iv, &mut text, tag)?;
        Ok(Bytes::from(text))
    }
}

fn derive_key(password: &str, salt: &[u8], kind: CipherKind) -> Result<Vec<u8>, FsError> {
    let params =
        scrypt::Params::new(14, 8, 1, kind.key_len()).map_err(|_| FsError::InvalidArgument)?;
    let mut key = vec![0_u8; kind.key_len()];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|_| FsError::InvalidArgument)?;
    Ok(key)
}

/// Report the plaintext size of a framed regular file.
fn plain(mut stat: FileStat) -> FileStat {
    if stat.kind() == FileKind::RegularFile {
        stat.size = stat.size.saturating_sub(OVERHEAD as u64);
    }
    stat
}

#[async_trait]
impl Provider for EncryptedProvider {
    async fn init(&self) -> Result<(), FsError> {
        self.inner.init().await
    }

    async fn destroy(&self) {
        self.inner.destroy().await;
    }

    async fn forget(&self, ino: Ino, nlookup: u64) {
        self.inner.forget(ino, nlookup).await;
    }

    async fn forget_multi(&self, forgets: &[Forget]) {
        self.inner.forget_multi(forgets).await;
    }

    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        self.inner.lookup(parent, name).await.map(plain)
    }

    async fn getattr(&self, ino: Ino, fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        self.inner.getattr(ino, fh).await.map(plain)
    }

    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let attr = SetAttr {
            size: attr
                .size
                .map(|s| if s == 0 { 0 } else { s + OVERHEAD as u64 }),
            ..attr
        };
        self.inner.setattr(ino, fh, attr).await.map(plain)
    }

    async fn readdir(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        self.inner.readdir(ino, fh, offset).await
    }

    async fn readdirplus(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        Ok(self
            .inner
            .readdirplus(ino, fh, offset)
            .await?
            .into_iter()
            .map(|e| DirEntryPlus {
                name: e.name,
                stat: plain(e.stat),
            })
            .collect())
    }

    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.inner.opendir(ino, flags).await
    }

    async fn releasedir(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.inner.releasedir(ino, fh).await
    }

    async fn fsyncdir(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        self.inner.fsyncdir(ino, fh, datasync).await
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.inner.open(ino, flags).await
    }

    #[instrument(name = "EncryptedProvider::read", skip(self))]
    async fn read(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let framed = size.saturating_add(OVERHEAD as u32);
        let frame = self.inner.read(ino, fh, offset, framed).await?;
        if frame.is_empty() {
            return Ok(frame);
        }
        let mut text = self.decrypt(&frame).await?;
        text.truncate(size as usize);
        Ok(text)
    }

    #[instrument(name = "EncryptedProvider::write", skip(self, data), fields(len = data.len()))]
    async fn write(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let frame = self.encrypt(&data).await?;
        self.inner.write(ino, fh, offset, frame).await?;
        Ok(written)
    }

    async fn flush(&self, ino: Ino, fh: FileHandle, lock_owner: u64) -> Result<(), FsError> {
        self.inner.flush(ino, fh, lock_owner).await
    }

    async fn fsync(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        self.inner.fsync(ino, fh, datasync).await
    }

    async fn release(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.inner.release(ino, fh).await
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let created = self.inner.create(parent, name, mode, flags).await?;
        Ok(Created {
            stat: plain(created.stat),
            fh: created.fh,
        })
    }

    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        self.inner.mknod(parent, name, mode, rdev).await
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        self.inner.mkdir(parent, name, mode).await
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.inner.unlink(parent, name).await
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.inner.rmdir(parent, name).await
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        self.inner.link(ino, newparent, newname).await.map(plain)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        self.inner.symlink(parent, name, target).await
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        self.inner.readlink(ino).await
    }

    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        self.inner
            .rename(parent, name, newparent, newname, flags)
            .await
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        self.inner.setxattr(ino, name, value, flags).await
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        self.inner.getxattr(ino, name).await
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        self.inner.listxattr(ino).await
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        self.inner.removexattr(ino, name).await
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        self.inner.access(ino, mask).await
    }

    async fn statfs(&self, ino: Ino) -> Result<StatFs, FsError> {
        self.inner.statfs(ino).await
    }

    async fn getlk(&self, ino: Ino, fh: FileHandle, lock: FileLock) -> Result<FileLock, FsError> {
        self.inner.getlk(ino, fh, lock).await
    }

    async fn setlk(
        &self,
        ino: Ino,
        fh: FileHandle,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), FsError> {
        self.inner.setlk(ino, fh, lock, sleep).await
    }

    async fn flock(&self, ino: Ino, fh: FileHandle, op: i32) -> Result<(), FsError> {
        self.inner.flock(ino, fh, op).await
    }

    async fn fallocate(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        if mode & FALLOC_FL_PUNCH_HOLE != 0 {
            return Err(FsError::NotSupported);
        }
        self.inner.fallocate(ino, fh, offset, length, mode).await
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        self.inner.tmpfile(parent, mode, flags).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::memory::MemoryProvider;

    fn provider(salt: &[u8]) -> EncryptedProvider {
        EncryptedProvider::new(
            Arc::new(MemoryProvider::new()),
            SecretString::from("hunter2".to_owned()),
            CipherKind::Aes128Gcm,
            Some(salt.to_vec()),
        )
    }

    #[tokio::test]
    async fn frames_carry_iv_and_tag() {
        let enc = provider(b"0123456789abcdef");
        let frame = enc.encrypt(b"attack at dawn").await.unwrap();
        assert_eq!(frame.len(), b"attack at dawn".len() + OVERHEAD);
        assert_eq!(enc.decrypt(&frame).await.unwrap().as_ref(), b"attack at dawn");
    }

    #[tokio::test]
    async fn truncated_frames_fail_to_decrypt() {
        let enc = provider(b"0123456789abcdef");
        assert!(matches!(
            enc.decrypt(&[0_u8; OVERHEAD - 1]).await,
            Err(FsError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn same_salt_derives_the_same_key() {
        let a = provider(b"0123456789abcdef");
        let b = provider(b"0123456789abcdef");
        let frame = a.encrypt(b"shared").await.unwrap();
        assert_eq!(b.decrypt(&frame).await.unwrap().as_ref(), b"shared");

        let c = provider(b"fedcba9876543210");
        assert!(matches!(
            c.decrypt(&frame).await,
            Err(FsError::DecryptionFailed)
        ));
    }
}
