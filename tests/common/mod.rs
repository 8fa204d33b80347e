#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use mount0::fs::memory::MemoryProvider;
use mount0::fs::{
    Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileStat, FsError, Ino, OpenFlags,
    Provider, SetAttr, StatFs,
};

/// A memory backend whose reads or mutations can be switched to fail with `EIO`.
///
/// Data reads and metadata reads fail independently: a member can lose file contents while
/// its directory tree still answers.
#[derive(Default)]
pub struct FaultyProvider {
    inner: MemoryProvider,
    fail_reads: AtomicBool,
    fail_metadata: AtomicBool,
    fail_writes: AtomicBool,
    /// Lookup references handed out and not yet forgotten.
    lookups: AtomicU64,
}

impl FaultyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail `lookup`, `getattr` and `statfs`.
    pub fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Fail both data and metadata reads.
    pub fn go_dark(&self) {
        self.fail_reads(true);
        self.fail_metadata(true);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lookup references callers still hold on this member.
    pub fn outstanding_lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    fn counted<T>(&self, refs: u64, result: Result<T, FsError>) -> Result<T, FsError> {
        if result.is_ok() {
            self.lookups.fetch_add(refs, Ordering::SeqCst);
        }
        result
    }

    fn check_read(&self) -> Result<(), FsError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(FsError::io())
        } else {
            Ok(())
        }
    }

    fn check_metadata(&self) -> Result<(), FsError> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            Err(FsError::io())
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<(), FsError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(FsError::io())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for FaultyProvider {
    async fn forget(&self, ino: Ino, nlookup: u64) {
        let _ = self
            .lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(nlookup))
            });
        self.inner.forget(ino, nlookup).await;
    }

    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        self.check_metadata()?;
        self.counted(1, self.inner.lookup(parent, name).await)
    }

    async fn getattr(&self, ino: Ino, fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        self.check_metadata()?;
        self.inner.getattr(ino, fh).await
    }

    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        self.check_write()?;
        self.inner.setattr(ino, fh, attr).await
    }

    async fn readdir(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        self.check_read()?;
        self.inner.readdir(ino, fh, offset).await
    }

    async fn readdirplus(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        self.check_read()?;
        let entries = self.inner.readdirplus(ino, fh, offset).await?;
        self.counted(entries.len() as u64, Ok(entries))
    }

    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.inner.opendir(ino, flags).await
    }

    async fn releasedir(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.inner.releasedir(ino, fh).await
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.inner.open(ino, flags).await
    }

    async fn read(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        self.check_read()?;
        self.inner.read(ino, fh, offset, size).await
    }

    async fn write(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        self.check_write()?;
        self.inner.write(ino, fh, offset, data).await
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
        self.check_write()?;
        self.counted(1, self.inner.create(parent, name, mode, flags).await)
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        self.check_write()?;
        self.counted(1, self.inner.mkdir(parent, name, mode).await)
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.check_write()?;
        self.inner.unlink(parent, name).await
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.check_write()?;
        self.inner.rmdir(parent, name).await
    }

    async fn statfs(&self, ino: Ino) -> Result<StatFs, FsError> {
        self.check_metadata()?;
        self.inner.statfs(ino).await
    }
}

pub fn memory() -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new())
}

pub fn dyn_of<P: Provider>(provider: &Arc<P>) -> DynProvider {
    Arc::clone(provider) as DynProvider
}

/// Create `name` under `parent`, write `data` at offset 0 and close it.
pub async fn write_file(provider: &dyn Provider, parent: Ino, name: &str, data: &[u8]) -> FileStat {
    let created = provider
        .create(parent, OsStr::new(name), 0o644, OpenFlags::RDWR)
        .await
        .unwrap();
    let written = provider
        .write(created.stat.ino, created.fh, 0, Bytes::copy_from_slice(data))
        .await
        .unwrap();
    assert_eq!(written as usize, data.len());
    provider.release(created.stat.ino, created.fh).await.unwrap();
    created.stat
}

/// Open `ino`, read `size` bytes from `offset` and close it.
pub async fn read_at(
    provider: &dyn Provider,
    ino: Ino,
    offset: u64,
    size: u32,
) -> Result<Bytes, FsError> {
    let fh = provider.open(ino, OpenFlags::RDONLY).await?;
    let data = provider.read(ino, fh, offset, size).await;
    provider.release(ino, fh).await?;
    data
}

/// List directory `ino` from `offset` with `readdirplus` the way the kernel does, forgetting
/// every entry it receives. Returns the names seen.
pub async fn page_plus(provider: &dyn Provider, ino: Ino, offset: u64) -> Vec<OsString> {
    let fh = provider.opendir(ino, OpenFlags::RDONLY).await.unwrap();
    let entries = provider.readdirplus(ino, fh, offset).await.unwrap();
    provider.releasedir(ino, fh).await.unwrap();
    let mut seen = Vec::with_capacity(entries.len());
    for entry in entries {
        provider.forget(entry.stat.ino, 1).await;
        seen.push(entry.name);
    }
    seen
}

/// Names listed in directory `ino`, sorted.
pub async fn names(provider: &dyn Provider, ino: Ino) -> Vec<OsString> {
    let fh = provider.opendir(ino, OpenFlags::RDONLY).await.unwrap();
    let mut names: Vec<OsString> = provider
        .readdir(ino, fh, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .filter(|n| n != "." && n != "..")
        .collect();
    provider.releasedir(ino, fh).await.unwrap();
    names.sort();
    names
}
