//! The provider contract.
//!
//! Leaf backends and composition engines implement the same trait, so any provider can be stacked
//! under any engine. Every capability has a default body: lifecycle hooks do nothing, and anything
//! else fails with [`FsError::NotSupported`].

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    CopyRange, Created, DirEntry, DirEntryPlus, FileHandle, FileLock, FileStat, Forget, FsError,
    Ino, IoctlReply, OpenFlags, SetAttr, StatFs,
};

/// A shared, type-erased provider.
pub type DynProvider = Arc<dyn Provider>;

/// Capability interface of every backend and composition engine.
///
/// All methods take `&self`: providers are shared between concurrently running requests and
/// synchronize internally.
#[async_trait]
#[allow(unused_variables, reason = "default bodies ignore their arguments")]
pub trait Provider: Send + Sync + 'static {
    /// Called once when the bridge starts serving requests.
    async fn init(&self) -> Result<(), FsError> {
        Ok(())
    }

    /// Called once when the bridge stops serving requests.
    async fn destroy(&self) {}

    /// The kernel dropped `nlookup` references to `ino`.
    async fn forget(&self, ino: Ino, nlookup: u64) {}

    /// Batched [`Provider::forget`].
    async fn forget_multi(&self, forgets: &[Forget]) {
        for f in forgets {
            self.forget(f.ino, f.nlookup).await;
        }
    }

    /// Resolve `name` inside the directory `parent`.
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Attributes of `ino`.
    async fn getattr(&self, ino: Ino, fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Change attributes of `ino` and return the result.
    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Entries of the directory `ino`, starting at index `offset`.
    async fn readdir(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Like [`Provider::readdir`], with full attributes for each entry.
    async fn readdirplus(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Open the directory `ino`.
    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        Err(FsError::NotSupported)
    }

    /// Close a directory handle.
    async fn releasedir(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Flush directory contents to stable storage.
    async fn fsyncdir(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Open the file `ino`.
    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        Err(FsError::NotSupported)
    }

    /// Read up to `size` bytes at `offset`. A short read means end of file.
    async fn read(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        Err(FsError::NotSupported)
    }

    /// Write `data` at `offset` and return the number of bytes written.
    async fn write(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        Err(FsError::NotSupported)
    }

    /// Called on every `close(2)` of a descriptor.
    async fn flush(&self, ino: Ino, fh: FileHandle, lock_owner: u64) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Flush file contents to stable storage.
    async fn fsync(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Close a file handle.
    async fn release(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Create and open a regular file.
    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        Err(FsError::NotSupported)
    }

    /// Create a file node of any type.
    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Create a directory.
    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Remove a non-directory entry.
    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Remove an empty directory.
    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Create a hard link to `ino` named `newname` inside `newparent`.
    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Create a symbolic link named `name` inside `parent` pointing at `target`.
    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        Err(FsError::NotSupported)
    }

    /// Target of the symbolic link `ino`.
    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        Err(FsError::NotSupported)
    }

    /// Move `parent/name` to `newparent/newname`.
    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Set an extended attribute.
    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Value of an extended attribute.
    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Names of all extended attributes.
    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Remove an extended attribute.
    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Check access permissions for `mask` (`R_OK`, `W_OK`, `X_OK`, `F_OK`).
    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Filesystem statistics.
    async fn statfs(&self, ino: Ino) -> Result<StatFs, FsError> {
        Err(FsError::NotSupported)
    }

    /// Test for a conflicting POSIX lock.
    async fn getlk(&self, ino: Ino, fh: FileHandle, lock: FileLock) -> Result<FileLock, FsError> {
        Err(FsError::NotSupported)
    }

    /// Acquire, change or release a POSIX lock.
    async fn setlk(
        &self,
        ino: Ino,
        fh: FileHandle,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Apply a BSD `flock(2)` operation.
    async fn flock(&self, ino: Ino, fh: FileHandle, op: i32) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Map a file block index to a device block index.
    async fn bmap(&self, ino: Ino, blocksize: u32, idx: u64) -> Result<u64, FsError> {
        Err(FsError::NotSupported)
    }

    /// Device-specific control.
    async fn ioctl(
        &self,
        ino: Ino,
        fh: FileHandle,
        cmd: u32,
        input: &[u8],
        out_size: u32,
    ) -> Result<IoctlReply, FsError> {
        Err(FsError::NotSupported)
    }

    /// Readiness of `fh` for the requested `events`.
    async fn poll(&self, ino: Ino, fh: FileHandle, events: u32) -> Result<u32, FsError> {
        Err(FsError::NotSupported)
    }

    /// Preallocate or deallocate space.
    async fn fallocate(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Copy a byte range between two open files.
    async fn copy_file_range(&self, range: CopyRange) -> Result<u64, FsError> {
        Err(FsError::NotSupported)
    }

    /// Reposition the offset of `fh`; returns the resulting offset.
    async fn lseek(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        Err(FsError::NotSupported)
    }

    /// Create and open an unnamed regular file inside `parent`.
    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        Err(FsError::NotSupported)
    }
}
