//! Protocol bridge: decoded kernel requests in, typed replies or errnos out.
//!
//! [`ProtocolBridge::dispatch`] is transport independent; the FUSE adapter in
//! [`super::fuser`] only converts callback arguments into a [`Request`] and a [`Reply`] back into
//! the kernel's reply objects. Every failure funnels through [`FsError::errno`].

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use fuser::{BackgroundSession, MountOption};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use super::fuser::FuserAdapter;
use super::{
    CopyRange, Created, DirEntry, DirEntryPlus, DynProvider, Errno, FileHandle, FileLock,
    FileStat, Forget, FsError, Ino, IoctlReply, OpenFlags, SetAttr, StatFs,
};

/// One decoded kernel request, carrying exactly what the provider call needs.
#[derive(Debug, Clone)]
pub enum Request {
    Init,
    Destroy,
    Forget { ino: Ino, nlookup: u64 },
    ForgetMulti(Vec<Forget>),
    Lookup { parent: Ino, name: OsString },
    GetAttr { ino: Ino, fh: Option<FileHandle> },
    SetAttr { ino: Ino, fh: Option<FileHandle>, attr: SetAttr },
    ReadDir { ino: Ino, fh: FileHandle, offset: u64 },
    ReadDirPlus { ino: Ino, fh: FileHandle, offset: u64 },
    OpenDir { ino: Ino, flags: OpenFlags },
    ReleaseDir { ino: Ino, fh: FileHandle },
    FsyncDir { ino: Ino, fh: FileHandle, datasync: bool },
    Open { ino: Ino, flags: OpenFlags },
    Read { ino: Ino, fh: FileHandle, offset: u64, size: u32 },
    Write { ino: Ino, fh: FileHandle, offset: u64, data: Bytes },
    Flush { ino: Ino, fh: FileHandle, lock_owner: u64 },
    Fsync { ino: Ino, fh: FileHandle, datasync: bool },
    Release { ino: Ino, fh: FileHandle },
    Create { parent: Ino, name: OsString, mode: u32, flags: OpenFlags },
    MkNod { parent: Ino, name: OsString, mode: u32, rdev: u32 },
    MkDir { parent: Ino, name: OsString, mode: u32 },
    Unlink { parent: Ino, name: OsString },
    RmDir { parent: Ino, name: OsString },
    Link { ino: Ino, newparent: Ino, newname: OsString },
    Symlink { parent: Ino, name: OsString, target: PathBuf },
    ReadLink { ino: Ino },
    Rename { parent: Ino, name: OsString, newparent: Ino, newname: OsString, flags: u32 },
    SetXattr { ino: Ino, name: OsString, value: Vec<u8>, flags: i32 },
    /// `size` is the caller's buffer; zero asks for the needed length.
    GetXattr { ino: Ino, name: OsString, size: u32 },
    /// `size` is the caller's buffer; zero asks for the needed length.
    ListXattr { ino: Ino, size: u32 },
    RemoveXattr { ino: Ino, name: OsString },
    Access { ino: Ino, mask: i32 },
    StatFs { ino: Ino },
    GetLk { ino: Ino, fh: FileHandle, lock: FileLock },
    SetLk { ino: Ino, fh: FileHandle, lock: FileLock, sleep: bool },
    Flock { ino: Ino, fh: FileHandle, op: i32 },
    Bmap { ino: Ino, blocksize: u32, idx: u64 },
    Ioctl { ino: Ino, fh: FileHandle, cmd: u32, input: Vec<u8>, out_size: u32 },
    Poll { ino: Ino, fh: FileHandle, events: u32 },
    Fallocate { ino: Ino, fh: FileHandle, offset: u64, length: u64, mode: i32 },
    CopyFileRange(CopyRange),
    Lseek { ino: Ino, fh: FileHandle, offset: i64, whence: i32 },
    TmpFile { parent: Ino, mode: u32, flags: OpenFlags },
}

impl Request {
    /// Operation name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Destroy => "destroy",
            Self::Forget { .. } => "forget",
            Self::ForgetMulti(_) => "forget_multi",
            Self::Lookup { .. } => "lookup",
            Self::GetAttr { .. } => "getattr",
            Self::SetAttr { .. } => "setattr",
            Self::ReadDir { .. } => "readdir",
            Self::ReadDirPlus { .. } => "readdirplus",
            Self::OpenDir { .. } => "opendir",
            Self::ReleaseDir { .. } => "releasedir",
            Self::FsyncDir { .. } => "fsyncdir",
            Self::Open { .. } => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Flush { .. } => "flush",
            Self::Fsync { .. } => "fsync",
            Self::Release { .. } => "release",
            Self::Create { .. } => "create",
            Self::MkNod { .. } => "mknod",
            Self::MkDir { .. } => "mkdir",
            Self::Unlink { .. } => "unlink",
            Self::RmDir { .. } => "rmdir",
            Self::Link { .. } => "link",
            Self::Symlink { .. } => "symlink",
            Self::ReadLink { .. } => "readlink",
            Self::Rename { .. } => "rename",
            Self::SetXattr { .. } => "setxattr",
            Self::GetXattr { .. } => "getxattr",
            Self::ListXattr { .. } => "listxattr",
            Self::RemoveXattr { .. } => "removexattr",
            Self::Access { .. } => "access",
            Self::StatFs { .. } => "statfs",
            Self::GetLk { .. } => "getlk",
            Self::SetLk { .. } => "setlk",
            Self::Flock { .. } => "flock",
            Self::Bmap { .. } => "bmap",
            Self::Ioctl { .. } => "ioctl",
            Self::Poll { .. } => "poll",
            Self::Fallocate { .. } => "fallocate",
            Self::CopyFileRange(_) => "copy_file_range",
            Self::Lseek { .. } => "lseek",
            Self::TmpFile { .. } => "tmpfile",
        }
    }
}

/// Typed success payload of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Lifecycle requests and operations with an empty success reply.
    None,
    /// A new directory entry (`lookup`, `mknod`, `mkdir`, `link`, `symlink`).
    Entry(FileStat),
    Attr(FileStat),
    Entries(Vec<DirEntry>),
    EntriesPlus(Vec<DirEntryPlus>),
    Opened(FileHandle),
    Created(Created),
    Data(Bytes),
    Written(u32),
    Target(PathBuf),
    /// Length the caller needs to allocate for an xattr value or name list.
    XattrSize(u32),
    Xattr(Vec<u8>),
    StatFs(StatFs),
    Lock(FileLock),
    Block(u64),
    Ioctl(IoctlReply),
    Poll(u32),
    Copied(u64),
    Offset(i64),
}

/// Failures to attach to or detach from the kernel.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("already mounted at {0}")]
    AlreadyMounted(PathBuf),

    #[error("not mounted")]
    NotMounted,

    #[error("mount failed: {0}")]
    Io(#[from] std::io::Error),
}

enum BridgeState {
    Unmounted,
    Mounted {
        mount_point: PathBuf,
        _session: BackgroundSession,
    },
}

/// Serves kernel requests from one provider chain.
pub struct ProtocolBridge {
    provider: DynProvider,
    state: Mutex<BridgeState>,
}

/// Answer a size query: `size == 0` asks for the length, a short buffer is `ERANGE`.
fn sized(payload: Vec<u8>, size: u32) -> Result<Reply, FsError> {
    let len = u32::try_from(payload.len()).map_err(|_| FsError::OutOfRange)?;
    if size == 0 {
        Ok(Reply::XattrSize(len))
    } else if len > size {
        Err(FsError::OutOfRange)
    } else {
        Ok(Reply::Xattr(payload))
    }
}

impl ProtocolBridge {
    #[must_use]
    pub fn new(provider: DynProvider) -> Self {
        Self {
            provider,
            state: Mutex::new(BridgeState::Unmounted),
        }
    }

    /// The provider chain this bridge serves.
    #[must_use]
    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    /// Mount point while mounted.
    #[must_use]
    pub fn mount_point(&self) -> Option<PathBuf> {
        match &*self.state.lock() {
            BridgeState::Unmounted => None,
            BridgeState::Mounted { mount_point, .. } => Some(mount_point.clone()),
        }
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mount_point().is_some()
    }

    /// Register with the kernel at `mount_point`. Requests are served on `runtime`.
    pub fn mount(
        self: &Arc<Self>,
        mount_point: impl AsRef<Path>,
        options: &[MountOption],
        runtime: tokio::runtime::Handle,
    ) -> Result<(), MountError> {
        let mut state = self.state.lock();
        if let BridgeState::Mounted { mount_point, .. } = &*state {
            return Err(MountError::AlreadyMounted(mount_point.clone()));
        }
        let mount_point = mount_point.as_ref().to_path_buf();
        let adapter = FuserAdapter::new(Arc::clone(self), runtime);
        let session = fuser::spawn_mount2(adapter, &mount_point, options)?;
        info!(mount_point = %mount_point.display(), "mounted");
        *state = BridgeState::Mounted {
            mount_point,
            _session: session,
        };
        Ok(())
    }

    /// Detach from the kernel. Dropping the session joins the request loop.
    pub fn unmount(&self) -> Result<(), MountError> {
        let previous = std::mem::replace(&mut *self.state.lock(), BridgeState::Unmounted);
        match previous {
            BridgeState::Unmounted => Err(MountError::NotMounted),
            BridgeState::Mounted { mount_point, .. } => {
                info!(mount_point = %mount_point.display(), "unmounted");
                Ok(())
            }
        }
    }

    /// Run one request against the provider chain.
    #[instrument(name = "ProtocolBridge::dispatch", skip(self, request), fields(op = request.name()))]
    pub async fn dispatch(&self, request: Request) -> Result<Reply, Errno> {
        let op = request.name();
        match self.call(request).await {
            Ok(reply) => Ok(reply),
            Err(e @ FsError::ProviderNotFound(_)) => {
                error!(op, error = %e, "inode table is inconsistent");
                Err(e.errno())
            }
            Err(e) => {
                debug!(op, error = %e, "replying error");
                Err(e.errno())
            }
        }
    }

    async fn call(&self, request: Request) -> Result<Reply, FsError> {
        let p = &self.provider;
        let reply = match request {
            Request::Init => {
                p.init().await?;
                Reply::None
            }
            Request::Destroy => {
                p.destroy().await;
                Reply::None
            }
            Request::Forget { ino, nlookup } => {
                p.forget(ino, nlookup).await;
                Reply::None
            }
            Request::ForgetMulti(forgets) => {
                p.forget_multi(&forgets).await;
                Reply::None
            }
            Request::Lookup { parent, name } => Reply::Entry(p.lookup(parent, &name).await?),
            Request::GetAttr { ino, fh } => Reply::Attr(p.getattr(ino, fh).await?),
            Request::SetAttr { ino, fh, attr } => Reply::Attr(p.setattr(ino, fh, attr).await?),
            Request::ReadDir { ino, fh, offset } => {
                Reply::Entries(p.readdir(ino, fh, offset).await?)
            }
            Request::ReadDirPlus { ino, fh, offset } => {
                Reply::EntriesPlus(p.readdirplus(ino, fh, offset).await?)
            }
            Request::OpenDir { ino, flags } => Reply::Opened(p.opendir(ino, flags).await?),
            Request::ReleaseDir { ino, fh } => {
                p.releasedir(ino, fh).await?;
                Reply::None
            }
            Request::FsyncDir { ino, fh, datasync } => {
                p.fsyncdir(ino, fh, datasync).await?;
                Reply::None
            }
            Request::Open { ino, flags } => Reply::Opened(p.open(ino, flags).await?),
            Request::Read {
                ino,
                fh,
                offset,
                size,
            } => Reply::Data(p.read(ino, fh, offset, size).await?),
            Request::Write {
                ino,
                fh,
                offset,
                data,
            } => Reply::Written(p.write(ino, fh, offset, data).await?),
            Request::Flush {
                ino,
                fh,
                lock_owner,
            } => {
                p.flush(ino, fh, lock_owner).await?;
                Reply::None
            }
            Request::Fsync { ino, fh, datasync } => {
                p.fsync(ino, fh, datasync).await?;
                Reply::None
            }
            Request::Release { ino, fh } => {
                p.release(ino, fh).await?;
                Reply::None
            }
            Request::Create {
                parent,
                name,
                mode,
                flags,
            } => Reply::Created(p.create(parent, &name, mode, flags).await?),
            Request::MkNod {
                parent,
                name,
                mode,
                rdev,
            } => Reply::Entry(p.mknod(parent, &name, mode, rdev).await?),
            Request::MkDir { parent, name, mode } => {
                Reply::Entry(p.mkdir(parent, &name, mode).await?)
            }
            Request::Unlink { parent, name } => {
                p.unlink(parent, &name).await?;
                Reply::None
            }
            Request::RmDir { parent, name } => {
                p.rmdir(parent, &name).await?;
                Reply::None
            }
            Request::Link {
                ino,
                newparent,
                newname,
            } => Reply::Entry(p.link(ino, newparent, &newname).await?),
            Request::Symlink {
                parent,
                name,
                target,
            } => Reply::Entry(p.symlink(parent, &name, &target).await?),
            Request::ReadLink { ino } => Reply::Target(p.readlink(ino).await?),
            Request::Rename {
                parent,
                name,
                newparent,
                newname,
                flags,
            } => {
                p.rename(parent, &name, newparent, &newname, flags).await?;
                Reply::None
            }
            Request::SetXattr {
                ino,
                name,
                value,
                flags,
            } => {
                p.setxattr(ino, &name, &value, flags).await?;
                Reply::None
            }
            Request::GetXattr { ino, name, size } => sized(p.getxattr(ino, &name).await?, size)?,
            Request::ListXattr { ino, size } => {
                let mut names = Vec::new();
                for name in p.listxattr(ino).await? {
                    names.extend_from_slice(name.as_bytes());
                    names.push(0);
                }
                sized(names, size)?
            }
            Request::RemoveXattr { ino, name } => {
                p.removexattr(ino, &name).await?;
                Reply::None
            }
            Request::Access { ino, mask } => {
                p.access(ino, mask).await?;
                Reply::None
            }
            Request::StatFs { ino } => Reply::StatFs(p.statfs(ino).await?),
            Request::GetLk { ino, fh, lock } => Reply::Lock(p.getlk(ino, fh, lock).await?),
            Request::SetLk {
                ino,
                fh,
                lock,
                sleep,
            } => {
                p.setlk(ino, fh, lock, sleep).await?;
                Reply::None
            }
            Request::Flock { ino, fh, op } => {
                p.flock(ino, fh, op).await?;
                Reply::None
            }
            Request::Bmap {
                ino,
                blocksize,
                idx,
            } => Reply::Block(p.bmap(ino, blocksize, idx).await?),
            Request::Ioctl {
                ino,
                fh,
                cmd,
                input,
                out_size,
            } => Reply::Ioctl(p.ioctl(ino, fh, cmd, &input, out_size).await?),
            Request::Poll { ino, fh, events } => Reply::Poll(p.poll(ino, fh, events).await?),
            Request::Fallocate {
                ino,
                fh,
                offset,
                length,
                mode,
            } => {
                p.fallocate(ino, fh, offset, length, mode).await?;
                Reply::None
            }
            Request::CopyFileRange(range) => Reply::Copied(p.copy_file_range(range).await?),
            Request::Lseek {
                ino,
                fh,
                offset,
                whence,
            } => Reply::Offset(p.lseek(ino, fh, offset, whence).await?),
            Request::TmpFile {
                parent,
                mode,
                flags,
            } => Reply::Created(p.tmpfile(parent, mode, flags).await?),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_query_reports_length() {
        assert_eq!(sized(b"abc".to_vec(), 0).unwrap(), Reply::XattrSize(3));
    }

    #[test]
    fn short_buffer_is_out_of_range() {
        let err = sized(b"abcdef".to_vec(), 3).unwrap_err();
        assert_eq!(err.errno(), Errno(libc::ERANGE));
    }

    #[test]
    fn large_enough_buffer_gets_payload() {
        assert_eq!(
            sized(b"abc".to_vec(), 16).unwrap(),
            Reply::Xattr(b"abc".to_vec())
        );
    }
}
