//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`ProtocolBridge::dispatch`].
//!
//! fuser calls back on its single session thread. Every callback turns its arguments into a
//! [`Request`] and spawns the dispatch on the tokio runtime, so slow backends never stall the
//! session loop and requests for distinct inodes run concurrently.

use std::ffi::{OsStr, c_int};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, error, instrument};

use super::bridge::{ProtocolBridge, Reply, Request};
use super::{CopyRange, FileKind, FileLock, FileStat, OpenFlags, SetAttr, TimeOrNow};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply: Send + 'static {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyDirectoryPlus,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
    fuser::ReplyStatfs,
    fuser::ReplyXattr,
    fuser::ReplyLock,
    fuser::ReplyBmap,
    fuser::ReplyIoctl,
    fuser::ReplyPoll,
    fuser::ReplyLseek,
);

/// A reply variant that does not belong to the request. Indicates a bridge defect.
fn mismatched<R: FuseReply>(reply: R, got: &Reply) {
    error!(?got, "bridge returned a reply of the wrong shape");
    reply.error(libc::EIO);
}

const fn file_type(kind: FileKind) -> fuser::FileType {
    match kind {
        FileKind::RegularFile => fuser::FileType::RegularFile,
        FileKind::Directory => fuser::FileType::Directory,
        FileKind::Symlink => fuser::FileType::Symlink,
        FileKind::CharDevice => fuser::FileType::CharDevice,
        FileKind::BlockDevice => fuser::FileType::BlockDevice,
        FileKind::NamedPipe => fuser::FileType::NamedPipe,
        FileKind::Socket => fuser::FileType::Socket,
    }
}

impl From<&FileStat> for fuser::FileAttr {
    fn from(stat: &FileStat) -> Self {
        Self {
            ino: stat.ino,
            size: stat.size,
            blocks: stat.blocks,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            crtime: stat.ctime,
            kind: file_type(stat.kind()),
            perm: stat.perm(),
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev,
            blksize: stat.blksize,
            flags: 0,
        }
    }
}

fn time_or_now(t: fuser::TimeOrNow) -> TimeOrNow {
    match t {
        fuser::TimeOrNow::SpecificTime(t) => TimeOrNow::At(t),
        fuser::TimeOrNow::Now => TimeOrNow::Now,
    }
}

/// Kernel offsets are signed; a negative one can never be valid.
fn unsigned(offset: i64) -> Option<u64> {
    u64::try_from(offset).ok()
}

/// Bridges a [`ProtocolBridge`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter {
    bridge: Arc<ProtocolBridge>,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    // Composed backends can change underneath the kernel, so attributes and entries are only
    // trusted for a second.
    const TTL: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(bridge: Arc<ProtocolBridge>, runtime: tokio::runtime::Handle) -> Self {
        Self { bridge, runtime }
    }

    /// Dispatch `request` in the background and hand its result to `on_ok`.
    fn serve<R: FuseReply>(
        &self,
        request: Request,
        reply: R,
        on_ok: impl FnOnce(Reply, R) + Send + 'static,
    ) {
        let bridge = Arc::clone(&self.bridge);
        drop(self.runtime.spawn(async move {
            match bridge.dispatch(request).await {
                Ok(val) => on_ok(val, reply),
                Err(errno) => reply.error(errno.into()),
            }
        }));
    }

    fn serve_empty(&self, request: Request, reply: fuser::ReplyEmpty) {
        self.serve(request, reply, |val, reply| match val {
            Reply::None => reply.ok(),
            other => mismatched(reply, &other),
        });
    }

    fn serve_entry(&self, request: Request, reply: fuser::ReplyEntry) {
        self.serve(request, reply, |val, reply| match val {
            Reply::Entry(stat) => reply.entry(&Self::TTL, &(&stat).into(), 0),
            other => mismatched(reply, &other),
        });
    }

    fn serve_attr(&self, request: Request, reply: fuser::ReplyAttr) {
        self.serve(request, reply, |val, reply| match val {
            Reply::Attr(stat) => reply.attr(&Self::TTL, &(&stat).into()),
            other => mismatched(reply, &other),
        });
    }

    fn serve_opened(&self, request: Request, reply: fuser::ReplyOpen) {
        self.serve(request, reply, |val, reply| match val {
            Reply::Opened(fh) => {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            }
            other => mismatched(reply, &other),
        });
    }

    fn serve_xattr(&self, request: Request, reply: fuser::ReplyXattr) {
        self.serve(request, reply, |val, reply| match val {
            Reply::XattrSize(len) => reply.size(len),
            Reply::Xattr(data) => reply.data(&data),
            other => mismatched(reply, &other),
        });
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), c_int> {
        self.runtime
            .block_on(self.bridge.dispatch(Request::Init))
            .map(|_| ())
            .map_err(i32::from)
    }

    fn destroy(&mut self) {
        let _ = self.runtime.block_on(self.bridge.dispatch(Request::Destroy));
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_os_string();
        self.serve_entry(Request::Lookup { parent, name }, reply);
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        let bridge = Arc::clone(&self.bridge);
        drop(self.runtime.spawn(async move {
            let _ = bridge.dispatch(Request::Forget { ino, nlookup }).await;
        }));
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.serve_attr(Request::GetAttr { ino, fh }, reply);
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let attr = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            ctime,
        };
        self.serve_attr(Request::SetAttr { ino, fh, attr }, reply);
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.serve(Request::ReadLink { ino }, reply, |val, reply| match val {
            Reply::Target(path) => reply.data(path.as_os_str().as_encoded_bytes()),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::mknod", skip(self, _req, reply))]
    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_os_string();
        let mode = mode & !umask;
        self.serve_entry(
            Request::MkNod {
                parent,
                name,
                mode,
                rdev,
            },
            reply,
        );
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let name = name.to_os_string();
        let mode = mode & !umask;
        self.serve_entry(Request::MkDir { parent, name, mode }, reply);
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = name.to_os_string();
        self.serve_empty(Request::Unlink { parent, name }, reply);
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = name.to_os_string();
        self.serve_empty(Request::RmDir { parent, name }, reply);
    }

    #[instrument(name = "FuserAdapter::symlink", skip(self, _req, reply))]
    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        let request = Request::Symlink {
            parent,
            name: link_name.to_os_string(),
            target: target.to_path_buf(),
        };
        self.serve_entry(request, reply);
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let request = Request::Rename {
            parent,
            name: name.to_os_string(),
            newparent,
            newname: newname.to_os_string(),
            flags,
        };
        self.serve_empty(request, reply);
    }

    #[instrument(name = "FuserAdapter::link", skip(self, _req, reply))]
    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let newname = newname.to_os_string();
        self.serve_entry(
            Request::Link {
                ino,
                newparent,
                newname,
            },
            reply,
        );
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from(flags);
        self.serve_opened(Request::Open { ino, flags }, reply);
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Some(offset) = unsigned(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let request = Request::Read {
            ino,
            fh,
            offset,
            size,
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Data(data) => {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            }
            other => mismatched(reply, &other),
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let Some(offset) = unsigned(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let request = Request::Write {
            ino,
            fh,
            offset,
            data: Bytes::copy_from_slice(data),
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Written(n) => reply.written(n),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.serve_empty(
            Request::Flush {
                ino,
                fh,
                lock_owner,
            },
            reply,
        );
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.serve_empty(Request::Release { ino, fh }, reply);
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.serve_empty(Request::Fsync { ino, fh, datasync }, reply);
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, reply))]
    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let flags = OpenFlags::from(flags);
        self.serve_opened(Request::OpenDir { ino, flags }, reply);
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        let Some(start) = unsigned(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let request = Request::ReadDir {
            ino,
            fh,
            offset: start,
        };
        self.serve(request, reply, move |val, mut reply| {
            let entries = match val {
                Reply::Entries(entries) => entries,
                other => return mismatched(reply, &other),
            };
            for (next, entry) in (offset + 1..).zip(entries.iter()) {
                if reply.add(entry.ino, next, file_type(entry.kind()), &entry.name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::readdirplus", skip(self, _req, reply))]
    fn readdirplus(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectoryPlus,
    ) {
        let Some(start) = unsigned(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let request = Request::ReadDirPlus {
            ino,
            fh,
            offset: start,
        };
        let bridge = Arc::clone(&self.bridge);
        self.serve(request, reply, move |val, mut reply| {
            let entries = match val {
                Reply::EntriesPlus(entries) => entries,
                other => return mismatched(reply, &other),
            };
            let mut unsent = Vec::new();
            for (next, entry) in (offset + 1..).zip(entries.iter()) {
                if !unsent.is_empty()
                    || reply.add(
                        entry.stat.ino,
                        next,
                        &entry.name,
                        &Self::TTL,
                        &(&entry.stat).into(),
                        0,
                    )
                {
                    unsent.push(entry.stat.ino);
                }
            }
            reply.ok();
            // Entries the kernel never received must not keep a lookup reference.
            if !unsent.is_empty() {
                drop(tokio::spawn(async move {
                    for ino in unsent {
                        let _ = bridge.dispatch(Request::Forget { ino, nlookup: 1 }).await;
                    }
                }));
            }
        });
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.serve_empty(Request::ReleaseDir { ino, fh }, reply);
    }

    #[instrument(name = "FuserAdapter::fsyncdir", skip(self, _req, reply))]
    fn fsyncdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.serve_empty(Request::FsyncDir { ino, fh, datasync }, reply);
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        self.serve(Request::StatFs { ino }, reply, |val, reply| match val {
            Reply::StatFs(stats) => {
                debug!(?stats, "replying...");
                reply.statfs(
                    stats.blocks,
                    stats.blocks_free,
                    stats.blocks_available,
                    stats.files,
                    stats.files_free,
                    stats.block_size,
                    stats.max_name_length,
                    stats.fragment_size,
                );
            }
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::setxattr", skip(self, _req, value, _position, reply))]
    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let request = Request::SetXattr {
            ino,
            name: name.to_os_string(),
            value: value.to_vec(),
            flags,
        };
        self.serve_empty(request, reply);
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, _req, reply))]
    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let name = name.to_os_string();
        self.serve_xattr(Request::GetXattr { ino, name, size }, reply);
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, _req, reply))]
    fn listxattr(&mut self, _req: &fuser::Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        self.serve_xattr(Request::ListXattr { ino, size }, reply);
    }

    #[instrument(name = "FuserAdapter::removexattr", skip(self, _req, reply))]
    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = name.to_os_string();
        self.serve_empty(Request::RemoveXattr { ino, name }, reply);
    }

    #[instrument(name = "FuserAdapter::access", skip(self, _req, reply))]
    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.serve_empty(Request::Access { ino, mask }, reply);
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let request = Request::Create {
            parent,
            name: name.to_os_string(),
            mode: mode & !umask,
            flags: OpenFlags::from(flags),
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Created(created) => {
                reply.created(&Self::TTL, &(&created.stat).into(), 0, created.fh, 0);
            }
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::getlk", skip(self, _req, reply))]
    fn getlk(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: fuser::ReplyLock,
    ) {
        let lock = FileLock {
            owner: lock_owner,
            start,
            end,
            typ,
            pid,
        };
        self.serve(Request::GetLk { ino, fh, lock }, reply, |val, reply| match val {
            Reply::Lock(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::setlk", skip(self, _req, reply))]
    fn setlk(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let lock = FileLock {
            owner: lock_owner,
            start,
            end,
            typ,
            pid,
        };
        self.serve_empty(
            Request::SetLk {
                ino,
                fh,
                lock,
                sleep,
            },
            reply,
        );
    }

    #[instrument(name = "FuserAdapter::bmap", skip(self, _req, reply))]
    fn bmap(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        blocksize: u32,
        idx: u64,
        reply: fuser::ReplyBmap,
    ) {
        let request = Request::Bmap {
            ino,
            blocksize,
            idx,
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Block(block) => reply.bmap(block),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::ioctl", skip(self, _req, _flags, in_data, reply))]
    fn ioctl(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: fuser::ReplyIoctl,
    ) {
        let request = Request::Ioctl {
            ino,
            fh,
            cmd,
            input: in_data.to_vec(),
            out_size,
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Ioctl(out) => reply.ioctl(out.result, &out.data),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::poll", skip(self, _req, _ph, _flags, reply))]
    fn poll(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _ph: fuser::PollHandle,
        events: u32,
        _flags: u32,
        reply: fuser::ReplyPoll,
    ) {
        self.serve(Request::Poll { ino, fh, events }, reply, |val, reply| match val {
            Reply::Poll(revents) => reply.poll(revents),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::fallocate", skip(self, _req, reply))]
    fn fallocate(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let (Some(offset), Some(length)) = (unsigned(offset), unsigned(length)) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.serve_empty(
            Request::Fallocate {
                ino,
                fh,
                offset,
                length,
                mode,
            },
            reply,
        );
    }

    #[instrument(name = "FuserAdapter::lseek", skip(self, _req, reply))]
    fn lseek(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: fuser::ReplyLseek,
    ) {
        let request = Request::Lseek {
            ino,
            fh,
            offset,
            whence,
        };
        self.serve(request, reply, |val, reply| match val {
            Reply::Offset(offset) => reply.offset(offset),
            other => mismatched(reply, &other),
        });
    }

    #[instrument(name = "FuserAdapter::copy_file_range", skip(self, _req, reply))]
    fn copy_file_range(
        &mut self,
        _req: &fuser::Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: fuser::ReplyWrite,
    ) {
        let (Some(offset_in), Some(offset_out)) = (unsigned(offset_in), unsigned(offset_out))
        else {
            reply.error(libc::EINVAL);
            return;
        };
        let range = CopyRange {
            ino_in,
            fh_in,
            offset_in,
            ino_out,
            fh_out,
            offset_out,
            len,
            flags,
        };
        self.serve(Request::CopyFileRange(range), reply, |val, reply| match val {
            Reply::Copied(n) => reply.written(u32::try_from(n).unwrap_or(u32::MAX)),
            other => mismatched(reply, &other),
        });
    }
}
