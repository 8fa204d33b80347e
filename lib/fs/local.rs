//! A backend that directly overlays a host directory.
//!
//! Host inode numbers are passed through unchanged, except that the exported directory itself is
//! always reported as [`ROOT_INO`]. Every blocking syscall runs on tokio's blocking pool.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{
    DirBuilderExt as _, FileExt as _, MetadataExt as _, OpenOptionsExt as _, PermissionsExt as _,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::stat::{Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::AccessFlags;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{instrument, warn};

use super::handle_table::HandleTable;
use super::{
    BLOCK_SIZE, CopyRange, Created, DirEntry, DirEntryPlus, FileHandle, FileKind, FileStat,
    FsError, Ino, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

const RENAME_NOREPLACE: u32 = 1;

struct Node {
    path: PathBuf,
    /// Kernel references handed out by lookups and creations.
    refs: u64,
}

/// Passthrough provider over a host directory.
pub struct LocalProvider {
    root: PathBuf,
    root_host_ino: u64,
    nodes: RwLock<FxHashMap<Ino, Node>>,
    files: HandleTable<Arc<File>>,
    dirs: HandleTable<Ino>,
}

/// Run a blocking filesystem call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, FsError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::IoFailure(Some(io::Error::other(e))))?
        .map_err(FsError::from)
}

fn timestamp(secs: i64, nsec: i64) -> SystemTime {
    let nanos = u32::try_from(nsec).unwrap_or(0);
    match u64::try_from(secs) {
        Ok(secs) => UNIX_EPOCH + Duration::new(secs, nanos),
        Err(_) => UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()),
    }
}

fn open_options(flags: OpenFlags) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true)
        .write(flags.is_writable())
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNC) && flags.is_writable());
    opts
}

impl LocalProvider {
    /// Export `root`, which must be an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut nodes = FxHashMap::default();
        nodes.insert(
            ROOT_INO,
            Node {
                path: root.clone(),
                refs: 1,
            },
        );
        Ok(Self {
            root,
            root_host_ino: meta.ino(),
            nodes: RwLock::new(nodes),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
        })
    }

    /// The exported host directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn visible(&self, host_ino: u64) -> Ino {
        if host_ino == self.root_host_ino {
            ROOT_INO
        } else {
            host_ino
        }
    }

    fn stat_of(&self, meta: &Metadata) -> FileStat {
        FileStat {
            ino: self.visible(meta.ino()),
            mode: meta.mode(),
            size: meta.size(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
            uid: meta.uid(),
            gid: meta.gid(),
            dev: meta.dev(),
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            rdev: u32::try_from(meta.rdev()).unwrap_or(u32::MAX),
            blksize: u32::try_from(meta.blksize()).unwrap_or(BLOCK_SIZE),
            blocks: meta.blocks(),
        }
    }

    fn path(&self, ino: Ino) -> Result<PathBuf, FsError> {
        self.nodes
            .read()
            .get(&ino)
            .map(|node| node.path.clone())
            .ok_or(FsError::NotFound)
    }

    fn child(&self, parent: Ino, name: &OsStr) -> Result<PathBuf, FsError> {
        if name.is_empty() || name == "." || name == ".." || name.as_encoded_bytes().contains(&b'/')
        {
            return Err(FsError::InvalidArgument);
        }
        Ok(self.path(parent)?.join(name))
    }

    /// Remember where `stat` lives, taking `refs` kernel references.
    fn record(&self, stat: &FileStat, path: PathBuf, refs: u64) {
        let mut nodes = self.nodes.write();
        let node = nodes.entry(stat.ino).or_insert(Node { path, refs: 0 });
        node.refs += refs;
    }

    async fn stat_path(&self, path: PathBuf) -> Result<FileStat, FsError> {
        let meta = blocking(move || fs::symlink_metadata(path)).await?;
        Ok(self.stat_of(&meta))
    }

    /// Stat `path` and register it with one kernel reference.
    async fn entry(&self, path: PathBuf) -> Result<FileStat, FsError> {
        let stat = self.stat_path(path.clone()).await?;
        self.record(&stat, path, 1);
        Ok(stat)
    }

    /// Point every recorded path under `from` at `to` after a rename.
    fn repath(&self, from: &Path, to: &Path) {
        let mut nodes = self.nodes.write();
        for node in nodes.values_mut() {
            if let Ok(rest) = node.path.strip_prefix(from) {
                node.path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
            }
        }
    }

    async fn listing(&self, path: PathBuf) -> Result<Vec<(OsString, Metadata)>, FsError> {
        blocking(move || {
            let mut entries = fs::read_dir(&path)?
                .map(|entry| {
                    let entry = entry?;
                    Ok((entry.file_name(), entry.path().symlink_metadata()?))
                })
                .collect::<io::Result<Vec<_>>>()?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(entries)
        })
        .await
    }

    fn file(&self, fh: FileHandle) -> Result<Arc<File>, FsError> {
        self.files.get(fh)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn forget(&self, ino: Ino, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(&ino) else {
            warn!(ino, "forget called on an unknown inode");
            return;
        };
        if node.refs <= nlookup {
            nodes.remove(&ino);
        } else {
            node.refs -= nlookup;
        }
    }

    #[instrument(name = "LocalProvider::lookup", skip(self))]
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        let path = self.child(parent, name)?;
        self.entry(path).await
    }

    async fn getattr(&self, ino: Ino, fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        if let Some(fh) = fh
            && let Ok(file) = self.file(fh)
        {
            let meta = blocking(move || file.metadata()).await?;
            return Ok(self.stat_of(&meta));
        }
        self.stat_path(self.path(ino)?).await
    }

    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let path = self.path(ino)?;
        let open = fh.and_then(|fh| self.file(fh).ok());
        let meta = blocking(move || {
            if let Some(mode) = attr.mode {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
            if attr.uid.is_some() || attr.gid.is_some() {
                std::os::unix::fs::lchown(&path, attr.uid, attr.gid)?;
            }
            if let Some(size) = attr.size {
                match &open {
                    Some(file) => file.set_len(size)?,
                    None => OpenOptions::new().write(true).open(&path)?.set_len(size)?,
                }
            }
            if attr.atime.is_some() || attr.mtime.is_some() {
                let mut times = FileTimes::new();
                if let Some(atime) = attr.atime {
                    times = times.set_accessed(atime.resolve());
                }
                if let Some(mtime) = attr.mtime {
                    times = times.set_modified(mtime.resolve());
                }
                match &open {
                    Some(file) => file.set_times(times)?,
                    None => File::open(&path)?.set_times(times)?,
                }
            }
            fs::symlink_metadata(&path)
        })
        .await?;
        Ok(self.stat_of(&meta))
    }

    async fn readdir(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.dirs.get(fh)?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .listing(self.path(dir)?)
            .await?
            .into_iter()
            .skip(skip)
            .map(|(name, meta)| DirEntry {
                ino: self.visible(meta.ino()),
                name,
                mode: meta.mode(),
            })
            .collect())
    }

    async fn readdirplus(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        let dir = self.dirs.get(fh)?;
        let parent = self.path(dir)?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .listing(parent.clone())
            .await?
            .into_iter()
            .skip(skip)
            .map(|(name, meta)| {
                let stat = self.stat_of(&meta);
                self.record(&stat, parent.join(&name), 1);
                DirEntryPlus { name, stat }
            })
            .collect())
    }

    async fn opendir(&self, ino: Ino, _flags: OpenFlags) -> Result<FileHandle, FsError> {
        let stat = self.stat_path(self.path(ino)?).await?;
        if !stat.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(self.dirs.insert(ino))
    }

    async fn releasedir(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.dirs.remove(fh).map(|_| ())
    }

    async fn fsyncdir(&self, _ino: Ino, fh: FileHandle, _datasync: bool) -> Result<(), FsError> {
        let path = self.path(self.dirs.get(fh)?)?;
        blocking(move || File::open(path)?.sync_all()).await
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let path = self.path(ino)?;
        let file = blocking(move || open_options(flags).open(path)).await?;
        Ok(self.files.insert(Arc::new(file)))
    }

    #[instrument(name = "LocalProvider::read", skip(self))]
    async fn read(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let file = self.file(fh)?;
        blocking(move || {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
    }

    #[instrument(name = "LocalProvider::write", skip(self, data), fields(len = data.len()))]
    async fn write(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let file = self.file(fh)?;
        let len = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        blocking(move || file.write_all_at(&data, offset)).await?;
        Ok(len)
    }

    async fn flush(&self, _ino: Ino, fh: FileHandle, _lock_owner: u64) -> Result<(), FsError> {
        self.file(fh).map(|_| ())
    }

    async fn fsync(&self, _ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let file = self.file(fh)?;
        blocking(move || {
            if datasync {
                file.sync_data()
            } else {
                file.sync_all()
            }
        })
        .await
    }

    async fn release(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.files.remove(fh).map(|_| ())
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let path = self.child(parent, name)?;
        let target = path.clone();
        let (file, meta) = blocking(move || {
            let file = open_options(flags)
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(target)?;
            let meta = file.metadata()?;
            Ok((file, meta))
        })
        .await?;
        let stat = self.stat_of(&meta);
        self.record(&stat, path, 1);
        Ok(Created {
            stat,
            fh: self.files.insert(Arc::new(file)),
        })
    }

    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        if matches!(
            FileKind::from_mode(mode),
            FileKind::Directory | FileKind::Symlink
        ) {
            return Err(FsError::InvalidArgument);
        }
        let path = self.child(parent, name)?;
        let target = path.clone();
        #[allow(clippy::allow_attributes)]
        #[allow(
            clippy::useless_conversion,
            clippy::cast_possible_truncation,
            clippy::cast_possible_wrap
        )]
        let (kind, perm, dev) = (
            SFlag::from_bits_truncate((mode & 0o170_000) as libc::mode_t),
            Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t),
            rdev as libc::dev_t,
        );
        blocking(move || {
            nix::sys::stat::mknod(&target, kind, perm, dev)
                .map_err(io::Error::from)
        })
        .await?;
        self.entry(path).await
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        let path = self.child(parent, name)?;
        let target = path.clone();
        blocking(move || fs::DirBuilder::new().mode(mode & 0o7777).create(target)).await?;
        self.entry(path).await
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let path = self.child(parent, name)?;
        blocking(move || fs::remove_file(path)).await
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let path = self.child(parent, name)?;
        blocking(move || fs::remove_dir(path)).await
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        let source = self.path(ino)?;
        let path = self.child(newparent, newname)?;
        let target = path.clone();
        blocking(move || fs::hard_link(source, target)).await?;
        let stat = self.stat_path(path).await?;
        self.record(&stat, self.path(ino)?, 1);
        Ok(stat)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        let path = self.child(parent, name)?;
        let (link, target) = (path.clone(), target.to_path_buf());
        blocking(move || std::os::unix::fs::symlink(target, link)).await?;
        self.entry(path).await
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        let path = self.path(ino)?;
        blocking(move || fs::read_link(path)).await
    }

    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(FsError::NotSupported);
        }
        let from = self.child(parent, name)?;
        let to = self.child(newparent, newname)?;
        let (src, dst) = (from.clone(), to.clone());
        blocking(move || {
            if flags & RENAME_NOREPLACE != 0 && fs::symlink_metadata(&dst).is_ok() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            fs::rename(src, dst)
        })
        .await?;
        self.repath(&from, &to);
        Ok(())
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        let path = self.path(ino)?;
        blocking(move || {
            nix::unistd::access(&path, AccessFlags::from_bits_truncate(mask))
                .map_err(io::Error::from)
        })
        .await
    }

    async fn statfs(&self, _ino: Ino) -> Result<StatFs, FsError> {
        let root = self.root.clone();
        let stat = blocking(move || statvfs(&root).map_err(io::Error::from)).await?;
        #[allow(clippy::allow_attributes)]
        #[allow(clippy::useless_conversion)]
        let (blocks, blocks_free, blocks_available, files, files_free) = (
            u64::from(stat.blocks()),
            u64::from(stat.blocks_free()),
            u64::from(stat.blocks_available()),
            u64::from(stat.files()),
            u64::from(stat.files_free()),
        );
        Ok(StatFs {
            blocks,
            blocks_free,
            blocks_available,
            files,
            files_free,
            block_size: u32::try_from(stat.block_size()).unwrap_or(BLOCK_SIZE),
            max_name_length: u32::try_from(stat.name_max()).unwrap_or(255),
            fragment_size: u32::try_from(stat.fragment_size()).unwrap_or(BLOCK_SIZE),
        })
    }

    /// Only plain preallocation (`mode == 0`) is supported; the file is grown to cover the range.
    async fn fallocate(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        if mode != 0 {
            return Err(FsError::NotSupported);
        }
        let file = self.file(fh)?;
        blocking(move || {
            let end = offset.saturating_add(length);
            if file.metadata()?.len() < end {
                file.set_len(end)?;
            }
            Ok(())
        })
        .await
    }

    async fn copy_file_range(&self, range: CopyRange) -> Result<u64, FsError> {
        let (src, dst) = (self.file(range.fh_in)?, self.file(range.fh_out)?);
        blocking(move || {
            let mut buf = vec![0u8; 64 * 1024];
            let mut copied = 0u64;
            while copied < range.len {
                let want = usize::try_from(range.len - copied)
                    .unwrap_or(usize::MAX)
                    .min(buf.len());
                let n = src.read_at(&mut buf[..want], range.offset_in + copied)?;
                if n == 0 {
                    break;
                }
                dst.write_all_at(&buf[..n], range.offset_out + copied)?;
                copied += n as u64;
            }
            Ok(copied)
        })
        .await
    }
}
