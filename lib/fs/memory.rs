//! In-memory backend.
//!
//! A complete tree kept behind a single [`parking_lot::RwLock`]. Nothing here awaits while the
//! lock is held, so every operation is effectively atomic with respect to the others.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::handle_table::HandleTable;
use super::{
    BLOCK_SIZE, CopyRange, Created, DirEntry, DirEntryPlus, FileHandle, FileKind, FileStat,
    FsError, Ino, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

const XATTR_CREATE: i32 = 1;
const XATTR_REPLACE: i32 = 2;
const RENAME_NOREPLACE: u32 = 1;
const RENAME_EXCHANGE: u32 = 2;
const FALLOC_FL_KEEP_SIZE: i32 = 1;
const FALLOC_FL_PUNCH_HOLE: i32 = 2;
const NAME_MAX: usize = 255;

enum Body {
    File(Vec<u8>),
    Dir {
        parent: Ino,
        entries: BTreeMap<OsString, Ino>,
    },
    Symlink(PathBuf),
    Special,
}

struct Node {
    stat: FileStat,
    body: Body,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    /// Open handles referencing this node.
    open: u32,
}

impl Node {
    fn touch(&mut self) {
        let now = SystemTime::now();
        self.stat.mtime = now;
        self.stat.ctime = now;
    }

    fn file(&self) -> Result<&Vec<u8>, FsError> {
        match &self.body {
            Body::File(data) => Ok(data),
            Body::Dir { .. } => Err(FsError::IsADirectory),
            Body::Symlink(_) | Body::Special => Err(FsError::InvalidArgument),
        }
    }

    fn file_mut(&mut self) -> Result<&mut Vec<u8>, FsError> {
        match &mut self.body {
            Body::File(data) => Ok(data),
            Body::Dir { .. } => Err(FsError::IsADirectory),
            Body::Symlink(_) | Body::Special => Err(FsError::InvalidArgument),
        }
    }

    fn entries(&self) -> Result<&BTreeMap<OsString, Ino>, FsError> {
        match &self.body {
            Body::Dir { entries, .. } => Ok(entries),
            Body::File(_) | Body::Symlink(_) | Body::Special => Err(FsError::NotADirectory),
        }
    }

    fn entries_mut(&mut self) -> Result<&mut BTreeMap<OsString, Ino>, FsError> {
        match &mut self.body {
            Body::Dir { entries, .. } => Ok(entries),
            Body::File(_) | Body::Symlink(_) | Body::Special => Err(FsError::NotADirectory),
        }
    }

    fn resize(&mut self, len: usize) -> Result<(), FsError> {
        self.file_mut()?.resize(len, 0);
        self.sync_size();
        Ok(())
    }

    fn sync_size(&mut self) {
        if let Body::File(data) = &self.body {
            self.stat.size = data.len() as u64;
            self.stat.blocks = self.stat.size.div_ceil(512);
        }
    }
}

struct Tree {
    nodes: FxHashMap<Ino, Node>,
    next_ino: Ino,
    uid: u32,
    gid: u32,
}

impl Tree {
    fn new(uid: u32, gid: u32) -> Self {
        let mut nodes = FxHashMap::default();
        let mut stat = FileStat::new(ROOT_INO, FileKind::Directory.type_bits() | 0o755, uid, gid);
        stat.nlink = 2;
        nodes.insert(
            ROOT_INO,
            Node {
                stat,
                body: Body::Dir {
                    parent: ROOT_INO,
                    entries: BTreeMap::new(),
                },
                xattrs: BTreeMap::new(),
                open: 0,
            },
        );
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
            uid,
            gid,
        }
    }

    fn node(&self, ino: Ino) -> Result<&Node, FsError> {
        self.nodes.get(&ino).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, ino: Ino) -> Result<&mut Node, FsError> {
        self.nodes.get_mut(&ino).ok_or(FsError::NotFound)
    }

    fn child(&self, parent: Ino, name: &OsStr) -> Result<Ino, FsError> {
        self.node(parent)?
            .entries()?
            .get(name)
            .copied()
            .ok_or(FsError::NotFound)
    }

    fn check_name(name: &OsStr) -> Result<(), FsError> {
        let bytes = name.as_encoded_bytes();
        if bytes.is_empty() || bytes.len() > NAME_MAX || bytes.contains(&b'/') {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// Create a node and, when `name` is given, link it into `parent`.
    fn alloc(
        &mut self,
        parent: Ino,
        name: Option<&OsStr>,
        mode: u32,
        body: Body,
    ) -> Result<FileStat, FsError> {
        if let Some(name) = name {
            Self::check_name(name)?;
            if self.node(parent)?.entries()?.contains_key(name) {
                return Err(FsError::AlreadyExists);
            }
        } else {
            self.node(parent)?.entries()?;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        let mut stat = FileStat::new(ino, mode, self.uid, self.gid);
        let is_dir = matches!(body, Body::Dir { .. });
        stat.nlink = match (name, is_dir) {
            (None, _) => 0,
            (Some(_), true) => 2,
            (Some(_), false) => 1,
        };
        if let Body::Symlink(target) = &body {
            stat.size = target.as_os_str().len() as u64;
        }
        self.nodes.insert(
            ino,
            Node {
                stat,
                body,
                xattrs: BTreeMap::new(),
                open: 0,
            },
        );

        if let Some(name) = name {
            let dir = self.node_mut(parent)?;
            dir.entries_mut()?.insert(name.to_owned(), ino);
            if is_dir {
                dir.stat.nlink += 1;
            }
            dir.touch();
        }
        Ok(stat)
    }

    fn drop_link(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.stat.nlink = node.stat.nlink.saturating_sub(1);
            node.stat.ctime = SystemTime::now();
        }
        self.reap(ino);
    }

    /// Free a node once nothing names it and nothing holds it open.
    fn reap(&mut self, ino: Ino) {
        let dead = self
            .nodes
            .get(&ino)
            .is_some_and(|n| n.open == 0 && n.stat.nlink == 0);
        if dead && ino != ROOT_INO {
            self.nodes.remove(&ino);
        }
    }

    fn open_node(&mut self, ino: Ino) -> Result<(), FsError> {
        self.node_mut(ino)?.open += 1;
        Ok(())
    }

    fn close_node(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.open = node.open.saturating_sub(1);
        }
        self.reap(ino);
    }

    /// Whether `ancestor` is `ino` or one of its parent directories.
    fn is_ancestor(&self, ancestor: Ino, mut ino: Ino) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            match self.nodes.get(&ino).map(|n| &n.body) {
                Some(Body::Dir { parent, .. }) if *parent != ino => ino = *parent,
                _ => return false,
            }
        }
    }

    fn unlink_entry(&mut self, parent: Ino, name: &OsStr, want_dir: bool) -> Result<(), FsError> {
        let ino = self.child(parent, name)?;
        let node = self.node(ino)?;
        match (&node.body, want_dir) {
            (Body::Dir { entries, .. }, true) => {
                if !entries.is_empty() {
                    return Err(FsError::NotEmpty);
                }
            }
            (Body::Dir { .. }, false) => return Err(FsError::IsADirectory),
            (_, true) => return Err(FsError::NotADirectory),
            (_, false) => {}
        }

        let dir = self.node_mut(parent)?;
        dir.entries_mut()?.remove(name);
        if want_dir {
            dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
        }
        dir.touch();

        if want_dir {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.stat.nlink = 0;
            }
            self.reap(ino);
        } else {
            self.drop_link(ino);
        }
        Ok(())
    }

    fn rename(
        &mut self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        Self::check_name(newname)?;
        let src = self.child(parent, name)?;
        let src_is_dir = self.node(src)?.stat.is_dir();
        self.node(newparent)?.entries()?;
        if src_is_dir && self.is_ancestor(src, newparent) {
            return Err(FsError::InvalidArgument);
        }

        let existing = self.child(newparent, newname).ok();

        if flags & RENAME_EXCHANGE != 0 {
            let dst = existing.ok_or(FsError::NotFound)?;
            self.node_mut(parent)?
                .entries_mut()?
                .insert(name.to_owned(), dst);
            self.node_mut(newparent)?
                .entries_mut()?
                .insert(newname.to_owned(), src);
            self.reparent(src, newparent);
            self.reparent(dst, parent);
            return Ok(());
        }

        if let Some(dst) = existing {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(FsError::AlreadyExists);
            }
            if dst == src {
                return Ok(());
            }
            let dst_is_dir = self.node(dst)?.stat.is_dir();
            match (src_is_dir, dst_is_dir) {
                (true, false) => return Err(FsError::NotADirectory),
                (false, true) => return Err(FsError::IsADirectory),
                _ => {}
            }
            self.unlink_entry(newparent, newname, dst_is_dir)?;
        }

        let from = self.node_mut(parent)?;
        from.entries_mut()?.remove(name);
        if src_is_dir {
            from.stat.nlink = from.stat.nlink.saturating_sub(1);
        }
        from.touch();

        let to = self.node_mut(newparent)?;
        to.entries_mut()?.insert(newname.to_owned(), src);
        if src_is_dir {
            to.stat.nlink += 1;
        }
        to.touch();

        self.reparent(src, newparent);
        if let Some(node) = self.nodes.get_mut(&src) {
            node.stat.ctime = SystemTime::now();
        }
        Ok(())
    }

    fn reparent(&mut self, ino: Ino, new_parent: Ino) {
        if let Some(Node {
            body: Body::Dir { parent, .. },
            ..
        }) = self.nodes.get_mut(&ino)
        {
            *parent = new_parent;
        }
    }

    fn list(&self, ino: Ino, offset: u64) -> Result<Vec<(OsString, FileStat)>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        self.node(ino)?
            .entries()?
            .iter()
            .skip(skip)
            .map(|(name, &child)| Ok((name.clone(), self.node(child)?.stat)))
            .collect()
    }

    fn used_bytes(&self) -> u64 {
        self.nodes
            .values()
            .map(|n| match &n.body {
                Body::File(data) => data.len() as u64,
                Body::Dir { .. } | Body::Symlink(_) | Body::Special => 0,
            })
            .sum()
    }
}

fn offset_to_usize(offset: u64) -> Result<usize, FsError> {
    usize::try_from(offset).map_err(|_| FsError::InvalidArgument)
}

/// A filesystem that lives entirely in process memory.
pub struct MemoryProvider {
    tree: RwLock<Tree>,
    handles: HandleTable<Ino>,
    capacity: u64,
}

impl MemoryProvider {
    /// Nominal capacity reported by `statfs`.
    const DEFAULT_CAPACITY: u64 = 1 << 30;

    /// An empty tree owned by the current user.
    #[must_use]
    pub fn new() -> Self {
        Self::with_owner(
            nix::unistd::Uid::current().as_raw(),
            nix::unistd::Gid::current().as_raw(),
        )
    }

    /// An empty tree whose objects are owned by `uid:gid`.
    #[must_use]
    pub fn with_owner(uid: u32, gid: u32) -> Self {
        Self {
            tree: RwLock::new(Tree::new(uid, gid)),
            handles: HandleTable::new(),
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    fn handle_ino(&self, fh: FileHandle) -> Result<Ino, FsError> {
        self.handles.get(fh)
    }

    fn open_handle(&self, tree: &mut Tree, ino: Ino) -> Result<FileHandle, FsError> {
        tree.open_node(ino)?;
        Ok(self.handles.insert(ino))
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        let tree = self.tree.read();
        let ino = tree.child(parent, name)?;
        Ok(tree.node(ino)?.stat)
    }

    async fn getattr(&self, ino: Ino, _fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        Ok(self.tree.read().node(ino)?.stat)
    }

    async fn setattr(
        &self,
        ino: Ino,
        _fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(ino)?;
        if let Some(size) = attr.size {
            node.resize(offset_to_usize(size)?)?;
            node.stat.mtime = SystemTime::now();
        }
        if let Some(mode) = attr.mode {
            node.stat.mode = (node.stat.mode & !0o7777) | (mode & 0o7777);
        }
        if let Some(uid) = attr.uid {
            node.stat.uid = uid;
        }
        if let Some(gid) = attr.gid {
            node.stat.gid = gid;
        }
        if let Some(atime) = attr.atime {
            node.stat.atime = atime.resolve();
        }
        if let Some(mtime) = attr.mtime {
            node.stat.mtime = mtime.resolve();
        }
        node.stat.ctime = attr.ctime.unwrap_or_else(SystemTime::now);
        Ok(node.stat)
    }

    async fn readdir(
        &self,
        ino: Ino,
        _fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        Ok(self
            .tree
            .read()
            .list(ino, offset)?
            .into_iter()
            .map(|(name, stat)| DirEntry {
                ino: stat.ino,
                name,
                mode: stat.mode,
            })
            .collect())
    }

    async fn readdirplus(
        &self,
        ino: Ino,
        _fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        Ok(self
            .tree
            .read()
            .list(ino, offset)?
            .into_iter()
            .map(|(name, stat)| DirEntryPlus { name, stat })
            .collect())
    }

    async fn opendir(&self, ino: Ino, _flags: OpenFlags) -> Result<FileHandle, FsError> {
        let mut tree = self.tree.write();
        tree.node(ino)?.entries()?;
        self.open_handle(&mut tree, ino)
    }

    async fn releasedir(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let ino = self.handles.remove(fh)?;
        self.tree.write().close_node(ino);
        Ok(())
    }

    async fn fsyncdir(&self, _ino: Ino, fh: FileHandle, _datasync: bool) -> Result<(), FsError> {
        self.handle_ino(fh).map(|_| ())
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(ino)?;
        if node.stat.is_dir() && flags.is_writable() {
            return Err(FsError::IsADirectory);
        }
        if flags.contains(OpenFlags::TRUNC) && flags.is_writable() {
            node.resize(0)?;
            node.touch();
        }
        self.open_handle(&mut tree, ino)
    }

    async fn read(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let ino = self.handle_ino(fh)?;
        let tree = self.tree.read();
        let data = tree.node(ino)?.file()?;
        let start = offset_to_usize(offset)?.min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let ino = self.handle_ino(fh)?;
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let start = offset_to_usize(offset)?;
        let end = start
            .checked_add(data.len())
            .ok_or(FsError::InvalidArgument)?;

        let mut tree = self.tree.write();
        if tree.used_bytes().saturating_add(data.len() as u64) > self.capacity {
            return Err(FsError::NoSpace);
        }
        let node = tree.node_mut(ino)?;
        let buf = node.file_mut()?;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        node.sync_size();
        node.touch();
        Ok(written)
    }

    async fn flush(&self, _ino: Ino, fh: FileHandle, _lock_owner: u64) -> Result<(), FsError> {
        self.handle_ino(fh).map(|_| ())
    }

    async fn fsync(&self, _ino: Ino, fh: FileHandle, _datasync: bool) -> Result<(), FsError> {
        self.handle_ino(fh).map(|_| ())
    }

    async fn release(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let ino = self.handles.remove(fh)?;
        self.tree.write().close_node(ino);
        Ok(())
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        _flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let mut tree = self.tree.write();
        let mode = FileKind::RegularFile.type_bits() | (mode & 0o7777);
        let stat = tree.alloc(parent, Some(name), mode, Body::File(Vec::new()))?;
        let fh = self.open_handle(&mut tree, stat.ino)?;
        Ok(Created { stat, fh })
    }

    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        let mut tree = self.tree.write();
        let body = match FileKind::from_mode(mode) {
            FileKind::RegularFile => Body::File(Vec::new()),
            FileKind::Directory | FileKind::Symlink => return Err(FsError::InvalidArgument),
            FileKind::CharDevice
            | FileKind::BlockDevice
            | FileKind::NamedPipe
            | FileKind::Socket => Body::Special,
        };
        let mode = if mode & 0o170_000 == 0 {
            FileKind::RegularFile.type_bits() | mode
        } else {
            mode
        };
        let stat = tree.alloc(parent, Some(name), mode, body)?;
        let node = tree.node_mut(stat.ino)?;
        node.stat.rdev = rdev;
        Ok(node.stat)
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        let mut tree = self.tree.write();
        let mode = FileKind::Directory.type_bits() | (mode & 0o7777);
        tree.alloc(
            parent,
            Some(name),
            mode,
            Body::Dir {
                parent,
                entries: BTreeMap::new(),
            },
        )
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.tree.write().unlink_entry(parent, name, false)
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        self.tree.write().unlink_entry(parent, name, true)
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        Tree::check_name(newname)?;
        let mut tree = self.tree.write();
        if tree.node(ino)?.stat.is_dir() {
            return Err(FsError::PermissionDenied);
        }
        let dir = tree.node_mut(newparent)?;
        let entries = dir.entries_mut()?;
        if entries.contains_key(newname) {
            return Err(FsError::AlreadyExists);
        }
        entries.insert(newname.to_owned(), ino);
        dir.touch();
        let node = tree.node_mut(ino)?;
        node.stat.nlink += 1;
        node.stat.ctime = SystemTime::now();
        Ok(node.stat)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        let mode = FileKind::Symlink.type_bits() | 0o777;
        self.tree
            .write()
            .alloc(parent, Some(name), mode, Body::Symlink(target.to_owned()))
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        match &self.tree.read().node(ino)?.body {
            Body::Symlink(target) => Ok(target.clone()),
            Body::File(_) | Body::Dir { .. } | Body::Special => Err(FsError::InvalidArgument),
        }
    }

    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        self.tree
            .write()
            .rename(parent, name, newparent, newname, flags)
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(ino)?;
        let exists = node.xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(FsError::AlreadyExists);
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(FsError::NoAttribute);
        }
        node.xattrs.insert(name.to_owned(), value.to_vec());
        node.stat.ctime = SystemTime::now();
        Ok(())
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        self.tree
            .read()
            .node(ino)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(FsError::NoAttribute)
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        Ok(self.tree.read().node(ino)?.xattrs.keys().cloned().collect())
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        let mut tree = self.tree.write();
        let node = tree.node_mut(ino)?;
        node.xattrs.remove(name).ok_or(FsError::NoAttribute)?;
        node.stat.ctime = SystemTime::now();
        Ok(())
    }

    async fn access(&self, ino: Ino, _mask: i32) -> Result<(), FsError> {
        self.tree.read().node(ino).map(|_| ())
    }

    async fn statfs(&self, _ino: Ino) -> Result<StatFs, FsError> {
        let tree = self.tree.read();
        let block = u64::from(BLOCK_SIZE);
        let total = self.capacity / block;
        let used = tree.used_bytes().div_ceil(block);
        let free = total.saturating_sub(used);
        let files = tree.nodes.len() as u64;
        Ok(StatFs {
            blocks: total,
            blocks_free: free,
            blocks_available: free,
            files,
            files_free: u64::from(u32::MAX).saturating_sub(files),
            ..StatFs::default()
        })
    }

    async fn fallocate(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        let ino = self.handle_ino(fh)?;
        let start = offset_to_usize(offset)?;
        let end = start
            .checked_add(offset_to_usize(length)?)
            .ok_or(FsError::InvalidArgument)?;
        let mut tree = self.tree.write();
        let node = tree.node_mut(ino)?;
        match mode {
            0 => {
                if node.file()?.len() < end {
                    node.resize(end)?;
                }
            }
            FALLOC_FL_KEEP_SIZE => {
                node.file()?;
            }
            m if m == FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE => {
                let buf = node.file_mut()?;
                let end = end.min(buf.len());
                if start < end {
                    buf[start..end].fill(0);
                }
            }
            _ => return Err(FsError::NotSupported),
        }
        node.touch();
        Ok(())
    }

    async fn copy_file_range(&self, range: CopyRange) -> Result<u64, FsError> {
        let src_ino = self.handle_ino(range.fh_in)?;
        let dst_ino = self.handle_ino(range.fh_out)?;
        let src_start = offset_to_usize(range.offset_in)?;
        let dst_start = offset_to_usize(range.offset_out)?;

        let mut tree = self.tree.write();
        let chunk = {
            let src = tree.node(src_ino)?.file()?;
            let start = src_start.min(src.len());
            let end = start
                .saturating_add(offset_to_usize(range.len)?)
                .min(src.len());
            src[start..end].to_vec()
        };
        let dst_end = dst_start
            .checked_add(chunk.len())
            .ok_or(FsError::InvalidArgument)?;
        let node = tree.node_mut(dst_ino)?;
        let buf = node.file_mut()?;
        if buf.len() < dst_end {
            buf.resize(dst_end, 0);
        }
        buf[dst_start..dst_end].copy_from_slice(&chunk);
        node.sync_size();
        node.touch();
        Ok(chunk.len() as u64)
    }

    async fn lseek(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        let ino = self.handle_ino(fh)?;
        let size = i64::try_from(self.tree.read().node(ino)?.stat.size)
            .map_err(|_| FsError::InvalidArgument)?;
        let pos = match whence {
            libc::SEEK_SET => offset,
            libc::SEEK_END => size.checked_add(offset).ok_or(FsError::InvalidArgument)?,
            libc::SEEK_DATA if offset < size => offset,
            libc::SEEK_HOLE if offset < size => size,
            _ => return Err(FsError::InvalidArgument),
        };
        if pos < 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(pos)
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        _flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let mut tree = self.tree.write();
        let mode = FileKind::RegularFile.type_bits() | (mode & 0o7777);
        let stat = tree.alloc(parent, None, mode, Body::File(Vec::new()))?;
        let fh = self.open_handle(&mut tree, stat.ino)?;
        Ok(Created { stat, fh })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlinked_file_survives_until_release() {
        let fs = MemoryProvider::new();
        let created = fs
            .create(ROOT_INO, OsStr::new("f"), 0o644, OpenFlags::RDWR)
            .await
            .unwrap();
        fs.write(created.stat.ino, created.fh, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        fs.unlink(ROOT_INO, OsStr::new("f")).await.unwrap();

        let data = fs.read(created.stat.ino, created.fh, 0, 16).await.unwrap();
        assert_eq!(&data[..], b"abc");

        fs.release(created.stat.ino, created.fh).await.unwrap();
        assert!(matches!(
            fs.getattr(created.stat.ino, None).await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn rename_refuses_to_move_a_directory_into_itself() {
        let fs = MemoryProvider::new();
        let a = fs.mkdir(ROOT_INO, OsStr::new("a"), 0o755).await.unwrap();
        fs.mkdir(a.ino, OsStr::new("b"), 0o755).await.unwrap();
        let b = fs.lookup(a.ino, OsStr::new("b")).await.unwrap();

        let err = fs
            .rename(ROOT_INO, OsStr::new("a"), b.ino, OsStr::new("a"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
    }
}
