//! Replicated execution across members holding the same data.
//!
//! Every entry is bound to one backend inode per member, looked up concurrently so that writes
//! can reach every replica. The [`Strategy`] decides how many members must succeed:
//!
//! - [`Strategy::First`] fails over: reads try members in registration order and stop at the
//!   first success; mutations are attempted on every member and succeed if one does.
//! - [`Strategy::Majority`] runs reads and metadata operations on every member and needs
//!   `floor(n/2)+1` successes. It counts successes, not agreement. A failure shared by a
//!   majority (a missing name, say) is reported as that failure. Writes bypass the quorum.
//! - [`Strategy::All`] needs every member to succeed.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{instrument, warn};

use super::fanout::{
    self, MergedEntry, Outcomes, collapse, each_bound, first_bound, forget_unseen, majority,
    merge_listings,
};
use super::handle_table::HandleTable;
use super::inode_table::InodeTable;
use super::{
    Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileLock, FileStat, Forget, FsError,
    Ino, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

/// How many members must succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One, tried in registration order.
    #[default]
    First,
    /// A strict majority.
    Majority,
    /// Every member.
    All,
}

type Binding = Arc<[Option<Ino>]>;
type Opened = Arc<[Option<(Ino, FileHandle)>]>;

/// Runs every operation against a group of replicas.
pub struct MultiProvider {
    strategy: Strategy,
    members: Vec<DynProvider>,
    table: InodeTable<Binding>,
    handles: HandleTable<Opened>,
}

impl MultiProvider {
    /// Group `members` under `strategy`. At least one member is required.
    pub fn new(strategy: Strategy, members: Vec<DynProvider>) -> Result<Self, FsError> {
        if members.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let root: Binding = vec![Some(ROOT_INO); members.len()].into();
        Ok(Self {
            strategy,
            members,
            table: InodeTable::new(root),
            handles: HandleTable::new(),
        })
    }

    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Successes an operation needs under the configured strategy.
    #[must_use]
    pub fn required(&self) -> usize {
        match self.strategy {
            Strategy::First => 1,
            Strategy::Majority => majority(self.members.len()),
            Strategy::All => self.members.len(),
        }
    }

    /// Check a fanned-out call's success count against the strategy.
    fn verdict(
        &self,
        op: &'static str,
        successes: usize,
        errors: Vec<FsError>,
    ) -> Result<(), FsError> {
        let required = self.required();
        if successes < required {
            return Err(match self.strategy {
                Strategy::Majority => fanout::quorum_failure(successes, required, errors),
                Strategy::First | Strategy::All => collapse(errors),
            });
        }
        for e in errors.iter().filter(|e| !e.is_not_found()) {
            warn!(op, error = %e, "replica failed, continuing with the others");
        }
        Ok(())
    }

    /// Apply the strategy's success rule to a fanned-out call, keeping per-member values.
    fn accept<T>(&self, op: &'static str, outcomes: Outcomes<T>) -> Result<Vec<Option<T>>, FsError> {
        let successes = outcomes.successes();
        let (values, errors) = outcomes.into_parts();
        self.verdict(op, successes, errors)?;
        Ok(values)
    }

    /// Like [`Self::accept`], returning the first success in member order.
    fn settle<T>(&self, op: &'static str, outcomes: Outcomes<T>) -> Result<T, FsError> {
        self.accept(op, outcomes)?
            .into_iter()
            .flatten()
            .next()
            .ok_or(FsError::AllMembersFailed)
    }

    /// Fan `f` out over `binding` and return the first success in member order once the
    /// strategy is satisfied.
    async fn mutate<S, T, F, Fut>(
        &self,
        op: &'static str,
        binding: &[Option<S>],
        f: F,
    ) -> Result<T, FsError>
    where
        S: Copy,
        F: Fn(usize, DynProvider, S) -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        let outcomes = each_bound(&self.members, binding, f).await;
        self.settle(op, outcomes)
    }

    /// A read-only call: sequential failover under `First`, the fanned-out rule otherwise.
    async fn query<S, T, F, Fut>(
        &self,
        op: &'static str,
        binding: &[Option<S>],
        f: F,
    ) -> Result<T, FsError>
    where
        S: Copy,
        F: Fn(usize, DynProvider, S) -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        match self.strategy {
            Strategy::First => first_bound(&self.members, binding, f)
                .await
                .map(|(_, val)| val),
            Strategy::Majority | Strategy::All => self.mutate(op, binding, f).await,
        }
    }

    fn adopt(&self, stats: &[Option<FileStat>], intern: bool) -> Result<FileStat, FsError> {
        let binding: Binding = stats.iter().map(|s| s.map(|s| s.ino)).collect();
        let stat = stats
            .iter()
            .flatten()
            .next()
            .copied()
            .ok_or(FsError::AllMembersFailed)?;
        let ino = if intern {
            self.table.intern(binding)
        } else {
            self.table.observe(binding)
        };
        Ok(stat.with_ino(ino))
    }

    async fn entry<F, Fut>(&self, op: &'static str, parent: Ino, f: F) -> Result<FileStat, FsError>
    where
        F: Fn(usize, DynProvider, Ino) -> Fut,
        Fut: Future<Output = Result<FileStat, FsError>>,
    {
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, f).await;
        let stats = self.accept(op, outcomes)?;
        self.adopt(&stats, true)
    }

    async fn opened<F, Fut>(&self, op: &'static str, ino: Ino, f: F) -> Result<FileHandle, FsError>
    where
        F: Fn(usize, DynProvider, Ino) -> Fut,
        Fut: Future<Output = Result<FileHandle, FsError>>,
    {
        let binding = self.table.require(ino)?;
        let outcomes = each_bound(&self.members, &binding, |idx, member, ino| {
            let fut = f(idx, member, ino);
            async move { fut.await.map(|fh| (ino, fh)) }
        })
        .await;
        let successes = outcomes.successes();
        let (fhs, errors) = outcomes.into_parts();
        let opened: Opened = fhs.into();
        if let Err(e) = self.verdict(op, successes, errors) {
            self.close(&opened).await;
            return Err(e);
        }
        Ok(self.handles.insert(opened))
    }

    async fn close(&self, opened: &Opened) {
        let _ = each_bound(&self.members, opened, |_, member, (ino, fh)| async move {
            member.release(ino, fh).await
        })
        .await;
    }

    async fn created<F, Fut>(&self, op: &'static str, parent: Ino, f: F) -> Result<Created, FsError>
    where
        F: Fn(usize, DynProvider, Ino) -> Fut,
        Fut: Future<Output = Result<Created, FsError>>,
    {
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, f).await;
        let successes = outcomes.successes();
        let (created, errors) = outcomes.into_parts();
        let opened: Opened = created.iter().map(|c| c.map(|c| (c.stat.ino, c.fh))).collect();
        if let Err(e) = self.verdict(op, successes, errors) {
            self.close(&opened).await;
            return Err(e);
        }
        let stats: Vec<Option<FileStat>> = created.iter().map(|c| c.map(|c| c.stat)).collect();
        Ok(Created {
            stat: self.adopt(&stats, true)?,
            fh: self.handles.insert(opened),
        })
    }

    async fn list(
        &self,
        fh: FileHandle,
        plus: bool,
    ) -> Result<Vec<MergedEntry>, FsError> {
        let opened = self.handles.get(fh)?;
        let outcomes = each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            if plus {
                member.readdirplus(ino, fh, 0).await.map(|entries| {
                    entries
                        .into_iter()
                        .map(|e| (e.name, e.stat))
                        .collect::<Vec<_>>()
                })
            } else {
                member.readdir(ino, fh, 0).await.map(|entries| {
                    entries
                        .into_iter()
                        .map(|e| (e.name, FileStat::new(e.ino, e.mode, 0, 0)))
                        .collect::<Vec<_>>()
                })
            }
        })
        .await;
        let listings = self.accept("readdir", outcomes)?;

        Ok(merge_listings(listings))
    }

    fn pair(a: &Binding, b: &Binding) -> Vec<Option<(Ino, Ino)>> {
        a.iter().zip(b.iter()).map(|(a, b)| a.zip(*b)).collect()
    }
}

#[async_trait]
impl Provider for MultiProvider {
    async fn init(&self) -> Result<(), FsError> {
        let outcomes =
            fanout::all_settled(&self.members, |_, member| async move { member.init().await })
                .await;
        self.accept("init", outcomes).map(|_| ())
    }

    async fn destroy(&self) {
        join_all(self.members.iter().map(|m| m.destroy())).await;
    }

    async fn forget(&self, ino: Ino, nlookup: u64) {
        let Some(binding) = self.table.resolve(ino) else {
            return;
        };
        let _ = self.table.forget(ino, nlookup);
        if ino == ROOT_INO {
            return;
        }
        let _ = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.forget(ino, nlookup).await;
            Ok(())
        })
        .await;
    }

    async fn forget_multi(&self, forgets: &[Forget]) {
        for f in forgets {
            self.forget(f.ino, f.nlookup).await;
        }
    }

    #[instrument(name = "MultiProvider::lookup", skip(self))]
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        self.entry("lookup", parent, |_, member, ino| async move {
            member.lookup(ino, name).await
        })
        .await
    }

    async fn getattr(&self, ino: Ino, _fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        let binding = self.table.require(ino)?;
        let stat = self
            .query("getattr", &binding, |_, member, ino| async move {
                member.getattr(ino, None).await
            })
            .await?;
        Ok(stat.with_ino(ino))
    }

    async fn setattr(
        &self,
        ino: Ino,
        _fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let binding = self.table.require(ino)?;
        let stat = self
            .mutate("setattr", &binding, |_, member, ino| async move {
                member.setattr(ino, None, attr).await
            })
            .await?;
        Ok(stat.with_ino(ino))
    }

    async fn readdir(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        self.list(fh, false)
            .await?
            .into_iter()
            .skip(skip)
            .map(|(name, stats)| {
                let stat = self.adopt(&stats, false)?;
                Ok(DirEntry {
                    ino: stat.ino,
                    name,
                    mode: stat.mode,
                })
            })
            .collect()
    }

    async fn readdirplus(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut listing = self.list(fh, true).await?;
        let kept = listing.split_off(skip.min(listing.len()));
        for (_, stats) in &listing {
            forget_unseen(&self.members, stats).await;
        }
        kept.into_iter()
            .map(|(name, stats)| {
                Ok(DirEntryPlus {
                    name,
                    stat: self.adopt(&stats, true)?,
                })
            })
            .collect()
    }

    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.opened("opendir", ino, |_, member, ino| async move {
            member.opendir(ino, flags).await
        })
        .await
    }

    async fn releasedir(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let opened = self.handles.remove(fh)?;
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.releasedir(ino, fh).await
        })
        .await
        .first_ok("releasedir")
    }

    async fn fsyncdir(&self, _ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        self.mutate("fsyncdir", &opened, |_, member, (ino, fh)| async move {
            member.fsyncdir(ino, fh, datasync).await
        })
        .await
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.opened("open", ino, |_, member, ino| async move {
            member.open(ino, flags).await
        })
        .await
    }

    #[instrument(name = "MultiProvider::read", skip(self))]
    async fn read(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let opened = self.handles.get(fh)?;
        self.query("read", &opened, |_, member, (ino, fh)| async move {
            member.read(ino, fh, offset, size).await
        })
        .await
    }

    #[instrument(name = "MultiProvider::write", skip(self, data), fields(len = data.len()))]
    async fn write(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let opened = self.handles.get(fh)?;
        let outcomes = each_bound(&self.members, &opened, |_, member, (ino, fh)| {
            let data = data.clone();
            async move { member.write(ino, fh, offset, data).await }
        })
        .await;
        match self.strategy {
            Strategy::All => self.settle("write", outcomes),
            Strategy::First | Strategy::Majority => outcomes.first_ok("write"),
        }
    }

    async fn flush(&self, _ino: Ino, fh: FileHandle, lock_owner: u64) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.flush(ino, fh, lock_owner).await
        })
        .await
        .first_ok("flush")
    }

    async fn fsync(&self, _ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.fsync(ino, fh, datasync).await
        })
        .await
        .first_ok("fsync")
    }

    async fn release(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let opened = self.handles.remove(fh)?;
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.release(ino, fh).await
        })
        .await
        .first_ok("release")
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        self.created("create", parent, |_, member, ino| async move {
            member.create(ino, name, mode, flags).await
        })
        .await
    }

    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        self.entry("mknod", parent, |_, member, ino| async move {
            member.mknod(ino, name, mode, rdev).await
        })
        .await
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        self.entry("mkdir", parent, |_, member, ino| async move {
            member.mkdir(ino, name, mode).await
        })
        .await
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(parent)?;
        self.mutate("unlink", &binding, |_, member, ino| async move {
            member.unlink(ino, name).await
        })
        .await
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(parent)?;
        self.mutate("rmdir", &binding, |_, member, ino| async move {
            member.rmdir(ino, name).await
        })
        .await
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        let pairs = Self::pair(&self.table.require(ino)?, &self.table.require(newparent)?);
        let outcomes = each_bound(&self.members, &pairs, |_, member, (ino, parent)| async move {
            member.link(ino, parent, newname).await
        })
        .await;
        let stats = self.accept("link", outcomes)?;
        self.adopt(&stats, true)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        self.entry("symlink", parent, |_, member, ino| async move {
            member.symlink(ino, name, target).await
        })
        .await
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        let binding = self.table.require(ino)?;
        self.query("readlink", &binding, |_, member, ino| async move {
            member.readlink(ino).await
        })
        .await
    }

    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        let pairs = Self::pair(&self.table.require(parent)?, &self.table.require(newparent)?);
        self.mutate("rename", &pairs, |_, member, (from, to)| async move {
            member.rename(from, name, to, newname, flags).await
        })
        .await
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        self.mutate("setxattr", &binding, |_, member, ino| async move {
            member.setxattr(ino, name, value, flags).await
        })
        .await
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        let binding = self.table.require(ino)?;
        self.query("getxattr", &binding, |_, member, ino| async move {
            member.getxattr(ino, name).await
        })
        .await
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        let binding = self.table.require(ino)?;
        self.query("listxattr", &binding, |_, member, ino| async move {
            member.listxattr(ino).await
        })
        .await
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        self.mutate("removexattr", &binding, |_, member, ino| async move {
            member.removexattr(ino, name).await
        })
        .await
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        self.query("access", &binding, |_, member, ino| async move {
            member.access(ino, mask).await
        })
        .await
    }

    async fn statfs(&self, _ino: Ino) -> Result<StatFs, FsError> {
        let root: Binding = vec![Some(ROOT_INO); self.members.len()].into();
        self.query("statfs", &root, |_, member, ino| async move {
            member.statfs(ino).await
        })
        .await
    }

    async fn getlk(&self, _ino: Ino, fh: FileHandle, lock: FileLock) -> Result<FileLock, FsError> {
        let opened = self.handles.get(fh)?;
        first_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.getlk(ino, fh, lock).await
        })
        .await
        .map(|(_, lock)| lock)
    }

    async fn setlk(
        &self,
        _ino: Ino,
        fh: FileHandle,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        first_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.setlk(ino, fh, lock, sleep).await
        })
        .await
        .map(|_| ())
    }

    async fn flock(&self, _ino: Ino, fh: FileHandle, op: i32) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        first_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.flock(ino, fh, op).await
        })
        .await
        .map(|_| ())
    }

    async fn fallocate(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        self.mutate("fallocate", &opened, |_, member, (ino, fh)| async move {
            member.fallocate(ino, fh, offset, length, mode).await
        })
        .await
    }

    async fn lseek(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        let opened = self.handles.get(fh)?;
        self.query("lseek", &opened, |_, member, (ino, fh)| async move {
            member.lseek(ino, fh, offset, whence).await
        })
        .await
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        self.created("tmpfile", parent, |_, member, ino| async move {
            member.tmpfile(ino, mode, flags).await
        })
        .await
    }
}
