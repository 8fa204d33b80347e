//! Read-cache tiering.
//!
//! [`CacheProvider`] layers a fast `slave` backend in front of an authoritative `master`. Reads
//! and metadata queries go to the slave first and fall back to the master on a miss, an error or
//! a short read; bytes fetched from the master repopulate the slave in the background. Mutations
//! land on the master first and are mirrored to the slave on a best-effort basis. Writes follow
//! the configured [`CachePolicy`]; deferred master writes are queued per handle, applied in order
//! and drained by `flush`, `fsync` and `release`.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::fanout::{detach, mirror};
use super::handle_table::HandleTable;
use super::inode_table::InodeTable;
use super::{
    Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileLock, FileStat, Forget, FsError,
    Ino, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

/// When the master sees a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Master and slave are written together; the caller waits for the master.
    #[default]
    WriteThrough,
    /// The slave is written synchronously; the master write is deferred to a background task.
    WriteBack,
}

/// Backend inode of an entry in each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Tiers<S> {
    master: Option<S>,
    slave: Option<S>,
}

impl<S: Copy> Tiers<S> {
    fn zip<U: Copy>(self, other: Tiers<U>) -> Tiers<(S, U)> {
        Tiers {
            master: self.master.zip(other.master),
            slave: self.slave.zip(other.slave),
        }
    }
}

type Opened = Tiers<(Ino, FileHandle)>;

/// Master writes of one write-back handle that the caller has already been acknowledged for.
struct Backlog {
    queue: mpsc::UnboundedSender<(u64, Bytes)>,
    worker: JoinHandle<()>,
}

/// A slow authoritative backend fronted by a fast cache backend.
pub struct CacheProvider {
    master: DynProvider,
    slave: DynProvider,
    policy: CachePolicy,
    table: InodeTable<Tiers<Ino>>,
    handles: HandleTable<Opened>,
    backlog: scc::HashMap<FileHandle, Backlog>,
}

impl CacheProvider {
    #[must_use]
    pub fn new(master: DynProvider, slave: DynProvider, policy: CachePolicy) -> Self {
        Self {
            master,
            slave,
            policy,
            table: InodeTable::new(Tiers {
                master: Some(ROOT_INO),
                slave: Some(ROOT_INO),
            }),
            handles: HandleTable::new(),
            backlog: scc::HashMap::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Run `f` on the master, then mirror it to the slave. The master result is authoritative;
    /// an entry that only the slave knows is mutated there directly.
    async fn master_first<S, T, F, Fut>(
        &self,
        op: &'static str,
        tiers: Tiers<S>,
        f: F,
    ) -> Result<Tiers<T>, FsError>
    where
        S: Copy,
        F: Fn(DynProvider, S) -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        match (tiers.master, tiers.slave) {
            (Some(m), slave) => {
                let master = f(DynProvider::clone(&self.master), m).await?;
                let slave = match slave {
                    Some(s) => mirror(op, f(DynProvider::clone(&self.slave), s)).await,
                    None => None,
                };
                Ok(Tiers {
                    master: Some(master),
                    slave,
                })
            }
            (None, Some(s)) => Ok(Tiers {
                master: None,
                slave: Some(f(DynProvider::clone(&self.slave), s).await?),
            }),
            (None, None) => Err(FsError::NotFound),
        }
    }

    /// Ask the slave, falling back to the master when the slave lacks the entry or fails.
    async fn slave_first<S, T, F, Fut>(&self, tiers: Tiers<S>, f: F) -> Result<T, FsError>
    where
        S: Copy,
        F: Fn(DynProvider, S) -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        if let Some(s) = tiers.slave {
            match f(DynProvider::clone(&self.slave), s).await {
                Ok(val) => return Ok(val),
                Err(e) if tiers.master.is_some() => {
                    debug!(error = %e, "slave miss, falling back to master");
                }
                Err(e) => return Err(e),
            }
        }
        match tiers.master {
            Some(m) => f(DynProvider::clone(&self.master), m).await,
            None => Err(FsError::NotFound),
        }
    }

    /// Mint the synthetic inode for an entry produced by both tiers, returning the stat of the
    /// tier `prefer_slave` selects.
    fn adopt(&self, stats: Tiers<FileStat>, prefer_slave: bool, intern: bool) -> Option<FileStat> {
        let binding = Tiers {
            master: stats.master.map(|s| s.ino),
            slave: stats.slave.map(|s| s.ino),
        };
        let stat = if prefer_slave {
            stats.slave.or(stats.master)
        } else {
            stats.master.or(stats.slave)
        }?;
        let ino = if intern {
            self.table.intern(binding)
        } else {
            self.table.observe(binding)
        };
        Some(stat.with_ino(ino))
    }

    fn created(&self, stats: Tiers<FileStat>) -> Result<FileStat, FsError> {
        self.adopt(stats, false, true).ok_or(FsError::NotFound)
    }

    /// Return the lookup references both tiers took for a `readdirplus` entry never passed up.
    async fn forget_unseen(&self, stats: Tiers<FileStat>) {
        let master = async {
            if let Some(stat) = stats.master {
                self.master.forget(stat.ino, 1).await;
            }
        };
        let slave = async {
            if let Some(stat) = stats.slave {
                self.slave.forget(stat.ino, 1).await;
            }
        };
        tokio::join!(master, slave);
    }

    /// Write `data` back into the slave after a master read, unless that would leave a hole.
    fn repopulate(&self, slave: (Ino, FileHandle), offset: u64, data: Bytes) {
        let provider = DynProvider::clone(&self.slave);
        let (ino, fh) = slave;
        detach("cache repopulate", async move {
            let cached = provider.getattr(ino, Some(fh)).await?.size;
            if cached < offset {
                return Ok(());
            }
            provider.write(ino, fh, offset, data).await.map(|_| ())
        });
    }

    /// Queue a master write behind the earlier ones of handle `fh`.
    fn defer(&self, fh: FileHandle, master: (Ino, FileHandle), offset: u64, data: Bytes) {
        let entry = self.backlog.entry_sync(fh).or_insert_with(|| {
            let (queue, mut pending) = mpsc::unbounded_channel::<(u64, Bytes)>();
            let provider = DynProvider::clone(&self.master);
            let (ino, mfh) = master;
            let worker = tokio::spawn(async move {
                while let Some((offset, data)) = pending.recv().await {
                    if let Err(e) = provider.write(ino, mfh, offset, data).await {
                        warn!(offset, error = %e, "write-back to master failed");
                    }
                }
            });
            Backlog { queue, worker }
        });
        if entry.get().queue.send((offset, data)).is_err() {
            warn!(fh, "write-back worker is gone, dropping master write");
        }
    }

    /// Wait until every deferred master write of `fh` has been applied.
    async fn drain(&self, fh: FileHandle) {
        let Some((_, backlog)) = self.backlog.remove_sync(&fh) else {
            return;
        };
        drop(backlog.queue);
        if let Err(e) = backlog.worker.await {
            warn!(fh, error = %e, "write-back worker died");
        }
    }

    async fn merged_listing(
        &self,
        fh: FileHandle,
        plus: bool,
    ) -> Result<Vec<(OsString, Tiers<FileStat>)>, FsError> {
        let opened = self.handles.get(fh)?;
        let list = |provider: DynProvider, slot: Option<(Ino, FileHandle)>| async move {
            let Some((ino, fh)) = slot else {
                return Ok(None);
            };
            if plus {
                provider.readdirplus(ino, fh, 0).await.map(|entries| {
                    Some(
                        entries
                            .into_iter()
                            .map(|e| (e.name, e.stat))
                            .collect::<Vec<_>>(),
                    )
                })
            } else {
                provider.readdir(ino, fh, 0).await.map(|entries| {
                    Some(
                        entries
                            .into_iter()
                            .map(|e| (e.name, FileStat::new(e.ino, e.mode, 0, 0)))
                            .collect::<Vec<_>>(),
                    )
                })
            }
        };
        let (master, slave) = tokio::join!(
            list(DynProvider::clone(&self.master), opened.master),
            list(DynProvider::clone(&self.slave), opened.slave),
        );
        let master = match (master, &slave) {
            (Ok(listing), _) => listing,
            (Err(e), Ok(Some(_))) => {
                warn!(error = %e, "master listing failed, serving the slave's");
                None
            }
            (Err(e), _) => return Err(e),
        };
        let slave = slave.unwrap_or_else(|e| {
            warn!(error = %e, "slave listing failed");
            None
        });

        let mut merged: Vec<(OsString, Tiers<FileStat>)> = Vec::new();
        for (name, stat) in master.into_iter().flatten() {
            merged.push((
                name,
                Tiers {
                    master: Some(stat),
                    slave: None,
                },
            ));
        }
        let index: FxHashMap<OsString, usize> = merged
            .iter()
            .enumerate()
            .map(|(pos, (name, _))| (name.clone(), pos))
            .collect();
        for (name, stat) in slave.into_iter().flatten() {
            match index.get(&name) {
                Some(&pos) => merged[pos].1.slave = Some(stat),
                None => merged.push((
                    name,
                    Tiers {
                        master: None,
                        slave: Some(stat),
                    },
                )),
            }
        }
        Ok(merged)
    }

    async fn open_tiers<F, Fut>(&self, tiers: Tiers<Ino>, f: F) -> Result<FileHandle, FsError>
    where
        F: Fn(DynProvider, Ino) -> Fut,
        Fut: Future<Output = Result<FileHandle, FsError>>,
    {
        let open = |provider: DynProvider, slot: Option<Ino>| {
            let fut = slot.map(|ino| f(provider, ino));
            async move {
                match fut {
                    Some(fut) => fut.await.map(|fh| slot.map(|ino| (ino, fh))),
                    None => Ok(None),
                }
            }
        };
        let (master, slave) = tokio::join!(
            open(DynProvider::clone(&self.master), tiers.master),
            open(DynProvider::clone(&self.slave), tiers.slave),
        );
        let opened = match (master, slave) {
            (Ok(master), Ok(slave)) => Tiers { master, slave },
            (Ok(master @ Some(_)), Err(e)) => {
                warn!(error = %e, "slave failed to open, serving from master only");
                Tiers {
                    master,
                    slave: None,
                }
            }
            (Err(e), Ok(slave)) => {
                if let Some((ino, fh)) = slave {
                    let _ = mirror("release", self.slave.release(ino, fh)).await;
                }
                return Err(e);
            }
            (Ok(None), Err(e)) | (Err(_), Err(e)) => return Err(e),
        };
        if opened.master.is_none() && opened.slave.is_none() {
            return Err(FsError::NotFound);
        }
        Ok(self.handles.insert(opened))
    }
}

#[async_trait]
impl Provider for CacheProvider {
    async fn init(&self) -> Result<(), FsError> {
        let (master, slave) = tokio::join!(self.master.init(), self.slave.init());
        master?;
        slave
    }

    async fn destroy(&self) {
        let mut pending = Vec::new();
        self.backlog.retain_sync(|fh, _| {
            pending.push(*fh);
            true
        });
        for fh in pending {
            self.drain(fh).await;
        }
        tokio::join!(self.master.destroy(), self.slave.destroy());
    }

    async fn forget(&self, ino: Ino, nlookup: u64) {
        let Some(tiers) = self.table.resolve(ino) else {
            return;
        };
        let _ = self.table.forget(ino, nlookup);
        if ino == ROOT_INO {
            return;
        }
        if let Some(m) = tiers.master {
            self.master.forget(m, nlookup).await;
        }
        if let Some(s) = tiers.slave {
            self.slave.forget(s, nlookup).await;
        }
    }

    async fn forget_multi(&self, forgets: &[Forget]) {
        for f in forgets {
            self.forget(f.ino, f.nlookup).await;
        }
    }

    #[instrument(name = "CacheProvider::lookup", skip(self))]
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        let tiers = self.table.require(parent)?;
        let look = |provider: DynProvider, slot: Option<Ino>| async move {
            match slot {
                Some(ino) => provider.lookup(ino, name).await.map(Some),
                None => Ok(None),
            }
        };
        let (master, slave) = tokio::join!(
            look(DynProvider::clone(&self.master), tiers.master),
            look(DynProvider::clone(&self.slave), tiers.slave),
        );
        let stats = match (master, slave) {
            (Err(e), Err(_) | Ok(None)) => return Err(e),
            (master, slave) => Tiers {
                master: master.ok().flatten(),
                slave: slave.ok().flatten(),
            },
        };
        self.adopt(stats, true, true).ok_or(FsError::NotFound)
    }

    async fn getattr(&self, ino: Ino, _fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        let tiers = self.table.require(ino)?;
        let stat = self
            .slave_first(tiers, |p, ino| async move { p.getattr(ino, None).await })
            .await?;
        Ok(stat.with_ino(ino))
    }

    async fn setattr(
        &self,
        ino: Ino,
        _fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let tiers = self.table.require(ino)?;
        let stats = self
            .master_first("setattr", tiers, |p, ino| async move {
                p.setattr(ino, None, attr).await
            })
            .await?;
        stats
            .master
            .or(stats.slave)
            .map(|s| s.with_ino(ino))
            .ok_or(FsError::NotFound)
    }

    async fn readdir(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .merged_listing(fh, false)
            .await?
            .into_iter()
            .skip(skip)
            .filter_map(|(name, stats)| {
                let stat = self.adopt(stats, true, false)?;
                Some(DirEntry {
                    ino: stat.ino,
                    name,
                    mode: stat.mode,
                })
            })
            .collect())
    }

    async fn readdirplus(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut listing = self.merged_listing(fh, true).await?;
        let kept = listing.split_off(skip.min(listing.len()));
        for (_, stats) in listing {
            self.forget_unseen(stats).await;
        }
        Ok(kept
            .into_iter()
            .filter_map(|(name, stats)| {
                Some(DirEntryPlus {
                    name,
                    stat: self.adopt(stats, true, true)?,
                })
            })
            .collect())
    }

    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let tiers = self.table.require(ino)?;
        self.open_tiers(tiers, |p, ino| async move { p.opendir(ino, flags).await })
            .await
    }

    async fn releasedir(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let opened = self.handles.remove(fh)?;
        self.master_first("releasedir", opened, |p, (ino, fh)| async move {
            p.releasedir(ino, fh).await
        })
        .await
        .map(|_| ())
    }

    async fn fsyncdir(&self, _ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        self.master_first("fsyncdir", opened, |p, (ino, fh)| async move {
            p.fsyncdir(ino, fh, datasync).await
        })
        .await
        .map(|_| ())
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let tiers = self.table.require(ino)?;
        self.open_tiers(tiers, |p, ino| async move { p.open(ino, flags).await })
            .await
    }

    #[instrument(name = "CacheProvider::read", skip(self))]
    async fn read(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let opened = self.handles.get(fh)?;
        let mut cached = None;
        if let Some((ino, sfh)) = opened.slave {
            match self.slave.read(ino, sfh, offset, size).await {
                Ok(bytes) if bytes.len() == size as usize => return Ok(bytes),
                Ok(bytes) => cached = Some(bytes),
                Err(e) => debug!(error = %e, "slave read failed"),
            }
        }
        let Some((ino, mfh)) = opened.master else {
            return cached.ok_or(FsError::NotFound);
        };
        let bytes = match self.master.read(ino, mfh, offset, size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "master read failed");
                return cached.ok_or(e);
            }
        };
        if let Some(slave) = opened.slave
            && bytes.len() > cached.as_ref().map_or(0, Bytes::len)
        {
            self.repopulate(slave, offset, bytes.clone());
        }
        Ok(bytes)
    }

    #[instrument(name = "CacheProvider::write", skip(self, data), fields(len = data.len()))]
    async fn write(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let opened = self.handles.get(fh)?;
        match (self.policy, opened.master, opened.slave) {
            (_, None, None) => Err(FsError::BadFileHandle(fh)),
            (_, None, Some((ino, sfh))) => self.slave.write(ino, sfh, offset, data).await,
            (_, Some((ino, mfh)), None) => self.master.write(ino, mfh, offset, data).await,
            (CachePolicy::WriteThrough, Some((mino, mfh)), Some((sino, sfh))) => {
                let (master, _) = tokio::join!(
                    self.master.write(mino, mfh, offset, data.clone()),
                    mirror("slave write", self.slave.write(sino, sfh, offset, data)),
                );
                master
            }
            (CachePolicy::WriteBack, Some((mino, mfh)), Some((sino, sfh))) => {
                let written = self.slave.write(sino, sfh, offset, data.clone()).await?;
                self.defer(fh, (mino, mfh), offset, data);
                Ok(written)
            }
        }
    }

    async fn flush(&self, _ino: Ino, fh: FileHandle, lock_owner: u64) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        self.drain(fh).await;
        self.master_first("flush", opened, |p, (ino, fh)| async move {
            p.flush(ino, fh, lock_owner).await
        })
        .await
        .map(|_| ())
    }

    async fn fsync(&self, _ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        self.drain(fh).await;
        self.master_first("fsync", opened, |p, (ino, fh)| async move {
            p.fsync(ino, fh, datasync).await
        })
        .await
        .map(|_| ())
    }

    async fn release(&self, _ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        self.drain(fh).await;
        let opened = self.handles.remove(fh)?;
        self.master_first("release", opened, |p, (ino, fh)| async move {
            p.release(ino, fh).await
        })
        .await
        .map(|_| ())
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let tiers = self.table.require(parent)?;
        let created = self
            .master_first("create", tiers, |p, ino| async move {
                p.create(ino, name, mode, flags).await
            })
            .await?;
        let opened = Tiers {
            master: created.master.map(|c| (c.stat.ino, c.fh)),
            slave: created.slave.map(|c| (c.stat.ino, c.fh)),
        };
        let stat = self.created(Tiers {
            master: created.master.map(|c| c.stat),
            slave: created.slave.map(|c| c.stat),
        })?;
        Ok(Created {
            stat,
            fh: self.handles.insert(opened),
        })
    }

    async fn mknod(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<FileStat, FsError> {
        let tiers = self.table.require(parent)?;
        let stats = self
            .master_first("mknod", tiers, |p, ino| async move {
                p.mknod(ino, name, mode, rdev).await
            })
            .await?;
        self.created(stats)
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        let tiers = self.table.require(parent)?;
        let stats = self
            .master_first("mkdir", tiers, |p, ino| async move {
                p.mkdir(ino, name, mode).await
            })
            .await?;
        self.created(stats)
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let tiers = self.table.require(parent)?;
        self.master_first("unlink", tiers, |p, ino| async move { p.unlink(ino, name).await })
            .await
            .map(|_| ())
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let tiers = self.table.require(parent)?;
        self.master_first("rmdir", tiers, |p, ino| async move { p.rmdir(ino, name).await })
            .await
            .map(|_| ())
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        let pairs = self
            .table
            .require(ino)?
            .zip(self.table.require(newparent)?);
        let stats = self
            .master_first("link", pairs, |p, (ino, parent)| async move {
                p.link(ino, parent, newname).await
            })
            .await?;
        self.created(stats)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        let tiers = self.table.require(parent)?;
        let stats = self
            .master_first("symlink", tiers, |p, ino| async move {
                p.symlink(ino, name, target).await
            })
            .await?;
        self.created(stats)
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        let tiers = self.table.require(ino)?;
        self.slave_first(tiers, |p, ino| async move { p.readlink(ino).await })
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
        let pairs = self
            .table
            .require(parent)?
            .zip(self.table.require(newparent)?);
        self.master_first("rename", pairs, |p, (from, to)| async move {
            p.rename(from, name, to, newname, flags).await
        })
        .await
        .map(|_| ())
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let tiers = self.table.require(ino)?;
        self.master_first("setxattr", tiers, |p, ino| async move {
            p.setxattr(ino, name, value, flags).await
        })
        .await
        .map(|_| ())
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        let tiers = self.table.require(ino)?;
        self.slave_first(tiers, |p, ino| async move { p.getxattr(ino, name).await })
            .await
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        let tiers = self.table.require(ino)?;
        self.slave_first(tiers, |p, ino| async move { p.listxattr(ino).await })
            .await
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        let tiers = self.table.require(ino)?;
        self.master_first("removexattr", tiers, |p, ino| async move {
            p.removexattr(ino, name).await
        })
        .await
        .map(|_| ())
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        let tiers = self.table.require(ino)?;
        self.slave_first(tiers, |p, ino| async move { p.access(ino, mask).await })
            .await
    }

    async fn statfs(&self, _ino: Ino) -> Result<StatFs, FsError> {
        self.master.statfs(ROOT_INO).await
    }

    async fn getlk(&self, _ino: Ino, fh: FileHandle, lock: FileLock) -> Result<FileLock, FsError> {
        let opened = self.handles.get(fh)?;
        let (ino, fh) = opened.master.ok_or(FsError::NotSupported)?;
        self.master.getlk(ino, fh, lock).await
    }

    async fn setlk(
        &self,
        _ino: Ino,
        fh: FileHandle,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        let (ino, fh) = opened.master.ok_or(FsError::NotSupported)?;
        self.master.setlk(ino, fh, lock, sleep).await
    }

    async fn flock(&self, _ino: Ino, fh: FileHandle, op: i32) -> Result<(), FsError> {
        let opened = self.handles.get(fh)?;
        let (ino, fh) = opened.master.ok_or(FsError::NotSupported)?;
        self.master.flock(ino, fh, op).await
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
        self.master_first("fallocate", opened, |p, (ino, fh)| async move {
            p.fallocate(ino, fh, offset, length, mode).await
        })
        .await
        .map(|_| ())
    }

    async fn lseek(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        let opened = self.handles.get(fh)?;
        self.slave_first(opened, |p, (ino, fh)| async move {
            p.lseek(ino, fh, offset, whence).await
        })
        .await
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let tiers = self.table.require(parent)?;
        let created = self
            .master_first("tmpfile", tiers, |p, ino| async move {
                p.tmpfile(ino, mode, flags).await
            })
            .await?;
        let opened = Tiers {
            master: created.master.map(|c| (c.stat.ino, c.fh)),
            slave: created.slave.map(|c| (c.stat.ino, c.fh)),
        };
        let stat = self.created(Tiers {
            master: created.master.map(|c| c.stat),
            slave: created.slave.map(|c| c.stat),
        })?;
        Ok(Created {
            stat,
            fh: self.handles.insert(opened),
        })
    }
}
