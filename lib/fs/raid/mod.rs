//! RAID composition over member providers.
//!
//! A [`RaidProvider`] presents N members as one backend. Every synthetic inode is bound to one
//! backend inode per member, established when the entry is first looked up or created. Level
//! specific placement lives in [`geometry`]; the bookkeeping (inode table, handles, metadata
//! fan-out) is shared by all levels.
//!
//! Degraded reads rebuild a lost data stripe from the group's first parity block and the other
//! data blocks. Data stays on the first `data_members` members while parity rotates over all of
//! them, so some groups keep their parity on a member that also holds one of their data
//! stripes. Losing that member loses both copies, and reading the stripe fails with
//! [`FsError::AllMembersFailed`].

pub mod geometry;

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use self::geometry::{Chunk, Geometry, Level, xor_blocks};
use super::fanout::{
    self, MergedEntry, Outcomes, collapse, each_bound, first_bound, forget_unseen, merge_listings,
};
use super::handle_table::HandleTable;
use super::inode_table::InodeTable;
use super::{
    Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileKind, FileLock, FileStat,
    Forget, FsError, Ino, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

/// Backend inode of the entry on each member, `None` where the member lacks it.
type Binding = Arc<[Option<Ino>]>;

/// Backend inode and handle on each member that opened.
type Opened = Arc<[Option<(Ino, FileHandle)>]>;

/// Stripes, mirrors or parity-protects data across member providers.
pub struct RaidProvider {
    geometry: Geometry,
    members: Vec<DynProvider>,
    table: InodeTable<Binding>,
    handles: HandleTable<Opened>,
}

impl RaidProvider {
    /// Group `members` at `level`, cutting files into `stripe_size`-byte stripes.
    pub fn new(level: Level, members: Vec<DynProvider>, stripe_size: u64) -> Result<Self, FsError> {
        let geometry = Geometry::new(level, members.len(), stripe_size)?;
        let root: Binding = vec![Some(ROOT_INO); members.len()].into();
        Ok(Self {
            geometry,
            members,
            table: InodeTable::new(root),
            handles: HandleTable::new(),
        })
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Synthetic inode and merged stat for an entry whose member stats were just produced.
    ///
    /// Counts one kernel reference when `intern` is set.
    fn adopt(&self, stats: &[Option<FileStat>], intern: bool) -> Result<FileStat, FsError> {
        let binding: Binding = stats.iter().map(|s| s.map(|s| s.ino)).collect();
        let ino = if intern {
            self.table.intern(binding)
        } else {
            self.table.observe(binding)
        };
        self.merge(ino, stats)
    }

    /// First member stat, re-numbered to `ino`, with the logical size of a striped file.
    fn merge(&self, ino: Ino, stats: &[Option<FileStat>]) -> Result<FileStat, FsError> {
        let mut stat = stats
            .iter()
            .flatten()
            .next()
            .copied()
            .ok_or(FsError::AllMembersFailed)?
            .with_ino(ino);
        if stat.kind() == FileKind::RegularFile && self.geometry.level() != Level::Raid1 {
            let sizes: Vec<Option<u64>> = stats.iter().map(|s| s.map(|s| s.size)).collect();
            stat.size = self.geometry.logical_size(&sizes);
            stat.blocks = stats.iter().flatten().map(|s| s.blocks).sum();
        }
        Ok(stat)
    }

    /// Fan a stat-producing call out and adopt whatever the members returned.
    fn settle_stats(&self, outcomes: Outcomes<FileStat>) -> Result<FileStat, FsError> {
        let (stats, errors) = outcomes.into_parts();
        if stats.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }
        for e in errors.iter().filter(|e| !e.is_not_found()) {
            warn!(error = %e, "member failed, continuing with the others");
        }
        self.adopt(&stats, true)
    }

    async fn member_stats(&self, binding: &Binding) -> Vec<Option<FileStat>> {
        let (stats, _) = each_bound(&self.members, binding, |_, member, ino| async move {
            member.getattr(ino, None).await
        })
        .await
        .into_parts();
        stats
    }

    async fn logical_size(&self, binding: &Binding) -> u64 {
        let sizes: Vec<Option<u64>> = self
            .member_stats(binding)
            .await
            .into_iter()
            .map(|s| s.map(|s| s.size))
            .collect();
        self.geometry.logical_size(&sizes)
    }

    /// Member handles for `fh`, or freshly opened ones the caller must close with
    /// [`Self::close_all`].
    async fn handles_for(
        &self,
        binding: &Binding,
        fh: Option<FileHandle>,
    ) -> Result<(Opened, bool), FsError> {
        if let Some(fh) = fh
            && let Ok(opened) = self.handles.get(fh)
        {
            return Ok((opened, false));
        }
        Ok((self.open_all(binding, OpenFlags::RDWR).await?, true))
    }

    async fn open_all(&self, binding: &Binding, flags: OpenFlags) -> Result<Opened, FsError> {
        let (fhs, errors) = each_bound(&self.members, binding, |_, member, ino| async move {
            member.open(ino, flags).await.map(|fh| (ino, fh))
        })
        .await
        .into_parts();
        let opened: Opened = fhs.into();
        let count = opened.iter().flatten().count();
        if count < self.geometry.open_quorum() {
            debug!(count, required = self.geometry.open_quorum(), "too few members opened");
            self.close_all(&opened).await;
            return Err(if count == 0 {
                collapse(errors)
            } else {
                FsError::AllMembersFailed
            });
        }
        Ok(opened)
    }

    async fn close_all(&self, opened: &Opened) {
        let _ = each_bound(&self.members, opened, |_, member, (ino, fh)| async move {
            member.release(ino, fh).await
        })
        .await
        .first_ok("release");
    }

    async fn read_member(
        &self,
        opened: &Opened,
        member: usize,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, FsError> {
        let (ino, fh) = opened
            .get(member)
            .copied()
            .flatten()
            .ok_or(FsError::AllMembersFailed)?;
        let size = u32::try_from(len).map_err(|_| FsError::InvalidArgument)?;
        self.members[member].read(ino, fh, offset, size).await
    }

    async fn write_member(
        &self,
        opened: &Opened,
        member: usize,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let (ino, fh) = opened
            .get(member)
            .copied()
            .flatten()
            .ok_or(FsError::AllMembersFailed)?;
        self.members[member].write(ino, fh, offset, data).await
    }

    /// Read one stripe piece, rebuilding it from parity if its data member fails.
    async fn read_chunk(&self, opened: &Opened, chunk: Chunk) -> Result<Bytes, FsError> {
        let g = &self.geometry;
        let member = g.data_member(chunk.stripe);
        let offset = g.data_offset(chunk.stripe) + chunk.within;
        match self.read_member(opened, member, offset, chunk.len).await {
            Ok(bytes) => Ok(pad(bytes, chunk.len)),
            Err(e) if g.level().has_parity() => {
                warn!(stripe = chunk.stripe, member, error = %e, "rebuilding stripe from parity");
                self.reconstruct(opened, chunk).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reconstruct(&self, opened: &Opened, chunk: Chunk) -> Result<Bytes, FsError> {
        let g = &self.geometry;
        let group = g.group(chunk.stripe);
        let parity = g
            .parity_members(group)
            .first()
            .copied()
            .ok_or(FsError::AllMembersFailed)?;
        let mut reads = vec![self.read_member(
            opened,
            parity,
            g.parity_offset(group) + chunk.within,
            chunk.len,
        )];
        for stripe in g.group_stripes(group).filter(|&s| s != chunk.stripe) {
            reads.push(self.read_member(
                opened,
                g.data_member(stripe),
                g.data_offset(stripe) + chunk.within,
                chunk.len,
            ));
        }
        let blocks = join_all(reads)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| FsError::AllMembersFailed)?;
        let refs: Vec<&[u8]> = blocks.iter().map(AsRef::as_ref).collect();
        Ok(pad(Bytes::from(xor_blocks(&refs)), chunk.len))
    }

    /// Recompute and store the parity blocks of `group` from its current data blocks.
    ///
    /// Unreadable data blocks count as zeros. Not serialized against concurrent writers to the
    /// same group.
    async fn update_parity(&self, opened: &Opened, group: u64) -> Result<(), FsError> {
        let g = &self.geometry;
        let reads = g.group_stripes(group).map(|stripe| async move {
            self.read_member(
                opened,
                g.data_member(stripe),
                g.data_offset(stripe),
                g.stripe_size(),
            )
            .await
            .unwrap_or_default()
        });
        let blocks = join_all(reads).await;
        let mut refs: Vec<&[u8]> = blocks.iter().map(AsRef::as_ref).collect();
        let p1 = xor_blocks(&refs);
        if p1.is_empty() {
            return Ok(());
        }
        let members = g.parity_members(group);
        let offset = g.parity_offset(group);
        let mut writes = Vec::with_capacity(members.len());
        if let Some(&m) = members.first() {
            writes.push(self.write_member(opened, m, offset, Bytes::copy_from_slice(&p1)));
        }
        if let Some(&m) = members.get(1) {
            refs.push(p1.as_slice());
            let p2 = xor_blocks(&refs);
            writes.push(self.write_member(opened, m, offset, Bytes::from(p2)));
        }
        Outcomes::new(join_all(writes).await).all_ok().map(|_| ())
    }

    async fn read_striped(
        &self,
        binding: &Binding,
        opened: &Opened,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let logical = self.logical_size(binding).await;
        let end = offset.saturating_add(u64::from(size)).min(logical);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let chunks = self.geometry.chunks(offset, end - offset);
        let pieces = join_all(chunks.into_iter().map(|c| self.read_chunk(opened, c))).await;
        let mut out = BytesMut::with_capacity(usize::try_from(end - offset).unwrap_or(0));
        for piece in pieces {
            out.extend_from_slice(&piece?);
        }
        Ok(out.freeze())
    }

    async fn write_striped(
        &self,
        opened: &Opened,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let g = &self.geometry;
        let chunks = g.chunks(offset, data.len() as u64);
        let writes = chunks.iter().map(|c| {
            let start = usize::try_from(c.buf_offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(usize::try_from(c.len).unwrap_or(usize::MAX));
            self.write_member(
                opened,
                g.data_member(c.stripe),
                g.data_offset(c.stripe) + c.within,
                data.slice(start..end),
            )
        });
        Outcomes::new(join_all(writes).await).all_ok()?;

        if g.level().has_parity() {
            let mut groups: Vec<u64> = chunks.iter().map(|c| g.group(c.stripe)).collect();
            groups.dedup();
            for group in groups {
                if let Err(e) = self.update_parity(opened, group).await {
                    warn!(group, error = %e, "parity update failed, group is degraded");
                }
            }
        }
        Ok(written)
    }

    async fn truncate(
        &self,
        binding: &Binding,
        fh: Option<FileHandle>,
        attr: SetAttr,
        size: u64,
    ) -> Result<Vec<Option<FileStat>>, FsError> {
        let lengths = self.geometry.member_lengths(size);
        let (stats, errors) = each_bound(&self.members, binding, |idx, member, ino| {
            let attr = SetAttr {
                size: Some(lengths[idx]),
                ..attr
            };
            async move { member.setattr(ino, None, attr).await }
        })
        .await
        .into_parts();
        if stats.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }
        if self.geometry.level().has_parity() && size > 0 {
            let (opened, owned) = self.handles_for(binding, fh).await?;
            let last = self.geometry.group((size - 1) / self.geometry.stripe_size());
            let result = self.update_parity(&opened, last).await;
            if owned {
                self.close_all(&opened).await;
            }
            if let Err(e) = result {
                warn!(group = last, error = %e, "parity update after truncate failed");
            }
            return Ok(self.member_stats(binding).await);
        }
        Ok(stats)
    }

    /// Every member's listing of an open directory, merged by name in first-seen order.
    async fn list(
        &self,
        fh: FileHandle,
        plus: bool,
    ) -> Result<Vec<MergedEntry>, FsError> {
        let opened = self.handles.get(fh)?;
        let listings = each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
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
                        .collect()
                })
            }
        })
        .await;
        let (listings, errors) = listings.into_parts();
        if listings.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }

        Ok(merge_listings(listings))
    }

    async fn opendir_members(&self, binding: &Binding) -> Result<Opened, FsError> {
        let (fhs, errors) = each_bound(&self.members, binding, |_, member, ino| async move {
            member.opendir(ino, OpenFlags::empty()).await.map(|fh| (ino, fh))
        })
        .await
        .into_parts();
        if fhs.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }
        Ok(fhs.into())
    }

    fn pair(a: &Binding, b: &Binding) -> Vec<Option<(Ino, Ino)>> {
        a.iter().zip(b.iter()).map(|(a, b)| a.zip(*b)).collect()
    }

    fn all_bound(&self) -> Vec<Option<Ino>> {
        vec![Some(ROOT_INO); self.members.len()]
    }
}

fn pad(bytes: Bytes, len: u64) -> Bytes {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if bytes.len() >= len {
        return bytes;
    }
    let mut out = BytesMut::from(bytes.as_ref());
    out.resize(len, 0);
    out.freeze()
}

#[async_trait]
impl Provider for RaidProvider {
    async fn init(&self) -> Result<(), FsError> {
        fanout::all_settled(&self.members, |_, member| async move { member.init().await })
            .await
            .all_ok()
            .map(|_| ())
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

    #[instrument(name = "RaidProvider::lookup", skip(self))]
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.lookup(ino, name).await
        })
        .await;
        self.settle_stats(outcomes)
    }

    async fn getattr(&self, ino: Ino, _fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        let binding = self.table.require(ino)?;
        let stats = self.member_stats(&binding).await;
        if stats.iter().all(Option::is_none) {
            return Err(FsError::AllMembersFailed);
        }
        self.merge(ino, &stats)
    }

    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let binding = self.table.require(ino)?;
        let stats = match attr.size {
            Some(size) if self.geometry.level() != Level::Raid1 => {
                self.truncate(&binding, fh, attr, size).await?
            }
            _ => {
                let (stats, errors) = each_bound(&self.members, &binding, |_, member, ino| async move {
                    member.setattr(ino, None, attr).await
                })
                .await
                .into_parts();
                if stats.iter().all(Option::is_none) {
                    return Err(collapse(errors));
                }
                stats
            }
        };
        self.merge(ino, &stats)
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

    async fn opendir(&self, ino: Ino, _flags: OpenFlags) -> Result<FileHandle, FsError> {
        let binding = self.table.require(ino)?;
        let opened = self.opendir_members(&binding).await?;
        Ok(self.handles.insert(opened))
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
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.fsyncdir(ino, fh, datasync).await
        })
        .await
        .first_ok("fsyncdir")
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let binding = self.table.require(ino)?;
        let opened = self.open_all(&binding, flags).await?;
        Ok(self.handles.insert(opened))
    }

    async fn read(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let opened = self.handles.get(fh)?;
        if self.geometry.level() == Level::Raid1 {
            return first_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
                member.read(ino, fh, offset, size).await
            })
            .await
            .map(|(_, bytes)| bytes);
        }
        let binding = self.table.require(ino)?;
        self.read_striped(&binding, &opened, offset, size).await
    }

    async fn write(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let opened = self.handles.get(fh)?;
        if self.geometry.level() == Level::Raid1 {
            return each_bound(&self.members, &opened, |_, member, (ino, fh)| {
                let data = data.clone();
                async move { member.write(ino, fh, offset, data).await }
            })
            .await
            .first_ok("raid1 write");
        }
        self.write_striped(&opened, offset, data).await
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
        let binding = self.table.require(parent)?;
        let (created, errors) = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.create(ino, name, mode, flags).await
        })
        .await
        .into_parts();
        if created.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }
        let stats: Vec<Option<FileStat>> = created.iter().map(|c| c.map(|c| c.stat)).collect();
        let opened: Opened = created.iter().map(|c| c.map(|c| (c.stat.ino, c.fh))).collect();
        let stat = self.adopt(&stats, true)?;
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
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.mknod(ino, name, mode, rdev).await
        })
        .await;
        self.settle_stats(outcomes)
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.mkdir(ino, name, mode).await
        })
        .await;
        self.settle_stats(outcomes)
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(parent)?;
        each_bound(&self.members, &binding, |_, member, ino| async move {
            member.unlink(ino, name).await
        })
        .await
        .first_ok("unlink")
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(parent)?;
        each_bound(&self.members, &binding, |_, member, ino| async move {
            member.rmdir(ino, name).await
        })
        .await
        .first_ok("rmdir")
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        let pairs = Self::pair(&self.table.require(ino)?, &self.table.require(newparent)?);
        let outcomes = each_bound(&self.members, &pairs, |_, member, (ino, parent)| async move {
            member.link(ino, parent, newname).await
        })
        .await;
        self.settle_stats(outcomes)
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        let binding = self.table.require(parent)?;
        let outcomes = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.symlink(ino, name, target).await
        })
        .await;
        self.settle_stats(outcomes)
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        let binding = self.table.require(ino)?;
        first_bound(&self.members, &binding, |_, member, ino| async move {
            member.readlink(ino).await
        })
        .await
        .map(|(_, target)| target)
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
        each_bound(&self.members, &pairs, |_, member, (from, to)| async move {
            member.rename(from, name, to, newname, flags).await
        })
        .await
        .first_ok("rename")
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        each_bound(&self.members, &binding, |_, member, ino| async move {
            member.setxattr(ino, name, value, flags).await
        })
        .await
        .first_ok("setxattr")
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        let binding = self.table.require(ino)?;
        first_bound(&self.members, &binding, |_, member, ino| async move {
            member.getxattr(ino, name).await
        })
        .await
        .map(|(_, value)| value)
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        let binding = self.table.require(ino)?;
        first_bound(&self.members, &binding, |_, member, ino| async move {
            member.listxattr(ino).await
        })
        .await
        .map(|(_, names)| names)
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        each_bound(&self.members, &binding, |_, member, ino| async move {
            member.removexattr(ino, name).await
        })
        .await
        .first_ok("removexattr")
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        let binding = self.table.require(ino)?;
        first_bound(&self.members, &binding, |_, member, ino| async move {
            member.access(ino, mask).await
        })
        .await
        .map(|_| ())
    }

    async fn statfs(&self, _ino: Ino) -> Result<StatFs, FsError> {
        let (stats, errors) = each_bound(&self.members, &self.all_bound(), |_, member, ino| async move {
            member.statfs(ino).await
        })
        .await
        .into_parts();
        let stats: Vec<StatFs> = stats.into_iter().flatten().collect();
        let Some(smallest) = stats.iter().min_by_key(|s| s.blocks).copied() else {
            return Err(collapse(errors));
        };
        // Usable capacity is bounded by the smallest member.
        let data = self.geometry.data_members() as u64;
        Ok(StatFs {
            blocks: smallest.blocks * data,
            blocks_free: stats.iter().map(|s| s.blocks_free).min().unwrap_or(0) * data,
            blocks_available: stats.iter().map(|s| s.blocks_available).min().unwrap_or(0) * data,
            ..smallest
        })
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
        if self.geometry.level() != Level::Raid1 {
            return Err(FsError::NotSupported);
        }
        let opened = self.handles.get(fh)?;
        each_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.fallocate(ino, fh, offset, length, mode).await
        })
        .await
        .first_ok("fallocate")
    }

    async fn lseek(
        &self,
        _ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        if self.geometry.level() != Level::Raid1 {
            return Err(FsError::NotSupported);
        }
        let opened = self.handles.get(fh)?;
        first_bound(&self.members, &opened, |_, member, (ino, fh)| async move {
            member.lseek(ino, fh, offset, whence).await
        })
        .await
        .map(|(_, pos)| pos)
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let binding = self.table.require(parent)?;
        let (created, errors) = each_bound(&self.members, &binding, |_, member, ino| async move {
            member.tmpfile(ino, mode, flags).await
        })
        .await
        .into_parts();
        if created.iter().all(Option::is_none) {
            return Err(collapse(errors));
        }
        let stats: Vec<Option<FileStat>> = created.iter().map(|c| c.map(|c| c.stat)).collect();
        let opened: Opened = created.iter().map(|c| c.map(|c| (c.stat.ino, c.fh))).collect();
        Ok(Created {
            stat: self.adopt(&stats, true)?,
            fh: self.handles.insert(opened),
        })
    }
}
