//! Path router.
//!
//! Backends are registered at mount paths and kept sorted longest-first, so the most specific
//! mount owns a subtree. The root directory is always synthetic: it lists the root mount's own
//! entries (if `/` is mounted) plus one entry per top-level mount segment. Intermediate segments
//! of nested mounts that no backend provides are served as synthetic directories.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::inode_table::InodeTable;
use super::{
    CopyRange, Created, DirEntry, DirEntryPlus, DynProvider, FileHandle, FileLock,
    FileStat, Forget, FsError, Ino, IoctlReply, OpenFlags, Provider, ROOT_INO, SetAttr, StatFs,
};

/// Identity of a registered mount, stable across other mounts coming and going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Route {
    /// A directory that exists only because mounts live below it.
    Virtual(PathBuf),
    /// An object inside a mounted backend.
    Backend { mount: MountId, ino: Ino },
}

struct Mount {
    id: MountId,
    path: PathBuf,
    provider: DynProvider,
}

enum Target {
    Virtual,
    Backend {
        mount: MountId,
        provider: DynProvider,
        ino: Ino,
    },
}

/// Normalize a mount path: absolute, no `.`/`..`, no trailing slash.
pub fn normalize(path: &Path) -> Result<PathBuf, FsError> {
    if !path.has_root() {
        return Err(FsError::InvalidArgument);
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir | Component::Prefix(_) => return Err(FsError::InvalidArgument),
        }
    }
    Ok(out)
}

/// Routes requests to the backend mounted at the longest matching path.
pub struct RouterProvider {
    mounts: RwLock<Vec<Mount>>,
    next_mount: AtomicU64,
    table: InodeTable<Route>,
    /// Virtual path each synthetic inode was first reached through.
    paths: scc::HashMap<Ino, PathBuf>,
}

impl RouterProvider {
    /// A router with nothing mounted.
    #[must_use]
    pub fn new() -> Self {
        let paths = scc::HashMap::new();
        let _ = paths.insert_sync(ROOT_INO, PathBuf::from("/"));
        Self {
            mounts: RwLock::new(Vec::new()),
            next_mount: AtomicU64::new(0),
            table: InodeTable::new(Route::Virtual(PathBuf::from("/"))),
            paths,
        }
    }

    /// Register `provider` at `path`. `/` matches every path not claimed by a longer mount.
    pub fn handle(&self, path: impl AsRef<Path>, provider: DynProvider) -> Result<(), FsError> {
        let path = normalize(path.as_ref())?;
        let mut mounts = self.mounts.write();
        if mounts.iter().any(|m| m.path == path) {
            return Err(FsError::AlreadyExists);
        }
        let id = MountId(self.next_mount.fetch_add(1, Ordering::Relaxed));
        debug!(path = %path.display(), ?id, "registering mount");
        mounts.push(Mount { id, path, provider });
        mounts.sort_by(|a, b| {
            b.path
                .as_os_str()
                .len()
                .cmp(&a.path.as_os_str().len())
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(())
    }

    /// Remove the mount registered at `path`, returning its provider.
    pub fn unhandle(&self, path: impl AsRef<Path>) -> Option<DynProvider> {
        let path = normalize(path.as_ref()).ok()?;
        let mut mounts = self.mounts.write();
        let idx = mounts.iter().position(|m| m.path == path)?;
        Some(mounts.remove(idx).provider)
    }

    /// Registered mount paths, longest first.
    #[must_use]
    pub fn mount_paths(&self) -> Vec<PathBuf> {
        self.mounts
            .read()
            .iter()
            .map(|m| m.path.clone())
            .collect()
    }

    /// The provider owning `path` by longest-prefix match, and the path it is mounted at.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> Result<(DynProvider, PathBuf), FsError> {
        let path = normalize(path.as_ref())?;
        self.mounts
            .read()
            .iter()
            .find(|m| path.starts_with(&m.path))
            .map(|m| (DynProvider::clone(&m.provider), m.path.clone()))
            .ok_or(FsError::NotFound)
    }

    fn provider(&self, id: MountId) -> Result<DynProvider, FsError> {
        self.mounts
            .read()
            .iter()
            .find(|m| m.id == id)
            .map(|m| DynProvider::clone(&m.provider))
            .ok_or(FsError::NotFound)
    }

    fn mount_at(&self, path: &Path) -> Option<(MountId, DynProvider)> {
        self.mounts
            .read()
            .iter()
            .find(|m| m.path == path)
            .map(|m| (m.id, DynProvider::clone(&m.provider)))
    }

    /// Next path segment of every mount strictly below `dir`, deduplicated, with the mount
    /// registered exactly at `dir/segment` when there is one.
    fn mount_children(&self, dir: &Path) -> Vec<(OsString, Option<(MountId, DynProvider)>)> {
        let mounts = self.mounts.read();
        let mut children: Vec<(OsString, Option<(MountId, DynProvider)>)> = Vec::new();
        for m in mounts.iter() {
            let Ok(rest) = m.path.strip_prefix(dir) else {
                continue;
            };
            let mut segments = rest.components();
            let Some(Component::Normal(seg)) = segments.next() else {
                continue;
            };
            let exact = segments.next().is_none();
            match children.iter_mut().find(|(name, _)| name == seg) {
                Some((_, slot)) if exact => *slot = Some((m.id, DynProvider::clone(&m.provider))),
                Some(_) => {}
                None => children.push((
                    seg.to_owned(),
                    exact.then(|| (m.id, DynProvider::clone(&m.provider))),
                )),
            }
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    fn path_of(&self, ino: Ino) -> PathBuf {
        self.paths
            .read_sync(&ino, |_, p| p.clone())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn record(&self, ino: Ino, path: PathBuf) -> Ino {
        let _ = self.paths.insert_sync(ino, path);
        ino
    }

    fn intern(&self, route: Route, path: PathBuf) -> Ino {
        let ino = self.table.intern(route);
        self.record(ino, path)
    }

    fn observe(&self, route: Route, path: PathBuf) -> Ino {
        let ino = self.table.observe(route);
        self.record(ino, path)
    }

    fn target(&self, ino: Ino) -> Result<Target, FsError> {
        match self.table.require(ino)? {
            Route::Backend { mount, ino } => Ok(Target::Backend {
                mount,
                provider: self.provider(mount)?,
                ino,
            }),
            Route::Virtual(path) => Ok(match self.mount_at(&path) {
                Some((mount, provider)) => Target::Backend {
                    mount,
                    provider,
                    ino: ROOT_INO,
                },
                None => Target::Virtual,
            }),
        }
    }

    /// The backend owning `ino`; synthetic directories with no backend fail with `NotFound`.
    fn backend(&self, ino: Ino) -> Result<(MountId, DynProvider, Ino), FsError> {
        match self.target(ino)? {
            Target::Backend {
                mount,
                provider,
                ino,
            } => Ok((mount, provider, ino)),
            Target::Virtual => Err(FsError::NotFound),
        }
    }

    /// Mint the synthetic inode for a stat produced by `mount` as the child `name` of `parent`.
    fn adopt(&self, mount: MountId, parent: Ino, name: &OsStr, stat: FileStat) -> FileStat {
        let path = self.path_of(parent).join(name);
        let ino = self.intern(
            Route::Backend {
                mount,
                ino: stat.ino,
            },
            path,
        );
        stat.with_ino(ino)
    }

    /// Give back the backend reference of a `readdirplus` entry the kernel never received.
    async fn forget_unseen(&self, ino: Ino) {
        let route = self.table.resolve(ino);
        if self.table.forget(ino, 0).is_some() {
            self.paths.remove_sync(&ino);
        }
        if let Some(Route::Backend { mount, ino: bino }) = route
            && bino != ROOT_INO
            && let Ok(provider) = self.provider(mount)
        {
            provider.forget(bino, 1).await;
        }
    }

    /// Full listing of `dir`: the owning backend's entries with nested mounts spliced in.
    ///
    /// With `plus` the backend is asked for `readdirplus`, which takes lookup references that
    /// are handed on to the kernel; shadowed entries give theirs straight back.
    async fn listing(
        &self,
        ino: Ino,
        fh: FileHandle,
        plus: bool,
    ) -> Result<Vec<(OsString, FileStat)>, FsError> {
        let dir = self.path_of(ino);
        let mut entries: Vec<(OsString, FileStat)> = Vec::new();

        let children = self.mount_children(&dir);
        if let Target::Backend {
            mount,
            provider,
            ino: bino,
        } = self.target(ino)?
        {
            let listed: Vec<(OsString, FileStat)> = if plus {
                provider
                    .readdirplus(bino, fh, 0)
                    .await?
                    .into_iter()
                    .map(|e| (e.name, e.stat))
                    .collect()
            } else {
                provider
                    .readdir(bino, fh, 0)
                    .await?
                    .into_iter()
                    .map(|e| (e.name, FileStat::new(e.ino, e.mode, 0, 0)))
                    .collect()
            };
            for (name, stat) in listed {
                if children.iter().any(|(child, _)| *child == name) {
                    if plus {
                        provider.forget(stat.ino, 1).await;
                    }
                    continue;
                }
                let route = Route::Backend {
                    mount,
                    ino: stat.ino,
                };
                let child = self.observe(route, dir.join(&name));
                entries.push((name, stat.with_ino(child)));
            }
        }

        let stats = join_all(children.iter().map(|(_, mount)| async move {
            match mount {
                Some((_, provider)) => provider.getattr(ROOT_INO, None).await.map(Some),
                None => Ok(None),
            }
        }))
        .await;
        for ((name, mount), stat) in children.into_iter().zip(stats) {
            let path = dir.join(&name);
            let stat = match (mount, stat) {
                (Some((id, _)), Ok(Some(stat))) => {
                    let child = self.observe(
                        Route::Backend {
                            mount: id,
                            ino: ROOT_INO,
                        },
                        path,
                    );
                    stat.with_ino(child)
                }
                (Some((_, _)), Err(e)) => {
                    debug!(path = %path.display(), error = %e, "skipping unreachable mount");
                    continue;
                }
                (_, _) => {
                    let child = self.observe(Route::Virtual(path.clone()), path);
                    FileStat::synthetic_dir(child)
                }
            };
            entries.push((name, stat));
        }
        Ok(entries)
    }

    fn same_backend(&self, a: Ino, b: Ino) -> Result<(DynProvider, Ino, Ino), FsError> {
        let (mount_a, provider, ino_a) = self.backend(a)?;
        let (mount_b, _, ino_b) = self.backend(b)?;
        if mount_a != mount_b {
            return Err(FsError::CrossDevice);
        }
        Ok((provider, ino_a, ino_b))
    }

    fn all_providers(&self) -> Vec<DynProvider> {
        self.mounts
            .read()
            .iter()
            .map(|m| DynProvider::clone(&m.provider))
            .collect()
    }
}

impl Default for RouterProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for RouterProvider {
    async fn init(&self) -> Result<(), FsError> {
        for provider in self.all_providers() {
            provider.init().await?;
        }
        Ok(())
    }

    async fn destroy(&self) {
        join_all(self.all_providers().iter().map(|p| p.destroy())).await;
    }

    async fn forget(&self, ino: Ino, nlookup: u64) {
        let Some(route) = self.table.resolve(ino) else {
            return;
        };
        if self.table.forget(ino, nlookup).is_some() {
            self.paths.remove_sync(&ino);
        }
        if let Route::Backend { mount, ino: bino } = route
            && bino != ROOT_INO
            && let Ok(provider) = self.provider(mount)
        {
            provider.forget(bino, nlookup).await;
        }
    }

    async fn forget_multi(&self, forgets: &[Forget]) {
        for f in forgets {
            self.forget(f.ino, f.nlookup).await;
        }
    }

    #[instrument(name = "RouterProvider::lookup", skip(self))]
    async fn lookup(&self, parent: Ino, name: &OsStr) -> Result<FileStat, FsError> {
        let path = self.path_of(parent).join(name);

        if let Some((mount, provider)) = self.mount_at(&path) {
            let stat = provider.getattr(ROOT_INO, None).await?;
            let ino = self.intern(
                Route::Backend {
                    mount,
                    ino: ROOT_INO,
                },
                path,
            );
            return Ok(stat.with_ino(ino));
        }

        if let Target::Backend {
            mount,
            provider,
            ino: bino,
        } = self.target(parent)?
        {
            match provider.lookup(bino, name).await {
                Ok(stat) => return Ok(self.adopt(mount, parent, name, stat)),
                Err(e) if !e.is_not_found() => return Err(e),
                Err(_) => {}
            }
        }

        if self.mount_children(&path).is_empty() {
            return Err(FsError::NotFound);
        }
        let ino = self.intern(Route::Virtual(path.clone()), path);
        Ok(FileStat::synthetic_dir(ino))
    }

    async fn getattr(&self, ino: Ino, fh: Option<FileHandle>) -> Result<FileStat, FsError> {
        match self.table.require(ino)? {
            Route::Virtual(path) => match self.mount_at(&path) {
                Some((_, provider)) => Ok(provider.getattr(ROOT_INO, None).await?.with_ino(ino)),
                None => Ok(FileStat::synthetic_dir(ino)),
            },
            Route::Backend { mount, ino: bino } => {
                let stat = self.provider(mount)?.getattr(bino, fh).await?;
                Ok(stat.with_ino(ino))
            }
        }
    }

    async fn setattr(
        &self,
        ino: Ino,
        fh: Option<FileHandle>,
        attr: SetAttr,
    ) -> Result<FileStat, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        Ok(provider.setattr(bino, fh, attr).await?.with_ino(ino))
    }

    async fn readdir(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.path_of(ino);
        if self.mount_children(&dir).is_empty()
            && let Target::Backend {
                mount,
                provider,
                ino: bino,
            } = self.target(ino)?
        {
            return Ok(provider
                .readdir(bino, fh, offset)
                .await?
                .into_iter()
                .map(|e| {
                    let child = self.observe(
                        Route::Backend {
                            mount,
                            ino: e.ino,
                        },
                        dir.join(&e.name),
                    );
                    DirEntry {
                        ino: child,
                        name: e.name,
                        mode: e.mode,
                    }
                })
                .collect());
        }

        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .listing(ino, fh, false)
            .await?
            .into_iter()
            .skip(skip)
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
        fh: FileHandle,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, FsError> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut entries = self.listing(ino, fh, true).await?;
        let kept = entries.split_off(skip.min(entries.len()));
        for (_, stat) in entries {
            self.forget_unseen(stat.ino).await;
        }
        Ok(kept
            .into_iter()
            .map(|(name, stat)| {
                if let Some(route) = self.table.resolve(stat.ino) {
                    let _ = self.table.intern(route);
                }
                DirEntryPlus { name, stat }
            })
            .collect())
    }

    async fn opendir(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.opendir(ino, flags).await,
            Target::Virtual => Ok(0),
        }
    }

    async fn releasedir(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.releasedir(ino, fh).await,
            Target::Virtual => Ok(()),
        }
    }

    async fn fsyncdir(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.fsyncdir(ino, fh, datasync).await,
            Target::Virtual => Ok(()),
        }
    }

    async fn open(&self, ino: Ino, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.open(bino, flags).await
    }

    async fn read(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.read(bino, fh, offset, size).await
    }

    async fn write(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<u32, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.write(bino, fh, offset, data).await
    }

    async fn flush(&self, ino: Ino, fh: FileHandle, lock_owner: u64) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.flush(bino, fh, lock_owner).await
    }

    async fn fsync(&self, ino: Ino, fh: FileHandle, datasync: bool) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.fsync(bino, fh, datasync).await
    }

    async fn release(&self, ino: Ino, fh: FileHandle) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.release(bino, fh).await
    }

    async fn create(
        &self,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let (mount, provider, bparent) = self.backend(parent)?;
        let created = provider.create(bparent, name, mode, flags).await?;
        Ok(Created {
            stat: self.adopt(mount, parent, name, created.stat),
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
        let (mount, provider, bparent) = self.backend(parent)?;
        let stat = provider.mknod(bparent, name, mode, rdev).await?;
        Ok(self.adopt(mount, parent, name, stat))
    }

    async fn mkdir(&self, parent: Ino, name: &OsStr, mode: u32) -> Result<FileStat, FsError> {
        let (mount, provider, bparent) = self.backend(parent)?;
        let stat = provider.mkdir(bparent, name, mode).await?;
        Ok(self.adopt(mount, parent, name, stat))
    }

    async fn unlink(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        let (_, provider, bparent) = self.backend(parent)?;
        provider.unlink(bparent, name).await
    }

    async fn rmdir(&self, parent: Ino, name: &OsStr) -> Result<(), FsError> {
        if self.mount_at(&self.path_of(parent).join(name)).is_some() {
            return Err(FsError::PermissionDenied);
        }
        let (_, provider, bparent) = self.backend(parent)?;
        provider.rmdir(bparent, name).await
    }

    async fn link(&self, ino: Ino, newparent: Ino, newname: &OsStr) -> Result<FileStat, FsError> {
        let (mount, _, _) = self.backend(newparent)?;
        let (provider, bino, bparent) = self.same_backend(ino, newparent)?;
        let stat = provider.link(bino, bparent, newname).await?;
        Ok(self.adopt(mount, newparent, newname, stat))
    }

    async fn symlink(
        &self,
        parent: Ino,
        name: &OsStr,
        target: &Path,
    ) -> Result<FileStat, FsError> {
        let (mount, provider, bparent) = self.backend(parent)?;
        let stat = provider.symlink(bparent, name, target).await?;
        Ok(self.adopt(mount, parent, name, stat))
    }

    async fn readlink(&self, ino: Ino) -> Result<PathBuf, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.readlink(bino).await
    }

    async fn rename(
        &self,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        let (provider, bparent, bnewparent) = self.same_backend(parent, newparent)?;
        provider
            .rename(bparent, name, bnewparent, newname, flags)
            .await
    }

    async fn setxattr(
        &self,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.setxattr(bino, name, value, flags).await
    }

    async fn getxattr(&self, ino: Ino, name: &OsStr) -> Result<Vec<u8>, FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.getxattr(ino, name).await,
            Target::Virtual => Err(FsError::NoAttribute),
        }
    }

    async fn listxattr(&self, ino: Ino) -> Result<Vec<OsString>, FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.listxattr(ino).await,
            Target::Virtual => Ok(Vec::new()),
        }
    }

    async fn removexattr(&self, ino: Ino, name: &OsStr) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.removexattr(bino, name).await
    }

    async fn access(&self, ino: Ino, mask: i32) -> Result<(), FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.access(ino, mask).await,
            Target::Virtual if mask & libc::W_OK != 0 => Err(FsError::PermissionDenied),
            Target::Virtual => Ok(()),
        }
    }

    async fn statfs(&self, ino: Ino) -> Result<StatFs, FsError> {
        match self.target(ino)? {
            Target::Backend { provider, ino, .. } => provider.statfs(ino).await,
            Target::Virtual => Ok(StatFs::default()),
        }
    }

    async fn getlk(&self, ino: Ino, fh: FileHandle, lock: FileLock) -> Result<FileLock, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.getlk(bino, fh, lock).await
    }

    async fn setlk(
        &self,
        ino: Ino,
        fh: FileHandle,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.setlk(bino, fh, lock, sleep).await
    }

    async fn flock(&self, ino: Ino, fh: FileHandle, op: i32) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.flock(bino, fh, op).await
    }

    async fn bmap(&self, ino: Ino, blocksize: u32, idx: u64) -> Result<u64, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.bmap(bino, blocksize, idx).await
    }

    async fn ioctl(
        &self,
        ino: Ino,
        fh: FileHandle,
        cmd: u32,
        input: &[u8],
        out_size: u32,
    ) -> Result<IoctlReply, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.ioctl(bino, fh, cmd, input, out_size).await
    }

    async fn poll(&self, ino: Ino, fh: FileHandle, events: u32) -> Result<u32, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.poll(bino, fh, events).await
    }

    async fn fallocate(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.fallocate(bino, fh, offset, length, mode).await
    }

    async fn copy_file_range(&self, range: CopyRange) -> Result<u64, FsError> {
        let (provider, ino_in, ino_out) = self.same_backend(range.ino_in, range.ino_out)?;
        provider
            .copy_file_range(CopyRange {
                ino_in,
                ino_out,
                ..range
            })
            .await
    }

    async fn lseek(
        &self,
        ino: Ino,
        fh: FileHandle,
        offset: i64,
        whence: i32,
    ) -> Result<i64, FsError> {
        let (_, provider, bino) = self.backend(ino)?;
        provider.lseek(bino, fh, offset, whence).await
    }

    async fn tmpfile(
        &self,
        parent: Ino,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Created, FsError> {
        let (mount, provider, bparent) = self.backend(parent)?;
        let created = provider.tmpfile(bparent, mode, flags).await?;
        let ino = self.table.intern(Route::Backend {
            mount,
            ino: created.stat.ino,
        });
        Ok(Created {
            stat: created.stat.with_ino(ino),
            fh: created.fh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileKind;

    #[test]
    fn normalize_strips_trailing_slashes() {
        assert_eq!(normalize(Path::new("/data/")).unwrap(), PathBuf::from("/data"));
        assert_eq!(normalize(Path::new("/")).unwrap(), PathBuf::from("/"));
        assert_eq!(
            normalize(Path::new("//a//b/")).unwrap(),
            PathBuf::from("/a/b")
        );
    }

    #[test]
    fn normalize_rejects_relative_and_parent_paths() {
        assert!(normalize(Path::new("data")).is_err());
        assert!(normalize(Path::new("/data/../etc")).is_err());
    }

    #[test]
    fn mount_kind_is_a_directory() {
        assert_eq!(
            FileKind::from_mode(FileStat::synthetic_dir(ROOT_INO).mode),
            FileKind::Directory
        );
    }
}
