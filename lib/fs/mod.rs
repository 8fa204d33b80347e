//! Provider contract, composition engines and the protocol bridge.

/// Protocol bridge: decoded kernel requests to provider calls.
pub mod bridge;
/// Transparent per-write encryption of file content.
pub mod encrypted;
/// Closed error taxonomy and errno mapping.
pub mod error;
/// Free functions shared by fan-out engines.
pub mod fanout;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`bridge::ProtocolBridge`].
pub mod fuser;
/// Read-cache tiering over a master and a slave backend.
pub mod cache;
/// Per-provider table mapping issued file handles to backend state.
pub mod handle_table;
/// Synthetic inode virtualization shared by all composition engines.
pub mod inode_table;
/// Passthrough backend over a host directory.
pub mod local;
/// In-memory backend.
pub mod memory;
/// Failover and quorum execution across replicated backends.
pub mod multi;
/// The provider contract every backend and engine implements.
pub mod provider;
/// Striping, mirroring and parity across member backends.
pub mod raid;
/// Longest-prefix routing of mount paths to backends.
pub mod router;

pub use error::{Errno, FsError};
pub use provider::{DynProvider, Provider};

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode number.
pub type Ino = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The root inode of every provider.
pub const ROOT_INO: Ino = 1;

/// Preferred I/O block size reported for synthetic directories.
pub const BLOCK_SIZE: u32 = 4096;

const S_IFMT: u32 = 0o170_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;

        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

impl OpenFlags {
    /// Whether these flags request write access.
    #[must_use]
    pub fn is_writable(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }
}

impl From<i32> for OpenFlags {
    fn from(val: i32) -> Self {
        Self::from_bits_retain(val)
    }
}

/// The type of a filesystem object, derived from the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A regular file.
    RegularFile,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
    /// A FIFO.
    NamedPipe,
    /// A Unix domain socket.
    Socket,
}

impl FileKind {
    /// Classify a mode. Unknown type bits are treated as a regular file.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::NamedPipe,
            S_IFSOCK => Self::Socket,
            _ => Self::RegularFile,
        }
    }

    /// The `S_IFMT` bits for this kind.
    #[must_use]
    pub const fn type_bits(self) -> u32 {
        match self {
            Self::RegularFile => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::NamedPipe => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }
}

/// Attributes of a filesystem object.
///
/// Once a stat crosses a composition boundary its `ino` is always the
/// caller-visible synthetic inode, never a raw backend inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStat {
    /// Inode number.
    pub ino: Ino,
    /// Type and permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Device containing the object.
    pub dev: u64,
    /// Number of hard links.
    pub nlink: u32,
    /// Device id for special files.
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
}

impl FileStat {
    /// A fresh stat for a new object of the given mode, owned by `uid:gid`.
    #[must_use]
    pub fn new(ino: Ino, mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            mode,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            dev: 0,
            nlink: 1,
            rdev: 0,
            blksize: BLOCK_SIZE,
            blocks: 0,
        }
    }

    /// The synthetic directory stat handed out for virtual directories.
    #[must_use]
    pub fn synthetic_dir(ino: Ino) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            mode: S_IFDIR | 0o755,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid: nix::unistd::Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
            dev: 0,
            nlink: 1,
            rdev: 0,
            blksize: BLOCK_SIZE,
            blocks: 0,
        }
    }

    /// The object type encoded in `mode`.
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits of `mode`.
    #[must_use]
    pub const fn perm(&self) -> u16 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to 12 bits, always fits in u16"
        )]
        let perm = (self.mode & 0o7777) as u16;
        perm
    }

    /// Whether this stat describes a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind(), FileKind::Directory)
    }

    /// Returns a copy with `ino` replaced.
    #[must_use]
    pub const fn with_ino(mut self, ino: Ino) -> Self {
        self.ino = ino;
        self
    }
}

/// A directory entry yielded by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    /// Inode number of the entry.
    pub ino: Ino,
    /// Name of the entry within its parent.
    pub name: OsString,
    /// Type and permission bits.
    pub mode: u32,
}

impl DirEntry {
    /// The object type of this entry.
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// A directory entry with full attributes, yielded by `readdirplus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntryPlus {
    /// Name of the entry within its parent.
    pub name: OsString,
    /// Attributes of the entry.
    pub stat: FileStat,
}

/// A time value in a `setattr` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeOrNow {
    /// A specific point in time.
    At(SystemTime),
    /// The time the request is serviced.
    Now,
}

impl TimeOrNow {
    /// Resolve to a concrete time.
    #[must_use]
    pub fn resolve(self) -> SystemTime {
        match self {
            Self::At(t) => t,
            Self::Now => SystemTime::now(),
        }
    }
}

/// Attribute changes requested by `setattr`. `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SetAttr {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size; truncates or extends the file.
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
    /// New change time.
    pub ctime: Option<SystemTime>,
}

impl SetAttr {
    /// A request that only changes the size.
    #[must_use]
    pub fn truncate(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }
}

/// The reply of `create` and `tmpfile`: the new object and an open handle to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Created {
    /// Attributes of the new object.
    pub stat: FileStat,
    /// Handle opened on the new object.
    pub fh: FileHandle,
}

/// Filesystem statistics returned by `statfs`.
///
/// Block counts are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatFs {
    /// Total number of data blocks.
    pub blocks: u64,
    /// Number of free blocks.
    pub blocks_free: u64,
    /// Number of blocks available to unprivileged users.
    pub blocks_available: u64,
    /// Total number of inodes.
    pub files: u64,
    /// Number of free inodes.
    pub files_free: u64,
    /// Filesystem block size.
    pub block_size: u32,
    /// Maximum filename length.
    pub max_name_length: u32,
    /// Fragment size.
    pub fragment_size: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 0,
            blocks_free: 0,
            blocks_available: 0,
            files: 0,
            files_free: 0,
            block_size: BLOCK_SIZE,
            max_name_length: 255,
            fragment_size: BLOCK_SIZE,
        }
    }
}

/// A POSIX byte-range lock description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileLock {
    /// Owner of the lock, as identified by the kernel.
    pub owner: u64,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range.
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// Process holding the lock.
    pub pid: u32,
}

/// The reply of `ioctl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IoctlReply {
    /// Result code returned to the caller.
    pub result: i32,
    /// Output buffer.
    pub data: Vec<u8>,
}

/// Both ends of a `copy_file_range` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyRange {
    /// Source inode.
    pub ino_in: Ino,
    /// Source handle.
    pub fh_in: FileHandle,
    /// Source offset.
    pub offset_in: u64,
    /// Destination inode.
    pub ino_out: Ino,
    /// Destination handle.
    pub fh_out: FileHandle,
    /// Destination offset.
    pub offset_out: u64,
    /// Number of bytes to copy.
    pub len: u64,
    /// Flags passed by the caller.
    pub flags: u32,
}

/// One entry of a `forget_multi` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Forget {
    /// Inode being forgotten.
    pub ino: Ino,
    /// Number of lookups the kernel is dropping.
    pub nlookup: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_type_bits() {
        for kind in [
            FileKind::RegularFile,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::CharDevice,
            FileKind::BlockDevice,
            FileKind::NamedPipe,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_mode(kind.type_bits() | 0o644), kind);
        }
    }

    #[test]
    fn synthetic_dir_has_expected_shape() {
        let stat = FileStat::synthetic_dir(ROOT_INO);
        assert_eq!(stat.mode, 0o40755);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.blksize, 4096);
        assert!(stat.is_dir());
    }

    #[test]
    fn open_flags_detect_write_access() {
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(OpenFlags::WRONLY.is_writable());
        assert!((OpenFlags::RDWR | OpenFlags::APPEND).is_writable());
    }
}
