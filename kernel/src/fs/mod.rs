// kernel/src/fs/mod.rs
//
// VFS: inodes and their driver contract, the page cache in front of
// regular files, path resolution and mounts, open files and descriptor
// tables, plus the in-kernel backends (ramfs, devfs, pipes).

use alloc::string::String;
use bitflags::bitflags;

pub mod devfs;
pub mod file;
pub mod inode;
pub mod page_cache;
pub mod pipe;
pub mod ramfs;
pub mod vfs;

pub use file::{FdTable, OpenFile};
pub use inode::{Inode, InodeId, InodeKind, InodeOps};
pub use page_cache::PageCache;
pub use vfs::Vfs;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotDirectory,
    IsDirectory,
    Exists,
    BadFileDescriptor,
    InvalidArgument,
    IoError,
    NotSupported,
    NoSpace,
    SymlinkLoop,
    PermissionDenied,
    /// Pipe empty/full under the blocking policy; retry after a wakeup.
    WouldBlock,
    BrokenPipe,
    TooManyOpenFiles,
    NotEmpty,
    NameTooLong,
    NotSeekable,
    NotTty,
}

pub type FsResult<T> = Result<T, FsError>;

/// Longest path component.
pub const NAME_MAX: usize = 255;
/// Longest path.
pub const PATH_MAX: usize = 4096;
/// Symlinks followed during one resolution before giving up.
pub const SYMLINK_DEPTH: usize = 8;

// ============================================================================
// Flags and records
// ============================================================================

bitflags! {
    /// `open(2)` flags, Linux values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const CREAT     = 0o100;
        const EXCL      = 0o200;
        const TRUNC     = 0o1000;
        const APPEND    = 0o2000;
        const NONBLOCK  = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW  = 0o400000;
        const CLOEXEC   = 0o2000000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: InodeKind,
    pub name: String,
}
