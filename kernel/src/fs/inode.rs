// kernel/src/fs/inode.rs
//
// A VFS node and the operations a backing driver provides for it.
//
// Drivers own their inodes: a lookup of the same name must hand back the
// same `Arc<Inode>`, since the inode id keys the page cache and the open
// count decides when cached pages are flushed.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{DirEntry, FsError, FsResult, OpenFlags, Stat};
use crate::sync::IrqLock;

pub type InodeId = u64;

static NEXT_INODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Pipe,
}

impl InodeKind {
    /// `st_mode` file-type bits.
    pub fn mode_bits(self) -> u32 {
        match self {
            InodeKind::File => 0o100000,
            InodeKind::Directory => 0o040000,
            InodeKind::Symlink => 0o120000,
            InodeKind::CharDevice => 0o020000,
            InodeKind::BlockDevice => 0o060000,
            InodeKind::Pipe => 0o010000,
        }
    }

    /// Linux `d_type` value.
    pub fn dirent_type(self) -> u8 {
        match self {
            InodeKind::Pipe => 1,
            InodeKind::CharDevice => 2,
            InodeKind::Directory => 4,
            InodeKind::BlockDevice => 6,
            InodeKind::File => 8,
            InodeKind::Symlink => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    pub size: u64,
    /// Permission bits.
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

/// Driver entry points.  The page cache only ever calls `read`/`write`,
/// and assumes nothing beyond what one call provides.
pub trait InodeOps: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; 0 at end of file.
    fn read(&self, node: &Inode, offset: u64, buf: &mut [u8]) -> FsResult<usize>;

    fn write(&self, node: &Inode, offset: u64, buf: &[u8]) -> FsResult<usize>;

    fn open(&self, _node: &Inode, _flags: OpenFlags) -> FsResult<()> {
        Ok(())
    }

    /// Called each time an open file on `node` goes away.
    fn close(&self, _node: &Inode, _flags: OpenFlags) {}

    fn lookup(&self, _dir: &Inode, _name: &str) -> FsResult<Arc<Inode>> {
        Err(FsError::NotDirectory)
    }

    fn create(&self, _dir: &Inode, _name: &str, _kind: InodeKind, _perm: u32) -> FsResult<Arc<Inode>> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _dir: &Inode, _name: &str) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    /// The `index`-th entry of a directory, `None` past the end.
    fn readdir(&self, _dir: &Inode, _index: usize) -> FsResult<Option<DirEntry>> {
        Err(FsError::NotDirectory)
    }

    fn truncate(&self, _node: &Inode, _size: u64) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn symlink(&self, _dir: &Inode, _name: &str, _target: &str) -> FsResult<Arc<Inode>> {
        Err(FsError::NotSupported)
    }

    fn readlink(&self, _node: &Inode) -> FsResult<String> {
        Err(FsError::InvalidArgument)
    }

    fn ioctl(&self, _node: &Inode, _cmd: u64, _arg: u64) -> FsResult<i64> {
        Err(FsError::NotTty)
    }

    /// Physical address backing `offset` for direct (device) mappings.
    fn mmap_phys(&self, _node: &Inode, _offset: u64) -> FsResult<u64> {
        Err(FsError::NotSupported)
    }
}

pub struct Inode {
    id: InodeId,
    kind: InodeKind,
    meta: IrqLock<InodeMeta>,
    /// Open files referring to this inode.
    open_count: AtomicUsize,
    /// Root of a filesystem mounted on this directory.
    mount: IrqLock<Option<Arc<Inode>>>,
    ops: Arc<dyn InodeOps>,
    /// Driver-private handle (node index, device number, ...).
    private: u64,
    /// Pipes and other transient nodes: gone once nothing refers to them.
    temporary: bool,
}

impl Inode {
    pub fn new(kind: InodeKind, perm: u32, ops: Arc<dyn InodeOps>, private: u64) -> Self {
        Self {
            id: NEXT_INODE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            meta: IrqLock::new(InodeMeta { size: 0, perm, uid: 0, gid: 0, nlink: 1 }),
            open_count: AtomicUsize::new(0),
            mount: IrqLock::new(None),
            ops,
            private,
            temporary: false,
        }
    }

    pub fn new_temporary(kind: InodeKind, ops: Arc<dyn InodeOps>) -> Self {
        Self { temporary: true, ..Self::new(kind, 0o600, ops, 0) }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn ops(&self) -> &Arc<dyn InodeOps> {
        &self.ops
    }

    pub fn private(&self) -> u64 {
        self.private
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    /// Regular files are the only nodes that go through the page cache.
    pub fn is_cached(&self) -> bool {
        self.kind == InodeKind::File
    }

    pub fn size(&self) -> u64 {
        self.meta.lock().size
    }

    pub fn set_size(&self, size: u64) {
        self.meta.lock().size = size;
    }

    /// Raise the size to at least `size`.
    pub fn extend_to(&self, size: u64) {
        let mut m = self.meta.lock();
        if size > m.size {
            m.size = size;
        }
    }

    pub fn meta(&self) -> InodeMeta {
        *self.meta.lock()
    }

    pub fn update_meta(&self, f: impl FnOnce(&mut InodeMeta)) {
        f(&mut self.meta.lock());
    }

    pub fn stat(&self) -> Stat {
        let m = self.meta();
        Stat {
            ino: self.id,
            mode: self.kind.mode_bits() | (m.perm & 0o7777),
            nlink: m.nlink,
            uid: m.uid,
            gid: m.gid,
            size: m.size,
            blocks: m.size.div_ceil(512),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub(super) fn acquire(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one open reference; true when it was the last.
    pub(super) fn release(&self) -> bool {
        self.open_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn mounted(&self) -> Option<Arc<Inode>> {
        self.mount.lock().clone()
    }

    pub fn set_mount(&self, root: Option<Arc<Inode>>) {
        *self.mount.lock() = root;
    }

    // ── driver shorthands ─────────────────────────────────────────────

    pub fn lookup(&self, name: &str) -> FsResult<Arc<Inode>> {
        if !self.is_dir() {
            return Err(FsError::NotDirectory);
        }
        self.ops.lookup(self, name)
    }

    pub fn readlink(&self) -> FsResult<String> {
        self.ops.readlink(self)
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("open", &self.open_count())
            .finish()
    }
}
