// kernel/src/fs/file.rs
//
// Open files and per-process descriptor tables.
//
// An `OpenFile` is one open file description: the inode, the access mode
// and a shared offset.  Descriptors (`dup`, `fork`) share it through an
// `Arc`; when the last handle goes away the driver's `close` runs, and if
// that was the inode's last open file its cached pages are written back
// and dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use super::inode::{Inode, InodeKind};
use super::page_cache::PageCache;
use super::{DirEntry, FsError, FsResult, OpenFlags, SeekFrom, Stat};
use crate::sync::IrqLock;

pub struct OpenFile {
    inode: Arc<Inode>,
    flags: AtomicU32,
    offset: IrqLock<u64>,
    cache: Arc<IrqLock<PageCache>>,
}

impl OpenFile {
    /// Open `inode`, running the driver's `open` hook.
    pub fn open(inode: Arc<Inode>, flags: OpenFlags, cache: Arc<IrqLock<PageCache>>) -> FsResult<Arc<Self>> {
        inode.ops().open(&inode, flags)?;
        inode.acquire();
        Ok(Arc::new(Self { inode, flags: AtomicU32::new(flags.bits()), offset: IrqLock::new(0), cache }))
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn flags(&self) -> OpenFlags {
        OpenFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// `F_SETFL`: only `O_APPEND` and `O_NONBLOCK` can change.
    pub fn set_status_flags(&self, flags: OpenFlags) {
        let mutable = OpenFlags::APPEND | OpenFlags::NONBLOCK;
        let new = (self.flags() - mutable) | (flags & mutable);
        self.flags.store(new.bits(), Ordering::Relaxed);
    }

    pub fn is_pipe(&self) -> bool {
        self.inode.kind() == InodeKind::Pipe
    }

    pub fn nonblocking(&self) -> bool {
        self.flags().contains(OpenFlags::NONBLOCK)
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
        if self.inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if self.inode.is_cached() {
            self.cache.lock().read(&self.inode, pos, buf)
        } else {
            self.inode.ops().read(&self.inode, pos, buf)
        }
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> FsResult<usize> {
        if self.inode.is_cached() {
            self.cache.lock().write(&self.inode, pos, data)
        } else {
            self.inode.ops().write(&self.inode, pos, data)
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.flags().readable() {
            return Err(FsError::BadFileDescriptor);
        }
        let mut off = self.offset.lock();
        let n = self.read_at(*off, buf)?;
        *off += n as u64;
        Ok(n)
    }

    pub fn write(&self, data: &[u8]) -> FsResult<usize> {
        if !self.flags().writable() {
            return Err(FsError::BadFileDescriptor);
        }
        let mut off = self.offset.lock();
        if self.flags().contains(OpenFlags::APPEND) {
            *off = self.inode.size();
        }
        let n = self.write_at(*off, data)?;
        *off += n as u64;
        Ok(n)
    }

    /// Positioned read; the shared offset is untouched.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> FsResult<usize> {
        if !self.flags().readable() {
            return Err(FsError::BadFileDescriptor);
        }
        if self.is_pipe() {
            return Err(FsError::NotSeekable);
        }
        self.read_at(pos, buf)
    }

    pub fn pwrite(&self, data: &[u8], pos: u64) -> FsResult<usize> {
        if !self.flags().writable() {
            return Err(FsError::BadFileDescriptor);
        }
        if self.is_pipe() {
            return Err(FsError::NotSeekable);
        }
        self.write_at(pos, data)
    }

    pub fn seek(&self, to: SeekFrom) -> FsResult<u64> {
        if self.is_pipe() {
            return Err(FsError::NotSeekable);
        }
        let mut off = self.offset.lock();
        let new = match to {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => off.checked_add_signed(d),
            SeekFrom::End(d) => self.inode.size().checked_add_signed(d),
        };
        *off = new.ok_or(FsError::InvalidArgument)?;
        Ok(*off)
    }

    /// Directory entry at the current offset; the offset counts entries.
    pub fn peek_dirent(&self) -> FsResult<Option<DirEntry>> {
        if !self.inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let off = *self.offset.lock();
        self.inode.ops().readdir(&self.inode, off as usize)
    }

    /// Step past the entry `peek_dirent` returned.
    pub fn skip_dirent(&self) {
        *self.offset.lock() += 1;
    }

    pub fn stat(&self) -> Stat {
        self.inode.stat()
    }

    pub fn ioctl(&self, cmd: u64, arg: u64) -> FsResult<i64> {
        self.inode.ops().ioctl(&self.inode, cmd, arg)
    }

    /// Write back this file's dirty cached pages.
    pub fn sync(&self) -> FsResult<()> {
        if self.inode.is_cached() {
            self.cache.lock().flush_inode(&self.inode)
        } else {
            Ok(())
        }
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.inode.ops().close(&self.inode, self.flags());
        if self.inode.release() && self.inode.is_cached() {
            // failures are logged by the cache; nobody is left to tell
            let _ = self.cache.lock().evict_inode(&self.inode);
        }
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("ino", &self.inode.id())
            .field("flags", &self.flags())
            .field("offset", &self.offset())
            .finish()
    }
}

// ============================================================================
// Descriptor table
// ============================================================================

#[derive(Clone)]
struct FdSlot {
    file: Arc<OpenFile>,
    cloexec: bool,
}

/// A process's descriptors.  Cloning (fork) shares the open files.
#[derive(Clone)]
pub struct FdTable {
    slots: Vec<Option<FdSlot>>,
    max: usize,
}

impl FdTable {
    pub fn new(max: usize) -> Self {
        Self { slots: Vec::new(), max }
    }

    fn check(&self, fd: usize) -> FsResult<()> {
        match self.slots.get(fd) {
            Some(Some(_)) => Ok(()),
            _ => Err(FsError::BadFileDescriptor),
        }
    }

    /// Install `file` at the lowest free descriptor `>= min`.
    pub fn alloc_from(&mut self, min: usize, file: Arc<OpenFile>, cloexec: bool) -> FsResult<usize> {
        let fd = (min..self.max)
            .find(|&i| self.slots.get(i).map_or(true, |s| s.is_none()))
            .ok_or(FsError::TooManyOpenFiles)?;
        if fd >= self.slots.len() {
            self.slots.resize(fd + 1, None);
        }
        self.slots[fd] = Some(FdSlot { file, cloexec });
        Ok(fd)
    }

    pub fn alloc(&mut self, file: Arc<OpenFile>, cloexec: bool) -> FsResult<usize> {
        self.alloc_from(0, file, cloexec)
    }

    pub fn get(&self, fd: usize) -> FsResult<Arc<OpenFile>> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|s| s.file.clone())
            .ok_or(FsError::BadFileDescriptor)
    }

    /// Remove `fd`, handing back its file so the caller decides when the
    /// last reference is dropped.
    pub fn close(&mut self, fd: usize) -> FsResult<Arc<OpenFile>> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.take())
            .map(|s| s.file)
            .ok_or(FsError::BadFileDescriptor)
    }

    pub fn dup(&mut self, fd: usize) -> FsResult<usize> {
        let file = self.get(fd)?;
        self.alloc(file, false)
    }

    pub fn dup2(&mut self, old: usize, new: usize) -> FsResult<usize> {
        let file = self.get(old)?;
        if new >= self.max {
            return Err(FsError::BadFileDescriptor);
        }
        if old == new {
            return Ok(new);
        }
        if new >= self.slots.len() {
            self.slots.resize(new + 1, None);
        }
        self.slots[new] = Some(FdSlot { file, cloexec: false });
        Ok(new)
    }

    pub fn cloexec(&self, fd: usize) -> FsResult<bool> {
        self.check(fd)?;
        Ok(self.slots[fd].as_ref().is_some_and(|s| s.cloexec))
    }

    pub fn set_cloexec(&mut self, fd: usize, on: bool) -> FsResult<()> {
        self.check(fd)?;
        if let Some(s) = self.slots[fd].as_mut() {
            s.cloexec = on;
        }
        Ok(())
    }

    /// Drop every close-on-exec descriptor, handing back the files.
    pub fn close_on_exec(&mut self) -> Vec<Arc<OpenFile>> {
        let mut closed = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.cloexec) {
                closed.extend(slot.take().map(|s| s.file));
            }
        }
        closed
    }

    pub fn close_all(&mut self) -> Vec<Arc<OpenFile>> {
        self.slots.drain(..).flatten().map(|s| s.file).collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn debug_list(&self) {
        crate::serial_println!("open descriptors:");
        for (fd, slot) in self.slots.iter().enumerate() {
            if let Some(s) = slot {
                crate::serial_println!("  {}: {:?}{}", fd, s.file, if s.cloexec { " cloexec" } else { "" });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::devfs::DevFs;
    use crate::memory::FramePool;

    fn null_file(flags: OpenFlags) -> Arc<OpenFile> {
        let pool = FramePool::new_heap_backed(4);
        let cache = Arc::new(IrqLock::new(PageCache::new(pool, 4, 4)));
        let dev = DevFs::new();
        let null = dev.root().lookup("null").unwrap();
        OpenFile::open(null, flags, cache).unwrap()
    }

    #[test]
    fn lowest_free_descriptor_is_reused() {
        let mut t = FdTable::new(8);
        let f = null_file(OpenFlags::RDWR);
        assert_eq!(t.alloc(f.clone(), false).unwrap(), 0);
        assert_eq!(t.alloc(f.clone(), false).unwrap(), 1);
        assert_eq!(t.alloc(f.clone(), false).unwrap(), 2);
        t.close(1).unwrap();
        assert_eq!(t.alloc(f, false).unwrap(), 1);
        assert_eq!(t.close(7).unwrap_err(), FsError::BadFileDescriptor);
    }

    #[test]
    fn table_limit() {
        let mut t = FdTable::new(2);
        let f = null_file(OpenFlags::RDONLY);
        t.alloc(f.clone(), false).unwrap();
        t.alloc(f.clone(), false).unwrap();
        assert_eq!(t.alloc(f, false).unwrap_err(), FsError::TooManyOpenFiles);
    }

    #[test]
    fn dup2_and_cloexec() {
        let mut t = FdTable::new(8);
        let f = null_file(OpenFlags::WRONLY);
        let fd = t.alloc(f, true).unwrap();
        assert_eq!(t.dup2(fd, 5).unwrap(), 5);
        assert!(!t.cloexec(5).unwrap());
        t.close_on_exec();
        assert!(t.get(fd).is_err());
        assert!(t.get(5).is_ok());
    }

    #[test]
    fn access_mode_is_enforced() {
        let f = null_file(OpenFlags::WRONLY);
        let mut b = [0u8; 4];
        assert_eq!(f.read(&mut b).unwrap_err(), FsError::BadFileDescriptor);
        assert_eq!(f.write(b"abc").unwrap(), 3);
    }
}
