// File I/O through the VFS and page cache, observed from the driver side.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use lumen::fs::inode::{Inode, InodeKind, InodeOps};
use lumen::fs::{FsError, FsResult, OpenFlags, SeekFrom};
use lumen::syscall::mm::{MAP_SHARED, PROT_READ, PROT_WRITE};
use lumen::KernelConfig;

const PAGE: u64 = 4096;

type Log = Arc<Mutex<Vec<(&'static str, u64, usize)>>>;

/// Backing store for every file in the recording directory; `private` is
/// the index of the file's bytes.
struct RecFiles {
    data: Mutex<Vec<Vec<u8>>>,
    log: Log,
}

impl InodeOps for RecFiles {
    fn read(&self, node: &Inode, off: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.log.lock().unwrap().push(("read", off, buf.len()));
        let data = self.data.lock().unwrap();
        let file = &data[node.private() as usize];
        let off = off as usize;
        if off >= file.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.len() - off);
        buf[..n].copy_from_slice(&file[off..off + n]);
        Ok(n)
    }

    fn write(&self, node: &Inode, off: u64, buf: &[u8]) -> FsResult<usize> {
        self.log.lock().unwrap().push(("write", off, buf.len()));
        let mut data = self.data.lock().unwrap();
        let file = &mut data[node.private() as usize];
        let end = off as usize + buf.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[off as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, node: &Inode, size: u64) -> FsResult<()> {
        self.data.lock().unwrap()[node.private() as usize].resize(size as usize, 0);
        Ok(())
    }
}

struct RecDir {
    files: Arc<RecFiles>,
    names: Mutex<Vec<(String, Arc<Inode>)>>,
}

impl InodeOps for RecDir {
    fn read(&self, _node: &Inode, _off: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Err(FsError::IsDirectory)
    }

    fn write(&self, _node: &Inode, _off: u64, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::IsDirectory)
    }

    fn lookup(&self, _dir: &Inode, name: &str) -> FsResult<Arc<Inode>> {
        let names = self.names.lock().unwrap();
        names.iter().find(|(n, _)| n == name).map(|(_, i)| i.clone()).ok_or(FsError::NotFound)
    }

    fn create(&self, _dir: &Inode, name: &str, kind: InodeKind, perm: u32) -> FsResult<Arc<Inode>> {
        if kind != InodeKind::File {
            return Err(FsError::NotSupported);
        }
        let mut data = self.files.data.lock().unwrap();
        data.push(Vec::new());
        let node = Arc::new(Inode::new(kind, perm, self.files.clone(), (data.len() - 1) as u64));
        self.names.lock().unwrap().push((name.to_string(), node.clone()));
        Ok(node)
    }
}

/// Mount a recording filesystem at `/rec` and return its call log.
fn mount_recorder(kernel: &lumen::Kernel) -> (Arc<RecFiles>, Log) {
    let log: Log = Arc::default();
    let files = Arc::new(RecFiles { data: Mutex::default(), log: log.clone() });
    let dir = RecDir { files: files.clone(), names: Mutex::default() };
    let root = Arc::new(Inode::new(InodeKind::Directory, 0o755, Arc::new(dir), 0));
    kernel.vfs().mkdir("/", "/rec", 0o755).unwrap();
    kernel.vfs().mount("/rec", root).unwrap();
    (files, log)
}

fn writes(log: &Log) -> Vec<(u64, usize)> {
    log.lock().unwrap().iter().filter(|c| c.0 == "write").map(|c| (c.1, c.2)).collect()
}

#[test]
fn close_writes_back_and_reopen_reads_from_driver() {
    let k = boot();
    let (files, log) = mount_recorder(&k);
    start(&k, "/prog");

    let path = cstr(&k, SCRATCH, "/rec/file");
    let buf = SCRATCH + 0x100;
    poke(&k, buf, b"0123456789");

    let fd = sys(&k, nr::OPEN, &[path, 0o102, 0o644]);
    assert!(fd >= 3);
    assert_eq!(sys(&k, nr::WRITE, &[fd as u64, buf, 10]), 10);
    assert!(writes(&log).is_empty(), "write went straight to the driver");
    assert_eq!(sys(&k, nr::CLOSE, &[fd as u64]), 0);
    assert_eq!(writes(&log), [(0, 10)]);
    assert_eq!(files.data.lock().unwrap()[0], b"0123456789");

    log.lock().unwrap().clear();
    let fd = sys(&k, nr::OPEN, &[path, 0, 0]);
    poke(&k, buf, &[0u8; 10]);
    assert_eq!(sys(&k, nr::READ, &[fd as u64, buf, 64]), 10);
    assert_eq!(peek(&k, buf, 10), b"0123456789");
    assert_eq!(log.lock().unwrap().as_slice(), [("read", 0, 10)]);
    assert_eq!(sys(&k, nr::READ, &[fd as u64, buf, 64]), 0);
    assert_eq!(sys(&k, nr::CLOSE, &[fd as u64]), 0);
    assert!(writes(&log).is_empty(), "clean pages were written back");
}

#[test]
fn eviction_flushes_only_the_dirty_range() {
    let k = boot_with(KernelConfig { cache_pages: 2, ..KernelConfig::default() });
    let (files, log) = mount_recorder(&k);
    let rw = OpenFlags::RDWR | OpenFlags::CREAT;

    let a = k.vfs().open("/", "/rec/a", rw, 0o644).unwrap();
    a.seek(SeekFrom::Start(PAGE + 100)).unwrap();
    assert_eq!(a.write(b"hello").unwrap(), 5);
    assert_eq!(a.inode().size(), PAGE + 105);

    let b = k.vfs().open("/", "/rec/b", rw, 0o644).unwrap();
    b.write(&[1u8; 2 * PAGE as usize]).unwrap();
    assert!(!k.vfs().cache().lock().contains(a.inode().id(), PAGE));
    assert_eq!(writes(&log)[0], (PAGE + 100, 5));
    assert_eq!(&files.data.lock().unwrap()[0][(PAGE + 100) as usize..], b"hello");

    // a is read back from the driver, b is still served from the cache
    let mut back = [0u8; 5];
    assert_eq!(a.pread(&mut back, PAGE + 100).unwrap(), 5);
    assert_eq!(&back, b"hello");
    assert!(log.lock().unwrap().contains(&("read", PAGE, 105)));
}

#[test]
fn truncate_drops_cached_tail() {
    let k = boot();
    let (_files, _log) = mount_recorder(&k);
    start(&k, "/prog");
    let path = cstr(&k, SCRATCH, "/rec/t");
    let buf = SCRATCH + 0x100;
    poke(&k, buf, b"abcdefgh");

    let fd = sys(&k, nr::OPEN, &[path, 0o102, 0o644]) as u64;
    assert_eq!(sys(&k, nr::WRITE, &[fd, buf, 8]), 8);
    assert_eq!(sys(&k, nr::CLOSE, &[fd]), 0);

    // O_TRUNC
    let fd = sys(&k, nr::OPEN, &[path, 0o1002, 0]) as u64;
    assert_eq!(sys(&k, nr::LSEEK, &[fd, 0, 2]), 0);
    assert_eq!(sys(&k, nr::READ, &[fd, buf, 8]), 0);
    assert_eq!(sys(&k, nr::CLOSE, &[fd]), 0);
}

#[test]
fn missing_file_and_bad_descriptor() {
    let k = boot();
    start(&k, "/prog");
    let path = cstr(&k, SCRATCH, "/nope");
    assert_eq!(sys(&k, nr::OPEN, &[path, 0, 0]), -2);
    assert_eq!(sys(&k, nr::READ, &[42, SCRATCH, 1]), -9);
    assert_eq!(sys(&k, nr::CLOSE, &[42]), -9);
}

#[test]
fn stores_through_a_shared_mapping_reach_the_driver() {
    let k = boot();
    let (files, log) = mount_recorder(&k);
    start(&k, "/prog");
    let path = cstr(&k, SCRATCH, "/rec/m");
    let buf = SCRATCH + 0x100;
    poke(&k, buf, b"hello page");
    let fd = sys(&k, nr::OPEN, &[path, 0o102, 0o644]) as u64;
    assert_eq!(sys(&k, nr::WRITE, &[fd, buf, 10]), 10);
    assert_eq!(sys(&k, nr::CLOSE, &[fd]), 0);

    let fd = sys(&k, nr::OPEN, &[path, 2, 0]) as u64;
    let rw = PROT_READ | PROT_WRITE;
    let addr = sys(&k, nr::MMAP, &[0, PAGE, rw, MAP_SHARED, fd, 0]) as u64;
    assert_eq!(peek(&k, addr, 5), b"hello");
    log.lock().unwrap().clear();

    poke(&k, addr, b"J");
    assert_eq!(sys(&k, nr::MUNMAP, &[addr, PAGE]), 0);
    assert!(writes(&log).is_empty(), "munmap wrote through");
    assert_eq!(sys(&k, nr::CLOSE, &[fd]), 0);
    assert_eq!(writes(&log), [(0, 10)]);
    assert_eq!(files.data.lock().unwrap()[0], b"Jello page");
}

#[test]
fn shared_mapping_outlives_the_descriptor() {
    let k = boot();
    let (files, _log) = mount_recorder(&k);
    start(&k, "/prog");
    let path = cstr(&k, SCRATCH, "/rec/m");
    let buf = SCRATCH + 0x100;
    poke(&k, buf, b"0123456789");
    let fd = sys(&k, nr::OPEN, &[path, 0o102, 0o644]) as u64;
    assert_eq!(sys(&k, nr::WRITE, &[fd, buf, 10]), 10);

    let rw = PROT_READ | PROT_WRITE;
    let addr = sys(&k, nr::MMAP, &[0, PAGE, rw, MAP_SHARED, fd, 0]) as u64;
    poke(&k, addr, b"a");
    assert_eq!(sys(&k, nr::CLOSE, &[fd]), 0);
    assert_eq!(files.data.lock().unwrap()[0], b"a123456789");

    // the page stays cached while mapped; later stores are not lost
    poke(&k, addr + 1, b"b");
    assert_eq!(sys(&k, nr::MUNMAP, &[addr, PAGE]), 0);
    assert_eq!(sys(&k, nr::SYNC, &[]), 0);
    assert_eq!(files.data.lock().unwrap()[0], b"ab23456789");
}

