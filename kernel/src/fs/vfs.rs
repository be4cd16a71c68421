// kernel/src/fs/vfs.rs
//
// Path resolution and namespace operations.
//
// Paths are made absolute against the caller's cwd and normalized
// lexically ("." dropped, ".." pops a component) before the walk starts.
// The walk crosses mount points (a directory with a filesystem mounted on
// it resolves to that filesystem's root) and follows symbolic links, at
// most `SYMLINK_DEPTH` per resolution.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::file::OpenFile;
use super::inode::{Inode, InodeKind};
use super::page_cache::PageCache;
use super::pipe::Pipe;
use super::{FsError, FsResult, OpenFlags, Stat, NAME_MAX, PATH_MAX, SYMLINK_DEPTH};
use crate::config::{KernelConfig, PipePolicy};
use crate::memory::fault::{FaultError, FilePager};
use crate::memory::{FramePool, PhysFrame};
use crate::sync::IrqLock;

/// Components of `path` joined onto `cwd`, with "." and ".." applied.
fn normalize(cwd: &str, path: &str) -> FsResult<Vec<String>> {
    if path.is_empty() {
        return Err(FsError::NotFound);
    }
    if path.len() > PATH_MAX {
        return Err(FsError::NameTooLong);
    }
    let mut out: Vec<String> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for comp in base.split('/').chain(path.split('/')) {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            c if c.len() > NAME_MAX => return Err(FsError::NameTooLong),
            c => out.push(c.to_string()),
        }
    }
    Ok(out)
}

fn join(comps: &[String]) -> String {
    let mut s = String::from("/");
    s.push_str(&comps.join("/"));
    s
}

/// Follow mount points stacked on `node`.
fn cross_mounts(mut node: Arc<Inode>) -> Arc<Inode> {
    while let Some(root) = node.mounted() {
        node = root;
    }
    node
}

pub struct Vfs {
    root: Arc<Inode>,
    cache: Arc<IrqLock<PageCache>>,
    pipe_policy: PipePolicy,
    pipe_buffer: usize,
}

impl Vfs {
    pub fn new(root: Arc<Inode>, pool: Arc<FramePool>, cfg: &KernelConfig) -> Self {
        Self {
            root,
            cache: Arc::new(IrqLock::new(PageCache::new(pool, cfg.cache_pages, cfg.cache_buckets))),
            pipe_policy: cfg.pipe_policy,
            pipe_buffer: cfg.pipe_buffer,
        }
    }

    pub fn root(&self) -> Arc<Inode> {
        cross_mounts(self.root.clone())
    }

    pub fn cache(&self) -> &Arc<IrqLock<PageCache>> {
        &self.cache
    }

    pub fn pipe_policy(&self) -> PipePolicy {
        self.pipe_policy
    }

    /// Normalized absolute form of `path`.
    pub fn absolute(&self, cwd: &str, path: &str) -> FsResult<String> {
        Ok(join(&normalize(cwd, path)?))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn walk(&self, mut comps: Vec<String>, follow_last: bool) -> FsResult<Arc<Inode>> {
        let mut links = 0;
        'restart: loop {
            let mut node = self.root();
            for i in 0..comps.len() {
                if !node.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                let next = cross_mounts(node.lookup(&comps[i])?);
                let last = i + 1 == comps.len();
                if next.kind() == InodeKind::Symlink && (!last || follow_last) {
                    links += 1;
                    if links > SYMLINK_DEPTH {
                        return Err(FsError::SymlinkLoop);
                    }
                    let target = next.readlink()?;
                    let dir = join(&comps[..i]);
                    let rest = comps[i + 1..].join("/");
                    comps = normalize(&dir, &format!("{}/{}", target, rest))?;
                    continue 'restart;
                }
                node = next;
            }
            return Ok(node);
        }
    }

    pub fn resolve(&self, cwd: &str, path: &str, follow: bool) -> FsResult<Arc<Inode>> {
        self.walk(normalize(cwd, path)?, follow)
    }

    /// Directory that would hold `path`'s last component, and that name.
    pub fn resolve_parent(&self, cwd: &str, path: &str) -> FsResult<(Arc<Inode>, String)> {
        let mut comps = normalize(cwd, path)?;
        let name = comps.pop().ok_or(FsError::Exists)?;
        let dir = self.walk(comps, true)?;
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok((dir, name))
    }

    // ========================================================================
    // Namespace operations
    // ========================================================================

    pub fn open(&self, cwd: &str, path: &str, flags: OpenFlags, perm: u32) -> FsResult<Arc<OpenFile>> {
        let follow = !flags.contains(OpenFlags::NOFOLLOW);
        let node = if flags.contains(OpenFlags::CREAT) {
            let (dir, name) = self.resolve_parent(cwd, path)?;
            match dir.lookup(&name) {
                Ok(_) if flags.contains(OpenFlags::EXCL) => return Err(FsError::Exists),
                Ok(_) => self.resolve(cwd, path, follow)?,
                Err(FsError::NotFound) => dir.ops().create(&dir, &name, InodeKind::File, perm & 0o7777)?,
                Err(e) => return Err(e),
            }
        } else {
            self.resolve(cwd, path, follow)?
        };

        if node.kind() == InodeKind::Symlink {
            return Err(FsError::SymlinkLoop);
        }
        if flags.contains(OpenFlags::DIRECTORY) && !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if node.is_dir() && flags.writable() {
            return Err(FsError::IsDirectory);
        }
        if flags.contains(OpenFlags::TRUNC) && flags.writable() && node.kind() == InodeKind::File {
            self.truncate_inode(&node, 0)?;
        }
        OpenFile::open(node, flags, self.cache.clone())
    }

    pub fn mkdir(&self, cwd: &str, path: &str, perm: u32) -> FsResult<Arc<Inode>> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        if dir.lookup(&name).is_ok() {
            return Err(FsError::Exists);
        }
        dir.ops().create(&dir, &name, InodeKind::Directory, perm & 0o7777)
    }

    pub fn unlink(&self, cwd: &str, path: &str) -> FsResult<()> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        let node = dir.lookup(&name)?;
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        dir.ops().unlink(&dir, &name)
    }

    pub fn rmdir(&self, cwd: &str, path: &str) -> FsResult<()> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let node = dir.lookup(&name)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if node.mounted().is_some() {
            return Err(FsError::PermissionDenied);
        }
        if node.ops().readdir(&node, 0)?.is_some() {
            return Err(FsError::NotEmpty);
        }
        dir.ops().unlink(&dir, &name)
    }

    pub fn symlink(&self, cwd: &str, target: &str, linkpath: &str) -> FsResult<()> {
        if target.is_empty() {
            return Err(FsError::NotFound);
        }
        let (dir, name) = self.resolve_parent(cwd, linkpath)?;
        if dir.lookup(&name).is_ok() {
            return Err(FsError::Exists);
        }
        dir.ops().symlink(&dir, &name, target).map(|_| ())
    }

    pub fn readlink(&self, cwd: &str, path: &str) -> FsResult<String> {
        let node = self.resolve(cwd, path, false)?;
        if node.kind() != InodeKind::Symlink {
            return Err(FsError::InvalidArgument);
        }
        node.readlink()
    }

    pub fn stat(&self, cwd: &str, path: &str, follow: bool) -> FsResult<Stat> {
        Ok(self.resolve(cwd, path, follow)?.stat())
    }

    /// Cut a regular file to `size`; cached pages past it go away.
    pub fn truncate_inode(&self, node: &Arc<Inode>, size: u64) -> FsResult<()> {
        match node.kind() {
            InodeKind::File => {}
            InodeKind::Directory => return Err(FsError::IsDirectory),
            _ => return Err(FsError::InvalidArgument),
        }
        self.cache.lock().truncate_inode(node, size);
        node.ops().truncate(node, size)?;
        node.set_size(size);
        Ok(())
    }

    pub fn truncate(&self, cwd: &str, path: &str, size: u64) -> FsResult<()> {
        let node = self.resolve(cwd, path, true)?;
        self.truncate_inode(&node, size)
    }

    /// Validated absolute directory for `chdir`.
    pub fn chdir(&self, cwd: &str, path: &str) -> FsResult<String> {
        let node = self.resolve(cwd, path, true)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        self.absolute(cwd, path)
    }

    /// Mount the filesystem rooted at `fs_root` on the directory `path`.
    pub fn mount(&self, path: &str, fs_root: Arc<Inode>) -> FsResult<()> {
        let node = self.resolve("/", path, true)?;
        if !node.is_dir() || !fs_root.is_dir() {
            return Err(FsError::NotDirectory);
        }
        node.set_mount(Some(fs_root));
        crate::serial_println!("vfs: mounted fs on {}", path);
        Ok(())
    }

    /// Write back every dirty cached page.
    pub fn sync(&self) -> FsResult<()> {
        self.cache.lock().sync_all()
    }

    /// A new pipe as (read end, write end).
    pub fn pipe(&self, flags: OpenFlags) -> FsResult<(Arc<OpenFile>, Arc<OpenFile>)> {
        let node = Pipe::new_inode(self.pipe_buffer, self.pipe_policy);
        let extra = flags & OpenFlags::NONBLOCK;
        let rd = OpenFile::open(node.clone(), OpenFlags::RDONLY | extra, self.cache.clone())?;
        let wr = OpenFile::open(node, OpenFlags::WRONLY | extra, self.cache.clone())?;
        Ok((rd, wr))
    }

    /// Create (or replace) a regular file with `data`; boot-time helper.
    pub fn write_file(&self, path: &str, data: &[u8], perm: u32) -> FsResult<()> {
        let f = self.open("/", path, OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC, perm)?;
        let mut done = 0;
        while done < data.len() {
            match f.write(&data[done..])? {
                0 => return Err(FsError::NoSpace),
                n => done += n,
            }
        }
        Ok(())
    }
}

impl FilePager for Vfs {
    fn file_page(&self, inode: &Arc<Inode>, offset: u64) -> Result<PhysFrame, FaultError> {
        self.cache
            .lock()
            .map_page(inode, offset)
            .map_err(|_| FaultError::Io)?
            .ok_or(FaultError::OutOfMemory)
    }

    fn mark_dirty(&self, inode: &Arc<Inode>, offset: u64) {
        if !self.cache.lock().mark_mapped_dirty(inode, offset) {
            crate::serial_println!("cache: mapped page of ino {} +{:#x} not cached", inode.id(), offset);
        }
    }
}
