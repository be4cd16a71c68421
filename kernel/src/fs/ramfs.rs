// kernel/src/fs/ramfs.rs
//
// In-memory filesystem.  Every inode carries its own `RamNode` as its
// driver, so a directory owns its children and a file's bytes live exactly
// as long as something (a directory entry, an open file, a cached page)
// still refers to the inode.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::inode::{Inode, InodeKind, InodeOps};
use super::{DirEntry, FsError, FsResult, NAME_MAX};
use crate::sync::IrqLock;

enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, Arc<Inode>>),
    Symlink(String),
}

pub struct RamNode {
    content: IrqLock<Content>,
}

impl RamNode {
    fn inode(kind: InodeKind, perm: u32, content: Content) -> Arc<Inode> {
        let ops = Arc::new(RamNode { content: IrqLock::new(content) });
        Arc::new(Inode::new(kind, perm, ops, 0))
    }

    /// A fresh, empty ramfs; returns its root directory.
    pub fn new_root() -> Arc<Inode> {
        Self::inode(InodeKind::Directory, 0o755, Content::Dir(BTreeMap::new()))
    }

    fn add_child(&self, name: &str, node: Arc<Inode>) -> FsResult<Arc<Inode>> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        match &mut *self.content.lock() {
            Content::Dir(children) => {
                if children.contains_key(name) {
                    return Err(FsError::Exists);
                }
                children.insert(name.to_string(), node.clone());
                Ok(node)
            }
            _ => Err(FsError::NotDirectory),
        }
    }
}

impl InodeOps for RamNode {
    fn read(&self, _node: &Inode, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        match &*self.content.lock() {
            Content::File(data) => {
                let off = offset as usize;
                if off >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - off);
                buf[..n].copy_from_slice(&data[off..off + n]);
                Ok(n)
            }
            Content::Dir(_) => Err(FsError::IsDirectory),
            Content::Symlink(_) => Err(FsError::InvalidArgument),
        }
    }

    fn write(&self, node: &Inode, offset: u64, buf: &[u8]) -> FsResult<usize> {
        match &mut *self.content.lock() {
            Content::File(data) => {
                let off = offset as usize;
                let end = off.checked_add(buf.len()).ok_or(FsError::InvalidArgument)?;
                if data.len() < end {
                    data.try_reserve(end - data.len()).map_err(|_| FsError::NoSpace)?;
                    data.resize(end, 0);
                }
                data[off..end].copy_from_slice(buf);
                node.extend_to(end as u64);
                Ok(buf.len())
            }
            Content::Dir(_) => Err(FsError::IsDirectory),
            Content::Symlink(_) => Err(FsError::InvalidArgument),
        }
    }

    fn lookup(&self, _dir: &Inode, name: &str) -> FsResult<Arc<Inode>> {
        match &*self.content.lock() {
            Content::Dir(children) => children.get(name).cloned().ok_or(FsError::NotFound),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn create(&self, _dir: &Inode, name: &str, kind: InodeKind, perm: u32) -> FsResult<Arc<Inode>> {
        let content = match kind {
            InodeKind::File => Content::File(Vec::new()),
            InodeKind::Directory => Content::Dir(BTreeMap::new()),
            _ => return Err(FsError::NotSupported),
        };
        self.add_child(name, RamNode::inode(kind, perm, content))
    }

    fn symlink(&self, _dir: &Inode, name: &str, target: &str) -> FsResult<Arc<Inode>> {
        let node = RamNode::inode(InodeKind::Symlink, 0o777, Content::Symlink(target.to_string()));
        node.set_size(target.len() as u64);
        self.add_child(name, node)
    }

    fn unlink(&self, _dir: &Inode, name: &str) -> FsResult<()> {
        match &mut *self.content.lock() {
            Content::Dir(children) => {
                let node = children.remove(name).ok_or(FsError::NotFound)?;
                node.update_meta(|m| m.nlink = m.nlink.saturating_sub(1));
                Ok(())
            }
            _ => Err(FsError::NotDirectory),
        }
    }

    fn readdir(&self, _dir: &Inode, index: usize) -> FsResult<Option<DirEntry>> {
        match &*self.content.lock() {
            Content::Dir(children) => Ok(children.iter().nth(index).map(|(name, node)| DirEntry {
                ino: node.id(),
                kind: node.kind(),
                name: name.clone(),
            })),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn truncate(&self, node: &Inode, size: u64) -> FsResult<()> {
        match &mut *self.content.lock() {
            Content::File(data) => {
                data.resize(size as usize, 0);
                node.set_size(size);
                Ok(())
            }
            Content::Dir(_) => Err(FsError::IsDirectory),
            Content::Symlink(_) => Err(FsError::InvalidArgument),
        }
    }

    fn readlink(&self, _node: &Inode) -> FsResult<String> {
        match &*self.content.lock() {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_unlink() {
        let root = RamNode::new_root();
        let f = root.ops().create(&root, "a", InodeKind::File, 0o644).unwrap();
        assert!(Arc::ptr_eq(&root.lookup("a").unwrap(), &f));
        assert_eq!(root.ops().create(&root, "a", InodeKind::File, 0o644).unwrap_err(), FsError::Exists);
        root.ops().unlink(&root, "a").unwrap();
        assert_eq!(root.lookup("a").unwrap_err(), FsError::NotFound);
        assert_eq!(f.meta().nlink, 0);
    }

    #[test]
    fn sparse_write_reads_back_zero_gap() {
        let root = RamNode::new_root();
        let f = root.ops().create(&root, "f", InodeKind::File, 0o644).unwrap();
        f.ops().write(&f, 4, b"xy").unwrap();
        assert_eq!(f.size(), 6);
        let mut b = [9u8; 8];
        assert_eq!(f.ops().read(&f, 0, &mut b).unwrap(), 6);
        assert_eq!(&b[..6], b"\0\0\0\0xy");
        f.ops().truncate(&f, 1).unwrap();
        assert_eq!(f.ops().read(&f, 0, &mut b).unwrap(), 1);
    }

    #[test]
    fn directory_listing_is_sorted() {
        let root = RamNode::new_root();
        for n in ["b", "a", "c"] {
            root.ops().create(&root, n, InodeKind::File, 0o644).unwrap();
        }
        root.ops().symlink(&root, "l", "/a").unwrap();
        let names: Vec<_> = (0..)
            .map_while(|i| root.ops().readdir(&root, i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a", "b", "c", "l"]);
        assert_eq!(root.lookup("l").unwrap().readlink().unwrap(), "/a");
    }
}
