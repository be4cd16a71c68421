// kernel/src/fs/devfs.rs
//
// /dev: a fixed directory of character devices from the driver table.

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::inode::{Inode, InodeKind, InodeOps};
use super::{DirEntry, FsError, FsResult};
use crate::drivers::DEVICES;

struct DevDir {
    entries: Vec<(&'static str, Arc<Inode>)>,
}

impl InodeOps for DevDir {
    fn read(&self, _node: &Inode, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Err(FsError::IsDirectory)
    }

    fn write(&self, _node: &Inode, _offset: u64, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::IsDirectory)
    }

    fn lookup(&self, _dir: &Inode, name: &str) -> FsResult<Arc<Inode>> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, node)| node.clone())
            .ok_or(FsError::NotFound)
    }

    fn create(&self, _dir: &Inode, _name: &str, _kind: InodeKind, _perm: u32) -> FsResult<Arc<Inode>> {
        Err(FsError::PermissionDenied)
    }

    fn readdir(&self, _dir: &Inode, index: usize) -> FsResult<Option<DirEntry>> {
        Ok(self.entries.get(index).map(|(name, node)| DirEntry {
            ino: node.id(),
            kind: node.kind(),
            name: name.to_string(),
        }))
    }
}

pub struct DevFs {
    root: Arc<Inode>,
}

impl DevFs {
    pub fn new() -> Self {
        let entries = DEVICES
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let node = Inode::new(InodeKind::CharDevice, d.perm, (d.ops)(), i as u64);
                (d.name, Arc::new(node))
            })
            .collect();
        let root = Inode::new(InodeKind::Directory, 0o755, Arc::new(DevDir { entries }), 0);
        Self { root: Arc::new(root) }
    }

    pub fn root(&self) -> Arc<Inode> {
        self.root.clone()
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_and_finds_devices() {
        let dev = DevFs::new();
        let root = dev.root();
        let names: Vec<_> = (0..)
            .map_while(|i| root.ops().readdir(&root, i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["null", "zero", "console"]);

        let zero = root.lookup("zero").unwrap();
        let mut buf = [0xffu8; 8];
        assert_eq!(zero.ops().read(&zero, 0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0; 8]);
        assert_eq!(root.lookup("tty").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn console_answers_tcgets() {
        let root = DevFs::new().root();
        let con = root.lookup("console").unwrap();
        assert_eq!(con.ops().ioctl(&con, 0x5401, 0), Ok(0));
        let null = root.lookup("null").unwrap();
        assert_eq!(null.ops().ioctl(&null, 0x5401, 0), Err(FsError::NotTty));
    }
}
