// kernel/src/syscall/mm.rs
//
// Memory-mapping system calls.

use super::SyscallCtx;
use crate::error::{Errno, SysResult};
use crate::fs::InodeKind;
use crate::memory::{is_page_aligned, AddressSpace, VmaBacking, VmaFlags};

pub const PROT_READ: u64 = 0x1;
pub const PROT_WRITE: u64 = 0x2;
pub const PROT_EXEC: u64 = 0x4;

pub const MAP_SHARED: u64 = 0x01;
pub const MAP_PRIVATE: u64 = 0x02;
pub const MAP_FIXED: u64 = 0x10;
pub const MAP_ANONYMOUS: u64 = 0x20;

fn prot_flags(prot: u64) -> Result<VmaFlags, Errno> {
    if prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
        return Err(Errno::EINVAL);
    }
    let mut flags = VmaFlags::empty();
    flags.set(VmaFlags::READ, prot & PROT_READ != 0);
    flags.set(VmaFlags::WRITE, prot & PROT_WRITE != 0);
    flags.set(VmaFlags::EXEC, prot & PROT_EXEC != 0);
    Ok(flags)
}

fn mm<'a>(cx: &'a mut SyscallCtx) -> Result<&'a mut AddressSpace, Errno> {
    cx.proc()?.mm.as_mut().ok_or(Errno::EFAULT)
}

pub fn sys_mmap(cx: &mut SyscallCtx, addr: u64, len: u64, prot: u64, flags: u64, fd: u64, offset: u64) -> SysResult {
    if len == 0 || !is_page_aligned(offset) {
        return Err(Errno::EINVAL);
    }
    let mut vflags = prot_flags(prot)?;
    let shared = match flags & (MAP_SHARED | MAP_PRIVATE) {
        MAP_SHARED => true,
        MAP_PRIVATE => false,
        _ => return Err(Errno::EINVAL),
    };
    vflags.set(VmaFlags::SHARED, shared);

    let backing = if flags & MAP_ANONYMOUS != 0 {
        VmaBacking::Anonymous
    } else {
        let file = cx.file(fd)?;
        let mode = file.flags();
        if !mode.readable() || (shared && vflags.contains(VmaFlags::WRITE) && !mode.writable()) {
            return Err(Errno::EACCES);
        }
        let inode = file.inode().clone();
        match inode.kind() {
            InodeKind::File => VmaBacking::File { inode, offset },
            InodeKind::CharDevice | InodeKind::BlockDevice => {
                let phys = inode.ops().mmap_phys(&inode, offset).map_err(|_| Errno::ENODEV)?;
                VmaBacking::Device { phys }
            }
            _ => return Err(Errno::ENODEV),
        }
    };

    let start = mm(cx)?.mmap(addr, len, vflags, backing, flags & MAP_FIXED != 0)?;
    crate::serial_trace!("mmap: {:#x}+{:#x} {:?}", start, len, vflags);
    Ok(start as i64)
}

pub fn sys_munmap(cx: &mut SyscallCtx, addr: u64, len: u64) -> SysResult {
    mm(cx)?.unmap(addr, len)?;
    Ok(0)
}

pub fn sys_mprotect(cx: &mut SyscallCtx, addr: u64, len: u64, prot: u64) -> SysResult {
    let flags = prot_flags(prot)?;
    mm(cx)?.protect(addr, len, flags)?;
    Ok(0)
}

pub fn sys_brk(cx: &mut SyscallCtx, addr: u64) -> SysResult {
    Ok(mm(cx)?.brk(addr) as i64)
}
