// kernel/src/syscall/fs.rs
//
// File and directory system calls.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{Outcome, SyscallCtx};
use crate::error::{Errno, SysResult};
use crate::fs::devfs::DevFs;
use crate::fs::ramfs::RamNode;
use crate::fs::{FsError, OpenFile, OpenFlags, SeekFrom, Stat, PATH_MAX};
use crate::process::signal::SIGPIPE;
use crate::process::WaitChannel;

/// Largest transfer a single read/write moves.
const MAX_IO: usize = 1 << 20;

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

const F_DUPFD: u64 = 0;
const F_GETFD: u64 = 1;
const F_SETFD: u64 = 2;
const F_GETFL: u64 = 3;
const F_SETFL: u64 = 4;
const F_DUPFD_CLOEXEC: u64 = 1030;
const FD_CLOEXEC: u64 = 1;

/// Size of the Linux x86_64 `struct stat`.
pub const STAT_SIZE: usize = 144;

fn fd_index(fd: u64) -> Result<usize, Errno> {
    usize::try_from(fd).map_err(|_| Errno::EBADF)
}

pub(super) fn path_arg(cx: &mut SyscallCtx, ptr: u64) -> Result<String, Errno> {
    let path = cx.user()?.read_cstr(ptr, PATH_MAX)?;
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    Ok(path)
}

/// `struct stat` in the Linux x86_64 layout.
pub fn encode_stat(st: &Stat) -> [u8; STAT_SIZE] {
    let mut out = [0u8; STAT_SIZE];
    out[8..16].copy_from_slice(&st.ino.to_le_bytes());
    out[16..24].copy_from_slice(&(st.nlink as u64).to_le_bytes());
    out[24..28].copy_from_slice(&st.mode.to_le_bytes());
    out[28..32].copy_from_slice(&st.uid.to_le_bytes());
    out[32..36].copy_from_slice(&st.gid.to_le_bytes());
    out[48..56].copy_from_slice(&st.size.to_le_bytes());
    out[56..64].copy_from_slice(&4096u64.to_le_bytes());
    out[64..72].copy_from_slice(&st.blocks.to_le_bytes());
    out
}

fn wake_pipe(cx: &mut SyscallCtx, file: &OpenFile) {
    if file.is_pipe() {
        cx.sched.wake(WaitChannel::Pipe(file.inode().id()));
    }
}

// ============================================================================
// read / write
// ============================================================================

pub fn sys_read(cx: &mut SyscallCtx, fd: u64, buf: u64, count: u64) -> Result<Outcome, Errno> {
    let file = cx.file(fd)?;
    let mut kbuf = vec![0u8; (count as usize).min(MAX_IO)];
    // a bad buffer must fail before anything is consumed
    cx.user()?.prepare_write(buf, kbuf.len())?;
    match file.read(&mut kbuf) {
        Ok(n) => {
            cx.user()?.write(buf, &kbuf[..n])?;
            wake_pipe(cx, &file);
            Ok(Outcome::Return(n as i64))
        }
        Err(FsError::WouldBlock) if !file.nonblocking() => cx.block_on(WaitChannel::Pipe(file.inode().id())),
        Err(e) => Err(e.into()),
    }
}

pub fn sys_write(cx: &mut SyscallCtx, fd: u64, buf: u64, count: u64) -> Result<Outcome, Errno> {
    let file = cx.file(fd)?;
    let mut kbuf = vec![0u8; (count as usize).min(MAX_IO)];
    cx.user()?.read(buf, &mut kbuf)?;
    match file.write(&kbuf) {
        Ok(n) => {
            wake_pipe(cx, &file);
            Ok(Outcome::Return(n as i64))
        }
        Err(FsError::WouldBlock) if !file.nonblocking() => cx.block_on(WaitChannel::Pipe(file.inode().id())),
        Err(FsError::BrokenPipe) => {
            cx.proc()?.signals.post(SIGPIPE);
            Err(Errno::EPIPE)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn sys_pread(cx: &mut SyscallCtx, fd: u64, buf: u64, count: u64, pos: u64) -> SysResult {
    let file = cx.file(fd)?;
    let mut kbuf = vec![0u8; (count as usize).min(MAX_IO)];
    let n = file.pread(&mut kbuf, pos)?;
    cx.user()?.write(buf, &kbuf[..n])?;
    Ok(n as i64)
}

pub fn sys_pwrite(cx: &mut SyscallCtx, fd: u64, buf: u64, count: u64, pos: u64) -> SysResult {
    let file = cx.file(fd)?;
    let mut kbuf = vec![0u8; (count as usize).min(MAX_IO)];
    cx.user()?.read(buf, &mut kbuf)?;
    Ok(file.pwrite(&kbuf, pos)? as i64)
}

pub fn sys_lseek(cx: &mut SyscallCtx, fd: u64, off: i64, whence: u64) -> SysResult {
    let file = cx.file(fd)?;
    let to = match whence {
        SEEK_SET => SeekFrom::Start(u64::try_from(off).map_err(|_| Errno::EINVAL)?),
        SEEK_CUR => SeekFrom::Current(off),
        SEEK_END => SeekFrom::End(off),
        _ => return Err(Errno::EINVAL),
    };
    Ok(file.seek(to)? as i64)
}

pub fn sys_ioctl(cx: &mut SyscallCtx, fd: u64, cmd: u64, arg: u64) -> SysResult {
    Ok(cx.file(fd)?.ioctl(cmd, arg)?)
}

// ============================================================================
// Descriptors
// ============================================================================

pub fn sys_open(cx: &mut SyscallCtx, path: u64, flags: u64, mode: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    let cwd = cx.cwd()?;
    let file = cx.kernel.vfs().open(&cwd, &path, flags, mode as u32 & 0o7777)?;
    let fd = cx.proc()?.files.alloc(file, flags.contains(OpenFlags::CLOEXEC))?;
    crate::serial_trace!("open: {} -> fd {}", path, fd);
    Ok(fd as i64)
}

pub fn sys_close(cx: &mut SyscallCtx, fd: u64) -> SysResult {
    let file = cx.proc()?.files.close(fd_index(fd)?)?;
    let pipe = file.is_pipe().then(|| file.inode().id());
    drop(file);
    if let Some(id) = pipe {
        cx.sched.wake(WaitChannel::Pipe(id));
    }
    Ok(0)
}

pub fn sys_dup(cx: &mut SyscallCtx, fd: u64) -> SysResult {
    Ok(cx.proc()?.files.dup(fd_index(fd)?)? as i64)
}

pub fn sys_dup2(cx: &mut SyscallCtx, old: u64, new: u64) -> SysResult {
    Ok(cx.proc()?.files.dup2(fd_index(old)?, fd_index(new)?)? as i64)
}

pub fn sys_fcntl(cx: &mut SyscallCtx, fd: u64, cmd: u64, arg: u64) -> SysResult {
    let fd = fd_index(fd)?;
    let files = &mut cx.proc()?.files;
    let file = files.get(fd)?;
    match cmd {
        F_DUPFD | F_DUPFD_CLOEXEC => {
            let min = usize::try_from(arg).map_err(|_| Errno::EINVAL)?;
            Ok(files.alloc_from(min, file, cmd == F_DUPFD_CLOEXEC)? as i64)
        }
        F_GETFD => Ok(if files.cloexec(fd)? { FD_CLOEXEC as i64 } else { 0 }),
        F_SETFD => {
            files.set_cloexec(fd, arg & FD_CLOEXEC != 0)?;
            Ok(0)
        }
        F_GETFL => Ok(file.flags().bits() as i64),
        F_SETFL => {
            file.set_status_flags(OpenFlags::from_bits_truncate(arg as u32));
            Ok(0)
        }
        _ => Err(Errno::EINVAL),
    }
}

pub fn sys_pipe(cx: &mut SyscallCtx, fds: u64, flags: u64) -> SysResult {
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    if !(flags - (OpenFlags::NONBLOCK | OpenFlags::CLOEXEC)).is_empty() {
        return Err(Errno::EINVAL);
    }
    let (rd, wr) = cx.kernel.vfs().pipe(flags)?;
    let cloexec = flags.contains(OpenFlags::CLOEXEC);
    let files = &mut cx.proc()?.files;
    let r = files.alloc(rd, cloexec)?;
    let w = match files.alloc(wr, cloexec) {
        Ok(w) => w,
        Err(e) => {
            let _ = files.close(r);
            return Err(e.into());
        }
    };
    let mut pair = [0u8; 8];
    pair[..4].copy_from_slice(&(r as i32).to_le_bytes());
    pair[4..].copy_from_slice(&(w as i32).to_le_bytes());
    let written = cx.user().and_then(|mut u| u.write(fds, &pair));
    if let Err(e) = written {
        let files = &mut cx.proc()?.files;
        let _ = files.close(r);
        let _ = files.close(w);
        return Err(e);
    }
    Ok(0)
}

pub fn sys_fsync(cx: &mut SyscallCtx, fd: u64) -> SysResult {
    cx.file(fd)?.sync()?;
    Ok(0)
}

// ============================================================================
// Metadata
// ============================================================================

pub fn sys_stat(cx: &mut SyscallCtx, path: u64, buf: u64, follow: bool) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    let st = cx.kernel.vfs().stat(&cwd, &path, follow)?;
    cx.user()?.write(buf, &encode_stat(&st))?;
    Ok(0)
}

pub fn sys_fstat(cx: &mut SyscallCtx, fd: u64, buf: u64) -> SysResult {
    let st = cx.file(fd)?.stat();
    cx.user()?.write(buf, &encode_stat(&st))?;
    Ok(0)
}

pub fn sys_truncate(cx: &mut SyscallCtx, path: u64, len: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    cx.kernel.vfs().truncate(&cwd, &path, len)?;
    Ok(0)
}

pub fn sys_ftruncate(cx: &mut SyscallCtx, fd: u64, len: u64) -> SysResult {
    let file = cx.file(fd)?;
    if !file.flags().writable() {
        return Err(Errno::EINVAL);
    }
    cx.kernel.vfs().truncate_inode(file.inode(), len)?;
    Ok(0)
}

// ============================================================================
// Namespace
// ============================================================================

pub fn sys_getcwd(cx: &mut SyscallCtx, buf: u64, size: u64) -> SysResult {
    let mut cwd = cx.cwd()?.into_bytes();
    cwd.push(0);
    if (size as usize) < cwd.len() {
        return Err(Errno::ERANGE);
    }
    cx.user()?.write(buf, &cwd)?;
    Ok(cwd.len() as i64)
}

pub fn sys_chdir(cx: &mut SyscallCtx, path: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    let new = cx.kernel.vfs().chdir(&cwd, &path)?;
    cx.proc()?.cwd = new;
    Ok(0)
}

pub fn sys_mkdir(cx: &mut SyscallCtx, path: u64, mode: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    cx.kernel.vfs().mkdir(&cwd, &path, mode as u32 & 0o7777)?;
    Ok(0)
}

pub fn sys_rmdir(cx: &mut SyscallCtx, path: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    cx.kernel.vfs().rmdir(&cwd, &path)?;
    Ok(0)
}

pub fn sys_unlink(cx: &mut SyscallCtx, path: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    cx.kernel.vfs().unlink(&cwd, &path)?;
    Ok(0)
}

pub fn sys_symlink(cx: &mut SyscallCtx, target: u64, linkpath: u64) -> SysResult {
    let target = path_arg(cx, target)?;
    let linkpath = path_arg(cx, linkpath)?;
    let cwd = cx.cwd()?;
    cx.kernel.vfs().symlink(&cwd, &target, &linkpath)?;
    Ok(0)
}

pub fn sys_readlink(cx: &mut SyscallCtx, path: u64, buf: u64, size: u64) -> SysResult {
    let path = path_arg(cx, path)?;
    let cwd = cx.cwd()?;
    let target = cx.kernel.vfs().readlink(&cwd, &path)?;
    let n = target.len().min(size as usize);
    cx.user()?.write(buf, &target.as_bytes()[..n])?;
    Ok(n as i64)
}

pub fn sys_sync(cx: &mut SyscallCtx) -> SysResult {
    cx.kernel.vfs().sync()?;
    Ok(0)
}

/// mount(source, target, fstype, ...): only the in-kernel filesystems.
pub fn sys_mount(cx: &mut SyscallCtx, target: u64, fstype: u64) -> SysResult {
    if !cx.proc()?.creds.is_root() {
        return Err(Errno::EPERM);
    }
    let target = path_arg(cx, target)?;
    let fstype = cx.user()?.read_cstr(fstype, 32)?;
    let root = match fstype.as_str() {
        "ramfs" | "tmpfs" => RamNode::new_root(),
        "devfs" => DevFs::new().root(),
        _ => return Err(Errno::EINVAL),
    };
    let cwd = cx.cwd()?;
    let abs = cx.kernel.vfs().absolute(&cwd, &target)?;
    cx.kernel.vfs().mount(&abs, root)?;
    crate::serial_println!("mount: {} on {}", fstype, abs);
    Ok(0)
}

/// Fill `dirp` with `linux_dirent64` records; an entry that does not fit
/// stays for the next call.
pub fn sys_getdents64(cx: &mut SyscallCtx, fd: u64, dirp: u64, count: u64) -> SysResult {
    let file = cx.file(fd)?;
    let mut out: Vec<u8> = Vec::new();
    while let Some(entry) = file.peek_dirent()? {
        let reclen = (19 + entry.name.len() + 1 + 7) & !7;
        if out.len() + reclen > count as usize {
            if out.is_empty() {
                return Err(Errno::EINVAL);
            }
            break;
        }
        let start = out.len();
        out.resize(start + reclen, 0);
        let rec = &mut out[start..];
        rec[0..8].copy_from_slice(&entry.ino.to_le_bytes());
        rec[8..16].copy_from_slice(&((start + reclen) as i64).to_le_bytes());
        rec[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
        rec[18] = entry.kind.dirent_type();
        rec[19..19 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        file.skip_dirent();
    }
    cx.user()?.write(dirp, &out)?;
    Ok(out.len() as i64)
}
