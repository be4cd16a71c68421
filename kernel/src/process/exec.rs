// kernel/src/process/exec.rs
//
// execve in two phases.
//
// `Loader::prepare` builds the complete new image off to the side: a
// fresh address space with every PT_LOAD segment copied into zero-filled
// frames, the signal trampoline page, and a user stack holding argv, envp
// and the auxiliary vector.  Any failure there just drops the half-built
// space; the caller's process is untouched.
//
// `commit` cannot fail.  It swaps the address space in, switches the MMU
// root, destroys the old image and resets per-image process state.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::elf::{ElfError, ElfFile, PF_R, PF_W, PF_X, PHDR_SIZE};
use super::task::Task;
use super::{Credentials, Process};
use crate::arch::{current, TrapFrame};
use crate::config::KernelConfig;
use crate::fs::{FsError, OpenFile, OpenFlags, Vfs};
use crate::memory::fault::NoPager;
use crate::memory::layout::{SIGNAL_TRAMPOLINE, USER_MIN};
use crate::memory::user_copy::UserMemory;
use crate::memory::{checked_page_align_up, page_align_down, pages, AddressSpace, FramePool, MmError, Vma, VmaFlags, PAGE_SIZE};

/// Total bytes of argument and environment strings.
pub const ARG_MAX: usize = 128 * 1024;
/// Longest single argument string.
pub const ARG_STRLEN: usize = PAGE_SIZE as usize * 8;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    Fs(FsError),
    NotExecutable,
    BadElf,
    WrongArch,
    OutOfMemory,
    ArgsTooLong,
    Fault,
}

impl From<FsError> for ExecError {
    fn from(e: FsError) -> Self {
        ExecError::Fs(e)
    }
}

impl From<MmError> for ExecError {
    fn from(e: MmError) -> Self {
        match e {
            MmError::OutOfMemory => ExecError::OutOfMemory,
            _ => ExecError::BadElf,
        }
    }
}

impl From<ElfError> for ExecError {
    fn from(e: ElfError) -> Self {
        match e {
            ElfError::WrongMachine => ExecError::WrongArch,
            _ => ExecError::BadElf,
        }
    }
}

/// A fully built program image waiting to be committed.
pub struct ExecImage {
    pub mm: AddressSpace,
    pub entry: u64,
    pub sp: u64,
    pub name: String,
}

/// What `prepare` needs from the kernel.
pub struct Loader<'a> {
    pub vfs: &'a Vfs,
    pub pool: &'a Arc<FramePool>,
    pub cfg: &'a KernelConfig,
    pub kernel_root: Option<u64>,
}

impl Loader<'_> {
    pub fn prepare(
        &self,
        cwd: &str,
        path: &str,
        argv: &[String],
        envp: &[String],
        creds: Credentials,
    ) -> Result<ExecImage, ExecError> {
        let strings: usize = argv.iter().chain(envp).map(|s| s.len() + 1).sum();
        if strings > ARG_MAX {
            return Err(ExecError::ArgsTooLong);
        }

        let data = self.read_executable(cwd, path)?;
        let elf = ElfFile::parse(&data)?;

        let mut mm = AddressSpace::new_user(self.pool.clone(), self.kernel_root, self.cfg)?;
        for seg in elf.load_segments() {
            self.load_segment(&mut mm, &data, seg.vaddr, seg.offset, seg.filesz, seg.memsz, seg.flags)?;
        }
        mm.set_heap_start(elf.image_end());
        self.map_trampoline(&mut mm)?;

        let auxv = [
            (AT_PHDR, elf.phdr_address().unwrap_or(0)),
            (AT_PHENT, PHDR_SIZE as u64),
            (AT_PHNUM, elf.phdrs.len() as u64),
            (AT_PAGESZ, PAGE_SIZE),
            (AT_ENTRY, elf.entry),
            (AT_UID, creds.uid as u64),
            (AT_EUID, creds.euid as u64),
            (AT_GID, creds.gid as u64),
            (AT_EGID, creds.egid as u64),
        ];
        let sp = build_stack(&mut mm, argv, envp, &auxv)?;

        crate::serial_println!(
            "exec: {} entry={:#x} sp={:#x} segments={}",
            path,
            elf.entry,
            sp,
            elf.load_segments().count()
        );
        Ok(ExecImage { mm, entry: elf.entry, sp, name: String::from(path) })
    }

    fn read_executable(&self, cwd: &str, path: &str) -> Result<Vec<u8>, ExecError> {
        let inode = self.vfs.resolve(cwd, path, true)?;
        if inode.is_dir() || inode.meta().perm & 0o111 == 0 {
            return Err(ExecError::NotExecutable);
        }
        let file = OpenFile::open(inode.clone(), OpenFlags::RDONLY, self.vfs.cache().clone())?;
        let size = inode.size() as usize;
        let mut data = alloc::vec![0u8; size];
        let mut done = 0;
        while done < size {
            let n = file.pread(&mut data[done..], done as u64)?;
            if n == 0 {
                return Err(ExecError::BadElf);
            }
            done += n;
        }
        Ok(data)
    }

    /// Map `[vaddr, vaddr + memsz)` with fresh frames: zero everywhere, then
    /// the file bytes copied over the first `filesz`.
    #[allow(clippy::too_many_arguments)]
    fn load_segment(
        &self,
        mm: &mut AddressSpace,
        data: &[u8],
        vaddr: u64,
        offset: u64,
        filesz: u64,
        memsz: u64,
        pflags: u32,
    ) -> Result<(), ExecError> {
        if memsz == 0 {
            return Ok(());
        }
        let start = page_align_down(vaddr);
        let end = vaddr
            .checked_add(memsz)
            .and_then(checked_page_align_up)
            .ok_or(ExecError::BadElf)?;
        if start < USER_MIN {
            return Err(ExecError::BadElf);
        }
        let mut flags = VmaFlags::empty();
        flags.set(VmaFlags::READ, pflags & PF_R != 0);
        flags.set(VmaFlags::WRITE, pflags & PF_W != 0);
        flags.set(VmaFlags::EXEC, pflags & PF_X != 0);
        mm.insert_vma(Vma::anonymous(start, end, flags))?;

        let file_start = vaddr;
        let file_end = vaddr + filesz;
        for va in pages(start, end) {
            let frame = self.pool.alloc_zeroed().ok_or(ExecError::OutOfMemory)?;
            let lo = va.max(file_start);
            let hi = (va + PAGE_SIZE).min(file_end);
            if lo < hi {
                let src = (offset + (lo - vaddr)) as usize;
                self.pool.write(frame, (lo - va) as usize, &data[src..src + (hi - lo) as usize]);
            }
            if let Err(e) = mm.page_table_mut().map(va, frame, flags.pte_perms()) {
                self.pool.free_frame(frame);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn map_trampoline(&self, mm: &mut AddressSpace) -> Result<(), ExecError> {
        let flags = VmaFlags::READ | VmaFlags::EXEC;
        mm.insert_vma(Vma::anonymous(SIGNAL_TRAMPOLINE, SIGNAL_TRAMPOLINE + PAGE_SIZE, flags))?;
        let frame = self.pool.alloc_zeroed().ok_or(ExecError::OutOfMemory)?;
        self.pool.write(frame, 0, current::SIGRETURN_TRAMPOLINE);
        if let Err(e) = mm.page_table_mut().map(SIGNAL_TRAMPOLINE, frame, flags.pte_perms()) {
            self.pool.free_frame(frame);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Lay out the initial user stack and return the entry stack pointer:
///
/// ```text
///   stack_top  → argument and environment strings
///                (16-byte alignment padding)
///                auxv pairs, AT_NULL last
///                NULL, envp[..]
///                NULL, argv[..]
///   sp         → argc
/// ```
fn build_stack(mm: &mut AddressSpace, argv: &[String], envp: &[String], auxv: &[(u64, u64)]) -> Result<u64, ExecError> {
    let top = mm.stack_top();
    let mut user = UserMemory::new(mm, &NoPager);
    let mut sp = top;

    let mut env_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        env_ptrs.push(push_str(&mut user, &mut sp, s)?);
    }
    env_ptrs.reverse();
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        arg_ptrs.push(push_str(&mut user, &mut sp, s)?);
    }
    arg_ptrs.reverse();

    let mut words: Vec<u64> = Vec::with_capacity(3 + argv.len() + envp.len() + 2 * (auxv.len() + 1));
    words.push(argv.len() as u64);
    words.extend(&arg_ptrs);
    words.push(0);
    words.extend(&env_ptrs);
    words.push(0);
    for &(key, value) in auxv {
        words.extend([key, value]);
    }
    words.extend([AT_NULL, 0]);

    let mut sp = (sp & !0xf) - words.len() as u64 * 8;
    sp &= !0xf;
    for (i, w) in words.iter().enumerate() {
        user.write_u64(sp + i as u64 * 8, *w).map_err(|_| ExecError::Fault)?;
    }
    Ok(sp)
}

fn push_str(user: &mut UserMemory<'_>, sp: &mut u64, s: &str) -> Result<u64, ExecError> {
    if s.len() >= ARG_STRLEN {
        return Err(ExecError::ArgsTooLong);
    }
    *sp -= s.len() as u64 + 1;
    user.write(*sp, s.as_bytes()).map_err(|_| ExecError::Fault)?;
    user.write(*sp + s.len() as u64, &[0]).map_err(|_| ExecError::Fault)?;
    Ok(*sp)
}

/// Install a prepared image into `proc`.  Returns the descriptors closed
/// for close-on-exec so the caller can wake anyone waiting on them.
pub fn commit(proc: &mut Process, task: &mut Task, image: ExecImage) -> Vec<Arc<OpenFile>> {
    let old = proc.mm.replace(image.mm);
    if let Some(mm) = &proc.mm {
        mm.activate();
    }
    drop(old);
    let closed = proc.files.close_on_exec();
    proc.signals.reset_for_exec();
    proc.set_name(&image.name);
    task.trapframe = TrapFrame::new_user(image.entry, image.sp);
    closed
}
