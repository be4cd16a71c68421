// kernel/src/memory/user_copy.rs
//
// Kernel access to a process's memory on its behalf (syscall arguments,
// exec stack building, signal frames).  Every access walks the process's
// own page table; pages that are absent or COW are resolved through the
// ordinary fault path, and anything that still cannot be reached makes
// the access fail with EFAULT instead of trapping the kernel.

use alloc::string::String;
use alloc::vec::Vec;

use super::address_space::AddressSpace;
use super::fault::{handle_fault, Access, FilePager};
use super::frame::PhysFrame;
use super::layout::{USER_LIMIT, USER_MIN};
use super::{page_align_down, PAGE_SIZE};
use crate::error::Errno;

pub struct UserMemory<'a> {
    mm: &'a mut AddressSpace,
    pager: &'a dyn FilePager,
}

impl<'a> UserMemory<'a> {
    pub fn new(mm: &'a mut AddressSpace, pager: &'a dyn FilePager) -> Self {
        Self { mm, pager }
    }

    /// Frame backing the page containing `va`, usable for `access`.
    fn page(&mut self, va: u64, access: Access) -> Result<PhysFrame, Errno> {
        if !(USER_MIN..USER_LIMIT).contains(&va) {
            return Err(Errno::EFAULT);
        }
        let usable = |mm: &AddressSpace| {
            mm.page_table().lookup(va).filter(|pte| {
                pte.is_valid() && pte.is_user() && (access != Access::Write || pte.is_writable())
            })
        };
        if let Some(pte) = usable(&*self.mm) {
            return Ok(PhysFrame::containing_address(pte.addr()));
        }
        handle_fault(self.mm, self.pager, va, access).map_err(|_| Errno::EFAULT)?;
        usable(&*self.mm)
            .map(|pte| PhysFrame::containing_address(pte.addr()))
            .ok_or(Errno::EFAULT)
    }

    /// Walk `[addr, addr + len)` page by page.
    fn for_each_chunk(
        &mut self,
        addr: u64,
        len: usize,
        access: Access,
        mut f: impl FnMut(PhysFrame, usize, core::ops::Range<usize>),
    ) -> Result<(), Errno> {
        let end = addr.checked_add(len as u64).ok_or(Errno::EFAULT)?;
        if end > USER_LIMIT {
            return Err(Errno::EFAULT);
        }
        let mut va = addr;
        let mut done = 0usize;
        while va < end {
            let page_end = (page_align_down(va) + PAGE_SIZE).min(end);
            let chunk = (page_end - va) as usize;
            let frame = self.page(va, access)?;
            f(frame, (va & (PAGE_SIZE - 1)) as usize, done..done + chunk);
            done += chunk;
            va = page_end;
        }
        Ok(())
    }

    /// Make `[addr, addr + len)` writable without storing anything, so a
    /// later `write` of that range cannot fail.
    pub fn prepare_write(&mut self, addr: u64, len: usize) -> Result<(), Errno> {
        self.for_each_chunk(addr, len, Access::Write, |_, _, _| {})
    }

    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        let pool = self.mm.pool().clone();
        self.for_each_chunk(addr, buf.len(), Access::Read, |frame, off, range| {
            pool.read(frame, off, &mut buf[range]);
        })
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Errno> {
        let pool = self.mm.pool().clone();
        self.for_each_chunk(addr, data.len(), Access::Write, |frame, off, range| {
            pool.write(frame, off, &data[range]);
        })
    }

    pub fn read_u64(&mut self, addr: u64) -> Result<u64, Errno> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Errno> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u32(&mut self, addr: u64) -> Result<u32, Errno> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Errno> {
        self.write(addr, &value.to_le_bytes())
    }

    /// NUL-terminated string of at most `max` bytes (terminator excluded).
    pub fn read_cstr(&mut self, addr: u64, max: usize) -> Result<String, Errno> {
        let mut bytes = Vec::new();
        let mut va = addr;
        loop {
            let page_end = page_align_down(va) + PAGE_SIZE;
            let mut chunk = alloc::vec![0u8; (page_end - va) as usize];
            self.read(va, &mut chunk)?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                break;
            }
            bytes.extend_from_slice(&chunk);
            if bytes.len() > max {
                return Err(Errno::ENAMETOOLONG);
            }
            va = page_end;
        }
        if bytes.len() > max {
            return Err(Errno::ENAMETOOLONG);
        }
        String::from_utf8(bytes).map_err(|_| Errno::EINVAL)
    }

    /// NULL-terminated array of user pointers (argv / envp).
    pub fn read_ptr_array(&mut self, addr: u64, max: usize) -> Result<Vec<u64>, Errno> {
        let mut out = Vec::new();
        if addr == 0 {
            return Ok(out);
        }
        loop {
            let p = self.read_u64(addr + out.len() as u64 * 8)?;
            if p == 0 {
                return Ok(out);
            }
            if out.len() == max {
                return Err(Errno::E2BIG);
            }
            out.push(p);
        }
    }

    /// String array at `addr` (argv / envp style), strings up to `max_len`.
    pub fn read_str_array(&mut self, addr: u64, max_items: usize, max_len: usize) -> Result<Vec<String>, Errno> {
        let ptrs = self.read_ptr_array(addr, max_items)?;
        ptrs.into_iter().map(|p| self.read_cstr(p, max_len)).collect()
    }
}
