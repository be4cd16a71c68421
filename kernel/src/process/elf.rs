// kernel/src/process/elf.rs
//
// ELF64 executable parsing.  Only statically linked little-endian
// ET_EXEC images for the running architecture are accepted; loading the
// segments into an address space is exec's job.

use alloc::vec::Vec;

pub const PT_LOAD: u32 = 1;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

#[cfg(target_arch = "aarch64")]
pub const EM_HOST: u16 = EM_AARCH64;
#[cfg(not(target_arch = "aarch64"))]
pub const EM_HOST: u16 = EM_X86_64;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    Truncated,
    BadMagic,
    NotElf64,
    NotExecutable,
    WrongMachine,
    BadProgramHeader,
    BadSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    pub fn end(&self) -> u64 {
        self.vaddr + self.memsz
    }
}

#[derive(Debug, Clone)]
pub struct ElfFile {
    pub entry: u64,
    pub machine: u16,
    pub phoff: u64,
    pub phentsize: u16,
    pub phdrs: Vec<ProgramHeader>,
}

fn u16_at(data: &[u8], off: usize) -> Result<u16, ElfError> {
    let bytes = data.get(off..off + 2).ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn u32_at(data: &[u8], off: usize) -> Result<u32, ElfError> {
    let bytes = data.get(off..off + 4).ok_or(ElfError::Truncated)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf))
}

fn u64_at(data: &[u8], off: usize) -> Result<u64, ElfError> {
    let bytes = data.get(off..off + 8).ok_or(ElfError::Truncated)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

impl ElfFile {
    /// Validate the header and collect the program headers.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if &data[0..4] != b"\x7fELF" {
            return Err(ElfError::BadMagic);
        }
        // ELFCLASS64, little endian
        if data[4] != 2 || data[5] != 1 {
            return Err(ElfError::NotElf64);
        }
        if u16_at(data, 16)? != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        let machine = u16_at(data, 18)?;
        if machine != EM_HOST {
            return Err(ElfError::WrongMachine);
        }
        let entry = u64_at(data, 24)?;
        let phoff = u64_at(data, 32)?;
        let phentsize = u16_at(data, 54)?;
        let phnum = u16_at(data, 56)? as usize;
        if phnum == 0 || (phentsize as usize) < PHDR_SIZE {
            return Err(ElfError::BadProgramHeader);
        }

        let mut phdrs = Vec::with_capacity(phnum);
        for i in 0..phnum {
            let base = usize::try_from(phoff)
                .ok()
                .and_then(|off| off.checked_add(i * phentsize as usize))
                .ok_or(ElfError::BadProgramHeader)?;
            if base.checked_add(PHDR_SIZE).map_or(true, |end| end > data.len()) {
                return Err(ElfError::BadProgramHeader);
            }
            let ph = ProgramHeader {
                p_type: u32_at(data, base)?,
                flags: u32_at(data, base + 4)?,
                offset: u64_at(data, base + 8)?,
                vaddr: u64_at(data, base + 16)?,
                filesz: u64_at(data, base + 32)?,
                memsz: u64_at(data, base + 40)?,
            };
            if ph.p_type == PT_LOAD {
                let file_end = ph.offset.checked_add(ph.filesz).ok_or(ElfError::BadSegment)?;
                if ph.filesz > ph.memsz || file_end > data.len() as u64 || ph.vaddr.checked_add(ph.memsz).is_none() {
                    return Err(ElfError::BadSegment);
                }
            }
            phdrs.push(ph);
        }
        if !phdrs.iter().any(|p| p.p_type == PT_LOAD) {
            return Err(ElfError::BadSegment);
        }
        Ok(Self { entry, machine, phoff, phentsize, phdrs })
    }

    pub fn load_segments(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.phdrs.iter().filter(|p| p.p_type == PT_LOAD)
    }

    /// Highest address covered by a loadable segment.
    pub fn image_end(&self) -> u64 {
        self.load_segments().map(ProgramHeader::end).max().unwrap_or(0)
    }

    /// User address of the program header table (for AT_PHDR).
    pub fn phdr_address(&self) -> Option<u64> {
        if let Some(ph) = self.phdrs.iter().find(|p| p.p_type == PT_PHDR) {
            return Some(ph.vaddr);
        }
        self.load_segments()
            .find(|p| self.phoff >= p.offset && self.phoff < p.offset + p.filesz)
            .map(|p| p.vaddr + (self.phoff - p.offset))
    }
}

/// Builds minimal executables (tests, ramdisk tooling).
pub mod build {
    use super::*;

    /// One PT_LOAD segment.
    pub struct Segment<'a> {
        pub vaddr: u64,
        pub flags: u32,
        pub data: &'a [u8],
        pub memsz: u64,
    }

    /// An ET_EXEC image for the running architecture.  Segment data is laid
    /// out after the headers; the first segment's file offset is congruent
    /// to its address modulo the page size.
    pub fn executable(entry: u64, segments: &[Segment]) -> Vec<u8> {
        let phnum = segments.len();
        let headers = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut out = alloc::vec![0u8; headers];
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_HOST.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&entry.to_le_bytes());
        out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        for (i, seg) in segments.iter().enumerate() {
            let page_off = (seg.vaddr % 4096) as usize;
            while out.len() % 4096 != page_off {
                out.push(0);
            }
            let offset = out.len() as u64;
            out.extend_from_slice(seg.data);
            let ph = EHDR_SIZE + i * PHDR_SIZE;
            out[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&seg.flags.to_le_bytes());
            out[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[ph + 24..ph + 32].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&seg.memsz.max(seg.data.len() as u64).to_le_bytes());
            out[ph + 48..ph + 56].copy_from_slice(&4096u64.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::{executable, Segment};
    use super::*;

    fn image() -> Vec<u8> {
        executable(
            0x40_1000,
            &[
                Segment { vaddr: 0x40_1000, flags: PF_R | PF_X, data: &[0x90; 16], memsz: 16 },
                Segment { vaddr: 0x40_2010, flags: PF_R | PF_W, data: b"data", memsz: 0x2000 },
            ],
        )
    }

    #[test]
    fn parses_built_image() {
        let elf = ElfFile::parse(&image()).unwrap();
        assert_eq!(elf.entry, 0x40_1000);
        assert_eq!(elf.load_segments().count(), 2);
        assert_eq!(elf.image_end(), 0x40_4010);
        assert_eq!(elf.phdrs[1].filesz, 4);
        // headers sit in no segment of this image
        assert_eq!(elf.phdr_address(), None);
    }

    #[test]
    fn rejects_bad_headers() {
        let good = image();
        let mut bad = good.clone();
        bad[0] = 0;
        assert_eq!(ElfFile::parse(&bad).unwrap_err(), ElfError::BadMagic);
        let mut bad = good.clone();
        bad[16] = 3; // ET_DYN
        assert_eq!(ElfFile::parse(&bad).unwrap_err(), ElfError::NotExecutable);
        let mut bad = good.clone();
        bad[18..20].copy_from_slice(&(EM_HOST ^ 1).to_le_bytes());
        assert_eq!(ElfFile::parse(&bad).unwrap_err(), ElfError::WrongMachine);
        assert_eq!(ElfFile::parse(&good[..40]).unwrap_err(), ElfError::Truncated);
        let mut bad = good;
        // filesz past the end of the file
        let ph = EHDR_SIZE + PHDR_SIZE;
        bad[ph + 32..ph + 40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert_eq!(ElfFile::parse(&bad).unwrap_err(), ElfError::BadSegment);
    }
}
