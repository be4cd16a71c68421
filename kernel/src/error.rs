// kernel/src/error.rs
//
// Linux-compatible error numbers.  Subsystems keep their own small error
// enums; this is where they meet the system-call ABI, which returns
// `-errno` in the result register.

use crate::fs::FsError;
use crate::memory::fault::FaultError;
use crate::memory::MmError;
use crate::process::exec::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EMFILE = 24,
    ENOTTY = 25,
    ENOSPC = 28,
    ESPIPE = 29,
    EPIPE = 32,
    ERANGE = 34,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
}

impl Errno {
    /// Value placed in the result register.
    pub fn as_ret(self) -> i64 {
        -(self as i64)
    }
}

pub type SysResult = Result<i64, Errno>;

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound => Errno::ENOENT,
            FsError::NotDirectory => Errno::ENOTDIR,
            FsError::IsDirectory => Errno::EISDIR,
            FsError::Exists => Errno::EEXIST,
            FsError::BadFileDescriptor => Errno::EBADF,
            FsError::InvalidArgument => Errno::EINVAL,
            FsError::IoError => Errno::EIO,
            FsError::NotSupported => Errno::ENOSYS,
            FsError::NoSpace => Errno::ENOSPC,
            FsError::SymlinkLoop => Errno::ELOOP,
            FsError::PermissionDenied => Errno::EACCES,
            FsError::WouldBlock => Errno::EAGAIN,
            FsError::BrokenPipe => Errno::EPIPE,
            FsError::TooManyOpenFiles => Errno::EMFILE,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::NameTooLong => Errno::ENAMETOOLONG,
            FsError::NotSeekable => Errno::ESPIPE,
            FsError::NotTty => Errno::ENOTTY,
        }
    }
}

impl From<MmError> for Errno {
    fn from(e: MmError) -> Self {
        match e {
            MmError::OutOfMemory => Errno::ENOMEM,
            MmError::Overlap | MmError::AlreadyMapped => Errno::EEXIST,
            MmError::InvalidRange | MmError::NotMapped | MmError::NoVma => Errno::EINVAL,
        }
    }
}

impl From<FaultError> for Errno {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::OutOfMemory => Errno::ENOMEM,
            FaultError::Io => Errno::EIO,
            FaultError::NoVma | FaultError::StackOverflow | FaultError::Protection => Errno::EFAULT,
        }
    }
}

impl From<ExecError> for Errno {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Fs(fs) => fs.into(),
            ExecError::NotExecutable => Errno::EACCES,
            ExecError::BadElf | ExecError::WrongArch => Errno::ENOEXEC,
            ExecError::OutOfMemory => Errno::ENOMEM,
            ExecError::ArgsTooLong => Errno::E2BIG,
            ExecError::Fault => Errno::EFAULT,
        }
    }
}
