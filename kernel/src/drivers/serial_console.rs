// kernel/src/drivers/serial_console.rs
//
// Console device on top of the kernel's serial sink.  Write-only: there is
// no input path yet, so reads report EOF.

use alloc::sync::Arc;

use crate::fs::{FsError, FsResult, Inode, InodeOps};

/// `TCGETS`; answering it is enough for `isatty()`.
const TCGETS: u64 = 0x5401;

pub struct SerialConsole;

impl InodeOps for SerialConsole {
    fn read(&self, _node: &Inode, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Ok(0)
    }

    fn write(&self, _node: &Inode, _offset: u64, buf: &[u8]) -> FsResult<usize> {
        crate::serial::write_bytes(buf);
        Ok(buf.len())
    }

    fn ioctl(&self, _node: &Inode, cmd: u64, _arg: u64) -> FsResult<i64> {
        match cmd {
            TCGETS => Ok(0),
            _ => Err(FsError::NotTty),
        }
    }
}

pub fn ops() -> Arc<dyn InodeOps> {
    Arc::new(SerialConsole)
}
