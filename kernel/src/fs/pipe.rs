// kernel/src/fs/pipe.rs
//
// Anonymous pipes: a bounded byte ring shared by a read end and a write
// end.  Each open file description counts as one reader or writer; the
// counts go down through the driver `close` hook.
//
// Empty pipe with writers, or full pipe with readers: under
// `PipePolicy::Block` the call fails with `WouldBlock` and the syscall
// layer parks the caller on the pipe's wait channel; under
// `PipePolicy::ReturnZero` it returns 0 right away.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::inode::{Inode, InodeKind, InodeOps};
use super::{FsError, FsResult, OpenFlags};
use crate::config::PipePolicy;
use crate::sync::IrqLock;

struct PipeState {
    buf: VecDeque<u8>,
    readers: usize,
    writers: usize,
}

pub struct Pipe {
    state: IrqLock<PipeState>,
    capacity: usize,
    policy: PipePolicy,
}

impl Pipe {
    pub fn new(capacity: usize, policy: PipePolicy) -> Self {
        Self {
            state: IrqLock::new(PipeState {
                buf: VecDeque::with_capacity(capacity),
                readers: 0,
                writers: 0,
            }),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// A fresh pipe inode; open it once per end.
    pub fn new_inode(capacity: usize, policy: PipePolicy) -> Arc<Inode> {
        Arc::new(Inode::new_temporary(InodeKind::Pipe, Arc::new(Self::new(capacity, policy))))
    }

    fn stalled(&self) -> FsResult<usize> {
        match self.policy {
            PipePolicy::ReturnZero => Ok(0),
            PipePolicy::Block => Err(FsError::WouldBlock),
        }
    }
}

impl InodeOps for Pipe {
    fn open(&self, _node: &Inode, flags: OpenFlags) -> FsResult<()> {
        let mut s = self.state.lock();
        if flags.readable() {
            s.readers += 1;
        }
        if flags.writable() {
            s.writers += 1;
        }
        Ok(())
    }

    fn close(&self, node: &Inode, flags: OpenFlags) {
        let mut s = self.state.lock();
        if flags.readable() {
            s.readers = s.readers.saturating_sub(1);
        }
        if flags.writable() {
            s.writers = s.writers.saturating_sub(1);
        }
        crate::serial_trace!("pipe {}: {} readers, {} writers", node.id(), s.readers, s.writers);
    }

    fn read(&self, node: &Inode, _offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut s = self.state.lock();
        if s.buf.is_empty() {
            return if s.writers == 0 { Ok(0) } else { self.stalled() };
        }
        let n = buf.len().min(s.buf.len());
        for (dst, src) in buf.iter_mut().zip(s.buf.drain(..n)) {
            *dst = src;
        }
        node.set_size(s.buf.len() as u64);
        Ok(n)
    }

    fn write(&self, node: &Inode, _offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut s = self.state.lock();
        if s.readers == 0 {
            return Err(FsError::BrokenPipe);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let room = self.capacity - s.buf.len();
        if room == 0 {
            return self.stalled();
        }
        let n = data.len().min(room);
        s.buf.extend(&data[..n]);
        node.set_size(s.buf.len() as u64);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ends(policy: PipePolicy, cap: usize) -> Arc<Inode> {
        let node = Pipe::new_inode(cap, policy);
        node.ops().open(&node, OpenFlags::RDONLY).unwrap();
        node.ops().open(&node, OpenFlags::WRONLY).unwrap();
        node
    }

    #[test]
    fn bytes_come_out_in_order() {
        let p = ends(PipePolicy::Block, 8);
        assert_eq!(p.ops().write(&p, 0, b"hello").unwrap(), 5);
        let mut b = [0u8; 3];
        assert_eq!(p.ops().read(&p, 0, &mut b).unwrap(), 3);
        assert_eq!(&b, b"hel");
        assert_eq!(p.ops().write(&p, 0, b"0123456789").unwrap(), 6);
        assert_eq!(p.size(), 8);
    }

    #[test]
    fn empty_and_full_follow_policy() {
        let p = ends(PipePolicy::Block, 2);
        let mut b = [0u8; 4];
        assert_eq!(p.ops().read(&p, 0, &mut b), Err(FsError::WouldBlock));
        p.ops().write(&p, 0, b"ab").unwrap();
        assert_eq!(p.ops().write(&p, 0, b"c"), Err(FsError::WouldBlock));

        let q = ends(PipePolicy::ReturnZero, 2);
        assert_eq!(q.ops().read(&q, 0, &mut b), Ok(0));
        q.ops().write(&q, 0, b"ab").unwrap();
        assert_eq!(q.ops().write(&q, 0, b"c"), Ok(0));
    }

    #[test]
    fn closed_ends() {
        let p = ends(PipePolicy::Block, 8);
        p.ops().write(&p, 0, b"x").unwrap();
        p.ops().close(&p, OpenFlags::WRONLY);
        let mut b = [0u8; 4];
        assert_eq!(p.ops().read(&p, 0, &mut b), Ok(1));
        assert_eq!(p.ops().read(&p, 0, &mut b), Ok(0));

        let q = ends(PipePolicy::Block, 8);
        q.ops().close(&q, OpenFlags::RDONLY);
        assert_eq!(q.ops().write(&q, 0, b"x"), Err(FsError::BrokenPipe));
    }
}
