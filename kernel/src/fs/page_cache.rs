// kernel/src/fs/page_cache.rs
//
// Unified page cache for regular files.
//
// Entries live in a slab (`slots`) and are threaded onto two lists:
//   - a hash chain per bucket, keyed by (inode id, page offset), for O(1)
//     lookup;
//   - one doubly-linked LRU list, most recently used at the head.
//
// Writes only mark the touched byte range dirty.  A dirty entry is written
// back through the driver's `write` (exactly its dirty range) when it is
// evicted, when the file's last open reference goes away, or on sync.
// Pages mapped into a shared writable mapping are written to behind the
// cache's back, so once the first write fault marks them they stay dirty
// for as long as they are mapped, and they are never evicted while mapped.
// Running out of frames, or of evictable entries, is never fatal: the
// transfer in progress stops early and reports a short count.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::inode::{Inode, InodeId};
use super::{FsError, FsResult};
use crate::memory::{FramePool, PhysFrame, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub inode: InodeId,
    /// Page-aligned byte offset in the file.
    pub offset: u64,
}

struct Entry {
    key: CacheKey,
    inode: Arc<Inode>,
    frame: PhysFrame,
    /// Dirty bytes within the page, `[lo, hi)`.
    dirty: Option<(usize, usize)>,
    /// Written through a shared mapping.
    mapped_dirty: bool,
    prev: Option<usize>,
    next: Option<usize>,
    hash_next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub resident: usize,
}

pub struct PageCache {
    pool: Arc<FramePool>,
    capacity: usize,
    buckets: Vec<Option<usize>>,
    slots: Vec<Option<Entry>>,
    free_slots: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used; next eviction candidate.
    tail: Option<usize>,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(pool: Arc<FramePool>, capacity: usize, buckets: usize) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
            buckets: vec![None; buckets.max(1)],
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { resident: self.len(), ..self.stats }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket(&self, key: CacheKey) -> usize {
        let h = key.inode.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ (key.offset / PAGE_SIZE);
        (h % self.buckets.len() as u64) as usize
    }

    fn entry(&self, idx: usize) -> &Entry {
        self.slots[idx].as_ref().unwrap_or_else(|| unreachable!("free cache slot {}", idx))
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.slots[idx].as_mut().unwrap_or_else(|| unreachable!("free cache slot {}", idx))
    }

    // ========================================================================
    // List plumbing
    // ========================================================================

    fn lru_unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let e = self.entry_mut(idx);
        e.prev = None;
        e.next = None;
    }

    fn lru_push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.entry_mut(idx);
            e.prev = None;
            e.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn hash_unlink(&mut self, idx: usize) {
        let key = self.entry(idx).key;
        let b = self.bucket(key);
        let next = self.entry(idx).hash_next;
        if self.buckets[b] == Some(idx) {
            self.buckets[b] = next;
            return;
        }
        let mut cur = self.buckets[b];
        while let Some(c) = cur {
            if self.entry(c).hash_next == Some(idx) {
                self.entry_mut(c).hash_next = next;
                return;
            }
            cur = self.entry(c).hash_next;
        }
    }

    fn find(&self, key: CacheKey) -> Option<usize> {
        let mut cur = self.buckets[self.bucket(key)];
        while let Some(c) = cur {
            let e = self.entry(c);
            if e.key == key {
                return Some(c);
            }
            cur = e.hash_next;
        }
        None
    }

    // ========================================================================
    // Lookup / fill / evict
    // ========================================================================

    /// Cached page for `(inode, offset)`, promoted to most recently used.
    pub fn lookup(&mut self, inode: InodeId, offset: u64) -> Option<usize> {
        let idx = self.find(CacheKey { inode, offset })?;
        if self.head != Some(idx) {
            self.lru_unlink(idx);
            self.lru_push_front(idx);
        }
        Some(idx)
    }

    pub fn contains(&self, inode: InodeId, offset: u64) -> bool {
        self.find(CacheKey { inode, offset }).is_some()
    }

    pub fn is_dirty(&self, inode: InodeId, offset: u64) -> bool {
        self.find(CacheKey { inode, offset })
            .is_some_and(|i| self.entry(i).dirty.is_some())
    }

    /// Write an entry's dirty range back through its driver.
    fn flush_entry(&mut self, idx: usize) -> FsResult<()> {
        let (inode, frame, offset, range) = {
            let e = self.entry(idx);
            match e.dirty {
                Some(r) => (e.inode.clone(), e.frame, e.key.offset, r),
                None => return Ok(()),
            }
        };
        let (lo, hi) = range;
        let mut data = vec![0u8; hi - lo];
        self.pool.read(frame, lo, &mut data);
        let mut done = 0;
        while done < data.len() {
            let n = inode.ops().write(&inode, offset + (lo + done) as u64, &data[done..])?;
            if n == 0 {
                return Err(FsError::IoError);
            }
            done += n;
        }
        let still_mapped = self.is_mapped(idx);
        let e = self.entry_mut(idx);
        e.mapped_dirty &= still_mapped;
        e.dirty = if e.mapped_dirty { Some(range) } else { None };
        self.stats.writebacks += 1;
        crate::serial_trace!("cache: wrote back ino {} +{:#x} [{}..{})", inode.id(), offset, lo, hi);
        Ok(())
    }

    /// Some mapping still holds the frame.
    fn is_mapped(&self, idx: usize) -> bool {
        self.pool.ref_count(self.entry(idx).frame) > 1
    }

    /// Unlink an entry from both lists and drop its frame reference.
    fn remove(&mut self, idx: usize) {
        self.hash_unlink(idx);
        self.lru_unlink(idx);
        if let Some(e) = self.slots[idx].take() {
            self.pool.free_frame(e.frame);
        }
        self.free_slots.push(idx);
    }

    /// Evict the least recently used entry that can go, writing it back
    /// first if dirty.  Mapped entries and entries whose write-back fails
    /// stay cached.
    pub fn evict_lru(&mut self) -> bool {
        let mut cur = self.tail;
        while let Some(idx) = cur {
            cur = self.entry(idx).prev;
            if self.is_mapped(idx) {
                continue;
            }
            match self.flush_entry(idx) {
                Ok(()) => {
                    self.remove(idx);
                    self.stats.evictions += 1;
                    return true;
                }
                Err(e) => {
                    let key = self.entry(idx).key;
                    crate::serial_println!("cache: write-back of ino {} +{:#x} failed: {:?}", key.inode, key.offset, e);
                }
            }
        }
        false
    }

    /// Cached page for `(inode, offset)`, reading it in on a miss.
    /// `Ok(None)` means no frame could be found for it.
    pub fn get_page(&mut self, inode: &Arc<Inode>, offset: u64) -> FsResult<Option<usize>> {
        debug_assert_eq!(offset % PAGE_SIZE, 0);
        if let Some(idx) = self.lookup(inode.id(), offset) {
            self.stats.hits += 1;
            return Ok(Some(idx));
        }
        self.stats.misses += 1;

        if self.len() >= self.capacity && !self.evict_lru() {
            return Ok(None);
        }
        let frame = match self.pool.alloc_frame() {
            Some(f) => f,
            None => {
                // Memory pressure: give up a cached page and retry once.
                if !self.evict_lru() {
                    return Ok(None);
                }
                match self.pool.alloc_frame() {
                    Some(f) => f,
                    None => return Ok(None),
                }
            }
        };

        // Populate the whole page; the tail past end-of-file reads as zero.
        let size = inode.size();
        let valid = size.saturating_sub(offset).min(PAGE_SIZE) as usize;
        let page = unsafe { self.pool.bytes_mut(frame) };
        page.fill(0);
        let mut filled = 0;
        while filled < valid {
            match inode.ops().read(inode, offset + filled as u64, &mut page[filled..valid]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.pool.free_frame(frame);
                    return Err(e);
                }
            }
        }

        let key = CacheKey { inode: inode.id(), offset };
        let entry = Entry {
            key,
            inode: inode.clone(),
            frame,
            dirty: None,
            mapped_dirty: false,
            prev: None,
            next: None,
            hash_next: None,
        };
        let idx = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i] = Some(entry);
                i
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        let b = self.bucket(key);
        self.entry_mut(idx).hash_next = self.buckets[b];
        self.buckets[b] = Some(idx);
        self.lru_push_front(idx);
        Ok(Some(idx))
    }

    // ========================================================================
    // Byte-level I/O
    // ========================================================================

    /// Read file bytes at `pos`, stopping at end of file.
    pub fn read(&mut self, inode: &Arc<Inode>, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
        let size = inode.size();
        if pos >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - pos) as usize);
        let mut done = 0;
        while done < want {
            let cur = pos + done as u64;
            let page_off = cur % PAGE_SIZE;
            let chunk = ((PAGE_SIZE - page_off) as usize).min(want - done);
            let idx = match self.get_page(inode, cur - page_off) {
                Ok(Some(idx)) => idx,
                Ok(None) => break,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            let frame = self.entry(idx).frame;
            self.pool.read(frame, page_off as usize, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Write bytes at `pos` into the cache, marking them dirty and growing
    /// the file size.
    pub fn write(&mut self, inode: &Arc<Inode>, pos: u64, data: &[u8]) -> FsResult<usize> {
        let mut done = 0;
        while done < data.len() {
            let cur = pos + done as u64;
            let page_off = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(data.len() - done);
            let idx = match self.get_page(inode, cur - page_off as u64) {
                Ok(Some(idx)) => idx,
                Ok(None) => break,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            let frame = self.entry(idx).frame;
            self.pool.write(frame, page_off, &data[done..done + chunk]);
            let e = self.entry_mut(idx);
            let (lo, hi) = (page_off, page_off + chunk);
            e.dirty = Some(match e.dirty {
                Some((a, b)) => (a.min(lo), b.max(hi)),
                None => (lo, hi),
            });
            done += chunk;
            inode.extend_to(cur + chunk as u64);
        }
        Ok(done)
    }

    // ========================================================================
    // Whole-inode operations
    // ========================================================================

    fn indices_of(&self, inode: InodeId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|e| e.key.inode == inode).map(|_| i))
            .collect()
    }

    /// Flush and drop every page of `inode` (its last open reference went
    /// away).  Pages are dropped even when write-back fails; the first
    /// failure is reported.  Pages still mapped are flushed but kept until
    /// the mapping goes away.
    pub fn evict_inode(&mut self, inode: &Inode) -> FsResult<()> {
        let mut result = Ok(());
        for idx in self.indices_of(inode.id()) {
            if let Err(e) = self.flush_entry(idx) {
                crate::serial_println!("cache: lost dirty page of ino {}: {:?}", inode.id(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            if !self.is_mapped(idx) {
                self.remove(idx);
            }
        }
        result
    }

    /// Write back `inode`'s dirty pages, keeping them cached.
    pub fn flush_inode(&mut self, inode: &Inode) -> FsResult<()> {
        for idx in self.indices_of(inode.id()) {
            self.flush_entry(idx)?;
        }
        Ok(())
    }

    /// Drop cached pages past a new file size; the page that straddles it
    /// has its tail zeroed and its dirty range clipped.
    pub fn truncate_inode(&mut self, inode: &Inode, size: u64) {
        for idx in self.indices_of(inode.id()) {
            let (offset, frame) = {
                let e = self.entry(idx);
                (e.key.offset, e.frame)
            };
            if offset >= size {
                self.remove(idx);
            } else if size - offset < PAGE_SIZE {
                let keep = (size - offset) as usize;
                let page = unsafe { self.pool.bytes_mut(frame) };
                page[keep..].fill(0);
                let e = self.entry_mut(idx);
                e.dirty = match e.dirty {
                    Some((lo, _)) if lo >= keep => None,
                    Some((lo, hi)) => Some((lo, hi.min(keep))),
                    None => None,
                };
            }
        }
    }

    pub fn sync_all(&mut self) -> FsResult<()> {
        let dirty: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].as_ref().is_some_and(|e| e.dirty.is_some()))
            .collect();
        let mut result = Ok(());
        for idx in dirty {
            if let Err(e) = self.flush_entry(idx) {
                result = Err(e);
            }
        }
        result
    }

    /// Frame holding the page, with an extra reference for a mapping.
    pub fn map_page(&mut self, inode: &Arc<Inode>, offset: u64) -> FsResult<Option<PhysFrame>> {
        Ok(self.get_page(inode, offset)?.map(|idx| {
            let frame = self.entry(idx).frame;
            self.pool.inc_ref(frame);
            frame
        }))
    }

    /// A shared mapping is about to write to the page at `offset`: its
    /// bytes up to end of file become dirty, and stay dirty while mapped.
    /// Returns false if the page is no longer cached.
    pub fn mark_mapped_dirty(&mut self, inode: &Inode, offset: u64) -> bool {
        let Some(idx) = self.find(CacheKey { inode: inode.id(), offset }) else {
            return false;
        };
        let valid = inode.size().saturating_sub(offset).min(PAGE_SIZE) as usize;
        let e = self.entry_mut(idx);
        e.mapped_dirty = true;
        if valid > 0 {
            e.dirty = Some(match e.dirty {
                Some((_, hi)) => (0, hi.max(valid)),
                None => (0, valid),
            });
        }
        true
    }

    /// LRU order, most recent first (diagnostics and tests).
    pub fn lru_keys(&self) -> Vec<CacheKey> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let e = self.entry(idx);
            out.push(e.key);
            cur = e.next;
        }
        out
    }
}
