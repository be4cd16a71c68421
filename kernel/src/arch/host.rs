// kernel/src/arch/host.rs
//
// Stand-ins for privileged operations on hosted builds.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn flush_tlb_page(_va: u64) {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub fn flush_tlb_all() {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

/// Invalidations issued so far (process-wide).
pub fn tlb_flush_count() -> usize {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

pub fn activate_root(root_phys: u64) {
    ACTIVE_ROOT.store(root_phys, Ordering::Relaxed);
    flush_tlb_all();
}

pub fn active_root() -> u64 {
    ACTIVE_ROOT.load(Ordering::Relaxed)
}

pub fn irq_save() -> usize {
    0
}

pub fn irq_restore(_saved: usize) {}

pub fn halt() {
    core::hint::spin_loop();
}
