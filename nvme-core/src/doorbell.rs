//! Submission/completion doorbell register pair for one queue (spec §4.2,
//! §6). The doorbell array starts at BAR0 offset 0x1000; each queue gets
//! two adjacent `4 << DSTRD`-byte slots, SQ tail first, then CQ head.

use common::io::{Io, Mmio};

/// Raw pointers into the doorbell array for a single queue. `unsafe` to
/// construct because the caller must guarantee `base` is a live mapping of
/// the controller's BAR0 for as long as this value is used.
pub struct Doorbell {
    sq_tail: *mut Mmio<u32>,
    cq_head: *mut Mmio<u32>,
}

unsafe impl Send for Doorbell {}
unsafe impl Sync for Doorbell {}

impl Doorbell {
    /// `bar0` is the mapped base address of the controller's register BAR,
    /// `dstrd` is `CAP.DSTRD`, `qid` is the 0-based queue index (0 for the
    /// admin queue pair).
    pub unsafe fn new(bar0: usize, dstrd: u8, qid: u16) -> Self {
        let stride = 4usize << dstrd;
        let base = bar0 + 0x1000 + (qid as usize) * 2 * stride;
        Doorbell {
            sq_tail: base as *mut Mmio<u32>,
            cq_head: (base + stride) as *mut Mmio<u32>,
        }
    }

    /// Builds a `Doorbell` from already-resolved register pointers,
    /// bypassing the BAR0 + stride arithmetic `new` does. Used by tests
    /// that back the doorbell pair with ordinary heap memory instead of a
    /// real MMIO mapping.
    ///
    /// # Safety
    /// `sq_tail` and `cq_head` must each point at a live, properly aligned
    /// `Mmio<u32>` for the lifetime of this value.
    pub unsafe fn from_raw(sq_tail: *mut Mmio<u32>, cq_head: *mut Mmio<u32>) -> Self {
        Doorbell { sq_tail, cq_head }
    }

    pub fn ring_sq_tail(&self, value: u32) {
        unsafe { (*self.sq_tail).write(value) };
    }

    pub fn ring_cq_head(&self, value: u32) {
        unsafe { (*self.cq_head).write(value) };
    }
}
