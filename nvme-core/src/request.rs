//! Request bank: a fixed-size slab of request descriptors with an
//! intrusive free list, the state machine from spec §4.3, and the PRP
//! chain builder commands reference (spec §4.3/§4.6).

use std::sync::atomic::{AtomicU16, Ordering};

use common::Dma;

pub const NO_NEXT: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// On the free list, not owned by anyone.
    Avail,
    /// Claimed by a caller, not yet written into a submission queue slot.
    Allocated,
    /// Written into a submission queue slot and the doorbell has been rung.
    Submitted,
    /// A matching completion entry has been observed.
    Completed,
}

/// One request descriptor: the completion status, the PRP list backing
/// store, and the free-list link. The free-list link is an index rather
/// than a pointer, so there is no raw-pointer CAS and no ABA hazard --
/// slots are never deallocated for the controller's lifetime, only ever
/// recycled (spec §9 design note on the C `atomic_cmpset_ptr` free list).
pub struct RequestSlot {
    pub state: RequestState,
    pub cid: u16,
    pub nsid: u32,
    pub completion_status: u16,
    pub sq_index: u8,
    next_free: AtomicU16,
}

impl RequestSlot {
    fn new() -> Self {
        RequestSlot {
            state: RequestState::Avail,
            cid: 0,
            nsid: 0,
            completion_status: 0,
            sq_index: 0,
            next_free: AtomicU16::new(NO_NEXT),
        }
    }
}

/// Handle to an allocated request slot; `cid` doubles as the command
/// identifier written into the submission queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandle {
    pub index: u16,
    pub cid: u16,
}

/// A fixed-size bank of request descriptors shared across the queue pairs
/// that route through a given submission queue (spec §4.3). Allocation and
/// release are lock-free: the head of the free chain is a single atomic,
/// and each slot's `next_free` link is itself atomic, so concurrent
/// `alloc`/`release` calls from different CPUs never need a mutex.
pub struct RequestBank {
    slots: Vec<parking_lot::Mutex<RequestSlot>>,
    free_head: AtomicU16,
    /// Scratch PRP-list pages, one per slot, sized for the controller's
    /// maximum transfer size (spec §4.6).
    pub prp_lists: Dma<[u64]>,
    prp_list_entries: usize,
}

impl RequestBank {
    pub fn new(depth: u16, prp_list_entries: usize) -> syscall::Result<Self> {
        let mut slots = Vec::with_capacity(depth as usize);
        for i in 0..depth {
            let slot = RequestSlot::new();
            if i + 1 < depth {
                slot.next_free.store(i + 1, Ordering::Relaxed);
            }
            slots.push(parking_lot::Mutex::new(slot));
        }
        let prp_lists = unsafe {
            Dma::<[u64]>::zeroed_slice(depth as usize * prp_list_entries)?.assume_init()
        };
        Ok(RequestBank {
            slots,
            free_head: AtomicU16::new(if depth == 0 { NO_NEXT } else { 0 }),
            prp_lists,
            prp_list_entries,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Pops a slot off the free chain, marking it `Allocated`. Returns
    /// `None` when the bank is exhausted -- callers fall back to the
    /// per-queue `PendingCommand` backpressure path (spec §4.3).
    pub fn alloc(&self, nsid: u32) -> Option<RequestHandle> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head == NO_NEXT {
                return None;
            }
            let next = self.slots[head as usize]
                .lock()
                .next_free
                .load(Ordering::Relaxed);
            if self
                .free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let mut slot = self.slots[head as usize].lock();
                slot.state = RequestState::Allocated;
                slot.nsid = nsid;
                slot.cid = head;
                return Some(RequestHandle { index: head, cid: head });
            }
        }
    }

    pub fn mark_submitted(&self, handle: RequestHandle, sq_index: u8) {
        let mut slot = self.slots[handle.index as usize].lock();
        debug_assert_eq!(slot.state, RequestState::Allocated);
        slot.state = RequestState::Submitted;
        slot.sq_index = sq_index;
    }

    pub fn mark_completed(&self, index: u16, status: u16) {
        let mut slot = self.slots[index as usize].lock();
        slot.state = RequestState::Completed;
        slot.completion_status = status;
    }

    pub fn state_of(&self, index: u16) -> RequestState {
        self.slots[index as usize].lock().state
    }

    /// Returns the slot to the free list. Must only be called once the
    /// caller has observed `Completed` and consumed the result.
    pub fn release(&self, handle: RequestHandle) {
        let mut slot = self.slots[handle.index as usize].lock();
        slot.state = RequestState::Avail;
        drop(slot);
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            self.slots[handle.index as usize]
                .lock()
                .next_free
                .store(head, Ordering::Relaxed);
            if self
                .free_head
                .compare_exchange(head, handle.index, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// The PRP-list scratch page owned by this slot, as a physical address
    /// suitable for PRP2 in a multi-page transfer.
    pub fn prp_list_physical(&self, index: u16) -> usize {
        self.prp_lists.physical() + index as usize * self.prp_list_entries * 8
    }
}

/// Builds the PRP1/PRP2 pair for a buffer spanning `phys_addr..phys_addr+len`
/// against a controller with the given page size (spec §4.3/§4.6). Returns
/// `(prp1, prp2)`; `prp2` is zero for single-page transfers, a second page
/// pointer for two-page transfers, and the address of `prp_list_scratch`
/// (pre-filled by this function) for anything larger.
pub fn build_prp(
    phys_addr: usize,
    len: usize,
    page_size: usize,
    prp_list_scratch: Option<&mut [u64]>,
    prp_list_scratch_phys: usize,
) -> (u64, u64) {
    let prp1 = phys_addr as u64;
    if len <= page_size - (phys_addr % page_size) {
        return (prp1, 0);
    }
    let first_page_end = (phys_addr / page_size + 1) * page_size;
    let remaining = phys_addr + len - first_page_end;
    if remaining <= page_size {
        return (prp1, first_page_end as u64);
    }

    let scratch = prp_list_scratch.expect("multi-page PRP transfer requires list scratch");
    let mut addr = first_page_end;
    let mut left = remaining;
    let mut i = 0;
    while left > 0 {
        scratch[i] = addr as u64;
        addr += page_size;
        left = left.saturating_sub(page_size);
        i += 1;
    }
    (prp1, prp_list_scratch_phys as u64)
}

/// Recomputes the set of 4 KiB pages a PRP1/PRP2 pair (plus any PRP list
/// scratch) actually addresses, for property-testing `build_prp` against
/// the page range the caller asked to cover.
#[cfg(test)]
fn prp_covers_pages(
    phys_addr: usize,
    len: usize,
    page_size: usize,
    prp1: u64,
    prp2: u64,
    scratch: &[u64],
) -> bool {
    let first_page = phys_addr / page_size;
    let last_page = (phys_addr + len - 1) / page_size;
    let npages = last_page - first_page + 1;
    if npages == 1 {
        return prp1 as usize == phys_addr && prp2 == 0;
    }
    if prp1 as usize != phys_addr {
        return false;
    }
    if npages == 2 {
        return prp2 as usize == (first_page + 1) * page_size;
    }
    // PRP list case: prp2 points at the scratch page itself, whose
    // entries are every page from the second one onward, in order.
    let scratch_phys = 0xFEED_0000u64;
    if prp2 != scratch_phys {
        return false;
    }
    for (i, page) in ((first_page + 1)..=last_page).enumerate() {
        if scratch[i] as usize != page * page_size {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `build_prp` must address exactly the pages spanned by
        /// `[phys_addr, phys_addr+len)`, regardless of where the buffer
        /// starts within its first page (spec §4.3/§4.6).
        #[test]
        fn prp_chain_covers_the_whole_transfer(
            phys_addr in 0usize..0x10_0000,
            len in 1usize..(4096 * 8),
        ) {
            const PAGE: usize = 4096;
            let phys_addr = (phys_addr / PAGE) * PAGE + (phys_addr % PAGE);
            let mut scratch = vec![0u64; 8];
            let (prp1, prp2) = build_prp(phys_addr, len, PAGE, Some(&mut scratch), 0xFEED_0000);
            prop_assert!(prp_covers_pages(phys_addr, len, PAGE, prp1, prp2, &scratch));
        }
    }

    #[test]
    fn alloc_release_round_trips_through_every_slot() {
        let bank = RequestBank::new(8, 2).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(bank.alloc(1).unwrap());
        }
        assert!(bank.alloc(1).is_none());
        for h in handles {
            bank.mark_submitted(h, 0);
            bank.mark_completed(h.index, 0);
            bank.release(h);
        }
        assert!(bank.alloc(1).is_some());
    }

    #[test]
    fn prp_single_page() {
        let (prp1, prp2) = build_prp(0x1000, 512, 4096, None, 0);
        assert_eq!(prp1, 0x1000);
        assert_eq!(prp2, 0);
    }

    #[test]
    fn prp_two_pages() {
        let (prp1, prp2) = build_prp(0x1F00, 512, 4096, None, 0);
        assert_eq!(prp1, 0x1F00);
        assert_eq!(prp2, 0x2000);
    }

    #[test]
    fn prp_list_for_large_transfer() {
        let mut scratch = vec![0u64; 4];
        let (prp1, prp2) = build_prp(0x0, 4096 * 5, 4096, Some(&mut scratch), 0xA000);
        assert_eq!(prp1, 0);
        assert_eq!(prp2, 0xA000);
        assert_eq!(scratch[0], 0x1000);
        assert_eq!(scratch[1], 0x2000);
        assert_eq!(scratch[2], 0x3000);
        assert_eq!(scratch[3], 0x4000);
    }
}
