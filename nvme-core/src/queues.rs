//! DMA-backed submission/completion queue rings (spec §4.2).
//!
//! Both rings are plain flat arrays in physically contiguous memory; the
//! controller and host each track their own head/tail independently and
//! only ever talk to each other through the doorbell registers, never
//! through shared cursor state.

use common::Dma;

use crate::cmd::{NvmeCmd, NvmeComp};

/// Host-owned submission ring: the driver writes new commands at `tail` and
/// rings the SQ doorbell; `head` tracks the controller's last-known
/// consumption point, taken from completion entries (spec §4.3/§4.4).
pub struct SubmissionQueue {
    pub data: Dma<[NvmeCmd]>,
    pub head: u16,
    pub tail: u16,
}

impl SubmissionQueue {
    pub fn new(depth: u16) -> syscall::Result<Self> {
        let dma = unsafe { Dma::<[NvmeCmd]>::zeroed_slice(depth as usize)?.assume_init() };
        Ok(SubmissionQueue {
            data: dma,
            head: 0,
            tail: 0,
        })
    }

    pub fn len(&self) -> u16 {
        self.data.len() as u16
    }

    /// Number of free slots, accounting for the ring reserving one slot to
    /// distinguish full from empty (spec §4.3 occupancy invariant).
    pub fn free_slots(&self) -> u16 {
        let len = self.len();
        let used = (self.tail + len - self.head) % len;
        len - 1 - used
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    /// Writes `cmd` at the current tail and advances it, wrapping at the
    /// ring length. Caller is responsible for checking `free_slots` first
    /// and for ringing the doorbell afterward.
    pub fn push(&mut self, cmd: NvmeCmd) -> u16 {
        debug_assert!(!self.is_full());
        let slot = self.tail;
        self.data[slot as usize] = cmd;
        self.tail = (self.tail + 1) % self.len();
        slot
    }

    pub fn advance_head(&mut self, new_head: u16) {
        self.head = new_head;
    }
}

/// Controller-owned completion ring: the driver polls `data[head]` for a
/// phase-bit flip, consumes entries and rings the CQ doorbell with the new
/// head (spec §4.4).
pub struct CompletionQueue {
    pub data: Dma<[NvmeComp]>,
    pub head: u16,
    /// Expected phase bit for the next unconsumed entry; flips every time
    /// the ring wraps around to index 0.
    pub phase: bool,
}

impl CompletionQueue {
    pub fn new(depth: u16) -> syscall::Result<Self> {
        let dma = unsafe { Dma::<[NvmeComp]>::zeroed_slice(depth as usize)?.assume_init() };
        Ok(CompletionQueue {
            data: dma,
            head: 0,
            phase: true,
        })
    }

    pub fn len(&self) -> u16 {
        self.data.len() as u16
    }

    /// Returns the next completion entry if its phase bit matches what we
    /// expect, without consuming it; callers must call `advance` to move
    /// past it. Never blocks (spec §4.4: the poller always returns).
    pub fn peek(&self) -> Option<&NvmeComp> {
        let entry = &self.data[self.head as usize];
        if entry.phase() == self.phase {
            Some(entry)
        } else {
            None
        }
    }

    /// Advances past the entry last returned by `peek`, flipping `phase`
    /// when the ring wraps.
    pub fn advance(&mut self) {
        self.head += 1;
        if self.head == self.len() {
            self.head = 0;
            self.phase = !self.phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sq_occupancy_reserves_one_slot() {
        // A depth-4 ring can only ever hold 3 outstanding commands; this is
        // the invariant spec §8 calls out by name.
        let mut sq = SubmissionQueue {
            data: unsafe { Dma::<[NvmeCmd]>::zeroed_slice(4).unwrap().assume_init() },
            head: 0,
            tail: 0,
        };
        assert_eq!(sq.free_slots(), 3);
        for _ in 0..3 {
            assert!(!sq.is_full());
            sq.push(NvmeCmd::empty());
        }
        assert!(sq.is_full());
        assert_eq!(sq.free_slots(), 0);
    }

    #[test]
    fn sq_wraps_and_frees_after_head_advance() {
        let mut sq = SubmissionQueue {
            data: unsafe { Dma::<[NvmeCmd]>::zeroed_slice(4).unwrap().assume_init() },
            head: 0,
            tail: 0,
        };
        sq.push(NvmeCmd::empty());
        sq.push(NvmeCmd::empty());
        sq.push(NvmeCmd::empty());
        sq.advance_head(2);
        assert_eq!(sq.free_slots(), 2);
        sq.push(NvmeCmd::empty());
        sq.push(NvmeCmd::empty());
        assert!(sq.is_full());
    }

    #[test]
    fn cq_phase_flips_on_wrap() {
        let mut cq = CompletionQueue {
            data: unsafe { Dma::<[NvmeComp]>::zeroed_slice(2).unwrap().assume_init() },
            head: 0,
            phase: true,
        };
        cq.data[0].status = 1; // phase bit set, matches initial expectation
        assert!(cq.peek().is_some());
        cq.advance();
        cq.data[1].status = 1;
        assert!(cq.peek().is_some());
        cq.advance();
        // wrapped back to index 0; phase flipped to false, so the stale
        // phase=1 entry at index 0 no longer matches until rewritten.
        assert!(cq.peek().is_none());
    }
}
