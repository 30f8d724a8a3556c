//! Top-level controller facade (spec §3's "Controller" entity): owns the
//! mapped register BAR, drives the chipset bring-up sequence, and exposes
//! the identify data and live queue pairs the driver binary's disk adapter
//! and scheme handler need. This is the one place that ties `chipset`,
//! `admin`, `queue_manager` and `queues` together into something a caller
//! can hold a single handle to.

use std::sync::Arc;

use common::io::Io;
use common::Dma;

use crate::cmd::{self, NvmeCmd, NvmeComp};
use crate::doorbell::Doorbell;
use crate::error::ChipsetError;
use crate::identify::{IdentifyControllerData, IdentifyNamespaceData};
use crate::queue_manager::{select_queue_depth, QueueMapStrategy, VectorAssigner};
use crate::queues::{CompletionQueue, SubmissionQueue};
use crate::regs::{ControllerCaps, NvmeRegs};
use crate::{admin, chipset};

/// A live I/O queue pair plus the doorbell pair and interrupt vector it was
/// created with.
pub struct IoQueuePair {
    pub qid: u16,
    pub vector: u16,
    pub sq: SubmissionQueue,
    pub cq: CompletionQueue,
    pub doorbell: Doorbell,
}

/// Discovered namespace geometry, decoded from an Identify Namespace
/// response (spec §4.5/§4.6).
#[derive(Debug, Clone, Copy)]
pub struct NamespaceGeometry {
    pub id: u32,
    pub blocks: u64,
    pub block_size: u32,
}

/// Owns the mapped controller register BAR and the admin queue pair; the
/// single entry point the driver binary uses to bring a device up, create
/// I/O queues, and identify namespaces.
pub struct Controller {
    regs: *const NvmeRegs,
    bar0: usize,
    pub caps: ControllerCaps,
    admin_sq: SubmissionQueue,
    admin_cq: CompletionQueue,
    admin_doorbell: Doorbell,
    next_cid: u16,
}

unsafe impl Send for Controller {}

impl Controller {
    /// Maps `bar0` (already obtained from `pcid-interface`) as the
    /// register set, reads CAP, and brings the controller up through the
    /// admin-queue bring-up sequence in spec §4.1. `admin_depth` is
    /// clamped to `CAP.MQES`.
    pub fn attach(bar0: usize, admin_depth: u16) -> Result<Self, ChipsetError> {
        let regs = bar0 as *const NvmeRegs;
        let caps = unsafe { ControllerCaps::decode((*regs).cap_low.read(), (*regs).cap_high.read()) };
        let depth = select_queue_depth(admin_depth, &caps);

        unsafe { chipset::disable(&*regs, &caps)? };

        let admin_sq = SubmissionQueue::new(depth).map_err(|_| ChipsetError::EnableTimeout)?;
        let admin_cq = CompletionQueue::new(depth).map_err(|_| ChipsetError::EnableTimeout)?;
        let aqa = ((depth as u32 - 1) << 16) | (depth as u32 - 1);

        unsafe {
            chipset::enable(
                &*regs,
                &caps,
                aqa,
                admin_sq.data.physical() as u64,
                admin_cq.data.physical() as u64,
                caps.css as u32 & 1,
                caps.mempg_min as u32,
            )?;
        }

        let admin_doorbell = unsafe { Doorbell::new(bar0, caps.dstrd, 0) };

        Ok(Controller {
            regs,
            bar0,
            caps,
            admin_sq,
            admin_cq,
            admin_doorbell,
            next_cid: 0,
        })
    }

    fn regs(&self) -> &NvmeRegs {
        unsafe { &*self.regs }
    }

    fn alloc_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cid
    }

    /// Issues one admin command and busy-polls the admin completion queue
    /// until it lands. The admin thread is the only caller of this path,
    /// so there is no concurrent-submitter hazard to guard against (spec
    /// §4.5).
    fn admin_roundtrip(&mut self, mut cmd: NvmeCmd) -> Result<NvmeComp, ChipsetError> {
        cmd.cid = self.alloc_cid();
        if self.admin_sq.is_full() {
            return Err(ChipsetError::EnableTimeout);
        }
        self.admin_sq.push(cmd);
        self.admin_doorbell.ring_sq_tail(self.admin_sq.tail as u32);

        loop {
            if let Some(entry) = self.admin_cq.peek() {
                let comp = *entry;
                self.admin_cq.advance();
                // CQ head doorbell must land before this completion is
                // treated as done (spec §4.4/§9).
                self.admin_doorbell.ring_cq_head(self.admin_cq.head as u32);
                self.admin_sq.advance_head(comp.sq_head);
                return Ok(comp);
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }

    /// Identify Controller (spec §4.5).
    pub fn identify_controller(&mut self) -> Result<Dma<IdentifyControllerData>, ChipsetError> {
        let page = unsafe {
            Dma::<IdentifyControllerData>::zeroed()
                .map_err(|_| ChipsetError::EnableTimeout)?
                .assume_init()
        };
        let cmd = cmd::identify_controller(0, page.physical() as u64);
        let comp = self.admin_roundtrip(cmd)?;
        if !comp.is_success() {
            return Err(ChipsetError::EnableTimeout);
        }
        Ok(page)
    }

    /// Identify Namespace for `nsid` (spec §4.5/§4.6).
    pub fn identify_namespace(&mut self, nsid: u32) -> Result<NamespaceGeometry, ChipsetError> {
        let page = unsafe {
            Dma::<IdentifyNamespaceData>::zeroed()
                .map_err(|_| ChipsetError::EnableTimeout)?
                .assume_init()
        };
        let cmd = cmd::identify_namespace(0, nsid, page.physical() as u64);
        let comp = self.admin_roundtrip(cmd)?;
        if !comp.is_success() {
            return Err(ChipsetError::EnableTimeout);
        }
        Ok(NamespaceGeometry {
            id: nsid,
            blocks: page.size_in_blocks(),
            block_size: page.lba_size(),
        })
    }

    /// Requests `count` I/O queue pairs via Set Features, then creates
    /// each completion queue before its matching submission queue (spec
    /// §4.2/§4.5's required creation order), assigning interrupt vectors
    /// round-robin over `total_vectors`.
    pub fn create_io_queues(
        &mut self,
        count: u16,
        depth: u16,
        total_vectors: u16,
    ) -> Result<Vec<IoQueuePair>, ChipsetError> {
        let depth = select_queue_depth(depth, &self.caps);
        let set_features = cmd::set_features_num_queues(0, count);
        let comp = self.admin_roundtrip(set_features)?;
        let (granted_sq, granted_cq) = admin::granted_queue_counts(comp.command_specific);
        let count = count.min(granted_sq).min(granted_cq);

        let mut assigner = VectorAssigner::new(total_vectors);
        let mut pairs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let qid = i + 1;
            let vector = assigner.next_vector();
            let cq = CompletionQueue::new(depth).map_err(|_| ChipsetError::EnableTimeout)?;
            let create_cq = cmd::create_io_completion_queue(0, qid, depth - 1, cq.data.physical() as u64, vector);
            let comp = self.admin_roundtrip(create_cq)?;
            if !comp.is_success() {
                return Err(ChipsetError::EnableTimeout);
            }

            let sq = SubmissionQueue::new(depth).map_err(|_| ChipsetError::EnableTimeout)?;
            let create_sq = cmd::create_io_submission_queue(0, qid, depth - 1, sq.data.physical() as u64, qid);
            let comp = self.admin_roundtrip(create_sq)?;
            if !comp.is_success() {
                return Err(ChipsetError::EnableTimeout);
            }

            let doorbell = unsafe { Doorbell::new(self.bar0, self.caps.dstrd, qid) };
            pairs.push(IoQueuePair {
                qid,
                vector,
                sq,
                cq,
                doorbell,
            });
        }
        Ok(pairs)
    }

    /// Tears down the queue pairs (submission queues first, per spec
    /// §4.5/§7) and requests a normal shutdown.
    pub fn shutdown(&mut self, io_qids: &[u16]) -> Result<(), ChipsetError> {
        for &qid in io_qids {
            let del_sq = cmd::delete_io_submission_queue(0, qid);
            let _ = self.admin_roundtrip(del_sq);
        }
        for &qid in io_qids {
            let del_cq = cmd::delete_io_completion_queue(0, qid);
            let _ = self.admin_roundtrip(del_cq);
        }
        chipset::shutdown(self.regs())
    }
}

/// Convenience re-export so callers building a queue-pair manager on top of
/// `Controller` can reason about the CPU mapping without re-deriving it.
pub fn default_queue_map(ncpus: usize, nvecs: usize) -> QueueMapStrategy {
    QueueMapStrategy::select(ncpus, nvecs)
}
