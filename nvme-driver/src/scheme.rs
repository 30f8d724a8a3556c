// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! NVMe scheme handler: brings a controller up, discovers namespaces, and
//! answers the Redox packet protocol against `nvme:<nsid>/` handles. This is
//! the disk adapter the rest of the crate builds toward: PRP construction,
//! the synchronous fast path, and IRQ-driven completion all meet here.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use log::{debug, info};

use common::Dma;
use nvme::{request, Controller};
use parking_lot::RwLock;

use crate::config::DriverConfig;
use crate::queue::{CompletionInfo, IoQueueManager, PendingCommand, QueuePair};
use crate::stats::GLOBAL_STATS;

/// Discovered namespace geometry plus the bits the packet handlers need on
/// every I/O (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub struct NamespaceInfo {
    pub id: u32,
    pub size: u64,
    pub block_size: u32,
    pub blocks: u64,
}

/// An open `nvme:` handle: either a namespace or the root directory.
pub struct NvmeHandle {
    pub is_directory: bool,
    pub ns_id: u32,
    pub ns_info: NamespaceInfo,
    pub queue_id: usize,
    pub offset: AtomicU64,
    pub created_at: Instant,
}

/// NVMe scheme implementation: the disk adapter from spec §4.6, wired to a
/// live `nvme-core` controller and one `QueuePair` per negotiated I/O queue.
pub struct NvmeScheme {
    controller: Controller,
    scheme_fd: RawFd,
    page_size: usize,
    namespaces: BTreeMap<u32, NamespaceInfo>,
    handles: RwLock<BTreeMap<u64, NvmeHandle>>,
    next_handle_id: AtomicU64,
    queues: IoQueueManager,
    io_qids: Vec<u16>,
    queue_counter: AtomicUsize,
    config: DriverConfig,
}

/// One I/O queue's worth of PRP list scratch: enough entries to cover a
/// multi-megabyte transfer without falling back to a second allocation.
const PRP_LIST_ENTRIES: usize = 512;

impl NvmeScheme {
    /// Maps the register BAR through `Controller::attach`, identifies the
    /// controller and every namespace it reports, and negotiates I/O queues
    /// per the configured queue count (spec §4.1/§4.2/§4.5).
    pub fn new(bar0: usize, scheme_fd: RawFd, config: DriverConfig) -> anyhow::Result<Self> {
        let mut controller = Controller::attach(bar0, config.queue_depth)?;
        let page_size = controller.caps.page_size();

        let ident = controller.identify_controller()?;
        info!("nvme: model {:?} serial {:?}", ident.model(), ident.serial());

        let mut namespaces = BTreeMap::new();
        for nsid in 1..=ident.nn {
            let geometry = match controller.identify_namespace(nsid) {
                Ok(g) if g.blocks > 0 => g,
                _ => continue,
            };
            namespaces.insert(
                nsid,
                NamespaceInfo {
                    id: nsid,
                    size: geometry.blocks * geometry.block_size as u64,
                    block_size: geometry.block_size,
                    blocks: geometry.blocks,
                },
            );
            debug!("nvme: namespace {} has {} blocks", nsid, namespaces[&nsid].blocks);
        }

        let requested_queues = config.queue_count.unwrap_or_else(|| num_cpus::get() as u16).max(1);
        let total_vectors = requested_queues + 1;
        let io_pairs = controller.create_io_queues(requested_queues, config.queue_depth, total_vectors)?;

        let mut io_qids = Vec::with_capacity(io_pairs.len());
        let mut queue_pairs = Vec::with_capacity(io_pairs.len());
        for (idx, pair) in io_pairs.into_iter().enumerate() {
            io_qids.push(pair.qid);
            queue_pairs.push(QueuePair::new(idx, pair.sq, pair.cq, pair.doorbell, config.queue_depth));
        }
        info!("nvme: negotiated {} I/O queue pairs", queue_pairs.len());

        Ok(NvmeScheme {
            controller,
            scheme_fd,
            page_size,
            namespaces,
            handles: RwLock::new(BTreeMap::new()),
            next_handle_id: AtomicU64::new(1),
            queues: IoQueueManager::new(queue_pairs),
            io_qids,
            queue_counter: AtomicUsize::new(0),
            config,
        })
    }

    /// Number of I/O queue pairs, one IRQ file per entry (spec §4.2/§4.5).
    pub fn queue_count(&self) -> u16 {
        self.queues.num_queues() as u16
    }

    fn select_queue(&self, handle: &NvmeHandle) -> usize {
        use crate::config::IoSchedulerType;
        match self.config.scheduler {
            IoSchedulerType::None | IoSchedulerType::RoundRobin => {
                self.queue_counter.fetch_add(1, Ordering::Relaxed) % self.queues.num_queues().max(1)
            }
            IoSchedulerType::CpuAffinity | IoSchedulerType::Priority | IoSchedulerType::Deadline => {
                handle.queue_id.min(self.queues.num_queues().saturating_sub(1))
            }
        }
    }

    /// Builds PRP1/PRP2 for a transfer at `phys_addr..phys_addr+len`,
    /// allocating PRP list scratch only when the transfer spans more than
    /// two pages (spec §4.3/§4.6).
    fn build_prp(&self, phys_addr: usize, len: usize) -> (u64, u64, Option<Dma<[u64]>>) {
        let span = (phys_addr % self.page_size + len + self.page_size - 1) / self.page_size;
        if span <= 2 {
            let (prp1, prp2) = request::build_prp(phys_addr, len, self.page_size, None, 0);
            return (prp1, prp2, None);
        }
        let mut scratch = match Dma::<[u64]>::zeroed_slice(PRP_LIST_ENTRIES) {
            Ok(s) => unsafe { s.assume_init() },
            Err(_) => return (0, 0, None),
        };
        let scratch_phys = scratch.physical();
        let (prp1, prp2) = request::build_prp(phys_addr, len, self.page_size, Some(&mut scratch[..]), scratch_phys);
        (prp1, prp2, Some(scratch))
    }

    /// Drains every ready completion on `queue`, answering the owning
    /// scheme packet for each (spec §4.4's doorbell-before-COMPLETED order
    /// is already enforced inside `nvme::poller::drain`). When `self_cmd_id`
    /// matches, the reply is written into `self_packet` instead of being
    /// sent through the scheme file, so the synchronous fast path can
    /// return it directly.
    fn finish_completion(
        &self,
        queue: &QueuePair,
        completion: CompletionInfo,
        self_cmd_id: u16,
        self_packet: &mut libredox::Packet,
    ) -> bool {
        let Some(pending) = queue.complete_command(completion.command_id) else {
            return false;
        };
        #[cfg(feature = "performance-counters")]
        {
            GLOBAL_STATS.record_io_complete(pending.bytes, pending.is_write, completion.submitted_at.elapsed());
        }
        if !pending.is_write && completion.status == 0 {
            if let Some(bounce) = &pending.bounce {
                unsafe {
                    std::ptr::copy_nonoverlapping(bounce.as_ptr(), pending.packet.c as *mut u8, pending.bytes.min(bounce.len()));
                }
            }
        }
        let result = if completion.status == 0 {
            pending.bytes
        } else {
            syscall::Error::new(syscall::EIO).to_errno()
        };

        if completion.command_id == self_cmd_id {
            self_packet.a = result;
            true
        } else {
            let mut packet = pending.packet;
            packet.a = result;
            let _ = syscall::write(self.scheme_fd, &packet);
            false
        }
    }

    /// Called from the per-queue IRQ thread: drains and replies to every
    /// completion currently posted on `queue_index`'s completion queue.
    pub fn irq(&mut self, queue_index: u16) {
        let Some(queue) = self.queues.get_queue(queue_index as usize) else {
            return;
        };
        while let Some(completion) = queue.poll_completion() {
            let mut discard = libredox::Packet::default();
            self.finish_completion(queue, completion, u16::MAX, &mut discard);
        }
    }

    /// Submits `cmd_id`'s command and, if the synchronous fast path is
    /// enabled, busy-polls the owning queue until either this command lands
    /// or the configured budget expires (spec §4.6's sync fast path).
    /// Returns `true` if `packet.a` was filled in synchronously.
    fn drive_sync_fastpath(&self, queue: &QueuePair, cmd_id: u16, packet: &mut libredox::Packet) -> bool {
        if !self.config.sync_fastpath_enabled {
            return false;
        }
        let deadline = Instant::now() + self.config.sync_fastpath_budget;
        loop {
            while let Some(completion) = queue.poll_completion() {
                if self.finish_completion(queue, completion, cmd_id, packet) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::hint::spin_loop();
        }
    }

    /// Dispatches one scheme packet. Returns `true` when `packet.a` already
    /// holds the reply (the caller should write it back immediately);
    /// `false` means the reply will arrive later through `irq`.
    pub fn handle(&mut self, packet: &mut libredox::Packet) -> bool {
        let (a, _b, _c, _d) = libredox::flag::decode_usize(packet.a);
        match a {
            libredox::flag::SYS_OPEN => self.handle_open(packet),
            libredox::flag::SYS_READ => self.handle_read(packet),
            libredox::flag::SYS_WRITE => self.handle_write(packet),
            libredox::flag::SYS_FSTAT => self.handle_fstat(packet),
            libredox::flag::SYS_FPATH => self.handle_fpath(packet),
            libredox::flag::SYS_LSEEK => self.handle_lseek(packet),
            libredox::flag::SYS_FSYNC => self.handle_fsync(packet),
            libredox::flag::SYS_CLOSE => self.handle_close(packet),
            libredox::flag::SYS_FTRUNCATE => {
                packet.a = syscall::Error::new(syscall::ENOSYS).to_errno();
                true
            }
            _ => {
                packet.a = syscall::Error::new(syscall::ENOSYS).to_errno();
                true
            }
        }
    }

    fn handle_open(&mut self, packet: &mut libredox::Packet) -> bool {
        let path = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(packet.c as *const u8, packet.d))
        };
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let queue_id = self.queue_counter.fetch_add(1, Ordering::Relaxed) % self.queues.num_queues().max(1);

        if parts.is_empty() {
            self.handles.write().insert(
                handle_id,
                NvmeHandle {
                    is_directory: true,
                    ns_id: 0,
                    ns_info: NamespaceInfo { id: 0, size: 0, block_size: 512, blocks: 0 },
                    queue_id,
                    offset: AtomicU64::new(0),
                    created_at: Instant::now(),
                },
            );
            packet.a = handle_id as usize;
            return true;
        }

        let Ok(ns_id) = parts[0].parse::<u32>() else {
            packet.a = syscall::Error::new(syscall::ENOENT).to_errno();
            return true;
        };
        let Some(ns_info) = self.namespaces.get(&ns_id).copied() else {
            packet.a = syscall::Error::new(syscall::ENODEV).to_errno();
            return true;
        };

        self.handles.write().insert(
            handle_id,
            NvmeHandle {
                is_directory: false,
                ns_id,
                ns_info,
                queue_id,
                offset: AtomicU64::new(0),
                created_at: Instant::now(),
            },
        );
        debug!("nvme: opened namespace {} as handle {}", ns_id, handle_id);
        packet.a = handle_id as usize;
        true
    }

    fn directory_listing(&self) -> String {
        let mut out = String::new();
        for id in self.namespaces.keys() {
            out.push_str(&id.to_string());
            out.push('\n');
        }
        out
    }

    fn handle_read(&mut self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let size = packet.d;

        let is_directory = match self.handles.read().get(&handle_id) {
            Some(h) => h.is_directory,
            None => {
                packet.a = syscall::Error::new(syscall::EBADF).to_errno();
                return true;
            }
        };
        if is_directory {
            let listing = self.directory_listing();
            let handles = self.handles.read();
            let handle = handles.get(&handle_id).unwrap();
            let offset = handle.offset.load(Ordering::Relaxed) as usize;
            let bytes = listing.as_bytes();
            let avail = bytes.len().saturating_sub(offset);
            let n = size.min(avail);
            unsafe {
                std::ptr::copy_nonoverlapping(bytes[offset..offset + n].as_ptr(), packet.c as *mut u8, n);
            }
            handle.offset.store((offset + n) as u64, Ordering::Relaxed);
            packet.a = n;
            return true;
        }

        let (queue_id, ns_info, lba, block_count, phys_addr) = {
            let handles = self.handles.read();
            let handle = handles.get(&handle_id).unwrap();
            let queue_id = self.select_queue(handle);
            let ns_info = handle.ns_info;
            let offset = handle.offset.load(Ordering::Relaxed);
            let lba = offset / ns_info.block_size as u64;
            let block_count = ((size + ns_info.block_size as usize - 1) / ns_info.block_size as usize) as u16;
            handle.offset.store(offset + size as u64, Ordering::Relaxed);
            let phys_addr = if self.config.zero_copy && packet.c & 1 == 1 {
                packet.c & !1
            } else {
                0
            };
            (queue_id, ns_info, lba, block_count, phys_addr)
        };

        let queue = self.queues.get_queue(queue_id).expect("queue index in range");

        let (prp1, prp2, prp_list, bounce) = if phys_addr != 0 {
            let (p1, p2, list) = self.build_prp(phys_addr, size);
            (p1, p2, list, None)
        } else {
            let bounce = match Dma::<[u8]>::zeroed_slice(size.max(1)) {
                Ok(b) => unsafe { b.assume_init() },
                Err(_) => {
                    packet.a = syscall::Error::new(syscall::ENOMEM).to_errno();
                    return true;
                }
            };
            let (p1, p2, list) = self.build_prp(bounce.physical(), size);
            (p1, p2, list, Some(bounce))
        };

        let Some(cmd_id) = queue.submit_read(ns_info.id, lba, block_count, prp1, prp2) else {
            packet.a = syscall::Error::new(syscall::EAGAIN).to_errno();
            return true;
        };
        queue.add_pending(
            cmd_id,
            PendingCommand {
                packet: *packet,
                phys: None,
                bounce,
                prp_list,
                submitted_at: Instant::now(),
                is_write: false,
                bytes: size,
            },
        );
        #[cfg(feature = "performance-counters")]
        {
            GLOBAL_STATS.record_io_submit(size, false);
        }
        self.drive_sync_fastpath(queue, cmd_id, packet)
    }

    fn handle_write(&mut self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let size = packet.d;

        let (queue_id, ns_info, lba, block_count, phys_addr) = {
            let handles = self.handles.read();
            let Some(handle) = handles.get(&handle_id) else {
                packet.a = syscall::Error::new(syscall::EBADF).to_errno();
                return true;
            };
            if handle.is_directory {
                packet.a = syscall::Error::new(syscall::EISDIR).to_errno();
                return true;
            }
            let queue_id = self.select_queue(handle);
            let ns_info = handle.ns_info;
            let offset = handle.offset.load(Ordering::Relaxed);
            let lba = offset / ns_info.block_size as u64;
            let block_count = ((size + ns_info.block_size as usize - 1) / ns_info.block_size as usize) as u16;
            handle.offset.store(offset + size as u64, Ordering::Relaxed);
            let phys_addr = if self.config.zero_copy && packet.c & 1 == 1 {
                packet.c & !1
            } else {
                0
            };
            (queue_id, ns_info, lba, block_count, phys_addr)
        };

        let queue = self.queues.get_queue(queue_id).expect("queue index in range");

        let (prp1, prp2, prp_list, bounce) = if phys_addr != 0 {
            let (p1, p2, list) = self.build_prp(phys_addr, size);
            (p1, p2, list, None)
        } else {
            let mut bounce = match Dma::<[u8]>::zeroed_slice(size.max(1)) {
                Ok(b) => unsafe { b.assume_init() },
                Err(_) => {
                    packet.a = syscall::Error::new(syscall::ENOMEM).to_errno();
                    return true;
                }
            };
            unsafe {
                std::ptr::copy_nonoverlapping(packet.c as *const u8, bounce.as_mut_ptr(), size);
            }
            let (p1, p2, list) = self.build_prp(bounce.physical(), size);
            (p1, p2, list, Some(bounce))
        };

        let Some(cmd_id) = queue.submit_write(ns_info.id, lba, block_count, prp1, prp2) else {
            packet.a = syscall::Error::new(syscall::EAGAIN).to_errno();
            return true;
        };
        queue.add_pending(
            cmd_id,
            PendingCommand {
                packet: *packet,
                phys: None,
                bounce,
                prp_list,
                submitted_at: Instant::now(),
                is_write: true,
                bytes: size,
            },
        );
        #[cfg(feature = "performance-counters")]
        {
            GLOBAL_STATS.record_io_submit(size, true);
        }
        self.drive_sync_fastpath(queue, cmd_id, packet)
    }

    fn handle_fstat(&self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let handles = self.handles.read();
        let Some(handle) = handles.get(&handle_id) else {
            packet.a = syscall::Error::new(syscall::EBADF).to_errno();
            return true;
        };
        let stat = libredox::Stat {
            st_mode: if handle.is_directory { libredox::flag::MODE_DIR } else { libredox::flag::MODE_FILE },
            st_size: handle.ns_info.size,
            st_blksize: handle.ns_info.block_size as u64,
            st_blocks: handle.ns_info.blocks,
            ..Default::default()
        };
        let buf = unsafe { std::slice::from_raw_parts_mut(packet.c as *mut libredox::Stat, 1) };
        buf[0] = stat;
        packet.a = 0;
        true
    }

    fn handle_fpath(&self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let handles = self.handles.read();
        let Some(handle) = handles.get(&handle_id) else {
            packet.a = syscall::Error::new(syscall::EBADF).to_errno();
            return true;
        };
        let path = if handle.is_directory {
            "nvme:".to_string()
        } else {
            format!("nvme:{}/", handle.ns_id)
        };
        let buf = unsafe { std::slice::from_raw_parts_mut(packet.c as *mut u8, packet.d) };
        let n = path.len().min(buf.len());
        buf[..n].copy_from_slice(&path.as_bytes()[..n]);
        packet.a = n;
        true
    }

    fn handle_lseek(&self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let offset = packet.c as i64;
        let whence = packet.d as i32;
        let handles = self.handles.read();
        let Some(handle) = handles.get(&handle_id) else {
            packet.a = syscall::Error::new(syscall::EBADF).to_errno();
            return true;
        };
        let current = handle.offset.load(Ordering::Relaxed) as i64;
        let size = handle.ns_info.size as i64;
        let new_offset = match whence {
            libredox::flag::SEEK_SET => offset,
            libredox::flag::SEEK_CUR => current + offset,
            libredox::flag::SEEK_END => size + offset,
            _ => {
                packet.a = syscall::Error::new(syscall::EINVAL).to_errno();
                return true;
            }
        };
        handle.offset.store(new_offset.max(0) as u64, Ordering::Relaxed);
        packet.a = new_offset.max(0) as usize;
        true
    }

    fn handle_fsync(&mut self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        let (queue_id, ns_id) = {
            let handles = self.handles.read();
            let Some(handle) = handles.get(&handle_id) else {
                packet.a = syscall::Error::new(syscall::EBADF).to_errno();
                return true;
            };
            (self.select_queue(handle), handle.ns_info.id)
        };
        let queue = self.queues.get_queue(queue_id).expect("queue index in range");
        let Some(cmd_id) = queue.submit_flush(ns_id) else {
            packet.a = syscall::Error::new(syscall::EAGAIN).to_errno();
            return true;
        };
        queue.add_pending(
            cmd_id,
            PendingCommand {
                packet: *packet,
                phys: None,
                bounce: None,
                prp_list: None,
                submitted_at: Instant::now(),
                is_write: false,
                bytes: 0,
            },
        );
        self.drive_sync_fastpath(queue, cmd_id, packet)
    }

    fn handle_close(&mut self, packet: &mut libredox::Packet) -> bool {
        let handle_id = packet.b as u64;
        if self.handles.write().remove(&handle_id).is_some() {
            packet.a = 0;
        } else {
            packet.a = syscall::Error::new(syscall::EBADF).to_errno();
        }
        true
    }

    /// Acquires (submits) the command for one dump-path step (spec §4.6):
    /// `nlba == 0` is the terminal flush, anything else a write of `nlba`
    /// blocks at `lba` from `phys_addr`, which the caller has already
    /// mapped to physically contiguous memory -- the dump path never
    /// bounces through a scratch buffer. Returns the PRP list scratch
    /// alongside the command id so the caller can keep it alive until the
    /// command completes.
    fn get_dump_request(
        &self,
        queue: &QueuePair,
        ns_id: u32,
        lba: u64,
        nlba: u32,
        phys_addr: usize,
    ) -> Option<(u16, Option<Dma<[u64]>>)> {
        if nlba == 0 {
            return queue.submit_dump_flush(ns_id).map(|cid| (cid, None));
        }
        let ns_info = self.namespaces.get(&ns_id).copied()?;
        let len = nlba as usize * ns_info.block_size as usize;
        let (prp1, prp2, prp_list) = self.build_prp(phys_addr, len);
        queue
            .submit_dump_write(ns_info.id, lba, nlba as u16, prp1, prp2)
            .map(|cid| (cid, prp_list))
    }

    /// Busy-polls `queue` for `cmd_id`'s completion (spec §4.6): the dump
    /// path must not block on IRQs or condvars, since neither is reliably
    /// available once the kernel has started a crash dump.
    fn poll_request(&self, queue: &QueuePair, cmd_id: u16) -> syscall::Result<()> {
        loop {
            if let Some(completion) = queue.poll_completion() {
                if completion.command_id == cmd_id {
                    return if completion.status == 0 {
                        Ok(())
                    } else {
                        Err(syscall::Error::new(syscall::EIO))
                    };
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Dump-path entry point (spec §4.6): called once per chunk with
    /// physically contiguous memory the caller already mapped, bypassing
    /// the scheme packet protocol and the normal blocking SQ lock
    /// entirely. The terminal call (`nlba == 0`) flushes instead of
    /// writing and shuts the controller down -- the last I/O a crash dump
    /// ever issues.
    pub fn dump_write(&mut self, ns_id: u32, lba: u64, nlba: u32, phys_addr: usize) -> syscall::Result<()> {
        let queue = self.queues.get_queue(0).expect("at least one I/O queue");
        let (cmd_id, _prp_list) = self
            .get_dump_request(queue, ns_id, lba, nlba, phys_addr)
            .ok_or_else(|| syscall::Error::new(syscall::EAGAIN))?;
        self.poll_request(queue, cmd_id)?;
        if nlba == 0 {
            return self
                .controller
                .shutdown(&self.io_qids)
                .map_err(|_| syscall::Error::new(syscall::EIO));
        }
        Ok(())
    }
}

impl Drop for NvmeScheme {
    fn drop(&mut self) {
        info!("nvme: shutting down");
        for queue in self.queues.iter() {
            queue.wait_idle();
        }
        let _ = self.controller.shutdown(&self.io_qids);
    }
}
