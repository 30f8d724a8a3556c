// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! NVMe scheme daemon: maps the controller's register BAR, brings a
//! `nvme::Controller` up, and serves `nvme:<nsid>/` through a Redox scheme
//! file plus one IRQ file per I/O queue.

use std::fs::File;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::Arc;
use std::thread;

use event::{Event, EventQueue};
use log::{error, info};
use parking_lot::Mutex;
use pcid_interface::PciFunctionHandle;

use crate::config::DriverConfig;
use crate::scheme::NvmeScheme;

mod config;
mod queue;
mod scheme;
mod stats;

/// PCI config-space offset of BAR0.
const PCI_BAR0_OFFSET: u16 = 0x10;
/// Bytes mapped for the register BAR: enough for CAP..CMBSZ plus a few
/// thousand doorbell-register slots (spec §6).
const BAR0_MAP_SIZE: usize = 0x3000;

fn main() {
    redox_log::init!();
    info!("starting nvme driver");

    let pci_handle = unsafe {
        libredox::call::open(
            "pci:class=010802",
            libredox::flag::O_RDWR | libredox::flag::O_CLOEXEC,
        )
        .expect("nvme: failed to open pci function")
    };

    let mut pci = PciFunctionHandle::from_raw_fd(pci_handle as RawFd);
    let bar0_raw = pci
        .read_config_u32(PCI_BAR0_OFFSET)
        .expect("nvme: failed to read BAR0");
    let bar0_phys = (bar0_raw & !0xF) as usize;

    let bar0 = unsafe {
        syscall::physmap(bar0_phys, BAR0_MAP_SIZE, syscall::PhysmapFlags::PHYSMAP_WRITE)
            .expect("nvme: failed to map register BAR")
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = args
        .first()
        .map(|a| DriverConfig::from_args(a))
        .unwrap_or_default();

    let scheme_file = libredox::call::open(
        "nvme:",
        libredox::flag::O_RDWR | libredox::flag::O_CREAT | libredox::flag::O_CLOEXEC,
    )
    .expect("nvme: failed to create nvme scheme");
    let scheme_fd = scheme_file as RawFd;

    let scheme = NvmeScheme::new(bar0, scheme_fd, config).expect("nvme: failed to bring up controller");
    let num_queues = scheme.queue_count();
    let scheme = Arc::new(Mutex::new(scheme));

    let mut threads = Vec::new();
    for queue_index in 0..num_queues {
        let scheme = Arc::clone(&scheme);
        threads.push(thread::spawn(move || {
            let mut event_queue = EventQueue::<()>::new().expect("nvme: failed to create event queue");
            let irq_file = File::open(format!("irq:{}", queue_index)).expect("nvme: failed to open irq file");
            let irq_fd = irq_file.into_raw_fd();

            event_queue
                .add(irq_fd, move |_: Event| {
                    let mut irq_buf = [0u8; 8];
                    let bytes = syscall::read(irq_fd, &mut irq_buf).expect("nvme: failed to read irq file");
                    if bytes == 8 {
                        scheme.lock().irq(queue_index);
                        syscall::write(irq_fd, &irq_buf).expect("nvme: failed to write irq file");
                    }
                    Ok(None)
                })
                .expect("nvme: failed to listen to irq events");

            loop {
                if let Err(err) = event_queue.run() {
                    error!("nvme: irq event loop failed: {}", err);
                }
            }
        }));
    }

    let mut event_queue = EventQueue::<()>::new().expect("nvme: failed to create event queue");
    event_queue
        .add(scheme_fd, move |_: Event| {
            loop {
                let mut packet = libredox::Packet::default();
                match syscall::read(scheme_fd, &mut packet) {
                    Ok(0) => break,
                    Ok(_) => {
                        if scheme.lock().handle(&mut packet) {
                            let _ = syscall::write(scheme_fd, &packet);
                        }
                    }
                    Err(err) if err.errno == syscall::EAGAIN => break,
                    Err(err) => {
                        error!("nvme: failed to read scheme: {}", err);
                        break;
                    }
                }
            }
            Ok(None)
        })
        .expect("nvme: failed to listen to scheme events");

    loop {
        if let Err(err) = event_queue.run() {
            error!("nvme: scheme event loop failed: {}", err);
        }
    }
}
