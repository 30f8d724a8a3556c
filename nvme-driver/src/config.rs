// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver-wide configuration (spec's Configuration section): queue sizing,
//! the I/O scheduling policy `scheme.rs` asks `select_queue`/the scheduler
//! for, and the synchronous fast-path tuning knobs.

use std::time::Duration;

/// Which `io_scheduler` policy to build for the I/O queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSchedulerType {
    /// No reordering or batching; submit in arrival order.
    None,
    /// Spread requests evenly across queue pairs.
    RoundRobin,
    /// Pin each CPU's requests to its own queue pair.
    CpuAffinity,
    /// Service higher-`IoPriority` requests first within a queue.
    Priority,
    /// Order by soonest deadline first.
    Deadline,
}

impl Default for IoSchedulerType {
    fn default() -> Self {
        IoSchedulerType::CpuAffinity
    }
}

/// Driver-wide tunables, normally populated from defaults and overridden by
/// kernel command line or scheme-mount arguments.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Requested I/O submission/completion queue depth (clamped to
    /// `CAP.MQES` by `nvme-core`).
    pub queue_depth: u16,
    /// Number of I/O queue pairs to request; `None` means "one per CPU,
    /// falling back per `QueueMapStrategy::select`".
    pub queue_count: Option<u16>,
    pub scheduler: IoSchedulerType,
    /// Submit and busy-poll inline for requests under this size instead of
    /// returning `EAGAIN` and waiting for the IRQ-driven event loop.
    pub sync_fastpath_enabled: bool,
    /// Upper bound on how long the synchronous fast path may busy-poll
    /// before falling back to the async path.
    pub sync_fastpath_budget: Duration,
    /// Enables zero-copy PRP construction directly from the caller's
    /// mapped buffer instead of bouncing through a staging page.
    pub zero_copy: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            queue_depth: 256,
            queue_count: None,
            scheduler: IoSchedulerType::default(),
            sync_fastpath_enabled: true,
            sync_fastpath_budget: Duration::from_micros(50),
            zero_copy: true,
        }
    }
}

impl DriverConfig {
    /// Parses `key=value,key=value` scheme-mount arguments, falling back to
    /// defaults for anything unrecognized or malformed.
    pub fn from_args(args: &str) -> Self {
        let mut cfg = DriverConfig::default();
        for pair in args.split(',') {
            let mut it = pair.splitn(2, '=');
            let (Some(key), Some(value)) = (it.next(), it.next()) else {
                continue;
            };
            match key.trim() {
                "queue_depth" => {
                    if let Ok(v) = value.trim().parse() {
                        cfg.queue_depth = v;
                    }
                }
                "queue_count" => {
                    if let Ok(v) = value.trim().parse() {
                        cfg.queue_count = Some(v);
                    }
                }
                "scheduler" => {
                    cfg.scheduler = match value.trim() {
                        "none" => IoSchedulerType::None,
                        "round_robin" => IoSchedulerType::RoundRobin,
                        "cpu_affinity" => IoSchedulerType::CpuAffinity,
                        "priority" => IoSchedulerType::Priority,
                        "deadline" => IoSchedulerType::Deadline,
                        _ => cfg.scheduler,
                    };
                }
                "sync_fastpath" => {
                    cfg.sync_fastpath_enabled = value.trim() != "off" && value.trim() != "0";
                }
                "zero_copy" => {
                    cfg.zero_copy = value.trim() != "off" && value.trim() != "0";
                }
                _ => {}
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DriverConfig::default();
        assert!(cfg.queue_depth > 0);
        assert!(cfg.sync_fastpath_enabled);
    }

    #[test]
    fn parses_recognized_keys_and_ignores_unknown_ones() {
        let cfg = DriverConfig::from_args("queue_depth=64,scheduler=round_robin,bogus=1,sync_fastpath=off");
        assert_eq!(cfg.queue_depth, 64);
        assert_eq!(cfg.scheduler, IoSchedulerType::RoundRobin);
        assert!(!cfg.sync_fastpath_enabled);
    }

    #[test]
    fn malformed_pairs_are_skipped_without_panicking() {
        let cfg = DriverConfig::from_args("queue_depth,=5,,scheduler=priority");
        assert_eq!(cfg.scheduler, IoSchedulerType::Priority);
    }
}
