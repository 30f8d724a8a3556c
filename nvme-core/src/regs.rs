//! MMIO register layout (spec §6, BAR0) and the decoded capability snapshot
//! taken once at attach.

use common::io::{Io, Mmio};

#[repr(C, packed)]
pub struct NvmeRegs {
    /// Controller Capabilities (low/high halves of the 64-bit CAP register).
    pub cap_low: Mmio<u32>,
    pub cap_high: Mmio<u32>,
    /// Version
    pub vs: Mmio<u32>,
    /// Interrupt mask set / clear
    pub intms: Mmio<u32>,
    pub intmc: Mmio<u32>,
    /// Controller configuration
    pub cc: Mmio<u32>,
    _rsvd: Mmio<u32>,
    /// Controller status
    pub csts: Mmio<u32>,
    /// NVM subsystem reset
    pub nssr: Mmio<u32>,
    /// Admin queue attributes
    pub aqa: Mmio<u32>,
    /// Admin submission/completion queue base addresses
    pub asq_low: Mmio<u32>,
    pub asq_high: Mmio<u32>,
    pub acq_low: Mmio<u32>,
    pub acq_high: Mmio<u32>,
    /// Controller memory buffer location/size
    pub cmbloc: Mmio<u32>,
    pub cmbsz: Mmio<u32>,
}

/// CONFIG.EN
pub const CC_EN: u32 = 1 << 0;
/// CONFIG.SHUT_NORM (normal shutdown notification, CC.SHN = 01b)
pub const CC_SHN_NORMAL: u32 = 1 << 14;
pub const CC_SHN_MASK: u32 = 0b11 << 14;

/// STATUS.RDY
pub const CSTS_RDY: u32 = 1 << 0;
/// STATUS.FATAL
pub const CSTS_CFS: u32 = 1 << 1;
/// STATUS.SHUT (2 bits: 00 not occurring, 01 occurring, 10 complete)
pub const CSTS_SHST_MASK: u32 = 0b11 << 2;
pub const CSTS_SHST_DONE: u32 = 0b10 << 2;
/// STATUS.PAUSED / STATUS.SUBRESET (post-1.4 controllers)
pub const CSTS_PAUSED: u32 = 1 << 4;
pub const CSTS_SUBRESET: u32 = 1 << 5;

/// Decoded view of the 64-bit CAP register, taken once at attach so the
/// rest of the driver never has to re-mask raw bits (spec §4.1/§6).
#[derive(Debug, Clone, Copy)]
pub struct ControllerCaps {
    /// Maximum queue entries supported, 0-based in the register; this is
    /// already resolved to the real (1-based) maximum.
    pub mqes: u16,
    /// Contiguous Queues Required.
    pub cqr: bool,
    /// Arbitration Mechanism Supported (weighted round robin etc).
    pub ams: u8,
    /// Worst-case time for CSTS.RDY to flip after CC.EN flips, in 500ms units.
    pub timeout_500ms: u8,
    /// Doorbell Stride (the register offset multiplier is `4 << dstrd`).
    pub dstrd: u8,
    /// NVM Subsystem Reset Supported.
    pub subreset_supported: bool,
    /// Command Sets Supported bitmap.
    pub css: u8,
    /// log2(minimum host memory page size) - 12.
    pub mempg_min: u8,
    /// log2(maximum host memory page size) - 12.
    pub mempg_max: u8,
}

impl ControllerCaps {
    pub fn decode(cap_low: u32, cap_high: u32) -> Self {
        let cap = (cap_low as u64) | ((cap_high as u64) << 32);
        ControllerCaps {
            mqes: (cap & 0xFFFF) as u16 + 1,
            cqr: (cap >> 16) & 1 != 0,
            ams: ((cap >> 17) & 0b11) as u8,
            timeout_500ms: ((cap >> 24) & 0xFF) as u8,
            dstrd: ((cap >> 32) & 0xF) as u8,
            subreset_supported: (cap >> 36) & 1 != 0,
            css: ((cap >> 37) & 0xFF) as u8,
            mempg_min: ((cap >> 48) & 0xF) as u8,
            mempg_max: ((cap >> 52) & 0xF) as u8,
        }
    }

    /// Page size implied by MEMPG_MIN, per spec §4.2.
    pub fn page_size(&self) -> usize {
        1usize << (12 + self.mempg_min as usize)
    }

    /// `CAP.TIMEOUT` as a `Duration`, with the "+1 fudge" spec §4.1 calls for.
    pub fn enable_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(500 * (self.timeout_500ms as u64 + 1))
    }
}
