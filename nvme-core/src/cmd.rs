//! Submission/completion entry wire layouts and the command builders the
//! admin thread and disk adapter use to fill submission-queue slots (spec
//! §4.3, §4.5, §4.6, §6).

/// A 64-byte NVMe submission queue entry, decoded field-by-field rather
/// than as an opaque byte blob so builders can't transpose a dword.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct NvmeCmd {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCmd {
    pub const fn empty() -> Self {
        NvmeCmd {
            opcode: 0,
            flags: 0,
            cid: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

/// A 16-byte NVMe completion queue entry.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct NvmeComp {
    pub command_specific: u32,
    pub reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

impl NvmeComp {
    /// Phase bit: toggles each time the completion queue wraps (spec §4.4).
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// Status Code + Status Code Type, with the phase bit masked off.
    pub fn status_code(&self) -> u16 {
        (self.status >> 1) & 0x7FFF
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == 0
    }
}

pub mod admin_opcode {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
}

pub mod nvm_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
}

pub mod feature {
    pub const NUM_QUEUES: u32 = 0x07;
}

/// CNS values for the Identify command (spec §4.5).
pub mod cns {
    pub const NAMESPACE: u32 = 0x00;
    pub const CONTROLLER: u32 = 0x01;
    pub const NAMESPACE_LIST: u32 = 0x02;
}

pub fn identify_controller(cid: u16, prp1: u64) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::IDENTIFY,
        cid,
        prp1,
        cdw10: cns::CONTROLLER,
        ..NvmeCmd::empty()
    }
}

pub fn identify_namespace(cid: u16, nsid: u32, prp1: u64) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::IDENTIFY,
        cid,
        nsid,
        prp1,
        cdw10: cns::NAMESPACE,
        ..NvmeCmd::empty()
    }
}

pub fn identify_namespace_list(cid: u16, base_nsid: u32, prp1: u64) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::IDENTIFY,
        cid,
        prp1,
        cdw10: cns::NAMESPACE_LIST,
        cdw11: base_nsid,
        ..NvmeCmd::empty()
    }
}

/// Requests `count` I/O queue pairs (1-based, per spec §4.2/§4.5); the
/// controller may grant fewer and the admin thread must re-read CDW0.
pub fn set_features_num_queues(cid: u16, count: u16) -> NvmeCmd {
    let dw11 = ((count as u32 - 1) << 16) | (count as u32 - 1);
    NvmeCmd {
        opcode: admin_opcode::SET_FEATURES,
        cid,
        cdw10: feature::NUM_QUEUES,
        cdw11: dw11,
        ..NvmeCmd::empty()
    }
}

/// `qid` 1-based I/O queue id, `qsize` 0-based max entry index (spec §4.2).
pub fn create_io_completion_queue(cid: u16, qid: u16, qsize: u16, prp1: u64, vector: u16) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::CREATE_IO_CQ,
        cid,
        prp1,
        cdw10: (qsize as u32) << 16 | qid as u32,
        cdw11: (vector as u32) << 16 | 0b01, // physically contiguous, interrupts enabled
        ..NvmeCmd::empty()
    }
}

pub fn create_io_submission_queue(cid: u16, qid: u16, qsize: u16, prp1: u64, cqid: u16) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::CREATE_IO_SQ,
        cid,
        prp1,
        cdw10: (qsize as u32) << 16 | qid as u32,
        cdw11: (cqid as u32) << 16 | 0b01, // physically contiguous, medium priority
        ..NvmeCmd::empty()
    }
}

pub fn delete_io_submission_queue(cid: u16, qid: u16) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::DELETE_IO_SQ,
        cid,
        cdw10: qid as u32,
        ..NvmeCmd::empty()
    }
}

pub fn delete_io_completion_queue(cid: u16, qid: u16) -> NvmeCmd {
    NvmeCmd {
        opcode: admin_opcode::DELETE_IO_CQ,
        cid,
        cdw10: qid as u32,
        ..NvmeCmd::empty()
    }
}

/// `lba`/`blocks` are 0-based start and 0-based "count minus one", the wire
/// convention spec §4.6 uses for the block-I/O verbs.
pub fn io_read(cid: u16, nsid: u32, lba: u64, blocks: u16, prp1: u64, prp2: u64) -> NvmeCmd {
    NvmeCmd {
        opcode: nvm_opcode::READ,
        cid,
        nsid,
        prp1,
        prp2,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        cdw12: blocks as u32,
        ..NvmeCmd::empty()
    }
}

pub fn io_write(cid: u16, nsid: u32, lba: u64, blocks: u16, prp1: u64, prp2: u64) -> NvmeCmd {
    NvmeCmd {
        opcode: nvm_opcode::WRITE,
        cid,
        nsid,
        prp1,
        prp2,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        cdw12: blocks as u32,
        ..NvmeCmd::empty()
    }
}

pub fn io_flush(cid: u16, nsid: u32) -> NvmeCmd {
    NvmeCmd {
        opcode: nvm_opcode::FLUSH,
        cid,
        nsid,
        ..NvmeCmd::empty()
    }
}

/// Write Zeroes, the command the disk adapter's FREEBLKS verb maps onto
/// (spec §4.6): `lba`/`blocks` use the same 0-based start/count-minus-one
/// convention as `io_read`/`io_write`, and no data region is needed since
/// the controller synthesizes zeroes itself.
pub fn io_write_zeroes(cid: u16, nsid: u32, lba: u64, blocks: u16) -> NvmeCmd {
    NvmeCmd {
        opcode: nvm_opcode::WRITE_ZEROES,
        cid,
        nsid,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        cdw12: blocks as u32,
        ..NvmeCmd::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(std::mem::size_of::<NvmeCmd>(), 64);
        assert_eq!(std::mem::size_of::<NvmeComp>(), 16);
    }

    #[test]
    fn write_zeroes_uses_zero_based_lba_and_count() {
        let cmd = io_write_zeroes(7, 1, 0x1_0000_0000, 99);
        assert_eq!(cmd.opcode, nvm_opcode::WRITE_ZEROES);
        assert_eq!(cmd.cdw10, 0);
        assert_eq!(cmd.cdw11, 1);
        assert_eq!(cmd.cdw12, 99);
    }

    #[test]
    fn phase_bit_is_low_bit_of_status() {
        let mut comp = NvmeComp {
            command_specific: 0,
            reserved: 0,
            sq_head: 0,
            sq_id: 0,
            cid: 0,
            status: 0,
        };
        assert!(!comp.phase());
        comp.status = 1;
        assert!(comp.phase());
        assert!(comp.is_success());
    }

    #[test]
    fn num_queues_feature_is_zero_based() {
        let cmd = set_features_num_queues(5, 4);
        assert_eq!(cmd.cdw11 & 0xFFFF, 3);
        assert_eq!((cmd.cdw11 >> 16) & 0xFFFF, 3);
    }
}
