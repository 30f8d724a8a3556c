//! Minimal client interface to the Redox PCI configuration-space daemon.
//!
//! This is the slice of the real `pcid-interface` crate the NVMe core needs:
//! a function handle for reading/writing config space and a view of the
//! MSI-X capability's vector table. Bus enumeration, hot-plug and the rest
//! of `pcid` itself are out of scope here (spec: "PCI bus attach glue beyond
//! what the NVMe core requires").

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use syscall::error::Result;

/// A connection to `pcid` for a single PCI function, used to read/write its
/// configuration space and to map its MSI-X vector table.
pub struct PciFunctionHandle {
    cfg_fd: File,
}

impl PciFunctionHandle {
    /// Wraps an already-open config-space file descriptor (the caller
    /// obtained it the way `nvme-driver`'s `main` opens `pci:class=010802`).
    pub fn from_raw_fd(fd: RawFd) -> Self {
        PciFunctionHandle {
            cfg_fd: unsafe { File::from_raw_fd(fd) },
        }
    }

    pub fn read_config_u32(&mut self, offset: u16) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.cfg_fd
            .seek(SeekFrom::Start(offset as u64))
            .ok();
        let _ = self.cfg_fd.read_exact(&mut buf);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_config_u32(&mut self, offset: u16, value: u32) -> Result<()> {
        self.cfg_fd
            .seek(SeekFrom::Start(offset as u64))
            .ok();
        let _ = self.cfg_fd.write_all(&value.to_le_bytes());
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.cfg_fd.as_raw_fd()
    }
}

/// A single 16-byte entry in a mapped MSI-X vector table (one per interrupt
/// vector): message address, message data, and a vector control word whose
/// bit 0 is the per-vector mask.
#[repr(C)]
pub struct MsixTableEntry {
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub msg_data: u32,
    pub vector_ctl: u32,
}

impl MsixTableEntry {
    pub fn set_masked(&mut self, masked: bool) {
        let ctl = unsafe { core::ptr::read_volatile(&self.vector_ctl) };
        let new = if masked { ctl | 1 } else { ctl & !1 };
        unsafe { core::ptr::write_volatile(&mut self.vector_ctl, new) };
    }

    pub fn unmask(&mut self) {
        self.set_masked(false);
    }
}

/// A mapped MSI-X capability: the vector table base plus entry count, as
/// negotiated with `pcid` at attach time.
pub struct MappedMsixRegs {
    table: *mut MsixTableEntry,
    count: u16,
}

unsafe impl Send for MappedMsixRegs {}

impl MappedMsixRegs {
    /// # Safety
    /// `table` must point at a live, `count`-entry MSI-X vector table for
    /// the lifetime of this handle (owned by the `pcid` BAR mapping).
    pub unsafe fn new(table: *mut MsixTableEntry, count: u16) -> Self {
        MappedMsixRegs { table, count }
    }

    pub fn vector_count(&self) -> u16 {
        self.count
    }

    pub fn table_entry_pointer(&mut self, vector: u16) -> &mut MsixTableEntry {
        assert!(vector < self.count, "pcid-interface: MSI-X vector out of range");
        unsafe { &mut *self.table.add(vector as usize) }
    }
}
