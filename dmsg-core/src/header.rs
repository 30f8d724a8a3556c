//! Wire header layout (spec §6) and the `cmd` bitfield (spec §3 "Command
//! bits"). The header is always decoded into this native struct and never
//! mutated in place on the wire buffer (spec §9 design note) -- encoding
//! and decoding live in `codec.rs`; this module only defines the shapes.

use bitflags::bitflags;

/// Little-endian magic. `MAGIC_REV` (the byte-swapped form) on the wire
/// means the peer is the opposite endianness; the whole header gets
/// swapped back during decode (spec §6, §4.8).
pub const MAGIC: u16 = 0x4832;
pub const MAGIC_REV: u16 = MAGIC.swap_bytes();

/// Fixed prefix size in bytes (spec §6); `cmd.SIZE` is expressed in
/// multiples of this alignment, and the extended header -- if any -- pads
/// out to a multiple of it too.
pub const DMSG_ALIGN: usize = 64;

/// Hard cap on aux-data size (spec §6, §4.8).
pub const MAX_AUX_BYTES: u32 = 1 << 20;

bitflags! {
    /// High byte of `cmd` (spec §3 "Command bits", §6).
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DmsgFlags: u32 {
        /// Opens a new transaction (child state under the circuit's
        /// governing state).
        const CREATE   = 0x8000_0000;
        /// Closes this side's half of a transaction.
        const DELETE   = 0x4000_0000;
        /// This message is a reply (writer/reader tree selection flips).
        const REPLY    = 0x2000_0000;
        /// Mid-stream cancel, carried alongside CREATE/DELETE.
        const ABORT    = 0x1000_0000;
        /// `msgid` belongs to the opposite side's namespace.
        const REVTRANS = 0x0800_0000;
        /// `circuit` belongs to the opposite side's namespace.
        const REVCIRC  = 0x0400_0000;
    }
}

const SIZE_SHIFT: u32 = 16;
const SIZE_MASK: u32 = 0x00FF_0000;
const BASECMD_MASK: u32 = 0x0000_FFFF;
const FLAGS_MASK: u32 = 0xFF00_0000;

/// The `cmd` dword: base opcode (low 16 bits), extended-header size in
/// `DMSG_ALIGN`-byte units (next byte), and transaction/circuit flag bits
/// (top byte). Kept as a thin newtype rather than raw `u32` so flag tests
/// read as `cmd.flags().contains(DmsgFlags::CREATE)` instead of bare
/// bit-masking at every call site.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DmsgCmd(pub u32);

impl DmsgCmd {
    pub fn new(basecmd: u16, size_units: u8, flags: DmsgFlags) -> Self {
        DmsgCmd(basecmd as u32 | ((size_units as u32) << SIZE_SHIFT) | flags.bits())
    }

    pub fn basecmd(self) -> u16 {
        (self.0 & BASECMD_MASK) as u16
    }

    pub fn size_units(self) -> u8 {
        ((self.0 & SIZE_MASK) >> SIZE_SHIFT) as u8
    }

    /// Total header size in bytes, `SIZE * DMSG_ALIGN` (spec §6, §4.8).
    pub fn hdr_bytes(self) -> usize {
        self.size_units() as usize * DMSG_ALIGN
    }

    pub fn flags(self) -> DmsgFlags {
        DmsgFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn with_flags(self, flags: DmsgFlags) -> Self {
        DmsgCmd((self.0 & !FLAGS_MASK) | flags.bits())
    }

    /// `cmd` with the transaction-closing bits stripped, used when seeding
    /// a new state's `rxcmd`/`txcmd` (spec §4.10).
    pub fn without(self, flags: DmsgFlags) -> Self {
        self.with_flags(self.flags() - flags)
    }

    pub fn swap_bytes(self) -> Self {
        DmsgCmd(self.0.swap_bytes())
    }
}

/// The fixed 64-byte header prefix (spec §6), decoded into native byte
/// order regardless of wire endianness.
#[derive(Clone, Copy, Debug)]
pub struct DmsgHeader {
    pub magic: u16,
    pub salt: u32,
    pub msgid: u64,
    pub circuit: u64,
    pub cmd: DmsgCmd,
    pub aux_crc: u32,
    pub aux_bytes: u32,
    pub error: u32,
    pub aux_descr: u64,
    /// CRC32C over the full extended header with this field zeroed.
    pub hdr_crc: u32,
}

impl DmsgHeader {
    /// Aux length rounded up to `DMSG_ALIGN`, the length actually carried
    /// (and CRC'd) on the wire (spec §3, §6, §4.8).
    pub fn aligned_aux_bytes(&self) -> u32 {
        align_up(self.aux_bytes, DMSG_ALIGN as u32)
    }

    pub fn low_seq_byte(&self) -> u8 {
        (self.salt & 0xFF) as u8
    }
}

pub fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}
