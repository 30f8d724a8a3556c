//! Message and extended-header shapes (spec §3 "Message", §4.8).
//!
//! The extended header is modeled as a tagged sum selected by base opcode
//! (spec §9 design note: "model the extended header as a tagged sum whose
//! variants are selected by opcode" instead of a C-style max-sized union).
//! The raw bytes are always retained alongside the interpreted view so
//! round-trip re-encoding never has to reconstruct bytes it never decoded
//! (spec §8's encode/decode round-trip property).

use crate::header::DmsgHeader;

/// Base opcodes the DMSG wire format defines: `Lnk`, `Dbg`, and catch-all
/// `Raw`. Anything outside this set decodes as `ExtendedHeader::Raw` rather
/// than being rejected.
pub mod opcode {
    pub const LNK_PAD: u16 = 0x0000;
    pub const LNK_PING: u16 = 0x0001;
    pub const LNK_AUTH: u16 = 0x0002;
    pub const LNK_SPAN: u16 = 0x0003;
    pub const LNK_CIRC: u16 = 0x0004;
    pub const LNK_ERROR: u16 = 0x0005;
    pub const DBG_SHELL: u16 = 0x0010;
    pub const DBG_ECHO: u16 = 0x0011;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LnkBody {
    Ping,
    Auth { keyid: u64 },
    Span { dist: u32, label: [u8; 16] },
    Circ { target: u64 },
    Error { code: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbgBody {
    Shell,
    Echo,
}

/// A fully interpreted extended header. `Raw` is the catch-all for any
/// opcode not specifically modeled here -- its bytes are exactly the
/// `ext_bytes` the message was decoded with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtendedHeader {
    Lnk(LnkBody),
    Dbg(DbgBody),
    Raw(Vec<u8>),
}

/// A received or to-be-sent message: the fixed header, the raw extended
/// header bytes (source of truth for re-encoding), and the aux-data blob
/// (spec §3 "Message", ≤ 1 MiB, aligned on the wire).
#[derive(Clone, Debug)]
pub struct Message {
    pub header: DmsgHeader,
    /// Raw bytes of the extended header, length `header.cmd.hdr_bytes() -
    /// DMSG_ALIGN`. Empty when `size_units() <= 1`.
    pub ext_bytes: Vec<u8>,
    /// Raw aux-data payload, `header.aux_bytes` long (unaligned; the wire
    /// padding up to `aligned_aux_bytes()` is not retained here).
    pub aux: Vec<u8>,
}

impl Message {
    /// Interprets `ext_bytes` according to the header's base opcode. Best
    /// effort: an unmodeled basecmd, or a body too short for its expected
    /// shape, falls back to `Raw`.
    pub fn extended_header(&self) -> ExtendedHeader {
        match self.header.cmd.basecmd() {
            opcode::LNK_PING => ExtendedHeader::Lnk(LnkBody::Ping),
            opcode::LNK_AUTH if self.ext_bytes.len() >= 8 => ExtendedHeader::Lnk(LnkBody::Auth {
                keyid: u64::from_le_bytes(self.ext_bytes[0..8].try_into().unwrap()),
            }),
            opcode::LNK_SPAN if self.ext_bytes.len() >= 20 => ExtendedHeader::Lnk(LnkBody::Span {
                dist: u32::from_le_bytes(self.ext_bytes[0..4].try_into().unwrap()),
                label: self.ext_bytes[4..20].try_into().unwrap(),
            }),
            opcode::LNK_CIRC if self.ext_bytes.len() >= 8 => ExtendedHeader::Lnk(LnkBody::Circ {
                target: u64::from_le_bytes(self.ext_bytes[0..8].try_into().unwrap()),
            }),
            opcode::LNK_ERROR if self.ext_bytes.len() >= 4 => ExtendedHeader::Lnk(LnkBody::Error {
                code: u32::from_le_bytes(self.ext_bytes[0..4].try_into().unwrap()),
            }),
            opcode::DBG_SHELL => ExtendedHeader::Dbg(DbgBody::Shell),
            opcode::DBG_ECHO => ExtendedHeader::Dbg(DbgBody::Echo),
            _ => ExtendedHeader::Raw(self.ext_bytes.clone()),
        }
    }
}
