//! Wire encode/decode for the fixed 64-byte header (spec §6). Endian
//! handling and CRC verification live here; `decoder.rs` drives this
//! module incrementally against a streaming FIFO, and `egress.rs` drives
//! the encode half against the outbound FIFO. `codec::encode`/`decode`
//! are also the single-shot round-trip entry points spec §8 tests against
//! directly.

use crate::crc::crc32c;
use crate::error::DmsgError;
use crate::header::{align_up, DmsgCmd, DmsgHeader, DMSG_ALIGN, MAGIC, MAGIC_REV, MAX_AUX_BYTES};
use crate::message::Message;

/// Upper bound on total header size (fixed + extended), spec §6. Bounded at
/// 16 alignment units (1 KiB), comfortably larger than any `Lnk`/`Dbg` body
/// this codec decodes.
pub const MAX_HDR_BYTES: usize = 16 * DMSG_ALIGN;

const OFF_MAGIC: usize = 0;
const OFF_SALT: usize = 4;
const OFF_MSGID: usize = 8;
const OFF_CIRCUIT: usize = 16;
const OFF_CMD: usize = 32;
const OFF_AUX_CRC: usize = 36;
const OFF_AUX_BYTES: usize = 40;
const OFF_ERROR: usize = 44;
const OFF_AUX_DESCR: usize = 48;
const OFF_HDR_CRC: usize = 60;

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Writes the fixed header into the first `DMSG_ALIGN` bytes of `buf`
/// (which must be at least that long), `hdr_crc` left zero -- the caller
/// fills it in once the extended header bytes that follow are known.
fn put_header_fields(buf: &mut [u8], h: &DmsgHeader) {
    put_u16(buf, OFF_MAGIC, h.magic);
    put_u32(buf, OFF_SALT, h.salt);
    put_u64(buf, OFF_MSGID, h.msgid);
    put_u64(buf, OFF_CIRCUIT, h.circuit);
    put_u32(buf, OFF_CMD, h.cmd.0);
    put_u32(buf, OFF_AUX_CRC, h.aux_crc);
    put_u32(buf, OFF_AUX_BYTES, h.aux_bytes);
    put_u32(buf, OFF_ERROR, h.error);
    put_u64(buf, OFF_AUX_DESCR, h.aux_descr);
    put_u32(buf, OFF_HDR_CRC, 0);
}

/// Encodes `header` (with `header.hdr_crc`/`aux_crc` recomputed) plus
/// `ext_bytes` plus `aux`, padded to alignment, into one contiguous wire
/// buffer ready for `writev`-style transmission.
pub fn encode(header: &DmsgHeader, ext_bytes: &[u8], aux: &[u8]) -> Vec<u8> {
    let hbytes = header.cmd.hdr_bytes().max(DMSG_ALIGN);
    let abytes = align_up(aux.len() as u32, DMSG_ALIGN as u32) as usize;

    let mut out = vec![0u8; hbytes + abytes];
    put_header_fields(&mut out[..DMSG_ALIGN], header);
    let ext_len = ext_bytes.len().min(hbytes - DMSG_ALIGN);
    out[DMSG_ALIGN..DMSG_ALIGN + ext_len].copy_from_slice(&ext_bytes[..ext_len]);

    out[hbytes..hbytes + aux.len()].copy_from_slice(aux);

    let aux_crc = crc32c(&out[hbytes..hbytes + abytes]);
    put_u32(&mut out[..hbytes], OFF_AUX_CRC, aux_crc);

    let hdr_crc = crc32c(&out[..hbytes]);
    put_u32(&mut out[..hbytes], OFF_HDR_CRC, hdr_crc);

    out
}

/// Result of peeking at the first `DMSG_ALIGN` bytes: whether the stream
/// is byte-swapped, and the total header/aux byte counts once any
/// swapping is accounted for (spec §4.8 HEADER1 stage).
pub struct HeaderPreamble {
    pub rev: bool,
    pub hbytes: usize,
    pub abytes: usize,
}

/// Validates the magic and extracts just enough to size the rest of the
/// message (spec §4.8 HEADER1). Does not verify CRCs -- those require the
/// full extended header, available only once `hbytes` bytes have arrived.
pub fn peek_preamble(buf: &[u8]) -> Result<HeaderPreamble, DmsgError> {
    debug_assert!(buf.len() >= DMSG_ALIGN);
    let raw_magic = get_u16(buf, OFF_MAGIC);
    let rev = match raw_magic {
        m if m == MAGIC => false,
        m if m == MAGIC_REV => true,
        _ => return Err(DmsgError::Sync),
    };
    let mut cmd_raw = get_u32(buf, OFF_CMD);
    let mut aux_bytes_raw = get_u32(buf, OFF_AUX_BYTES);
    if rev {
        cmd_raw = cmd_raw.swap_bytes();
        aux_bytes_raw = aux_bytes_raw.swap_bytes();
    }
    let hbytes = DmsgCmd(cmd_raw).hdr_bytes().max(DMSG_ALIGN);
    let abytes = align_up(aux_bytes_raw, DMSG_ALIGN as u32) as usize;
    if hbytes < DMSG_ALIGN || hbytes > MAX_HDR_BYTES {
        return Err(DmsgError::Field);
    }
    if aux_bytes_raw > MAX_AUX_BYTES {
        return Err(DmsgError::Field);
    }
    Ok(HeaderPreamble { rev, hbytes, abytes })
}

/// Verifies the header CRC and decodes the full fixed header plus
/// extended-header bytes (spec §4.8 HEADER2). `buf` must be exactly
/// `hbytes` long. Endian-swaps every multi-byte field if `rev`; the
/// extended-header bytes themselves are left as opaque payload, per-opcode
/// interpretation happening in `Message::extended_header`.
pub fn decode_header(buf: &[u8], rev: bool) -> Result<(DmsgHeader, Vec<u8>), DmsgError> {
    let hbytes = buf.len();
    let saved_crc_raw = get_u32(buf, OFF_HDR_CRC);
    let mut zeroed = buf.to_vec();
    put_u32(&mut zeroed, OFF_HDR_CRC, 0);
    let computed = crc32c(&zeroed);
    let expected = if rev { saved_crc_raw.swap_bytes() } else { saved_crc_raw };
    if computed != expected {
        return Err(DmsgError::Xcrc);
    }

    let sw32 = |v: u32| if rev { v.swap_bytes() } else { v };
    let sw64 = |v: u64| if rev { v.swap_bytes() } else { v };

    let header = DmsgHeader {
        magic: if rev { MAGIC } else { get_u16(buf, OFF_MAGIC) },
        salt: sw32(get_u32(buf, OFF_SALT)),
        msgid: sw64(get_u64(buf, OFF_MSGID)),
        circuit: sw64(get_u64(buf, OFF_CIRCUIT)),
        cmd: DmsgCmd(sw32(get_u32(buf, OFF_CMD))),
        aux_crc: sw32(get_u32(buf, OFF_AUX_CRC)),
        aux_bytes: sw32(get_u32(buf, OFF_AUX_BYTES)),
        error: sw32(get_u32(buf, OFF_ERROR)),
        aux_descr: sw64(get_u64(buf, OFF_AUX_DESCR)),
        hdr_crc: expected,
    };
    let ext_bytes = buf[DMSG_ALIGN..hbytes].to_vec();
    Ok((header, ext_bytes))
}

/// Verifies the aux-data CRC against `header.aux_crc`, computed over the
/// alignment-padded length (spec §4.8 AUXDATA2, §6).
pub fn verify_aux_crc(header: &DmsgHeader, aligned_aux: &[u8]) -> Result<(), DmsgError> {
    if crc32c(aligned_aux) != header.aux_crc {
        return Err(DmsgError::Acrc);
    }
    Ok(())
}

/// Single-shot decode of a complete wire buffer (header + ext + aux),
/// used by the round-trip property tests and anywhere the full message is
/// already buffered.
pub fn decode(buf: &[u8]) -> Result<Message, DmsgError> {
    if buf.len() < DMSG_ALIGN {
        return Err(DmsgError::Field);
    }
    let preamble = peek_preamble(buf)?;
    if buf.len() < preamble.hbytes + preamble.abytes {
        return Err(DmsgError::Field);
    }
    let (header, ext_bytes) = decode_header(&buf[..preamble.hbytes], preamble.rev)?;
    let aligned_aux = &buf[preamble.hbytes..preamble.hbytes + preamble.abytes];
    verify_aux_crc(&header, aligned_aux)?;
    let aux = aligned_aux[..header.aux_bytes as usize].to_vec();
    Ok(Message { header, ext_bytes, aux })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DmsgFlags;
    use proptest::prelude::*;

    fn sample_header(aux_len: u32) -> DmsgHeader {
        DmsgHeader {
            magic: MAGIC,
            salt: 0x1234_0007,
            msgid: 0xDEAD_BEEF_0000_0001,
            circuit: 0,
            cmd: DmsgCmd::new(crate::message::opcode::LNK_PING, 1, DmsgFlags::CREATE),
            aux_crc: 0,
            aux_bytes: aux_len,
            error: 0,
            aux_descr: 0,
            hdr_crc: 0,
        }
    }

    #[test]
    fn round_trip_no_aux() {
        let header = sample_header(0);
        let wire = encode(&header, &[], &[]);
        let msg = decode(&wire).unwrap();
        assert_eq!(msg.header.msgid, header.msgid);
        assert_eq!(msg.aux.len(), 0);
    }

    #[test]
    fn round_trip_with_1mib_aux() {
        let aux = vec![0xAAu8; 1 << 20];
        let header = sample_header(aux.len() as u32);
        let wire = encode(&header, &[], &aux);
        let msg = decode(&wire).unwrap();
        assert_eq!(msg.aux, aux);
    }

    #[test]
    fn round_trip_unaligned_aux() {
        let aux = vec![7u8; 37];
        let header = sample_header(aux.len() as u32);
        let wire = encode(&header, &[], &aux);
        let msg = decode(&wire).unwrap();
        assert_eq!(msg.aux, aux);
        assert_eq!(msg.aux.len(), 37);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let header = sample_header(0);
        let mut wire = encode(&header, &[], &[]);
        wire[0] ^= 0xFF;
        assert_eq!(decode(&wire), Err(DmsgError::Sync));
    }

    #[test]
    fn single_bit_header_flip_is_detected_as_xcrc() {
        let header = sample_header(8);
        let mut wire = encode(&header, &[], &[1, 2, 3, 4, 5, 6, 7, 8]);
        wire[10] ^= 0x01;
        assert_eq!(decode(&wire), Err(DmsgError::Xcrc));
    }

    #[test]
    fn single_bit_aux_flip_is_detected_as_acrc() {
        let header = sample_header(8);
        let mut wire = encode(&header, &[], &[1, 2, 3, 4, 5, 6, 7, 8]);
        let aux_off = header.cmd.hdr_bytes();
        wire[aux_off] ^= 0x01;
        assert_eq!(decode(&wire), Err(DmsgError::Acrc));
    }

    #[test]
    fn endian_reversed_stream_decodes_identically() {
        let header = sample_header(4);
        let wire = encode(&header, &[], &[9, 9, 9, 9]);

        // Reconstruct the same message as a REV-magic, fully byte-swapped
        // stream the way an opposite-endian peer would have sent it.
        let mut rev_wire = wire.clone();
        let hbytes = header.cmd.hdr_bytes();
        put_u16(&mut rev_wire, OFF_MAGIC, MAGIC_REV);
        for off in [OFF_SALT, OFF_CMD, OFF_AUX_CRC, OFF_AUX_BYTES, OFF_ERROR, OFF_HDR_CRC] {
            let v = get_u32(&wire, off);
            put_u32(&mut rev_wire, off, v.swap_bytes());
        }
        for off in [OFF_MSGID, OFF_CIRCUIT, OFF_AUX_DESCR] {
            let v = get_u64(&wire, off);
            put_u64(&mut rev_wire, off, v.swap_bytes());
        }
        let _ = hbytes;

        let original = decode(&wire).unwrap();
        let reversed = decode(&rev_wire).unwrap();
        assert_eq!(original.header.msgid, reversed.header.msgid);
        assert_eq!(original.header.cmd, reversed.header.cmd);
        assert_eq!(original.aux, reversed.aux);
    }

    proptest! {
        /// Any well-formed message -- arbitrary msgid/circuit/aux content
        /// and length, including zero -- round-trips through encode/decode
        /// with the aux payload preserved byte-for-byte (spec §8).
        #[test]
        fn encode_decode_round_trips_for_any_aux_payload(
            msgid in any::<u64>(),
            circuit in any::<u64>(),
            aux in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let header = DmsgHeader {
                magic: MAGIC,
                salt: 0,
                msgid,
                circuit,
                cmd: DmsgCmd::new(crate::message::opcode::LNK_PING, 1, DmsgFlags::empty()),
                aux_crc: 0,
                aux_bytes: aux.len() as u32,
                error: 0,
                aux_descr: 0,
                hdr_crc: 0,
            };
            let wire = encode(&header, &[], &aux);
            let msg = decode(&wire).unwrap();
            prop_assert_eq!(msg.header.msgid, msgid);
            prop_assert_eq!(msg.header.circuit, circuit);
            prop_assert_eq!(msg.aux, aux);
        }

        /// Flipping any single bit outside the magic and `cmd.SIZE` bytes
        /// (which drive framing, not the CRC check itself) is always
        /// caught by the header CRC, never silently accepted or
        /// misattributed to the aux CRC (spec §7's `Xcrc` entry).
        #[test]
        fn any_single_header_bit_flip_is_detected(
            aux in proptest::collection::vec(any::<u8>(), 0..64),
            byte_idx in (0usize..DMSG_ALIGN).prop_filter(
                "skip framing bytes (magic, cmd.SIZE) that change message shape instead of just corrupting the CRC",
                |&i| i != OFF_MAGIC && i != OFF_MAGIC + 1 && i != OFF_CMD + 2,
            ),
            bit in 0u8..8,
        ) {
            let header = sample_header(aux.len() as u32);
            let mut wire = encode(&header, &[], &aux);
            wire[byte_idx] ^= 1 << bit;
            prop_assert_eq!(decode(&wire), Err(DmsgError::Xcrc));
        }
    }
}
