//! Ingress decoder (spec §4.8): a staged state machine over a byte FIFO
//! that reassembles one `Message` at a time from a streaming socket.
//!
//! This owns only the cleartext side of the FIFO. `IOCom` is responsible
//! for running any configured `CryptoAdapter::decrypt` over freshly-read
//! bytes before handing them to `fill` -- in plaintext mode that's a
//! no-op, which is exactly the "`cdx = cdn = end`" collapse spec §4.8
//! describes for the unencrypted case.

use std::collections::VecDeque;

use crate::codec::{decode_header, peek_preamble};
use crate::error::DmsgError;
use crate::header::{DmsgHeader, DMSG_ALIGN};
use crate::message::Message;

#[derive(Debug)]
enum State {
    Header1,
    Header2 {
        rev: bool,
        hbytes: usize,
        abytes: usize,
    },
    AuxData {
        header: DmsgHeader,
        ext_bytes: Vec<u8>,
        hbytes: usize,
        abytes: usize,
    },
    Errored(DmsgError),
}

/// Per spec §3/§4.8 anti-replay: the salt's low byte must track a
/// monotonic per-direction sequence counter.
struct SeqCheck {
    next: u8,
}

impl SeqCheck {
    fn check_and_advance(&mut self, got: u8) -> Result<(), DmsgError> {
        if got != self.next {
            return Err(DmsgError::Msgseq);
        }
        self.next = self.next.wrapping_add(1);
        Ok(())
    }
}

pub struct IngressDecoder {
    buf: VecDeque<u8>,
    state: State,
    seq: SeqCheck,
}

impl Default for IngressDecoder {
    fn default() -> Self {
        IngressDecoder::new()
    }
}

impl IngressDecoder {
    pub fn new() -> Self {
        IngressDecoder {
            buf: VecDeque::new(),
            state: State::Header1,
            seq: SeqCheck { next: 0 },
        }
    }

    /// Appends freshly-received (already-decrypted) bytes to the FIFO.
    pub fn fill(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    fn contiguous(&self, len: usize) -> Option<Vec<u8>> {
        if self.buf.len() < len {
            return None;
        }
        Some(self.buf.iter().take(len).copied().collect())
    }

    fn consume(&mut self, len: usize) {
        self.buf.drain(..len);
    }

    /// Attempts to assemble the next complete message out of whatever has
    /// been `fill`ed so far. Returns `Ok(None)` when more bytes are needed.
    /// Once an error occurs the decoder latches it -- every subsequent
    /// call returns the same error, mirroring the original's "stream is
    /// errored out, stop processing it" rule (spec §4.8 ERROR state).
    pub fn next_message(&mut self) -> Result<Option<Message>, DmsgError> {
        loop {
            match &self.state {
                State::Errored(e) => return Err(*e),
                State::Header1 => {
                    let Some(raw) = self.contiguous(DMSG_ALIGN) else {
                        return Ok(None);
                    };
                    match peek_preamble(&raw) {
                        Ok(p) => {
                            self.state = State::Header2 {
                                rev: p.rev,
                                hbytes: p.hbytes,
                                abytes: p.abytes,
                            }
                        }
                        Err(e) => {
                            self.state = State::Errored(e);
                            return Err(e);
                        }
                    }
                }
                State::Header2 { rev, hbytes, abytes } => {
                    let (rev, hbytes, abytes) = (*rev, *hbytes, *abytes);
                    let Some(raw) = self.contiguous(hbytes) else {
                        return Ok(None);
                    };
                    match decode_header(&raw, rev) {
                        Ok((header, ext_bytes)) => {
                            if let Err(e) = self.seq.check_and_advance(header.low_seq_byte()) {
                                self.state = State::Errored(e);
                                return Err(e);
                            }
                            self.state = State::AuxData {
                                header,
                                ext_bytes,
                                hbytes,
                                abytes,
                            };
                        }
                        Err(e) => {
                            self.state = State::Errored(e);
                            return Err(e);
                        }
                    }
                }
                State::AuxData { abytes, .. } => {
                    let State::AuxData {
                        header,
                        ext_bytes,
                        hbytes,
                        abytes: _,
                    } = std::mem::replace(&mut self.state, State::Header1)
                    else {
                        unreachable!()
                    };
                    let Some(whole) = self.contiguous(hbytes + abytes) else {
                        // Put the state back; more aux bytes are needed.
                        self.state = State::AuxData {
                            header,
                            ext_bytes,
                            hbytes,
                            abytes,
                        };
                        return Ok(None);
                    };
                    let aligned_aux = &whole[hbytes..hbytes + abytes];
                    if let Err(e) = crate::codec::verify_aux_crc(&header, aligned_aux) {
                        self.state = State::Errored(e);
                        return Err(e);
                    }
                    let aux = aligned_aux[..header.aux_bytes as usize].to_vec();
                    self.consume(hbytes + abytes);
                    self.state = State::Header1;
                    return Ok(Some(Message { header, ext_bytes, aux }));
                }
            }
        }
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.state, State::Errored(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::header::{DmsgCmd, DmsgFlags, MAGIC};
    use crate::message::opcode;

    fn header(aux_len: u32, seq: u8) -> DmsgHeader {
        DmsgHeader {
            magic: MAGIC,
            salt: 0xAB00_0000 | seq as u32,
            msgid: 42,
            circuit: 0,
            cmd: DmsgCmd::new(opcode::LNK_PING, 1, DmsgFlags::CREATE),
            aux_crc: 0,
            aux_bytes: aux_len,
            error: 0,
            aux_descr: 0,
            hdr_crc: 0,
        }
    }

    #[test]
    fn assembles_message_fed_in_one_piece() {
        let wire = encode(&header(4, 0), &[], &[1, 2, 3, 4]);
        let mut dec = IngressDecoder::new();
        dec.fill(&wire);
        let msg = dec.next_message().unwrap().unwrap();
        assert_eq!(msg.header.msgid, 42);
        assert_eq!(msg.aux, vec![1, 2, 3, 4]);
    }

    #[test]
    fn assembles_message_fed_byte_by_byte() {
        let wire = encode(&header(4, 0), &[], &[9, 8, 7, 6]);
        let mut dec = IngressDecoder::new();
        for b in 0..wire.len() - 1 {
            dec.fill(&wire[b..b + 1]);
            assert!(dec.next_message().unwrap().is_none());
        }
        dec.fill(&wire[wire.len() - 1..]);
        let msg = dec.next_message().unwrap().unwrap();
        assert_eq!(msg.aux, vec![9, 8, 7, 6]);
    }

    #[test]
    fn two_back_to_back_messages_both_decode() {
        let mut dec = IngressDecoder::new();
        let w0 = encode(&header(0, 0), &[], &[]);
        let w1 = encode(&header(0, 1), &[], &[]);
        dec.fill(&w0);
        dec.fill(&w1);
        assert_eq!(dec.next_message().unwrap().unwrap().header.salt & 0xFF, 0);
        assert_eq!(dec.next_message().unwrap().unwrap().header.salt & 0xFF, 1);
    }

    #[test]
    fn sequence_gap_yields_msgseq_and_latches() {
        let mut dec = IngressDecoder::new();
        let w1 = encode(&header(0, 1), &[], &[]); // should have been seq 0
        dec.fill(&w1);
        assert_eq!(dec.next_message(), Err(DmsgError::Msgseq));
        assert!(dec.is_errored());
        assert_eq!(dec.next_message(), Err(DmsgError::Msgseq));
    }

    #[test]
    fn bad_magic_yields_sync_error() {
        let mut dec = IngressDecoder::new();
        let mut wire = encode(&header(0, 0), &[], &[]);
        wire[0] = 0;
        wire[1] = 0;
        dec.fill(&wire);
        assert_eq!(dec.next_message(), Err(DmsgError::Sync));
    }
}
