//! Egress flusher (spec §4.9): drains the cross-thread tx queue, CRC-stamps
//! and salts each message, and issues a single vectored write per flush
//! covering as many queued messages as fit in `MAXIOVEC`.

use std::io::{self, IoSlice, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::encode;
use crate::crypto::CryptoAdapter;
use crate::header::{DmsgCmd, DmsgHeader};
use crate::state::StateId;

/// Matches the original's iovec batch cap per flush call (spec §4.9).
pub const MAXIOVEC: usize = 16;

/// Reseed cadence for the salt's high bits (spec §4.9/§6).
const RESEED_INTERVAL: u64 = 32768;

struct Pending {
    wire: Vec<u8>,
    written: usize,
    state: Option<StateId>,
    is_delete: bool,
}

/// A message queued for transmission, before salt/CRC stamping. The
/// caller builds the header with `cmd`/`msgid`/`circuit` already set and
/// `salt`/`aux_crc`/`hdr_crc` left zero -- `enqueue` fills those in.
pub struct OutboundMessage {
    pub header: DmsgHeader,
    pub ext_bytes: Vec<u8>,
    pub aux: Vec<u8>,
    /// State whose `cleanup_tx` should run once this message is fully
    /// written (spec §4.10's TX-side close bookkeeping). `None` for
    /// non-transactional messages (e.g. a final synthesized LNK_ERROR).
    pub state: Option<StateId>,
}

pub struct EgressFlusher {
    queue: std::collections::VecDeque<Pending>,
    seq: u32,
    rng: StdRng,
    since_reseed: u64,
}

impl EgressFlusher {
    pub fn new(seed: u64) -> Self {
        EgressFlusher {
            queue: std::collections::VecDeque::new(),
            seq: 0,
            rng: StdRng::seed_from_u64(seed),
            since_reseed: 0,
        }
    }

    /// Stamps salt (low byte = sequence, high bits random; spec §4.9),
    /// encodes the message (which computes aux/header CRCs), runs the
    /// whole cleartext frame through `crypto` when a real session-crypto
    /// layer is active (spec §6), and queues the result for the next
    /// flush. `written`/flush accounting always refers to whatever ends
    /// up in `Pending.wire` -- ciphertext when encrypted, cleartext
    /// otherwise -- so partial `write_vectored` calls stay consistent.
    pub fn enqueue(&mut self, mut msg: OutboundMessage, crypto: &mut dyn CryptoAdapter) {
        if self.since_reseed >= RESEED_INTERVAL {
            self.rng = StdRng::from_entropy();
            self.since_reseed = 0;
        }
        let high: u32 = self.rng.gen::<u32>() & !0xFF;
        msg.header.salt = high | (self.seq & 0xFF);
        self.seq = self.seq.wrapping_add(1);
        self.since_reseed += 1;

        let is_delete = msg.header.cmd.flags().contains(crate::header::DmsgFlags::DELETE);
        let cleartext = encode(&msg.header, &msg.ext_bytes, &msg.aux);
        let wire = if crypto.is_active() {
            let mut ciphertext = Vec::with_capacity(cleartext.len());
            crypto.encrypt(&cleartext, &mut ciphertext);
            ciphertext
        } else {
            cleartext
        };
        self.queue.push_back(Pending {
            wire,
            written: 0,
            state: msg.state,
            is_delete,
        });
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Issues one vectored write covering up to `MAXIOVEC` queued
    /// messages' unwritten tails. Returns the states of messages that
    /// were fully flushed by this call (callers run `cleanup_tx` on
    /// each); a partially-written message is left at the front of the
    /// queue with its cursor advanced.
    ///
    /// Soft errors (`WouldBlock`/`Interrupted`) are swallowed -- the
    /// caller re-arms its write-ready wait and tries again later (spec
    /// §4.9). Any other error is propagated so the caller can hard-close
    /// the ioq.
    pub fn flush_into(&mut self, sink: &mut impl Write) -> io::Result<Vec<(StateId, bool)>> {
        if self.queue.is_empty() {
            return Ok(Vec::new());
        }

        let mut slices: Vec<IoSlice> = Vec::with_capacity(MAXIOVEC);
        for p in self.queue.iter().take(MAXIOVEC) {
            slices.push(IoSlice::new(&p.wire[p.written..]));
        }

        let n = match sink.write_vectored(&slices) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut remaining = n;
        let mut completed = Vec::new();
        while remaining > 0 {
            let Some(front) = self.queue.front_mut() else { break };
            let avail = front.wire.len() - front.written;
            let take = avail.min(remaining);
            front.written += take;
            remaining -= take;
            if front.written == front.wire.len() {
                let done = self.queue.pop_front().unwrap();
                if let Some(state) = done.state {
                    completed.push((state, done.is_delete));
                }
            }
        }
        Ok(completed)
    }
}

/// Stamps a fresh header for a message about to be queued: `cmd`'s SIZE
/// field from `ext_bytes`' aligned length, `aux_bytes` from `aux`'s real
/// length. CRCs and salt are left zero -- `EgressFlusher::enqueue` fills
/// those in at send time.
pub fn prepare_header(
    basecmd: u16,
    flags: crate::header::DmsgFlags,
    msgid: u64,
    circuit: u64,
    ext_bytes_len: usize,
    aux_len: usize,
) -> DmsgHeader {
    let size_units = (crate::header::align_up(
        (crate::header::DMSG_ALIGN + ext_bytes_len) as u32,
        crate::header::DMSG_ALIGN as u32,
    ) / crate::header::DMSG_ALIGN as u32) as u8;
    DmsgHeader {
        magic: crate::header::MAGIC,
        salt: 0,
        msgid,
        circuit,
        cmd: DmsgCmd::new(basecmd, size_units, flags),
        aux_crc: 0,
        aux_bytes: aux_len as u32,
        error: 0,
        aux_descr: 0,
        hdr_crc: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextAdapter;
    use crate::header::DmsgFlags;
    use crate::message::opcode;

    struct CapturingSink(Vec<u8>);
    impl Write for CapturingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut n = 0;
            for b in bufs {
                self.0.extend_from_slice(b);
                n += b.len();
            }
            Ok(n)
        }
    }

    #[test]
    fn flush_writes_and_reports_completed_state() {
        let mut flusher = EgressFlusher::new(1);
        let header = prepare_header(opcode::LNK_PING, DmsgFlags::CREATE, 1, 0, 0, 0);
        let sid = StateId { index: 0, generation: 0 };
        flusher.enqueue(
            OutboundMessage {
                header,
                ext_bytes: vec![],
                aux: vec![],
                state: Some(sid),
            },
            &mut PlaintextAdapter,
        );
        let mut sink = CapturingSink(Vec::new());
        let completed = flusher.flush_into(&mut sink).unwrap();
        assert_eq!(completed, vec![(sid, false)]);
        assert!(!flusher.has_pending());
        assert_eq!(sink.0.len(), 64);
    }

    #[test]
    fn salt_low_byte_tracks_sequence() {
        let mut flusher = EgressFlusher::new(2);
        for i in 0..300u32 {
            let header = prepare_header(opcode::LNK_PING, DmsgFlags::empty(), 1, 0, 0, 0);
            flusher.enqueue(
                OutboundMessage {
                    header,
                    ext_bytes: vec![],
                    aux: vec![],
                    state: None,
                },
                &mut PlaintextAdapter,
            );
            assert_eq!(flusher.queue.back().unwrap().wire[4] as u32, i & 0xFF);
        }
    }

    struct XorAdapter(u8);
    impl CryptoAdapter for XorAdapter {
        fn negotiate(&mut self) -> Result<(), crate::error::DmsgError> {
            Ok(())
        }
        fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> usize {
            out.extend(ciphertext.iter().map(|b| b ^ self.0));
            ciphertext.len()
        }
        fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> usize {
            out.extend(plaintext.iter().map(|b| b ^ self.0));
            plaintext.len()
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn active_crypto_adapter_transforms_the_wire_bytes() {
        let mut flusher = EgressFlusher::new(3);
        let header = prepare_header(opcode::LNK_PING, DmsgFlags::empty(), 1, 0, 0, 0);
        flusher.enqueue(
            OutboundMessage { header, ext_bytes: vec![], aux: vec![], state: None },
            &mut XorAdapter(0xAA),
        );
        let ciphertext = flusher.queue.back().unwrap().wire.clone();
        let mut cleartext = Vec::new();
        XorAdapter(0xAA).decrypt(&ciphertext, &mut cleartext);
        assert_eq!(cleartext.len(), 64);
        assert_ne!(ciphertext, cleartext);
    }
}
