//! IOCom core loop (spec §4.7): per-connection state (work flags, the
//! ingress/egress pipelines, the transaction state trees, the
//! cross-thread inbox) transport-agnostic over the actual fds. The
//! `poll(2)` reactor, self-pipe and socket plumbing live in `dmsgd` --
//! this type only knows "bytes came in" (`feed_rx`) and "here is
//! somewhere to write bytes to" (`flush`).

use std::io::Write;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::crypto::{CryptoAdapter, PlaintextAdapter};
use crate::egress::{EgressFlusher, OutboundMessage};
use crate::error::DmsgError;
use crate::header::{DmsgCmd, DmsgFlags, DmsgHeader, MAGIC};
use crate::message::{opcode, Message};
use crate::state::{RxEvent, StateId, StateTable};

bitflags! {
    /// The original's per-connection work flags (spec §4.7). `RREQ`/`WREQ`
    /// say which directions the reactor should be polling for; the
    /// `*WORK` bits say what the loop body still has left to do this
    /// iteration.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct IocomFlags: u32 {
        const RREQ    = 0x0001;
        const WREQ    = 0x0002;
        const RWORK   = 0x0004;
        const WWORK   = 0x0008;
        const PWORK   = 0x0010;
        const SWORK   = 0x0020;
        const ARWORK  = 0x0040;
        const AWWORK  = 0x0080;
        const EOF     = 0x0100;
        const CRYPTED = 0x0200;
        const CLOSEALT = 0x0400;
    }
}

/// What the caller should do with a received message after the state
/// machine has classified it -- handed to the `rcvmsg_callback`
/// equivalent alongside the message itself.
#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    Stream(StateId),
    Created(StateId),
    Closed { state: StateId, freed: bool },
}

impl From<RxEvent> for Disposition {
    fn from(e: RxEvent) -> Self {
        match e {
            RxEvent::Stream(s) => Disposition::Stream(s),
            RxEvent::Created(s) => Disposition::Created(s),
            RxEvent::Closed { state, freed } => Disposition::Closed { state, freed },
        }
    }
}

/// One connection's worth of DMSG protocol state (spec §3 "IOCom").
pub struct IOCom {
    pub label: String,
    pub flags: IocomFlags,
    ingress: crate::decoder::IngressDecoder,
    egress: EgressFlusher,
    pub states: StateTable,
    /// Cross-thread submission inbox (spec's `txmsgq`): other threads
    /// call `post` without needing `&mut self`; the loop thread drains it
    /// under the same lock during `PWORK` handling.
    inbox: Mutex<Vec<OutboundMessage>>,
    pub error: Option<DmsgError>,
    crypto: Box<dyn CryptoAdapter>,
}

impl IOCom {
    pub fn new(label: impl Into<String>, seed: u64) -> Self {
        IOCom {
            label: label.into(),
            flags: IocomFlags::RREQ,
            ingress: crate::decoder::IngressDecoder::new(),
            egress: EgressFlusher::new(seed),
            states: StateTable::new(),
            inbox: Mutex::new(Vec::new()),
            error: None,
            crypto: Box::new(PlaintextAdapter),
        }
    }

    /// Builds an `IOCom` over a real (socket-backed) connection with a
    /// session-crypto layer plugged in (spec §6): `negotiate` runs
    /// immediately, and every byte crossing `feed_rx`/`flush` afterwards
    /// goes through it.
    pub fn with_crypto(
        label: impl Into<String>,
        seed: u64,
        mut crypto: Box<dyn CryptoAdapter>,
    ) -> Result<Self, DmsgError> {
        crypto.negotiate()?;
        let mut flags = IocomFlags::RREQ;
        if crypto.is_active() {
            flags.insert(IocomFlags::CRYPTED);
        }
        Ok(IOCom {
            label: label.into(),
            flags,
            ingress: crate::decoder::IngressDecoder::new(),
            egress: EgressFlusher::new(seed),
            states: StateTable::new(),
            inbox: Mutex::new(Vec::new()),
            error: None,
            crypto,
        })
    }

    pub fn root(&self) -> StateId {
        self.states.root()
    }

    /// Cross-thread entry point (spec §4.7, §5): enqueues a message for
    /// transmission and arms `WREQ` so the reactor polls for writability.
    /// Callers are expected to also kick whatever wakeup mechanism (the
    /// self-pipe, in `dmsgd`) gets the loop thread to notice `PWORK`.
    pub fn post(&self, msg: OutboundMessage) {
        self.inbox.lock().push(msg);
    }

    pub fn has_inbox_work(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    /// `PWORK` handling (spec §4.7): drains the cross-thread inbox into
    /// the egress queue and arms `RWORK`/`WWORK` so both directions get a
    /// pass this iteration.
    pub fn drain_inbox(&mut self) {
        let pending: Vec<_> = self.inbox.lock().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        for msg in pending {
            self.egress.enqueue(msg, self.crypto.as_mut());
        }
        self.flags.insert(IocomFlags::RWORK | IocomFlags::WWORK);
    }

    /// Feeds freshly-read raw socket bytes into the ingress decoder,
    /// running them through `CryptoAdapter::decrypt` first when a real
    /// session-crypto layer is active; arms `RWORK`.
    pub fn feed_rx(&mut self, data: &[u8]) {
        if self.crypto.is_active() {
            let mut cleartext = Vec::with_capacity(data.len());
            self.crypto.decrypt(data, &mut cleartext);
            self.ingress.fill(&cleartext);
        } else {
            self.ingress.fill(data);
        }
        self.flags.insert(IocomFlags::RWORK);
    }

    pub fn egress_wants_write(&self) -> bool {
        self.egress.has_pending()
    }

    /// `WWORK` handling (spec §4.7, §4.9): one vectored write, then
    /// `cleanup_tx` for every message whose DELETE bit was fully flushed.
    pub fn flush(&mut self, sink: &mut impl Write) -> std::io::Result<()> {
        let completed = self.egress.flush_into(sink)?;
        for (sid, is_delete) in completed {
            if is_delete {
                let _ = self.states.cleanup_tx(sid);
            }
        }
        if !self.egress.has_pending() {
            self.flags.remove(IocomFlags::WWORK);
        } else {
            self.flags.insert(IocomFlags::WREQ);
        }
        Ok(())
    }

    /// `RWORK` handling (spec §4.7): decodes every message the FIFO will
    /// currently yield, runs each through the transaction state machine,
    /// and hands the caller `(message, disposition)`. A fatal decode
    /// error drives the error-drain cascade and sets `EOF`; `EALREADY`
    /// from the state machine is swallowed per spec §7.
    pub fn process_rx(&mut self, mut on_message: impl FnMut(&mut Self, Message, Disposition)) {
        if !self.flags.contains(IocomFlags::RWORK) {
            return;
        }
        loop {
            if self.flags.contains(IocomFlags::EOF) {
                break;
            }
            let next = self.ingress.next_message();
            match next {
                Ok(Some(msg)) => match self.states.on_receive(&msg.header) {
                    Ok(event) => {
                        let disposition = Disposition::from(event);
                        on_message(self, msg, disposition);
                    }
                    Err(e) if !e.is_fatal() => {
                        // Benign ABORT+DELETE race: discard and resume.
                    }
                    Err(e) => {
                        self.enter_error(e);
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    self.enter_error(e);
                    break;
                }
            }
        }
        self.flags.remove(IocomFlags::RWORK);
    }

    /// Error-drain cascade (spec §4.8 ERROR state, §7): synthesize a
    /// remote DELETE+LNK_ERROR for every still-open transaction (reader
    /// tree first, then writer), then a final non-transactional
    /// LNK_ERROR, then set EOF. The loop exits once EOF is observed.
    fn enter_error(&mut self, e: DmsgError) {
        self.error = Some(e);
        for sid in self.states.all_open_states() {
            let cmd = self.states.synth_error_cmd(sid);
            let msgid = self.states.msgid(sid).unwrap_or(0);
            let header = DmsgHeader {
                magic: MAGIC,
                salt: 0,
                msgid,
                circuit: 0,
                cmd,
                aux_crc: 0,
                aux_bytes: 0,
                error: e.code(),
                aux_descr: 0,
                hdr_crc: 0,
            };
            self.egress.enqueue(
                OutboundMessage {
                    header,
                    ext_bytes: Vec::new(),
                    aux: Vec::new(),
                    state: Some(sid),
                },
                self.crypto.as_mut(),
            );
        }

        let final_header = DmsgHeader {
            magic: MAGIC,
            salt: 0,
            msgid: 0,
            circuit: 0,
            cmd: DmsgCmd::new(opcode::LNK_ERROR, 1, DmsgFlags::empty()),
            aux_crc: 0,
            aux_bytes: 0,
            error: e.code(),
            aux_descr: 0,
            hdr_crc: 0,
        };
        self.egress.enqueue(
            OutboundMessage {
                header: final_header,
                ext_bytes: Vec::new(),
                aux: Vec::new(),
                state: None,
            },
            self.crypto.as_mut(),
        );

        self.flags.insert(IocomFlags::WWORK | IocomFlags::EOF);
    }

    /// Socket-level EOF (spec §7's `Eof` entry, which no internal decode
    /// path produces on its own): drives the same error-drain cascade as
    /// a fatal decode error, so callers observe it exactly like any other
    /// terminal condition via `is_eof`/`error`.
    pub fn on_socket_eof(&mut self) {
        if !self.flags.contains(IocomFlags::EOF) {
            self.enter_error(DmsgError::Eof);
        }
    }

    pub fn is_eof(&self) -> bool {
        self.flags.contains(IocomFlags::EOF)
    }

    /// Whether the reactor has any `*WORK` bit set (spec §4.7's poll-skip
    /// condition: "if no *WORK bits set: poll(...)").
    pub fn has_pending_work(&self) -> bool {
        self.flags.intersects(
            IocomFlags::RWORK
                | IocomFlags::WWORK
                | IocomFlags::PWORK
                | IocomFlags::SWORK
                | IocomFlags::ARWORK
                | IocomFlags::AWWORK,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DmsgFlags;

    #[test]
    fn post_then_drain_arms_read_and_write_work() {
        let mut iocom = IOCom::new("test", 1);
        let root = iocom.root();
        let header = crate::egress::prepare_header(opcode::LNK_PING, DmsgFlags::CREATE, 0, 0, 0, 0);
        iocom.post(OutboundMessage {
            header,
            ext_bytes: vec![],
            aux: vec![],
            state: Some(root),
        });
        assert!(iocom.has_inbox_work());
        iocom.drain_inbox();
        assert!(!iocom.has_inbox_work());
        assert!(iocom.flags.contains(IocomFlags::WWORK));
        assert!(iocom.egress_wants_write());
    }

    #[test]
    fn handshake_create_reply_delete_closes_both_sides() {
        let mut a = IOCom::new("a", 1);
        let mut b = IOCom::new("b", 2);

        let root_a = a.root();
        let sid_a = a.states.create_local(root_a, opcode::LNK_PING).unwrap();
        let msgid = a.states.msgid(sid_a).unwrap();
        let header = crate::egress::prepare_header(opcode::LNK_PING, DmsgFlags::CREATE, msgid, 0, 0, 0);
        a.post(OutboundMessage {
            header,
            ext_bytes: vec![],
            aux: vec![],
            state: None,
        });
        a.drain_inbox();
        let mut wire = Vec::new();
        a.flush(&mut wire).unwrap();

        b.feed_rx(&wire);
        let mut seen = Vec::new();
        b.process_rx(|_, msg, disp| seen.push((msg.header.msgid, disp)));
        assert!(matches!(seen[0].1, Disposition::Created(_)));
        assert!(!b.states.reader_tree_is_empty());

        let sid_b = match seen[0].1 {
            Disposition::Created(s) => s,
            _ => panic!(),
        };
        let reply_header = crate::egress::prepare_header(
            opcode::LNK_PING,
            DmsgFlags::REPLY | DmsgFlags::CREATE | DmsgFlags::DELETE,
            msgid,
            0,
            0,
            0,
        );
        b.post(OutboundMessage {
            header: reply_header,
            ext_bytes: vec![],
            aux: vec![],
            state: Some(sid_b),
        });
        b.drain_inbox();
        let mut wire2 = Vec::new();
        b.flush(&mut wire2).unwrap();
        assert!(b.states.reader_tree_is_empty());

        a.feed_rx(&wire2);
        let mut closed = Vec::new();
        a.process_rx(|_, msg, disp| closed.push((msg.header.msgid, disp)));
        assert!(matches!(closed[0].1, Disposition::Closed { .. }));
        assert!(a.states.writer_tree_is_empty());
    }

    #[test]
    fn corrupted_header_drives_error_cascade_and_sets_eof() {
        let mut iocom = IOCom::new("err", 1);
        let header = crate::egress::prepare_header(opcode::LNK_PING, DmsgFlags::empty(), 0, 0, 0, 0);
        let wire = crate::codec::encode(&header, &[], &[]);
        let mut bad = wire.clone();
        bad[10] ^= 0x01;
        iocom.feed_rx(&bad);
        iocom.process_rx(|_, _, _| {});
        assert!(iocom.is_eof());
        assert_eq!(iocom.error, Some(DmsgError::Xcrc));
        assert!(iocom.egress_wants_write());
    }

    #[test]
    fn socket_eof_drives_error_cascade_once() {
        let mut iocom = IOCom::new("eof", 1);
        iocom.on_socket_eof();
        assert!(iocom.is_eof());
        assert_eq!(iocom.error, Some(DmsgError::Eof));
        assert!(iocom.egress_wants_write());

        // A second call must not re-enqueue another error message.
        let pending_before = {
            let mut wire = Vec::new();
            iocom.flush(&mut wire).unwrap();
            wire.len()
        };
        iocom.on_socket_eof();
        assert_eq!(pending_before > 0, true);
    }

    struct RefusingAdapter;
    impl CryptoAdapter for RefusingAdapter {
        fn negotiate(&mut self) -> Result<(), DmsgError> {
            Err(DmsgError::Sock)
        }
        fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> usize {
            out.extend_from_slice(ciphertext);
            ciphertext.len()
        }
        fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> usize {
            out.extend_from_slice(plaintext);
            plaintext.len()
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn with_crypto_propagates_negotiate_failure() {
        let result = IOCom::with_crypto("x", 1, Box::new(RefusingAdapter));
        assert_eq!(result.err(), Some(DmsgError::Sock));
    }

    #[test]
    fn with_crypto_sets_crypted_flag_when_adapter_is_active() {
        let iocom = IOCom::with_crypto("x", 1, Box::new(PlaintextAdapter)).unwrap();
        assert!(!iocom.flags.contains(IocomFlags::CRYPTED));
    }
}
