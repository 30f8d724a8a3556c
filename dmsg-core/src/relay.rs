//! Router/relay (spec §4.11): automatic mirroring of one `IOCom`'s
//! transaction subtree onto a paired state in another `IOCom`. Each side
//! owns its own state slab; the cross-link is a `relay: Option<StateId>`
//! field naming the peer's `StateId` (spec §9 design note), and the two
//! `IOCom`s themselves are reached through a shared `Relay` handle rather
//! than a raw pointer stashed inside the state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::egress::{prepare_header, OutboundMessage};
use crate::iocom::IOCom;
use crate::message::Message;
use crate::state::StateId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelaySide {
    Left,
    Right,
}

/// Binds two `IOCom`s' root states as each other's relay endpoint. A
/// `CREATE` landing on either root subtree is auto-mirrored onto the
/// other side; subsequent traffic on the mirrored pair forwards with the
/// same cmd bits (spec §4.11).
pub struct Relay {
    pub left: Arc<Mutex<IOCom>>,
    pub right: Arc<Mutex<IOCom>>,
}

impl Relay {
    pub fn bind(left: Arc<Mutex<IOCom>>, right: Arc<Mutex<IOCom>>) -> Self {
        let lroot = left.lock().root();
        let rroot = right.lock().root();
        left.lock().states.set_relay(lroot, rroot);
        right.lock().states.set_relay(rroot, lroot);
        Relay { left, right }
    }

    fn side(&self, side: RelaySide) -> (&Arc<Mutex<IOCom>>, &Arc<Mutex<IOCom>>) {
        match side {
            RelaySide::Left => (&self.left, &self.right),
            RelaySide::Right => (&self.right, &self.left),
        }
    }

    /// Whether `parent`'s subtree on `side` is relay-bound -- i.e. a new
    /// child created under it should be mirrored.
    pub fn parent_is_relayed(&self, side: RelaySide, parent: StateId) -> bool {
        let (src, _) = self.side(side);
        src.lock().states.relay_of(parent).is_some()
    }

    /// A `CREATE` arrived on `side` under a relay-bound parent: spawns a
    /// symmetric child on the other side, cross-links the two states as
    /// each other's `relay`, and forwards the message (spec §4.11).
    pub fn relay_create(&self, side: RelaySide, sid: StateId, msg: &Message) {
        let (src, dst) = self.side(side);
        let dst_sid = {
            let mut dst_guard = dst.lock();
            let root = dst_guard.root();
            match dst_guard.states.create_local(root, msg.header.cmd.basecmd()) {
                Ok(id) => id,
                Err(_) => return,
            }
        };
        {
            let mut src_guard = src.lock();
            src_guard.states.set_relay(sid, dst_sid);
        }
        let new_msgid = {
            let mut dst_guard = dst.lock();
            dst_guard.states.set_relay(dst_sid, sid);
            dst_guard.states.msgid(dst_sid).unwrap_or(0)
        };
        let header = prepare_header(
            msg.header.cmd.basecmd(),
            msg.header.cmd.flags(),
            new_msgid,
            0,
            msg.ext_bytes.len(),
            msg.aux.len(),
        );
        dst.lock().post(OutboundMessage {
            header,
            ext_bytes: msg.ext_bytes.clone(),
            aux: msg.aux.clone(),
            state: None,
        });
    }

    /// Forwards a streaming/closing message on an already relay-bound
    /// state onto its peer, moving (not copying) the aux-data buffer
    /// (spec §4.11). A state with no `relay` set (never bound, or its
    /// peer already freed) is a no-op.
    pub fn forward(&self, side: RelaySide, sid: StateId, msg: Message) {
        let (src, dst) = self.side(side);
        let peer_sid = match src.lock().states.relay_of(sid) {
            Some(p) => p,
            None => return,
        };
        let peer_msgid = match dst.lock().states.msgid(peer_sid) {
            Some(m) => m,
            None => return,
        };
        let header = prepare_header(
            msg.header.cmd.basecmd(),
            msg.header.cmd.flags(),
            peer_msgid,
            0,
            msg.ext_bytes.len(),
            msg.aux.len(),
        );
        dst.lock().post(OutboundMessage {
            header,
            ext_bytes: msg.ext_bytes,
            aux: msg.aux,
            state: Some(peer_sid),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DmsgFlags;
    use crate::iocom::Disposition;
    use crate::message::opcode;
    use std::io::Write;

    fn pump(from: &Arc<Mutex<IOCom>>, to: &mut IOCom) {
        let mut wire = Vec::new();
        from.lock().flush(&mut wire).unwrap();
        to.feed_rx(&wire);
    }

    #[test]
    fn create_on_one_side_spawns_mirrored_child_on_the_other() {
        let c1 = Arc::new(Mutex::new(IOCom::new("c1", 1)));
        let c2 = Arc::new(Mutex::new(IOCom::new("c2", 2)));
        let relay = Relay::bind(c1.clone(), c2.clone());

        let (root1, sid1) = {
            let mut g = c1.lock();
            let root = g.root();
            let sid = g.states.create_local(root, opcode::LNK_PING).unwrap();
            (root, sid)
        };
        let msgid1 = c1.lock().states.msgid(sid1).unwrap();
        let header = prepare_header(opcode::LNK_PING, DmsgFlags::CREATE, msgid1, 0, 0, 0);
        c1.lock().post(OutboundMessage { header, ext_bytes: vec![], aux: vec![], state: None });
        c1.lock().drain_inbox();

        let mut wire = Vec::new();
        c1.lock().flush(&mut wire).unwrap();

        let mut c2_guard = c2.lock();
        c2_guard.feed_rx(&wire);
        let mut created: Option<(StateId, Message)> = None;
        c2_guard.process_rx(|_, msg, disp| {
            if let Disposition::Created(sid) = disp {
                created = Some((sid, msg));
            }
        });
        let (sid2, msg) = created.expect("c2 should have received a Created disposition");
        assert!(relay.parent_is_relayed(RelaySide::Right, root1));
        drop(c2_guard);

        relay.relay_create(RelaySide::Right, sid2, &msg);
        assert_eq!(c1.lock().states.relay_of(sid1), None); // not yet bound from c1's side
        // c2's new mirrored child is bound to sid2 on c2's side.
        let mirrored_exists = !c2.lock().states.writer_tree_is_empty();
        assert!(mirrored_exists);
    }

    #[test]
    fn forward_moves_aux_data_to_the_peer_state() {
        let c1 = Arc::new(Mutex::new(IOCom::new("c1", 1)));
        let c2 = Arc::new(Mutex::new(IOCom::new("c2", 2)));
        let root1 = c1.lock().root();
        let root2 = c2.lock().root();
        let sid1 = c1.lock().states.create_local(root1, opcode::LNK_PING).unwrap();
        let sid2 = c2.lock().states.create_local(root2, opcode::LNK_PING).unwrap();
        c1.lock().states.set_relay(sid1, sid2);
        c2.lock().states.set_relay(sid2, sid1);
        let relay = Relay { left: c1.clone(), right: c2.clone() };

        let msg = Message {
            header: crate::header::DmsgHeader {
                magic: crate::header::MAGIC,
                salt: 0,
                msgid: c1.lock().states.msgid(sid1).unwrap(),
                circuit: 0,
                cmd: crate::header::DmsgCmd::new(opcode::LNK_PING, 1, DmsgFlags::empty()),
                aux_crc: 0,
                aux_bytes: 4,
                error: 0,
                aux_descr: 0,
                hdr_crc: 0,
            },
            ext_bytes: vec![],
            aux: vec![1, 2, 3, 4],
        };
        relay.forward(RelaySide::Left, sid1, msg);
        assert!(c2.lock().has_inbox_work());
        let _ = pump; // silence unused helper in this focused test
    }
}
