//! Transaction state machine (spec §4.10, §9): a generation-checked slab
//! standing in for the original's two intrusive red-black trees. A
//! `BTreeMap<u64, StateId>` has the same ordering and complexity as an
//! RB-tree keyed the same way, so this is a direct translation rather
//! than a redesign (spec §9's own framing for this substitution).

use std::collections::BTreeMap;

use crate::error::DmsgError;
use crate::header::{DmsgCmd, DmsgFlags, DmsgHeader};

/// Index + generation, so a freed-and-reused slot can never be mistaken
/// for the state a stale handle was pointing at (spec §9 design note on
/// translating intrusive collections into arena slabs).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct StateId {
    pub index: u32,
    pub generation: u32,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct StateFlags: u32 {
        const ROOT      = 0x01;
        const DYNAMIC   = 0x02;
        const INSERTED  = 0x04;
        /// The transaction was remotely initiated (lives in the reader
        /// tree); clear means we initiated it (writer tree). Root is
        /// neither.
        const OPPOSITE  = 0x08;
    }
}

struct StateSlot {
    generation: u32,
    alive: bool,
    msgid: u64,
    parent: StateId,
    rxcmd: u32,
    txcmd: u32,
    icmd: u32,
    children: Vec<StateId>,
    refs: u32,
    flags: StateFlags,
    relay: Option<StateId>,
}

/// One observable outcome of feeding a received header through the state
/// machine (spec §4.10's CREATE/DELETE/REPLY/ABORT switch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    /// Message delivered in an open (possibly freshly created)
    /// transaction; the transaction is still open afterward.
    Stream(StateId),
    /// This message closed the transaction from the remote side; if our
    /// side had already sent DELETE too, the state has now been freed.
    Closed { state: StateId, freed: bool },
    /// The message spawned a brand-new child state (CREATE, no REPLY).
    Created(StateId),
}

pub struct StateTable {
    slots: Vec<StateSlot>,
    free: Vec<u32>,
    reader_tree: BTreeMap<u64, StateId>,
    writer_tree: BTreeMap<u64, StateId>,
    next_local_msgid: u64,
}

impl Default for StateTable {
    fn default() -> Self {
        StateTable::new()
    }
}

impl StateTable {
    pub fn new() -> Self {
        let root = StateSlot {
            generation: 0,
            alive: true,
            msgid: 0,
            parent: StateId { index: 0, generation: 0 },
            rxcmd: 0,
            txcmd: 0,
            icmd: 0,
            children: Vec::new(),
            refs: 0,
            flags: StateFlags::ROOT,
            relay: None,
        };
        StateTable {
            slots: vec![root],
            free: Vec::new(),
            reader_tree: BTreeMap::new(),
            writer_tree: BTreeMap::new(),
            next_local_msgid: 1,
        }
    }

    pub fn root(&self) -> StateId {
        StateId { index: 0, generation: 0 }
    }

    fn slot(&self, id: StateId) -> Option<&StateSlot> {
        let s = self.slots.get(id.index as usize)?;
        (s.alive && s.generation == id.generation).then_some(s)
    }

    fn slot_mut(&mut self, id: StateId) -> Option<&mut StateSlot> {
        let s = self.slots.get_mut(id.index as usize)?;
        if s.alive && s.generation == id.generation {
            Some(s)
        } else {
            None
        }
    }

    pub fn msgid(&self, id: StateId) -> Option<u64> {
        self.slot(id).map(|s| s.msgid)
    }

    pub fn rxcmd(&self, id: StateId) -> Option<u32> {
        self.slot(id).map(|s| s.rxcmd)
    }

    pub fn txcmd(&self, id: StateId) -> Option<u32> {
        self.slot(id).map(|s| s.txcmd)
    }

    pub fn parent_of(&self, id: StateId) -> Option<StateId> {
        self.slot(id).map(|s| s.parent)
    }

    pub fn relay_of(&self, id: StateId) -> Option<StateId> {
        self.slot(id).and_then(|s| s.relay)
    }

    pub fn set_relay(&mut self, id: StateId, peer: StateId) {
        if let Some(s) = self.slot_mut(id) {
            s.relay = Some(peer);
        }
    }

    pub fn is_reader(&self, id: StateId) -> bool {
        self.slot(id).map(|s| s.flags.contains(StateFlags::OPPOSITE)).unwrap_or(false)
    }

    fn alloc_slot(&mut self, slot: StateSlot) -> StateId {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation + 1;
            self.slots[index as usize] = StateSlot { generation, ..slot };
            StateId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(StateSlot { generation: 0, ..slot });
            StateId { index, generation: 0 }
        }
    }

    fn lookup_parent(&self, circuit: u64, revcirc: bool) -> Option<StateId> {
        if circuit == 0 {
            return Some(self.root());
        }
        let tree = if revcirc { &self.writer_tree } else { &self.reader_tree };
        tree.get(&circuit).copied()
    }

    fn lookup_existing(&self, msgid: u64, revtrans: bool) -> Option<StateId> {
        let tree = if revtrans { &self.writer_tree } else { &self.reader_tree };
        tree.get(&msgid).copied()
    }

    /// Opens a transaction we are originating (spec §4.10's writer-tree
    /// path; mirrors `dmsg_msg_alloc`'s CREATE-without-REPLY branch). The
    /// msgid is this side's own address-derived identifier -- here, a
    /// monotonically increasing local counter stands in for the C
    /// pointer-derived id, since the slab already rules out ABA reuse.
    pub fn create_local(&mut self, pstate: StateId, basecmd: u16) -> Result<StateId, DmsgError> {
        if self.slot(pstate).is_none() {
            return Err(DmsgError::Trans);
        }
        let msgid = self.next_local_msgid;
        self.next_local_msgid += 1;
        let id = self.alloc_slot(StateSlot {
            generation: 0,
            alive: true,
            msgid,
            parent: pstate,
            rxcmd: DmsgFlags::REPLY.bits(),
            txcmd: basecmd as u32,
            icmd: basecmd as u32,
            children: Vec::new(),
            refs: 0,
            flags: StateFlags::DYNAMIC | StateFlags::INSERTED,
            relay: None,
        });
        self.writer_tree.insert(msgid, id);
        if let Some(p) = self.slot_mut(pstate) {
            p.children.push(id);
            p.refs += 1;
        }
        Ok(id)
    }

    /// Feeds one received header through the CREATE/DELETE/REPLY/ABORT
    /// switch (spec §4.10's full table). Returns `Err(DmsgError::Ealready)`
    /// for the benign ABORT+DELETE race against an already-closed or
    /// never-opened transaction -- callers should discard and resume
    /// rather than treat it as fatal (spec §7).
    pub fn on_receive(&mut self, header: &DmsgHeader) -> Result<RxEvent, DmsgError> {
        let flags = header.cmd.flags();
        let revtrans = flags.contains(DmsgFlags::REVTRANS);
        let revcirc = flags.contains(DmsgFlags::REVCIRC);
        let create = flags.contains(DmsgFlags::CREATE);
        let delete = flags.contains(DmsgFlags::DELETE);
        let reply = flags.contains(DmsgFlags::REPLY);
        let abort = flags.contains(DmsgFlags::ABORT);

        let pstate = self.lookup_parent(header.circuit, revcirc).ok_or(DmsgError::Trans)?;
        let existing = self.lookup_existing(header.msgid, revtrans);

        let (sid, created) = if create && !reply {
            if existing.is_some() {
                return Err(DmsgError::Trans);
            }
            let id = self.alloc_slot(StateSlot {
                generation: 0,
                alive: true,
                msgid: header.msgid,
                parent: pstate,
                rxcmd: header.cmd.without(DmsgFlags::DELETE).0,
                txcmd: DmsgFlags::REPLY.bits(),
                icmd: header.cmd.basecmd() as u32,
                children: Vec::new(),
                refs: 0,
                flags: StateFlags::DYNAMIC | StateFlags::INSERTED | StateFlags::OPPOSITE,
                relay: None,
            });
            self.reader_tree.insert(header.msgid, id);
            if let Some(p) = self.slot_mut(pstate) {
                p.children.push(id);
                p.refs += 1;
            }
            (id, true)
        } else {
            match existing {
                Some(id) => (id, false),
                None => {
                    return if abort {
                        Err(DmsgError::Ealready)
                    } else {
                        Err(DmsgError::Trans)
                    }
                }
            }
        };

        if reply && create {
            // REPLY+CREATE: state pre-existed (we originated as writer).
            if let Some(s) = self.slot_mut(sid) {
                s.rxcmd = header.cmd.without(DmsgFlags::DELETE).0;
            }
        } else if !created {
            if let Some(s) = self.slot_mut(sid) {
                s.icmd = header.cmd.basecmd() as u32;
            }
        }

        let freed = self.cleanup_rx(sid, delete)?;

        if created {
            Ok(RxEvent::Created(sid))
        } else if delete {
            Ok(RxEvent::Closed { state: sid, freed })
        } else {
            Ok(RxEvent::Stream(sid))
        }
    }

    /// Post-processing for a received message (spec §4.10
    /// `state_cleanuprx`): merges DELETE into `rxcmd`, and frees the state
    /// once both directions have closed and it has no children left.
    fn cleanup_rx(&mut self, sid: StateId, delete: bool) -> Result<bool, DmsgError> {
        if !delete {
            return Ok(false);
        }
        let (both_closed, is_root) = {
            let Some(s) = self.slot_mut(sid) else {
                return Err(DmsgError::Trans);
            };
            s.rxcmd |= DmsgFlags::DELETE.bits();
            (
                s.rxcmd & DmsgFlags::DELETE.bits() != 0 && s.txcmd & DmsgFlags::DELETE.bits() != 0,
                s.flags.contains(StateFlags::ROOT),
            )
        };
        if both_closed && !is_root {
            self.free_if_empty(sid);
            return Ok(true);
        }
        Ok(false)
    }

    /// Marks this side's direction as DELETE-sent (spec §4.10
    /// `state_cleanuptx`, the TX-side mirror of `cleanup_rx`). Called by
    /// the egress flusher once a DELETE-flagged message has been fully
    /// written.
    pub fn cleanup_tx(&mut self, sid: StateId) -> Result<bool, DmsgError> {
        let (both_closed, is_root) = {
            let Some(s) = self.slot_mut(sid) else {
                return Err(DmsgError::Trans);
            };
            s.txcmd |= DmsgFlags::DELETE.bits();
            (
                s.rxcmd & DmsgFlags::DELETE.bits() != 0 && s.txcmd & DmsgFlags::DELETE.bits() != 0,
                s.flags.contains(StateFlags::ROOT),
            )
        };
        if both_closed && !is_root {
            self.free_if_empty(sid);
            return Ok(true);
        }
        Ok(false)
    }

    /// Unlinks from its tree and detaches from the parent's child list and
    /// refcount; only actually frees the slot once `subq` (children) is
    /// empty, per spec §4.10 ("free state when subq empty").
    fn free_if_empty(&mut self, sid: StateId) {
        let Some(s) = self.slot(sid) else { return };
        if !s.children.is_empty() {
            return;
        }
        let msgid = s.msgid;
        let parent = s.parent;
        let is_reader = s.flags.contains(StateFlags::OPPOSITE);
        let relay = s.relay;

        if is_reader {
            self.reader_tree.remove(&msgid);
        } else {
            self.writer_tree.remove(&msgid);
        }
        if let Some(p) = self.slot_mut(parent) {
            p.children.retain(|&c| c != sid);
            p.refs = p.refs.saturating_sub(1);
        }
        if let Some(peer) = relay {
            if let Some(s) = self.slot_mut(peer) {
                s.relay = None;
            }
        }
        if let Some(s) = self.slot_mut(sid) {
            s.alive = false;
            s.relay = None;
        }
        self.free.push(sid.index);
    }

    pub fn reader_tree_is_empty(&self) -> bool {
        self.reader_tree.is_empty()
    }

    pub fn writer_tree_is_empty(&self) -> bool {
        self.writer_tree.is_empty()
    }

    /// All states currently open in either tree, reader first then
    /// writer (spec §7's drain order for the synthesized LNK_ERROR
    /// cascade).
    pub fn all_open_states(&self) -> Vec<StateId> {
        self.reader_tree
            .values()
            .copied()
            .chain(self.writer_tree.values().copied())
            .collect()
    }

    /// Builds the DELETE+ABORT+LNK_ERROR cmd to synthesize for a given
    /// open state during the error-drain cascade (spec §4.8 ERROR state,
    /// §7). Mirrors the original's asymmetric REVTRANS/REVCIRC/CREATE
    /// patch-up depending on which side (rx- or tx-opened) is closing.
    pub fn synth_error_cmd(&self, sid: StateId) -> DmsgCmd {
        let mut flags = DmsgFlags::ABORT | DmsgFlags::DELETE;
        if let Some(s) = self.slot(sid) {
            if s.flags.contains(StateFlags::OPPOSITE) {
                flags |= DmsgFlags::REVCIRC;
            } else {
                flags |= DmsgFlags::REVTRANS | DmsgFlags::REPLY;
                if s.rxcmd & DmsgFlags::CREATE.bits() == 0 {
                    flags |= DmsgFlags::CREATE;
                }
            }
        }
        DmsgCmd::new(crate::message::opcode::LNK_ERROR, 1, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MAGIC;

    fn hdr(msgid: u64, circuit: u64, flags: DmsgFlags) -> DmsgHeader {
        DmsgHeader {
            magic: MAGIC,
            salt: 0,
            msgid,
            circuit,
            cmd: DmsgCmd::new(crate::message::opcode::LNK_PING, 1, flags),
            aux_crc: 0,
            aux_bytes: 0,
            error: 0,
            aux_descr: 0,
            hdr_crc: 0,
        }
    }

    #[test]
    fn create_then_reply_create_delete_closes_transaction() {
        let mut t = StateTable::new();
        let created = t.on_receive(&hdr(1, 0, DmsgFlags::CREATE)).unwrap();
        let RxEvent::Created(sid) = created else { panic!() };
        assert!(!t.reader_tree_is_empty());

        // TX side replies (this side sends, so mark our own DELETE).
        let freed = t.cleanup_tx(sid).unwrap();
        assert!(!freed); // remote hasn't sent its DELETE yet

        // Remote's REPLY+CREATE+DELETE closes its side.
        let closed = t
            .on_receive(&hdr(1, 0, DmsgFlags::REPLY | DmsgFlags::CREATE | DmsgFlags::DELETE))
            .unwrap();
        assert_eq!(closed, RxEvent::Closed { state: sid, freed: true });
        assert!(t.reader_tree_is_empty());
    }

    #[test]
    fn duplicate_create_is_a_transaction_error() {
        let mut t = StateTable::new();
        t.on_receive(&hdr(5, 0, DmsgFlags::CREATE)).unwrap();
        assert_eq!(t.on_receive(&hdr(5, 0, DmsgFlags::CREATE)), Err(DmsgError::Trans));
    }

    #[test]
    fn delete_without_matching_create_and_abort_is_ealready() {
        let mut t = StateTable::new();
        let result = t.on_receive(&hdr(99, 0, DmsgFlags::DELETE | DmsgFlags::ABORT));
        assert_eq!(result, Err(DmsgError::Ealready));
    }

    #[test]
    fn delete_without_matching_create_and_no_abort_is_protocol_error() {
        let mut t = StateTable::new();
        let result = t.on_receive(&hdr(99, 0, DmsgFlags::DELETE));
        assert_eq!(result, Err(DmsgError::Trans));
    }

    #[test]
    fn abort_idempotence_second_call_is_also_ealready_with_no_tree_change() {
        let mut t = StateTable::new();
        t.on_receive(&hdr(1, 0, DmsgFlags::CREATE)).unwrap();
        let sid = *t.reader_tree.get(&1).unwrap();
        t.cleanup_tx(sid).unwrap();
        t.on_receive(&hdr(1, 0, DmsgFlags::REPLY | DmsgFlags::CREATE | DmsgFlags::DELETE))
            .unwrap();
        assert!(t.reader_tree_is_empty());

        let before = t.slots.len();
        let r1 = t.on_receive(&hdr(1, 0, DmsgFlags::DELETE | DmsgFlags::ABORT));
        assert_eq!(r1, Err(DmsgError::Ealready));
        let r2 = t.on_receive(&hdr(1, 0, DmsgFlags::DELETE | DmsgFlags::ABORT));
        assert_eq!(r2, Err(DmsgError::Ealready));
        assert_eq!(t.slots.len(), before);
        assert!(t.reader_tree_is_empty());
    }

    #[test]
    fn stream_message_in_open_transaction_does_not_close_it() {
        let mut t = StateTable::new();
        t.on_receive(&hdr(1, 0, DmsgFlags::CREATE)).unwrap();
        let streamed = t.on_receive(&hdr(1, 0, DmsgFlags::empty()));
        assert!(matches!(streamed, Ok(RxEvent::Stream(_))));
        assert!(!t.reader_tree_is_empty());
    }

    #[test]
    fn create_local_opens_a_writer_tree_entry() {
        let mut t = StateTable::new();
        let root = t.root();
        let id = t.create_local(root, crate::message::opcode::LNK_PING).unwrap();
        assert!(!t.writer_tree_is_empty());
        assert_eq!(t.parent_of(id), Some(root));
    }
}
