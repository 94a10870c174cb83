//! Outbound pending messages and their lazily built fragment trees.
//!
//! A root holds the complete encoded frame. Fragments are byte ranges of the
//! root with absolute offsets, cut only when a queue's MTU asks for it; a
//! fragment that is still too large for a smaller MTU is cut again, so the
//! live leaves always cover each byte of the root exactly once.

use std::collections::HashMap;

use uuid::Uuid;

use crate::identity::PeerIdentity;
use crate::ids::{HopId, IdAllocator, PendingId, QueueId};
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Payload from the upper layer.
    Core,
    /// A DV box we relay to the next hop.
    DvForward,
    /// Byte range of a root.
    Fragment,
}

#[derive(Debug)]
pub struct PendingMessage {
    pub id: PendingId,
    pub kind: PendingKind,
    /// Virtual link the root is queued on.
    pub target: PeerIdentity,
    pub root: PendingId,
    pub parent: Option<PendingId>,
    pub children: Vec<PendingId>,
    /// Encoded frame; roots only.
    pub data: Vec<u8>,
    /// Upper-layer payload size; roots only.
    pub bytes_msg: usize,
    /// Wire bytes spent on this root so far.
    pub bytes_physical: u64,
    pub offset: usize,
    pub len: usize,
    /// How much of this node has been cut into children.
    pub frag_off: usize,
    /// Set when the root is first fragmented.
    pub msg_uuid: Option<Uuid>,
    pub pending_acks: Vec<Uuid>,
    pub next_attempt: Timestamp,
    pub attempts: u32,
}

impl PendingMessage {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.frag_off == 0
    }
}

/// One attempted transmission awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingAcknowledgement {
    pub queue: Option<QueueId>,
    pub hop: Option<HopId>,
    pub pending: Option<PendingId>,
    /// Peer expected to send the ack.
    pub receiver: PeerIdentity,
    pub sent_at: Timestamp,
    pub size: usize,
}

/// What was freed by completing or dropping part of a tree.
#[derive(Debug, Default)]
pub struct Removed {
    pub acks: Vec<Uuid>,
    pub root: Option<PendingMessage>,
}

#[derive(Default)]
pub struct PendingStore {
    msgs: HashMap<PendingId, PendingMessage>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PendingId) -> Option<&PendingMessage> {
        self.msgs.get(&id)
    }

    pub fn get_mut(&mut self, id: PendingId) -> Option<&mut PendingMessage> {
        self.msgs.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn insert_root(
        &mut self,
        ids: &mut IdAllocator,
        kind: PendingKind,
        target: PeerIdentity,
        data: Vec<u8>,
        bytes_msg: usize,
    ) -> PendingId {
        let id = PendingId(ids.next());
        let len = data.len();
        self.msgs.insert(
            id,
            PendingMessage {
                id,
                kind,
                target,
                root: id,
                parent: None,
                children: Vec::new(),
                data,
                bytes_msg,
                bytes_physical: 0,
                offset: 0,
                len,
                frag_off: 0,
                msg_uuid: None,
                pending_acks: Vec::new(),
                next_attempt: Timestamp::ZERO,
                attempts: 0,
            },
        );
        id
    }

    /// Bytes carried by `id`: its range of the root frame.
    pub fn bytes(&self, id: PendingId) -> Option<&[u8]> {
        let pm = self.msgs.get(&id)?;
        let root = self.msgs.get(&pm.root)?;
        root.data.get(pm.offset..pm.offset + pm.len)
    }

    /// Choose the next leaf of the tree under `id` to transmit, cutting new
    /// fragments as needed. A root may go out whole when it is at most
    /// `whole_max` bytes; fragment pieces are at most `piece_max` bytes.
    pub fn pick_leaf(
        &mut self,
        id: PendingId,
        whole_max: usize,
        piece_max: usize,
        now: Timestamp,
        rng_uuid: &mut dyn FnMut() -> Uuid,
        ids: &mut IdAllocator,
    ) -> Option<PendingId> {
        let pm = self.msgs.get(&id)?;
        let children = pm.children.clone();
        let (is_root, is_leaf) = (pm.is_root(), pm.is_leaf());
        let (len, frag_off, next_attempt) = (pm.len, pm.frag_off, pm.next_attempt);
        for c in children {
            if let Some(leaf) = self.pick_leaf(c, whole_max, piece_max, now, rng_uuid, ids) {
                return Some(leaf);
            }
        }
        let fit = if is_root { whole_max } else { piece_max };
        if is_leaf && len <= fit {
            return (next_attempt <= now).then_some(id);
        }
        if frag_off < len && piece_max > 0 {
            return self.cut(id, piece_max, rng_uuid, ids);
        }
        None
    }

    fn cut(
        &mut self,
        id: PendingId,
        piece_max: usize,
        rng_uuid: &mut dyn FnMut() -> Uuid,
        ids: &mut IdAllocator,
    ) -> Option<PendingId> {
        let child = PendingId(ids.next());
        let pm = self.msgs.get_mut(&id)?;
        let size = piece_max.min(pm.len - pm.frag_off);
        let offset = pm.offset + pm.frag_off;
        pm.frag_off += size;
        pm.children.push(child);
        let (root, target) = (pm.root, pm.target);
        let root_pm = self.msgs.get_mut(&root)?;
        if root_pm.msg_uuid.is_none() {
            root_pm.msg_uuid = Some(rng_uuid());
        }
        self.msgs.insert(
            child,
            PendingMessage {
                id: child,
                kind: PendingKind::Fragment,
                target,
                root,
                parent: Some(id),
                children: Vec::new(),
                data: Vec::new(),
                bytes_msg: 0,
                bytes_physical: 0,
                offset,
                len: size,
                frag_off: 0,
                msg_uuid: None,
                pending_acks: Vec::new(),
                next_attempt: Timestamp::ZERO,
                attempts: 0,
            },
        );
        Some(child)
    }

    /// Earliest retry time among leaves of the tree under `id`.
    pub fn earliest_attempt(&self, id: PendingId) -> Option<Timestamp> {
        let pm = self.msgs.get(&id)?;
        let own = pm.is_leaf().then_some(pm.next_attempt);
        pm.children
            .iter()
            .filter_map(|c| self.earliest_attempt(*c))
            .chain(own)
            .min()
    }

    fn remove_subtree(&mut self, id: PendingId, acks: &mut Vec<Uuid>) -> Option<PendingMessage> {
        let pm = self.msgs.remove(&id)?;
        acks.extend(pm.pending_acks.iter().copied());
        for c in &pm.children {
            self.remove_subtree(*c, acks);
        }
        Some(pm)
    }

    /// The node `id` was acknowledged: drop it with everything below it, then
    /// every ancestor left fully cut and childless. Reports the root when the
    /// whole message is done.
    pub fn complete(&mut self, id: PendingId) -> Removed {
        let mut out = Removed::default();
        let Some(done) = self.remove_subtree(id, &mut out.acks) else {
            return out;
        };
        let mut child = done.id;
        let mut parent = done.parent;
        if parent.is_none() {
            out.root = Some(done);
            return out;
        }
        while let Some(pid) = parent {
            let Some(pm) = self.msgs.get_mut(&pid) else {
                break;
            };
            pm.children.retain(|c| *c != child);
            if !(pm.children.is_empty() && pm.frag_off == pm.len) {
                break;
            }
            child = pid;
            parent = pm.parent;
            if let Some(gone) = self.msgs.remove(&pid) {
                out.acks.extend(gone.pending_acks.iter().copied());
                if gone.is_root() {
                    out.root = Some(gone);
                }
            }
        }
        out
    }

    /// Drop a whole tree without completing it.
    pub fn free_root(&mut self, root: PendingId) -> Removed {
        let mut out = Removed::default();
        out.root = self.remove_subtree(root, &mut out.acks);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(len: usize) -> (PendingStore, IdAllocator, PendingId) {
        let mut store = PendingStore::new();
        let mut ids = IdAllocator::default();
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let target = PeerIdentity::from_bytes([1u8; 32]);
        let root = store.insert_root(&mut ids, PendingKind::Core, target, data, len);
        (store, ids, root)
    }

    fn drain(
        store: &mut PendingStore,
        ids: &mut IdAllocator,
        root: PendingId,
        whole: usize,
        piece: usize,
    ) -> Vec<PendingId> {
        let now = Timestamp::from_millis(10);
        let mut uuid = || Uuid::from_u128(7);
        let mut out = Vec::new();
        while let Some(leaf) = store.pick_leaf(root, whole, piece, now, &mut uuid, ids) {
            store.get_mut(leaf).unwrap().next_attempt = Timestamp::MAX;
            out.push(leaf);
        }
        out
    }

    #[test]
    fn small_root_goes_out_whole() {
        let (mut store, mut ids, root) = setup(100);
        let leaves = drain(&mut store, &mut ids, root, 1000, 900);
        assert_eq!(leaves, vec![root]);
        let removed = store.complete(root);
        assert!(removed.root.is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn leaves_cover_root_exactly_once() {
        let (mut store, mut ids, root) = setup(10_000);
        let leaves = drain(&mut store, &mut ids, root, 1_100, 1_100);
        assert_eq!(leaves.len(), 10);
        let mut seen = vec![0u8; 10_000];
        for l in &leaves {
            let pm = store.get(*l).unwrap();
            for b in &mut seen[pm.offset..pm.offset + pm.len] {
                *b += 1;
            }
            assert_eq!(store.bytes(*l).unwrap()[0], pm.offset as u8);
        }
        assert!(seen.iter().all(|c| *c == 1));
        assert!(store.get(root).unwrap().msg_uuid.is_some());
    }

    #[test]
    fn oversized_fragment_is_cut_again() {
        let (mut store, mut ids, root) = setup(3_000);
        let now = Timestamp::from_millis(1);
        let mut uuid = || Uuid::from_u128(1);
        let big = store
            .pick_leaf(root, 2_000, 2_000, now, &mut uuid, &mut ids)
            .unwrap();
        assert_eq!(store.get(big).unwrap().len, 2_000);
        let small = drain(&mut store, &mut ids, root, 500, 500);
        // the 2000-byte piece becomes four children; the remaining 1000 two more
        assert_eq!(small.len(), 6);
        assert_eq!(store.get(big).unwrap().children.len(), 4);
        for l in &small {
            assert!(store.get(*l).unwrap().len <= 500);
        }
    }

    #[test]
    fn root_completes_only_after_last_leaf() {
        let (mut store, mut ids, root) = setup(5_000);
        let leaves = drain(&mut store, &mut ids, root, 1_000, 1_000);
        let (last, rest) = leaves.split_last().unwrap();
        for l in rest {
            assert!(store.complete(*l).root.is_none());
            assert!(store.get(root).is_some());
        }
        let done = store.complete(*last);
        assert_eq!(done.root.unwrap().id, root);
        assert!(store.is_empty());
    }

    #[test]
    fn ack_of_cut_node_frees_its_children() {
        let (mut store, mut ids, root) = setup(2_000);
        let now = Timestamp::from_millis(1);
        let mut uuid = || Uuid::from_u128(1);
        let first = store
            .pick_leaf(root, 1_000, 1_000, now, &mut uuid, &mut ids)
            .unwrap();
        store.get_mut(first).unwrap().pending_acks.push(Uuid::from_u128(42));
        store.get_mut(first).unwrap().next_attempt = Timestamp::MAX;
        // cut the sent piece further under a smaller MTU
        let sub = store
            .pick_leaf(root, 400, 400, now, &mut uuid, &mut ids)
            .unwrap();
        assert_eq!(store.get(sub).unwrap().parent, Some(first));
        let removed = store.complete(first);
        assert_eq!(removed.acks, vec![Uuid::from_u128(42)]);
        assert!(store.get(sub).is_none());
        assert!(store.get(root).is_some());
    }

    #[test]
    fn earliest_attempt_tracks_waiting_leaves() {
        let (mut store, mut ids, root) = setup(2_000);
        let leaves = drain(&mut store, &mut ids, root, 1_000, 1_000);
        store.get_mut(leaves[1]).unwrap().next_attempt = Timestamp::from_millis(50);
        assert_eq!(store.earliest_attempt(root), Some(Timestamp::from_millis(50)));
    }
}
