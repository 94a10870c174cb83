//! Sender side of virtual links: queue selection, framing of pending leaves,
//! control messages, and processing of cumulative acknowledgements.

use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::{Action, Inbound, TimerEvent, TransportCore};
use crate::dv::DistanceVectorHop;
use crate::identity::PeerIdentity;
use crate::ids::{CommunicatorId, HopId, PendingId, QueueId};
use crate::pending::{PendingAcknowledgement, PendingKind, PendingMessage};
use crate::protocol::{FragmentBox, Message, ReliabilityAck, ReliabilityBox};
use crate::queue::{Characteristics, InFlight, Queue};
use crate::scheduler::{Route, RouteOptions};
use crate::stats;
use crate::time::Timestamp;
use crate::wire;

/// Retransmission delay doubles per attempt up to this many times.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Floor for the round-trip estimate; a zero estimate would resend at once.
const MIN_RTT: Duration = Duration::from_millis(10);

/// Header bytes a fragment adds around its payload.
pub(crate) fn fragment_overhead() -> usize {
    wire::encoded_len(&Message::Fragment(FragmentBox {
        ack_uuid: Uuid::nil(),
        msg_uuid: Uuid::nil(),
        frag_off: 0,
        msg_size: 0,
        payload: Vec::new(),
    }))
    .unwrap_or(64)
}

/// Header bytes a reliability box adds around its inner frame.
pub(crate) fn reliability_overhead() -> usize {
    wire::encoded_len(&Message::ReliabilityBox(ReliabilityBox {
        ack_countdown: 0,
        ack_uuid: Uuid::nil(),
        inner: Vec::new(),
    }))
    .unwrap_or(64)
}

impl TransportCore {
    fn is_reliable(&self, communicator: CommunicatorId) -> bool {
        self.communicators
            .get(&communicator)
            .is_some_and(|c| c.characteristics == Characteristics::Reliable)
    }

    pub(crate) fn queue_has_capacity(&self, qid: QueueId) -> bool {
        let Some(q) = self.queues.get(&qid) else {
            return false;
        };
        let Some(c) = self.communicators.get(&q.communicator) else {
            return false;
        };
        q.is_up()
            && q.in_flight.len() < self.config.queue_length_limit as usize
            && c.total_in_flight < self.config.communicator_total_queue_limit
    }

    /// Usable queues to a neighbour; validated ones unless `unconfirmed`.
    fn queues_to(&self, peer: &PeerIdentity, now: Timestamp, unconfirmed: bool) -> Vec<QueueId> {
        let Some(n) = self.neighbours.get(peer) else {
            return Vec::new();
        };
        n.queues
            .iter()
            .filter_map(|q| self.queues.get(q))
            .filter(|q| q.is_validated(now) || (unconfirmed && q.is_up()))
            .map(|q| q.id)
            .collect()
    }

    /// Least loaded usable queue, validated ones first.
    pub(crate) fn pick_queue(
        &self,
        peer: &PeerIdentity,
        now: Timestamp,
        unconfirmed: bool,
    ) -> Option<QueueId> {
        self.ranked_queues(peer, now, unconfirmed).first().copied()
    }

    /// Usable queues to `peer`, validated and least loaded first.
    fn ranked_queues(&self, peer: &PeerIdentity, now: Timestamp, unconfirmed: bool) -> Vec<QueueId> {
        let mut qs: Vec<&Queue> = self
            .queues_to(peer, now, unconfirmed)
            .into_iter()
            .filter_map(|q| self.queues.get(&q))
            .collect();
        qs.sort_by_key(|q| (!q.is_validated(now), q.in_flight.len(), q.id));
        qs.into_iter().map(|q| q.id).collect()
    }

    /// DV paths to `target` whose next hop has a queue, confirmed and shortest first.
    fn ranked_hops(&self, target: &PeerIdentity, now: Timestamp, unconfirmed: bool) -> Vec<HopId> {
        let Some(dv) = self.dvs.get(target) else {
            return Vec::new();
        };
        let mut hs: Vec<&DistanceVectorHop> = dv
            .hops
            .iter()
            .filter_map(|h| self.hops.get(h))
            .filter(|h| unconfirmed || h.path_valid_until > now)
            .filter(|h| !self.queues_to(&h.next_hop, now, true).is_empty())
            .collect();
        hs.sort_by_key(|h| (h.path_valid_until <= now, h.distance(), h.id));
        hs.into_iter().map(|h| h.id).collect()
    }

    /// Re-check every link that may send through neighbour `peer`.
    pub(crate) fn schedule_neighbour(&mut self, peer: PeerIdentity) {
        let queues = self
            .neighbours
            .get(&peer)
            .map(|n| n.queues.clone())
            .unwrap_or_default();
        for q in queues {
            self.flush_control_backlog(q);
        }
        self.check_link_transmission(peer);
        let targets: Vec<PeerIdentity> = self
            .neighbours
            .get(&peer)
            .map(|n| {
                n.dv_hops
                    .iter()
                    .filter_map(|h| self.hops.get(h))
                    .map(|h| h.target)
                    .collect()
            })
            .unwrap_or_default();
        for t in targets {
            self.check_link_transmission(t);
        }
    }

    pub(crate) fn schedule_communicator(&mut self, communicator: CommunicatorId) {
        let peers: Vec<PeerIdentity> = self
            .communicators
            .get(&communicator)
            .map(|c| {
                c.queues
                    .iter()
                    .filter_map(|q| self.queues.get(q))
                    .map(|q| q.neighbour)
                    .collect()
            })
            .unwrap_or_default();
        for p in peers {
            self.schedule_neighbour(p);
        }
    }

    /// Push pending messages of the link to `target` onto every queue that
    /// has room: validated direct queues first, then confirmed DV paths.
    pub(crate) fn check_link_transmission(&mut self, target: PeerIdentity) {
        let now = self.now();
        let Some(vl) = self.links.get(&target) else {
            return;
        };
        if vl.pending.is_empty() {
            self.cancel_retransmit(target);
            return;
        }
        for qid in self.queues_to(&target, now, false) {
            self.fill_queue(target, qid, None, now);
        }
        let hops: Vec<HopId> = self
            .dvs
            .get(&target)
            .map(|dv| {
                dv.hops
                    .iter()
                    .filter(|h| self.hops.get(h).is_some_and(|h| h.path_valid_until > now))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for hop in hops {
            let Some(next) = self.hops.get(&hop).map(|h| h.next_hop) else {
                continue;
            };
            for qid in self.queues_to(&next, now, false) {
                self.fill_queue(target, qid, Some(hop), now);
            }
        }
        self.schedule_retransmit(target, now);
    }

    fn fill_queue(&mut self, target: PeerIdentity, qid: QueueId, hop: Option<HopId>, now: Timestamp) {
        self.flush_control_backlog(qid);
        while self.queue_has_capacity(qid) {
            let Some(leaf) = self.next_leaf(target, qid, hop, now) else {
                break;
            };
            if !self.transmit_leaf(target, qid, hop, leaf, now) {
                break;
            }
        }
    }

    /// Frame budgets on `qid` for a whole root and for one fragment piece.
    fn budgets(&self, qid: QueueId, hop: Option<HopId>) -> (usize, usize) {
        let Some(q) = self.queues.get(&qid) else {
            return (0, 0);
        };
        let mut budget = q.max_frame();
        if let Some(h) = hop.and_then(|h| self.hops.get(&h)) {
            budget = budget.saturating_sub(crate::backchannel::dv_box_overhead(h.path.len() + 1));
        }
        let need_ack = hop.is_some() || !self.is_reliable(q.communicator);
        let whole = if need_ack {
            budget.saturating_sub(reliability_overhead())
        } else {
            budget
        };
        (whole, budget.saturating_sub(fragment_overhead()))
    }

    fn next_leaf(
        &mut self,
        target: PeerIdentity,
        qid: QueueId,
        hop: Option<HopId>,
        now: Timestamp,
    ) -> Option<PendingId> {
        let roots: Vec<PendingId> = self.links.get(&target)?.pending.iter().copied().collect();
        let (whole, piece) = self.budgets(qid, hop);
        for root in roots {
            let kind = self.pending.get(root).map(|pm| pm.kind);
            if hop.is_some() && kind != Some(PendingKind::Core) {
                continue;
            }
            let mut seed = [0u8; 16];
            rand::RngCore::fill_bytes(&mut self.rng, &mut seed);
            let mut fresh = || uuid::Builder::from_random_bytes(seed).into_uuid();
            if let Some(leaf) = self
                .pending
                .pick_leaf(root, whole, piece, now, &mut fresh, &mut self.ids)
            {
                return Some(leaf);
            }
        }
        None
    }

    fn transmit_leaf(
        &mut self,
        target: PeerIdentity,
        qid: QueueId,
        hop: Option<HopId>,
        leaf: PendingId,
        now: Timestamp,
    ) -> bool {
        let Some(communicator) = self.queues.get(&qid).map(|q| q.communicator) else {
            return false;
        };
        let need_ack = hop.is_some() || !self.is_reliable(communicator);
        let Some(pm) = self.pending.get(leaf) else {
            return false;
        };
        let (root_id, offset, is_root, attempts) = (pm.root, pm.offset, pm.is_root(), pm.attempts);
        let Some(bytes) = self.pending.bytes(leaf).map(<[u8]>::to_vec) else {
            return false;
        };
        let Some(root) = self.pending.get(root_id) else {
            return false;
        };
        let (msg_uuid, msg_size) = (root.msg_uuid.unwrap_or_else(Uuid::nil), root.len);
        let ack_uuid = if need_ack { self.fresh_uuid() } else { Uuid::nil() };
        let framed = if !is_root {
            wire::encode_frame(&Message::Fragment(FragmentBox {
                ack_uuid,
                msg_uuid,
                frag_off: offset as u32,
                msg_size: msg_size as u32,
                payload: bytes,
            }))
        } else if need_ack {
            // roots queued behind this one
            let behind = self.links.get(&target).map_or(0, |vl| {
                vl.pending.iter().skip_while(|r| **r != root_id).count()
            });
            wire::encode_frame(&Message::ReliabilityBox(ReliabilityBox {
                ack_countdown: behind.saturating_sub(1) as u32,
                ack_uuid,
                inner: bytes,
            }))
        } else {
            Ok(bytes)
        };
        let frame = match framed {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "cannot frame pending message");
                return false;
            }
        };
        let frame = match hop {
            Some(h) => match self.dv_encapsulate(h, &frame) {
                Some(boxed) => boxed,
                None => return false,
            },
            None => frame,
        };
        let size = frame.len();
        if let Some(root) = self.pending.get_mut(root_id) {
            root.bytes_physical += size as u64;
        }
        if attempts > 0 {
            self.stats.incr(stats::RETRANSMISSIONS);
        }
        trace!(peer = %target, ?leaf, size, ?hop, "transmitting");
        if !need_ack {
            // completed once the communicator reports the send done
            if let Some(pm) = self.pending.get_mut(leaf) {
                pm.attempts += 1;
                pm.next_attempt = Timestamp::MAX;
            }
            self.transmit_raw(qid, frame, Some(leaf));
            return true;
        }
        let rtt = self.estimate_rtt(qid, hop);
        let shift = attempts.min(MAX_BACKOFF_SHIFT);
        // the receiver may hold the ack back for up to the cumulative delay
        let wait = rtt
            .saturating_mul(self.config.retransmit_rtt_factor)
            .saturating_add(self.config.max_cumulative_ack_delay)
            .saturating_mul(1 << shift);
        if let Some(pm) = self.pending.get_mut(leaf) {
            pm.attempts += 1;
            pm.next_attempt = now.saturating_add(wait);
            pm.pending_acks.push(ack_uuid);
        }
        self.pending_acks.insert(
            ack_uuid,
            PendingAcknowledgement {
                queue: Some(qid),
                hop,
                pending: Some(leaf),
                receiver: target,
                sent_at: now,
                size,
            },
        );
        if let Some(q) = self.queues.get_mut(&qid) {
            q.pending_acks.push(ack_uuid);
        }
        if let Some(h) = hop.and_then(|h| self.hops.get_mut(&h)) {
            h.pending_acks.push(ack_uuid);
        }
        self.transmit_raw(qid, frame, None);
        true
    }

    fn estimate_rtt(&self, qid: QueueId, hop: Option<HopId>) -> Duration {
        let q = self.queues.get(&qid).and_then(|q| q.pd.rtt());
        let h = hop.and_then(|h| self.hops.get(&h)).and_then(|h| h.pd.rtt());
        q.max(h).unwrap_or(self.config.default_rtt).max(MIN_RTT)
    }

    /// Hand one frame to a queue. `complete` is finished when the send completes.
    pub(crate) fn transmit_raw(&mut self, qid: QueueId, frame: Vec<u8>, complete: Option<PendingId>) {
        let now = self.now();
        let message_id = self.ids.next();
        let Some(q) = self.queues.get_mut(&qid) else {
            return;
        };
        let size = frame.len();
        q.in_flight.insert(
            message_id,
            InFlight {
                pending: complete,
                bytes: size,
            },
        );
        q.idle = false;
        q.pd.record_sent(size, now);
        let (communicator, handle) = (q.communicator, q.handle);
        if let Some(c) = self.communicators.get_mut(&communicator) {
            c.total_in_flight += 1;
        }
        self.transmissions.insert(message_id, qid);
        self.emit(Action::Transmit {
            communicator,
            queue: handle,
            message_id,
            bytes: frame,
        });
        self.notify_monitors(qid);
    }

    fn cancel_retransmit(&mut self, target: PeerIdentity) {
        let old = self.links.get_mut(&target).and_then(|vl| vl.retransmit.take());
        if let Some((h, _)) = old {
            self.timers.cancel(h);
        }
    }

    fn schedule_retransmit(&mut self, target: PeerIdentity, now: Timestamp) {
        let Some(vl) = self.links.get(&target) else {
            return;
        };
        let earliest = vl
            .pending
            .iter()
            .filter_map(|r| self.pending.earliest_attempt(*r))
            .min()
            .filter(|at| *at > now && *at != Timestamp::MAX);
        let current = vl.retransmit.map(|(_, at)| at);
        if earliest == current {
            return;
        }
        self.cancel_retransmit(target);
        if let Some(at) = earliest {
            let h = self.timers.schedule(at, TimerEvent::Retransmit(target));
            if let Some(vl) = self.links.get_mut(&target) {
                vl.retransmit = Some((h, at));
            }
        }
    }

    /// The communicator finished sending `message_id`; frees queue capacity.
    pub fn on_send_complete(&mut self, communicator: CommunicatorId, message_id: u64) -> Vec<Action> {
        let Some(qid) = self.transmissions.remove(&message_id) else {
            return self.finish();
        };
        let Some(q) = self.queues.get_mut(&qid) else {
            return self.finish();
        };
        let flight = q.in_flight.remove(&message_id);
        q.idle = q.in_flight.is_empty();
        let peer = q.neighbour;
        let limit = self.config.communicator_total_queue_limit;
        let mut was_full = false;
        if let Some(c) = self.communicators.get_mut(&communicator) {
            was_full = c.total_in_flight >= limit;
            c.total_in_flight = c.total_in_flight.saturating_sub(1);
        }
        if let Some(leaf) = flight.and_then(|f| f.pending) {
            self.complete_pending(leaf);
        }
        self.notify_monitors(qid);
        if was_full {
            self.schedule_communicator(communicator);
        } else {
            self.schedule_neighbour(peer);
        }
        self.finish()
    }

    /// `id` reached its receiver; finish the root once nothing is left.
    pub(crate) fn complete_pending(&mut self, id: PendingId) {
        let removed = self.pending.complete(id);
        self.drop_acks(removed.acks);
        if let Some(root) = removed.root {
            self.root_done(root);
        }
    }

    fn root_done(&mut self, root: PendingMessage) {
        if let Some(vl) = self.links.get_mut(&root.target) {
            vl.pending.retain(|p| *p != root.id);
        }
        if root.kind == PendingKind::Core {
            self.stats.incr(stats::CORE_SENT);
            self.emit(Action::SendOk {
                peer: root.target,
                success: true,
                bytes_msg: root.bytes_msg as u64,
                bytes_physical: root.bytes_physical,
            });
        }
    }

    /// Forget acknowledgements that can no longer matter.
    pub(crate) fn drop_acks(&mut self, acks: Vec<Uuid>) {
        for u in acks {
            let Some(pa) = self.pending_acks.remove(&u) else {
                continue;
            };
            if let Some(q) = pa.queue.and_then(|q| self.queues.get_mut(&q)) {
                q.pending_acks.retain(|x| *x != u);
            }
            if let Some(h) = pa.hop.and_then(|h| self.hops.get_mut(&h)) {
                h.pending_acks.retain(|x| *x != u);
            }
        }
    }

    pub(crate) fn handle_reliability_ack(&mut self, inb: &Inbound, ack: ReliabilityAck) {
        let now = self.now();
        trace!(sender = %inb.sender, counter = ack.ack_counter, n = ack.acks.len(), "ack received");
        for entry in ack.acks {
            let known = self
                .pending_acks
                .get(&entry.ack_uuid)
                .is_some_and(|pa| pa.receiver == inb.sender);
            if !known {
                self.stats.incr(stats::ACKS_UNKNOWN);
                continue;
            }
            let Some(pa) = self.pending_acks.remove(&entry.ack_uuid) else {
                continue;
            };
            let delay = Duration::from_micros(entry.ack_delay_us);
            let rtt = now.saturating_since(pa.sent_at).saturating_sub(delay);
            if let Some(q) = pa.queue.and_then(|q| self.queues.get_mut(&q)) {
                q.pd.update_rtt(rtt);
                q.pd.record_acked(pa.size, now);
                q.pending_acks.retain(|x| *x != entry.ack_uuid);
            }
            if let Some(h) = pa.hop.and_then(|h| self.hops.get_mut(&h)) {
                h.pd.update_rtt(rtt);
                h.pd.record_acked(pa.size, now);
                h.pending_acks.retain(|x| *x != entry.ack_uuid);
            }
            if let Some(pm) = pa.pending {
                self.complete_pending(pm);
            }
        }
    }

    /// Send a control frame to `target` as `opts` allow. False if no route exists.
    pub(crate) fn route_control(
        &mut self,
        target: PeerIdentity,
        frame: Vec<u8>,
        opts: RouteOptions,
    ) -> bool {
        let now = self.now();
        let mut queues = self.ranked_queues(&target, now, opts.unconfirmed_allowed);
        let mut hops = if opts.dv_allowed {
            self.ranked_hops(&target, now, opts.unconfirmed_allowed)
        } else {
            Vec::new()
        };
        if queues.is_empty() && hops.is_empty() {
            debug!(peer = %target, "no route for control message");
            self.stats.incr(stats::ROUTING_FAILED);
            return false;
        }
        // at most two sends when redundant, one otherwise
        let (nq, nh) = match (queues.is_empty(), hops.is_empty()) {
            (true, _) | (_, true) if opts.redundant => (2, 2),
            (true, _) | (_, true) => (1, 1),
            _ if opts.redundant => (1, 1),
            _ => match self.policy.choose(&mut self.rng) {
                Route::Direct => (1, 0),
                Route::DistanceVector => (0, 1),
            },
        };
        queues.truncate(nq);
        hops.truncate(nh);
        for q in queues {
            self.send_control_on_queue(q, frame.clone());
        }
        for h in hops {
            self.send_control_via_hop(h, &frame);
        }
        true
    }

    /// One-shot send to a direct neighbour over any queue that is up.
    pub(crate) fn send_direct(&mut self, peer: PeerIdentity, frame: Vec<u8>) -> bool {
        let now = self.now();
        match self.pick_queue(&peer, now, true) {
            Some(q) => {
                self.send_control_on_queue(q, frame);
                true
            }
            None => {
                self.stats.incr(stats::ROUTING_FAILED);
                false
            }
        }
    }

    fn send_control_via_hop(&mut self, hop: HopId, frame: &[u8]) {
        let now = self.now();
        let Some(next) = self.hops.get(&hop).map(|h| h.next_hop) else {
            return;
        };
        let Some(boxed) = self.dv_encapsulate(hop, frame) else {
            return;
        };
        if let Some(q) = self.pick_queue(&next, now, true) {
            self.send_control_on_queue(q, boxed);
        }
    }

    /// Unreliable one-shot send on a queue; waits in the queue's backlog
    /// when the queue is full.
    pub(crate) fn send_control_on_queue(&mut self, qid: QueueId, frame: Vec<u8>) {
        let Some(q) = self.queues.get(&qid) else {
            return;
        };
        if frame.len() > q.max_frame() {
            debug!(size = frame.len(), mtu = q.mtu, "control message exceeds mtu");
            self.stats.incr(stats::CONTROL_TOO_BIG);
            return;
        }
        if q.control_backlog.is_empty() && self.queue_has_capacity(qid) {
            self.transmit_raw(qid, frame, None);
            return;
        }
        let limit = self.config.control_backlog_limit;
        if let Some(q) = self.queues.get_mut(&qid) {
            if q.control_backlog.len() < limit {
                q.control_backlog.push_back(frame);
            } else {
                self.stats.incr(stats::CONTROL_BACKLOG_FULL);
            }
        }
    }

    fn flush_control_backlog(&mut self, qid: QueueId) {
        while self.queue_has_capacity(qid) {
            let Some(frame) = self
                .queues
                .get_mut(&qid)
                .and_then(|q| q.control_backlog.pop_front())
            else {
                break;
            };
            self.transmit_raw(qid, frame, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::dv::LearnResult;
    use crate::identity::Keypair;
    use crate::protocol::CoreData;
    use crate::queue::{ConnectionStatus, NetworkType};
    use crate::scheduler::Fixed;
    use crate::time::ManualClock;

    /// Core with a direct queue (handle 2) to `c` and a DV path to `c` via
    /// `b` (handle 1).
    fn two_routes() -> (TransportCore, PeerIdentity) {
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
        let mut core =
            TransportCore::with_clock(Keypair::generate(), TransportConfig::default(), clock, 7);
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let (b, c) = (Keypair::generate().identity(), Keypair::generate().identity());
        core.on_add_queue(comm, b, 1, "udp-b", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        assert_eq!(core.learn_path(&[b, c], None, Timestamp::ZERO), LearnResult::Learned);
        core.on_add_queue(comm, c, 2, "udp-c", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        (core, c)
    }

    /// Queue handles a control frame to `target` went out on.
    fn route(core: &mut TransportCore, target: PeerIdentity, opts: RouteOptions) -> Vec<u32> {
        let frame = wire::encode_frame(&Message::CoreData(CoreData { payload: vec![7; 20] })).unwrap();
        assert!(core.route_control(target, frame, opts));
        let mut handles: Vec<u32> = core
            .finish()
            .into_iter()
            .filter_map(|a| match a {
                Action::Transmit { queue, .. } => Some(queue),
                _ => None,
            })
            .collect();
        handles.sort_unstable();
        handles
    }

    #[test]
    fn fixed_policy_pins_the_route() {
        let (mut core, c) = two_routes();
        core.set_route_policy(Fixed(Route::Direct));
        for _ in 0..3 {
            assert_eq!(route(&mut core, c, RouteOptions::ANYTHING_GOES), vec![2]);
        }
        core.set_route_policy(Fixed(Route::DistanceVector));
        for _ in 0..3 {
            assert_eq!(route(&mut core, c, RouteOptions::ANYTHING_GOES), vec![1]);
        }
    }

    #[test]
    fn coin_flip_spreads_over_both_routes() {
        let (mut core, c) = two_routes();
        let mut seen = Vec::new();
        for _ in 0..20 {
            let handles = route(&mut core, c, RouteOptions::ANYTHING_GOES);
            assert_eq!(handles.len(), 1);
            seen.extend(handles);
        }
        assert!(seen.contains(&1));
        assert!(seen.contains(&2));
    }

    #[test]
    fn redundant_sends_use_two_routes() {
        let (mut core, c) = two_routes();
        core.set_route_policy(Fixed(Route::Direct));
        assert_eq!(route(&mut core, c, RouteOptions::ANYTHING_GOES.redundant()), vec![1, 2]);

        let direct = RouteOptions {
            dv_allowed: false,
            ..RouteOptions::ANYTHING_GOES
        };
        assert_eq!(route(&mut core, c, direct.redundant()), vec![2]);
        let comm = core.communicators.keys().next().copied().unwrap();
        core.on_add_queue(comm, c, 3, "udp-c2", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        assert_eq!(route(&mut core, c, direct.redundant()), vec![2, 3]);
        assert_eq!(route(&mut core, c, direct).len(), 1);
    }

    #[test]
    fn overheads_are_small_and_fixed() {
        let f = fragment_overhead();
        let r = reliability_overhead();
        assert!(f > wire::HEADER_LEN && f < 128);
        assert!(r > wire::HEADER_LEN && r < f);
        let msg = Message::Fragment(FragmentBox {
            ack_uuid: Uuid::from_u128(1),
            msg_uuid: Uuid::from_u128(2),
            frag_off: 10,
            msg_size: 1000,
            payload: vec![0u8; 300],
        });
        assert_eq!(wire::encoded_len(&msg).unwrap(), f + 300);
    }
}
