//! Host-driven API: TransportCore receives events from the host, returns actions.
//!
//! Events come from three sides: communicators (queues, inbound frames,
//! send completions), the upper layer (sends, receive-window credit) and the
//! peer store (fetched records, store results). Expired timers are delivered
//! through [`TransportCore::on_timeout`]; the host asks
//! [`TransportCore::next_deadline`] when to call it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::OwnAddress;
use crate::backchannel::Backtalker;
use crate::config::{TransportConfig, MAX_DV_HOPS};
use crate::dv::{DistanceVector, DistanceVectorHop, DvLearnCampaigns};
use crate::identity::{Keypair, PeerIdentity};
use crate::ids::{AddressId, CommunicatorId, HopId, IdAllocator, MonitorId, QueueId, RequestId};
use crate::link::{IncomingToken, Neighbour, VirtualLink};
use crate::monitor::{Monitor, QueueSnapshot};
use crate::peerstore::{self, StoreMode};
use crate::pending::{PendingAcknowledgement, PendingKind, PendingStore};
use crate::protocol::{CoreData, Message};
use crate::queue::{Characteristics, Communicator, ConnectionStatus, NetworkType, Queue};
use crate::reassembly::{AckCumulator, ReassemblyContext};
use crate::scheduler::{self, CoinFlip, RoutePolicy};
use crate::stats::{self, Statistics};
use crate::time::{Clock, MonotonicClock, SystemClock, Timestamp};
use crate::timer::{TimerHandle, TimerQueue};
use crate::validation::ValidationTable;
use crate::wire;

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hand a frame to a communicator queue; answer with `on_send_complete`.
    Transmit {
        communicator: CommunicatorId,
        queue: u32,
        message_id: u64,
        bytes: Vec<u8>,
    },
    /// Ask a communicator to open a queue; answer with `on_queue_create_result`.
    CreateQueue {
        communicator: CommunicatorId,
        request: RequestId,
        peer: PeerIdentity,
        address: String,
    },
    /// Processing of an inbound frame finished; the communicator may deliver more.
    IncomingAck {
        communicator: CommunicatorId,
        sender: PeerIdentity,
        token: u64,
    },
    /// Backchannel message for a local communicator.
    DeliverBackchannel {
        communicator: CommunicatorId,
        sender: PeerIdentity,
        payload: Vec<u8>,
    },
    DeliverToCore {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    CoreConnect {
        peer: PeerIdentity,
    },
    CoreDisconnect {
        peer: PeerIdentity,
    },
    /// An upper-layer message was delivered (`success`) or given up on.
    SendOk {
        peer: PeerIdentity,
        success: bool,
        bytes_msg: u64,
        bytes_physical: u64,
    },
    PeerStoreStore {
        request: RequestId,
        peer: PeerIdentity,
        key: &'static str,
        value: Vec<u8>,
        expiry: Timestamp,
        mode: StoreMode,
    },
    /// Answer with one `on_peerstore_record` per record, then one with `None`.
    PeerStoreFetch {
        peer: PeerIdentity,
        key: &'static str,
    },
    /// Answer with `on_peerstore_record` now and whenever the records change.
    PeerStoreWatch {
        peer: PeerIdentity,
        key: &'static str,
    },
    PeerStoreWatchCancel {
        peer: PeerIdentity,
        key: &'static str,
    },
    Monitor {
        monitor: MonitorId,
        snapshot: QueueSnapshot,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    DvLearn,
    Validation,
    LinkCheck(PeerIdentity),
    Retransmit(PeerIdentity),
    ReassemblyExpiry(PeerIdentity, Uuid),
    AckFlush(PeerIdentity),
    BacktalkerExpiry(PeerIdentity),
    HopExpiry(HopId),
    AddressRefresh(AddressId),
}

/// Context of one inbound frame while it is demultiplexed.
pub(crate) struct Inbound {
    /// Direct neighbour, or the DV origin once a box was opened.
    pub sender: PeerIdentity,
    pub via_dv: bool,
    pub communicator: Option<CommunicatorId>,
    pub expected_validity: Duration,
    /// Taken by a delivery that has to wait for the upper layer.
    pub token: Option<IncomingToken>,
}

pub(crate) struct QueueRequest {
    pub communicator: CommunicatorId,
    pub peer: PeerIdentity,
    pub address: String,
}

/// Read-only view of a distance-vector path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub next_hop: PeerIdentity,
    /// Intermediate peers after the next hop, target excluded.
    pub path: Vec<PeerIdentity>,
    pub distance: usize,
    pub path_valid_until: Timestamp,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct TransportCore {
    pub(crate) keypair: Keypair,
    pub(crate) me: PeerIdentity,
    pub(crate) config: TransportConfig,
    clock: Box<dyn Clock + Send>,
    pub(crate) rng: StdRng,
    pub(crate) monotonic: MonotonicClock,
    pub(crate) ids: IdAllocator,
    pub(crate) timers: TimerQueue<TimerEvent>,
    pub(crate) stats: Statistics,
    pub(crate) policy: Box<dyn RoutePolicy + Send>,
    pub(crate) out: Vec<Action>,

    pub(crate) communicators: HashMap<CommunicatorId, Communicator>,
    pub(crate) queues: HashMap<QueueId, Queue>,
    /// Message id of every in-flight transmission -> queue carrying it.
    pub(crate) transmissions: HashMap<u64, QueueId>,
    pub(crate) queue_requests: HashMap<RequestId, QueueRequest>,
    pub(crate) neighbours: HashMap<PeerIdentity, Neighbour>,
    pub(crate) dvs: HashMap<PeerIdentity, DistanceVector>,
    pub(crate) hops: HashMap<HopId, DistanceVectorHop>,
    pub(crate) links: HashMap<PeerIdentity, VirtualLink>,
    pub(crate) pending: PendingStore,
    pub(crate) pending_acks: HashMap<Uuid, PendingAcknowledgement>,
    pub(crate) reassembly: HashMap<(PeerIdentity, Uuid), ReassemblyContext>,
    pub(crate) ack_cumulators: HashMap<PeerIdentity, AckCumulator>,
    pub(crate) validations: ValidationTable,
    pub(crate) backtalkers: HashMap<PeerIdentity, Backtalker>,
    pub(crate) dv_learns: DvLearnCampaigns,
    pub(crate) dv_learn_timer: Option<TimerHandle>,
    pub(crate) own_addresses: HashMap<AddressId, OwnAddress>,
    pub(crate) store_requests: HashMap<RequestId, AddressId>,
    pub(crate) monitors: HashMap<MonitorId, Monitor>,
    pub(crate) suggestions: HashSet<PeerIdentity>,
}

impl TransportCore {
    /// Core on the wall clock with an entropy-seeded RNG.
    pub fn new(keypair: Keypair, config: TransportConfig) -> Self {
        Self::with_clock(keypair, config, SystemClock, rand::rngs::OsRng.next_u64())
    }

    /// Core with an injected clock and a seeded RNG (simulations, tests).
    pub fn with_clock(
        keypair: Keypair,
        mut config: TransportConfig,
        clock: impl Clock + Send + 'static,
        seed: u64,
    ) -> Self {
        if config.max_dv_hops_allowed > MAX_DV_HOPS {
            warn!(
                configured = config.max_dv_hops_allowed,
                "max_dv_hops_allowed above {MAX_DV_HOPS}, clamping"
            );
            config.max_dv_hops_allowed = MAX_DV_HOPS;
        }
        let me = keypair.identity();
        let mut core = Self {
            keypair,
            me,
            config,
            clock: Box::new(clock),
            rng: StdRng::seed_from_u64(seed),
            monotonic: MonotonicClock::default(),
            ids: IdAllocator::default(),
            timers: TimerQueue::new(),
            stats: Statistics::new(),
            policy: Box::new(CoinFlip),
            out: Vec::new(),
            communicators: HashMap::new(),
            queues: HashMap::new(),
            transmissions: HashMap::new(),
            queue_requests: HashMap::new(),
            neighbours: HashMap::new(),
            dvs: HashMap::new(),
            hops: HashMap::new(),
            links: HashMap::new(),
            pending: PendingStore::new(),
            pending_acks: HashMap::new(),
            reassembly: HashMap::new(),
            ack_cumulators: HashMap::new(),
            validations: ValidationTable::default(),
            backtalkers: HashMap::new(),
            dv_learns: DvLearnCampaigns::default(),
            dv_learn_timer: None,
            own_addresses: HashMap::new(),
            store_requests: HashMap::new(),
            monitors: HashMap::new(),
            suggestions: HashSet::new(),
        };
        let first = scheduler::randomize(core.config.dv_learn_base_frequency, &mut core.rng);
        core.schedule_dv_learn(first);
        core
    }

    /// Replace the direct-vs-DV tie breaker.
    pub fn set_route_policy(&mut self, policy: impl RoutePolicy + Send + 'static) {
        self.policy = Box::new(policy);
    }

    pub fn identity(&self) -> PeerIdentity {
        self.me
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn emit(&mut self, action: Action) {
        self.out.push(action);
    }

    pub(crate) fn finish(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.out)
    }

    pub(crate) fn fresh_uuid(&mut self) -> Uuid {
        let mut b = [0u8; 16];
        self.rng.fill_bytes(&mut b);
        uuid::Builder::from_random_bytes(b).into_uuid()
    }

    pub(crate) fn next_request(&mut self) -> RequestId {
        RequestId(self.ids.next())
    }

    // ---------------------------------------------------------------- timers

    /// When the host should call [`TransportCore::on_timeout`] next.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Run every timer that is due.
    pub fn on_timeout(&mut self) -> Vec<Action> {
        let now = self.now();
        while let Some(event) = self.timers.pop_due(now) {
            match event {
                TimerEvent::DvLearn => {
                    self.dv_learn_timer = None;
                    self.start_dv_learn();
                }
                TimerEvent::Validation => {
                    self.validations.timer = None;
                    self.run_validations();
                }
                TimerEvent::LinkCheck(peer) => {
                    if let Some(vl) = self.links.get_mut(&peer) {
                        vl.link_check = None;
                    }
                    self.check_link_down(peer);
                }
                TimerEvent::Retransmit(peer) => {
                    if let Some(vl) = self.links.get_mut(&peer) {
                        vl.retransmit = None;
                    }
                    self.check_link_transmission(peer);
                }
                TimerEvent::ReassemblyExpiry(peer, msg_uuid) => {
                    self.expire_reassembly(peer, msg_uuid)
                }
                TimerEvent::AckFlush(peer) => self.flush_acks(peer),
                TimerEvent::BacktalkerExpiry(peer) => self.expire_backtalker(peer),
                TimerEvent::HopExpiry(hop) => self.expire_dv_hop(hop),
                TimerEvent::AddressRefresh(addr) => self.refresh_own_address(addr),
            }
        }
        self.finish()
    }

    // ---------------------------------------------------------- communicators

    pub fn on_communicator_connected(
        &mut self,
        name: &str,
        address_prefix: &str,
        characteristics: Characteristics,
    ) -> CommunicatorId {
        let id = CommunicatorId(self.ids.next());
        info!(communicator = name, prefix = address_prefix, ?characteristics, "communicator connected");
        self.communicators.insert(
            id,
            Communicator {
                name: name.to_string(),
                address_prefix: address_prefix.to_string(),
                characteristics,
                queues: Vec::new(),
                addresses: Vec::new(),
                total_in_flight: 0,
            },
        );
        id
    }

    /// Communicator went away: its queues and addresses go with it.
    pub fn on_communicator_disconnected(&mut self, id: CommunicatorId) -> Vec<Action> {
        let Some(c) = self.communicators.get(&id) else {
            return self.finish();
        };
        info!(communicator = %c.name, "communicator disconnected");
        let queues = c.queues.clone();
        let addresses = c.addresses.clone();
        for q in queues {
            self.free_queue(q);
        }
        for a in addresses {
            self.free_own_address(a);
        }
        self.queue_requests.retain(|_, r| r.communicator != id);
        self.communicators.remove(&id);
        self.finish()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_add_queue(
        &mut self,
        communicator: CommunicatorId,
        peer: PeerIdentity,
        handle: u32,
        address: &str,
        mtu: u32,
        network_type: NetworkType,
        status: ConnectionStatus,
    ) -> Vec<Action> {
        if peer == self.me || !self.communicators.contains_key(&communicator) {
            self.stats.incr(stats::MALFORMED);
            return self.finish();
        }
        if self.find_queue(communicator, handle).is_some() {
            warn!(handle, "communicator reused a live queue handle");
            return self.finish();
        }
        let now = self.now();
        let qid = QueueId(self.ids.next());
        if !self.neighbours.contains_key(&peer) {
            debug!(%peer, "new neighbour");
            self.neighbours.insert(peer, Neighbour::new(peer));
            self.emit(Action::PeerStoreFetch {
                peer,
                key: peerstore::KEY_DV_LEARN_MONOTIME,
            });
        }
        if let Some(n) = self.neighbours.get_mut(&peer) {
            n.queues.push(qid);
        }
        if let Some(c) = self.communicators.get_mut(&communicator) {
            c.queues.push(qid);
        }
        let validated_until = self
            .validations
            .validated_until(&peer, address)
            .filter(|t| *t > now)
            .unwrap_or(Timestamp::ZERO);
        self.queues.insert(
            qid,
            Queue {
                id: qid,
                communicator,
                neighbour: peer,
                handle,
                address: address.to_string(),
                mtu,
                network_type,
                status,
                validated_until,
                pd: Default::default(),
                in_flight: HashMap::new(),
                idle: true,
                control_backlog: Default::default(),
                pending_acks: Vec::new(),
            },
        );
        debug!(%peer, address, mtu, "queue added");
        self.notify_monitors(qid);
        self.queue_available(peer, address);
        if validated_until > now {
            self.ensure_link(peer);
        }
        self.schedule_neighbour(peer);
        self.finish()
    }

    pub fn on_update_queue(
        &mut self,
        communicator: CommunicatorId,
        handle: u32,
        status: ConnectionStatus,
    ) -> Vec<Action> {
        let Some(qid) = self.find_queue(communicator, handle) else {
            return self.finish();
        };
        let Some(q) = self.queues.get_mut(&qid) else {
            return self.finish();
        };
        q.status = status;
        let peer = q.neighbour;
        self.notify_monitors(qid);
        if status == ConnectionStatus::Down {
            self.check_link_down(peer);
        } else {
            self.schedule_neighbour(peer);
        }
        self.finish()
    }

    pub fn on_del_queue(&mut self, communicator: CommunicatorId, handle: u32) -> Vec<Action> {
        if let Some(qid) = self.find_queue(communicator, handle) {
            self.free_queue(qid);
        }
        self.finish()
    }

    pub fn on_queue_create_result(&mut self, request: RequestId, ok: bool) -> Vec<Action> {
        if let Some(r) = self.queue_requests.remove(&request) {
            if !ok {
                debug!(peer = %r.peer, address = %r.address, "queue creation failed");
                self.stats.incr(stats::QUEUE_CREATE_FAILED);
            }
        }
        self.finish()
    }

    /// Inbound frame from a communicator. `token` is the communicator's flow
    /// control handle; it comes back in an `IncomingAck` once processing is done.
    pub fn on_incoming(
        &mut self,
        communicator: CommunicatorId,
        sender: PeerIdentity,
        bytes: &[u8],
        expected_address_validity: Duration,
        token: Option<u64>,
    ) -> Vec<Action> {
        let mut inb = Inbound {
            sender,
            via_dv: false,
            communicator: Some(communicator),
            expected_validity: expected_address_validity,
            token: token.map(|token| IncomingToken {
                communicator,
                sender,
                token,
            }),
        };
        if sender == self.me {
            self.stats.incr(stats::MALFORMED);
        } else if let Some(msg) = self.decode_inner(bytes) {
            self.dispatch(msg, &mut inb);
        }
        if let Some(t) = inb.token.take() {
            self.emit(Action::IncomingAck {
                communicator: t.communicator,
                sender: t.sender,
                token: t.token,
            });
        }
        self.finish()
    }

    pub(crate) fn decode_inner(&mut self, bytes: &[u8]) -> Option<Message> {
        match wire::decode_exact(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                self.stats.incr(stats::MALFORMED);
                None
            }
        }
    }

    /// Demultiplex one message by type.
    pub(crate) fn dispatch(&mut self, msg: Message, inb: &mut Inbound) {
        match msg {
            Message::CoreData(m) => self.deliver_to_core(inb, m.payload),
            Message::Fragment(f) => self.handle_fragment(inb, f),
            Message::ReliabilityBox(rb) => self.handle_reliability_box(inb, rb),
            Message::ReliabilityAck(ack) => self.handle_reliability_ack(inb, ack),
            Message::Backchannel(bc) => self.handle_backchannel(inb, bc),
            Message::ValidationResponse(r) => self.handle_validation_response(inb, r),
            Message::DvLearn(_) | Message::DvBox(_) | Message::ValidationChallenge(_)
                if inb.via_dv =>
            {
                debug!(sender = %inb.sender, "dropping message nested in a dv box");
                self.stats.incr(stats::INVALID_NESTING);
            }
            Message::DvLearn(dvl) => self.handle_dv_learn(inb, dvl),
            Message::DvBox(dvb) => self.handle_dv_box(inb, dvb),
            Message::ValidationChallenge(c) => self.handle_validation_challenge(inb, c),
        }
    }

    pub(crate) fn find_queue(&self, communicator: CommunicatorId, handle: u32) -> Option<QueueId> {
        self.communicators.get(&communicator)?.queues.iter().copied().find(|q| {
            self.queues
                .get(q)
                .is_some_and(|q| q.handle == handle)
        })
    }

    /// Teardown: acks first, then list memberships, then dependent structures.
    pub(crate) fn free_queue(&mut self, qid: QueueId) {
        let Some(q) = self.queues.remove(&qid) else {
            return;
        };
        for u in &q.pending_acks {
            if let Some(pa) = self.pending_acks.get_mut(u) {
                pa.queue = None;
            }
        }
        let now = self.now();
        for (mid, flight) in &q.in_flight {
            self.transmissions.remove(mid);
            // a leaf waiting on this send is due again
            if let Some(pm) = flight.pending.and_then(|p| self.pending.get_mut(p)) {
                pm.next_attempt = now;
            }
        }
        if let Some(c) = self.communicators.get_mut(&q.communicator) {
            c.total_in_flight = c.total_in_flight.saturating_sub(q.in_flight.len() as u32);
            c.queues.retain(|x| *x != qid);
        }
        let peer = q.neighbour;
        let now_empty = match self.neighbours.get_mut(&peer) {
            Some(n) => {
                n.queues.retain(|x| *x != qid);
                n.queues.is_empty()
            }
            None => false,
        };
        debug!(%peer, address = %q.address, "queue removed");
        self.notify_monitors_removed(&q);
        if now_empty {
            self.free_neighbour(peer);
        } else {
            self.check_link_down(peer);
            self.schedule_neighbour(peer);
        }
        self.schedule_communicator(q.communicator);
    }

    fn free_neighbour(&mut self, peer: PeerIdentity) {
        let Some(n) = self.neighbours.remove(&peer) else {
            return;
        };
        debug!(%peer, "neighbour gone");
        let mut targets = Vec::new();
        for hop in n.dv_hops {
            if let Some(t) = self.free_dv_hop(hop) {
                targets.push(t);
            }
        }
        self.check_link_down(peer);
        for t in targets {
            self.check_link_down(t);
        }
    }

    // ---------------------------------------------------------- virtual links

    /// Latest `validated_until` over the usable queues to `peer`.
    pub(crate) fn direct_valid_until(&self, peer: &PeerIdentity, now: Timestamp) -> Option<Timestamp> {
        let n = self.neighbours.get(peer)?;
        n.queues
            .iter()
            .filter_map(|q| self.queues.get(q))
            .filter(|q| q.is_validated(now))
            .map(|q| q.validated_until)
            .max()
    }

    /// Latest `path_valid_until` over confirmed DV paths to `peer`.
    pub(crate) fn dv_valid_until(&self, peer: &PeerIdentity, now: Timestamp) -> Option<Timestamp> {
        let dv = self.dvs.get(peer)?;
        dv.hops
            .iter()
            .filter_map(|h| self.hops.get(h))
            .filter(|h| h.path_valid_until > now)
            .map(|h| h.path_valid_until)
            .max()
    }

    /// Create the link to `target` if it is missing, and re-arm its expiry check.
    pub(crate) fn ensure_link(&mut self, target: PeerIdentity) {
        if !self.links.contains_key(&target) {
            info!(peer = %target, "virtual link up");
            self.links.insert(
                target,
                VirtualLink::new(target, self.config.recv_window_size),
            );
            self.emit(Action::CoreConnect { peer: target });
        }
        self.check_link_down(target);
    }

    /// Tear the link down if no validated backing is left, else re-arm the check.
    pub(crate) fn check_link_down(&mut self, target: PeerIdentity) {
        if !self.links.contains_key(&target) {
            return;
        }
        let now = self.now();
        let until = self
            .direct_valid_until(&target, now)
            .max(self.dv_valid_until(&target, now));
        let Some(until) = until else {
            self.free_link(target);
            return;
        };
        let old = self.links.get_mut(&target).and_then(|vl| vl.link_check.take());
        if let Some(h) = old {
            self.timers.cancel(h);
        }
        let h = self.timers.schedule(until, TimerEvent::LinkCheck(target));
        if let Some(vl) = self.links.get_mut(&target) {
            vl.link_check = Some(h);
        }
    }

    fn free_link(&mut self, target: PeerIdentity) {
        let Some(vl) = self.links.remove(&target) else {
            return;
        };
        info!(peer = %target, "virtual link down");
        for root in vl.pending {
            let removed = self.pending.free_root(root);
            self.drop_acks(removed.acks);
            if let Some(r) = removed.root {
                if r.kind == PendingKind::Core {
                    self.emit(Action::SendOk {
                        peer: target,
                        success: false,
                        bytes_msg: r.bytes_msg as u64,
                        bytes_physical: r.bytes_physical,
                    });
                }
            }
        }
        for h in vl.held {
            if let Some(t) = h.token {
                self.emit(Action::IncomingAck {
                    communicator: t.communicator,
                    sender: t.sender,
                    token: t.token,
                });
            }
        }
        for h in [vl.link_check, vl.retransmit.map(|(h, _)| h)].into_iter().flatten() {
            self.timers.cancel(h);
        }
        self.emit(Action::CoreDisconnect { peer: target });
    }

    // ------------------------------------------------------------ upper layer

    /// Queue an upper-layer message for `target`.
    pub fn on_core_send(&mut self, target: PeerIdentity, payload: Vec<u8>) -> Vec<Action> {
        let bytes_msg = payload.len();
        if !self.links.contains_key(&target) {
            debug!(peer = %target, "no virtual link, dropping core message");
            self.stats.incr(stats::ROUTING_FAILED);
            self.emit(Action::SendOk {
                peer: target,
                success: false,
                bytes_msg: bytes_msg as u64,
                bytes_physical: 0,
            });
            return self.finish();
        }
        let frame = match wire::encode_frame(&Message::CoreData(CoreData { payload })) {
            Ok(f) if f.len() > self.config.max_message_size => {
                debug!(peer = %target, size = f.len(), "core message too large");
                self.emit(Action::SendOk {
                    peer: target,
                    success: false,
                    bytes_msg: bytes_msg as u64,
                    bytes_physical: 0,
                });
                return self.finish();
            }
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "core message not encodable");
                self.emit(Action::SendOk {
                    peer: target,
                    success: false,
                    bytes_msg: bytes_msg as u64,
                    bytes_physical: 0,
                });
                return self.finish();
            }
        };
        let id = self
            .pending
            .insert_root(&mut self.ids, PendingKind::Core, target, frame, bytes_msg);
        if let Some(vl) = self.links.get_mut(&target) {
            vl.pending.push_back(id);
        }
        self.check_link_transmission(target);
        self.finish()
    }

    /// The upper layer can take `increase` more messages from `peer`.
    pub fn on_core_recv_ok(&mut self, peer: PeerIdentity, increase: u32) -> Vec<Action> {
        if let Some(vl) = self.links.get_mut(&peer) {
            let inc = i32::try_from(increase).unwrap_or(i32::MAX);
            vl.core_recv_window = vl.core_recv_window.saturating_add(inc);
            self.flush_held(peer);
        }
        self.finish()
    }

    pub(crate) fn deliver_to_core(&mut self, inb: &mut Inbound, payload: Vec<u8>) {
        let limit = self.config.core_backlog_limit;
        let Some(vl) = self.links.get_mut(&inb.sender) else {
            debug!(sender = %inb.sender, "virtual link down, dropping core message");
            self.stats.incr(stats::LINK_DOWN_DELIVERY);
            return;
        };
        if vl.core_recv_window > 0 && vl.held.is_empty() {
            vl.core_recv_window -= 1;
            self.stats.incr(stats::CORE_DELIVERED);
            self.out.push(Action::DeliverToCore {
                peer: inb.sender,
                payload,
            });
        } else if vl.held.len() < limit {
            vl.held.push_back(crate::link::HeldDelivery {
                payload,
                token: inb.token.take(),
            });
        } else {
            self.stats.incr(stats::CORE_BACKLOG_FULL);
        }
    }

    fn flush_held(&mut self, peer: PeerIdentity) {
        let Some(vl) = self.links.get_mut(&peer) else {
            return;
        };
        while vl.core_recv_window > 0 {
            let Some(h) = vl.held.pop_front() else {
                break;
            };
            vl.core_recv_window -= 1;
            self.stats.incr(stats::CORE_DELIVERED);
            self.out.push(Action::DeliverToCore {
                peer,
                payload: h.payload,
            });
            if let Some(t) = h.token {
                self.out.push(Action::IncomingAck {
                    communicator: t.communicator,
                    sender: t.sender,
                    token: t.token,
                });
            }
        }
    }

    // ------------------------------------------------------------- peer store

    /// A record fetched or watched earlier; `None` ends a fetch without (more) records.
    pub fn on_peerstore_record(
        &mut self,
        peer: PeerIdentity,
        key: &str,
        value: Option<Vec<u8>>,
    ) -> Vec<Action> {
        match key {
            peerstore::KEY_BACKCHANNEL_MONOTIME => self.backtalker_monotime_loaded(peer, value),
            peerstore::KEY_DV_LEARN_MONOTIME => {
                let stored = value.and_then(|v| wire::from_blob::<Timestamp>(&v).ok());
                if let (Some(t), Some(n)) = (stored, self.neighbours.get_mut(&peer)) {
                    n.dv_monotime = n.dv_monotime.max(t);
                }
            }
            peerstore::KEY_HELLO => {
                if let Some(v) = value {
                    self.hello_received(peer, &v);
                }
            }
            _ => {}
        }
        self.finish()
    }

    pub fn on_peerstore_store_result(&mut self, request: RequestId, ok: bool) -> Vec<Action> {
        if let Some(addr) = self.store_requests.remove(&request) {
            if !ok {
                self.own_address_store_failed(addr);
            }
        }
        self.finish()
    }

    /// Persist a monotonic time under `key`.
    pub(crate) fn store_monotime(&mut self, peer: PeerIdentity, key: &'static str, t: Timestamp) {
        let Ok(value) = wire::to_blob(&t) else {
            return;
        };
        let request = self.next_request();
        self.emit(Action::PeerStoreStore {
            request,
            peer,
            key,
            value,
            expiry: Timestamp::MAX,
            mode: StoreMode::Replace,
        });
    }

    // ---------------------------------------------------------------- queries

    pub fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.links.contains_key(peer)
    }

    pub fn neighbours(&self) -> Vec<PeerIdentity> {
        self.neighbours.keys().copied().collect()
    }

    /// Outbound upper-layer messages still queued for `peer`.
    pub fn pending_messages(&self, peer: &PeerIdentity) -> usize {
        self.links.get(peer).map_or(0, |vl| vl.pending.len())
    }

    /// In-flight transmissions on every queue to `peer`.
    pub fn queue_in_flight(&self, peer: &PeerIdentity) -> Vec<usize> {
        self.neighbours.get(peer).map_or_else(Vec::new, |n| {
            n.queues
                .iter()
                .filter_map(|q| self.queues.get(q))
                .map(|q| q.in_flight.len())
                .collect()
        })
    }

    pub fn communicator_in_flight(&self, communicator: CommunicatorId) -> u32 {
        self.communicators
            .get(&communicator)
            .map_or(0, |c| c.total_in_flight)
    }

    pub fn dv_paths(&self, target: &PeerIdentity) -> Vec<PathInfo> {
        let Some(dv) = self.dvs.get(target) else {
            return Vec::new();
        };
        dv.hops
            .iter()
            .filter_map(|h| self.hops.get(h))
            .map(|h| PathInfo {
                next_hop: h.next_hop,
                path: h.path.clone(),
                distance: h.distance(),
                path_valid_until: h.path_valid_until,
            })
            .collect()
    }

    pub fn address_validated_until(&self, peer: &PeerIdentity, address: &str) -> Option<Timestamp> {
        self.validations.validated_until(peer, address)
    }
}
