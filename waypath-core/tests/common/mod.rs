//! Simulated network of transport cores sharing one manual clock.
//!
//! Frames travel instantly; the host side (communicator, upper layer and
//! peer store) is played by `Net` itself.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use waypath_core::peerstore::PeerStore;
use waypath_core::{
    Action, Characteristics, CommunicatorId, ConnectionStatus, Keypair, ManualClock,
    MemoryPeerStore, Message, NetworkType, PeerIdentity, Timestamp, TransportConfig, TransportCore,
};

pub const ADDRESS_VALIDITY: Duration = Duration::from_secs(3600);

pub struct Packet {
    pub from: usize,
    pub to: usize,
    pub bytes: Vec<u8>,
}

impl Packet {
    pub fn message(&self) -> Option<Message> {
        waypath_core::wire::decode_exact(&self.bytes).ok()
    }
}

pub struct Node {
    pub core: TransportCore,
    pub id: PeerIdentity,
    pub comm: CommunicatorId,
    pub store: MemoryPeerStore,
    pub delivered: Vec<(PeerIdentity, Vec<u8>)>,
    pub send_ok: Vec<(PeerIdentity, bool, u64)>,
    pub connected: HashSet<PeerIdentity>,
    /// Hand window credit back after every delivery.
    pub auto_recv_ok: bool,
    /// Report every transmission as sent right away; otherwise it waits in `unsent`.
    pub auto_complete: bool,
    pub unsent: Vec<(CommunicatorId, u64)>,
}

/// What the interceptor does with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Drop,
    Hold,
}

pub struct Net {
    pub clock: ManualClock,
    pub nodes: Vec<Node>,
    /// (node, queue handle) -> remote node
    wires: HashMap<(usize, u32), usize>,
    next_handle: u32,
    work: VecDeque<(usize, Action)>,
    packets: VecDeque<Packet>,
    pub held: Vec<Packet>,
    pub intercept: Option<Box<dyn FnMut(&Packet) -> Verdict>>,
    /// Deliver queued packets in a scrambled order driven by this state.
    pub scramble: Option<u64>,
}

impl Net {
    pub fn new(n: usize, characteristics: Characteristics) -> Self {
        Self::with_config(n, characteristics, TransportConfig::default())
    }

    pub fn with_config(n: usize, characteristics: Characteristics, config: TransportConfig) -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000_000));
        let nodes = (0..n)
            .map(|i| {
                let mut core = TransportCore::with_clock(
                    Keypair::generate(),
                    config.clone(),
                    clock.clone(),
                    100 + i as u64,
                );
                let comm = core.on_communicator_connected("sim", "sim", characteristics);
                Node {
                    id: core.identity(),
                    core,
                    comm,
                    store: MemoryPeerStore::new(),
                    delivered: Vec::new(),
                    send_ok: Vec::new(),
                    connected: HashSet::new(),
                    auto_recv_ok: true,
                    auto_complete: true,
                    unsent: Vec::new(),
                }
            })
            .collect();
        Self {
            clock,
            nodes,
            wires: HashMap::new(),
            next_handle: 1,
            work: VecDeque::new(),
            packets: VecDeque::new(),
            held: Vec::new(),
            intercept: None,
            scramble: None,
        }
    }

    pub fn id(&self, i: usize) -> PeerIdentity {
        self.nodes[i].id
    }

    pub fn address(i: usize) -> String {
        format!("sim-node{i}")
    }

    /// Open queues both ways between `a` and `b` without running anything.
    pub fn wire(&mut self, a: usize, b: usize, mtu: u32) {
        for (from, to, status) in [(a, b, ConnectionStatus::Outbound), (b, a, ConnectionStatus::Inbound)] {
            let handle = self.next_handle;
            self.next_handle += 1;
            self.wires.insert((from, handle), to);
            let peer = self.nodes[to].id;
            let node = &mut self.nodes[from];
            let comm = node.comm;
            let actions = node.core.on_add_queue(
                comm,
                peer,
                handle,
                &Self::address(to),
                mtu,
                NetworkType::Lan,
                status,
            );
            self.push(from, actions);
        }
    }

    /// Wire `a` and `b` and run until the link is validated both ways.
    pub fn connect(&mut self, a: usize, b: usize, mtu: u32) {
        self.wire(a, b, mtu);
        self.run_for(Duration::from_millis(10));
        assert!(self.nodes[a].core.is_connected(&self.nodes[b].id), "{a} -> {b} not connected");
        assert!(self.nodes[b].core.is_connected(&self.nodes[a].id), "{b} -> {a} not connected");
    }

    pub fn push(&mut self, node: usize, actions: Vec<Action>) {
        self.work.extend(actions.into_iter().map(|a| (node, a)));
    }

    pub fn send(&mut self, from: usize, to: usize, payload: Vec<u8>) {
        let target = self.nodes[to].id;
        let actions = self.nodes[from].core.on_core_send(target, payload);
        self.push(from, actions);
    }

    /// Put a copy of an earlier packet back on the wire.
    pub fn inject(&mut self, from: usize, to: usize, bytes: Vec<u8>) {
        self.packets.push_back(Packet { from, to, bytes });
    }

    /// Report all transmissions of node `i` held back so far as sent.
    pub fn complete_sends(&mut self, i: usize) {
        for (communicator, message_id) in std::mem::take(&mut self.nodes[i].unsent) {
            let actions = self.nodes[i].core.on_send_complete(communicator, message_id);
            self.push(i, actions);
        }
        self.settle();
    }

    fn next_packet(&mut self) -> Option<Packet> {
        match self.scramble.as_mut() {
            Some(state) if !self.packets.is_empty() => {
                *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let i = (*state >> 33) as usize % self.packets.len();
                self.packets.remove(i)
            }
            _ => self.packets.pop_front(),
        }
    }

    /// Process actions and packets until nothing is left; the clock stands still.
    pub fn settle(&mut self) {
        loop {
            if let Some((node, action)) = self.work.pop_front() {
                self.handle(node, action);
                continue;
            }
            let Some(p) = self.next_packet() else {
                break;
            };
            let verdict = self.intercept.as_mut().map_or(Verdict::Deliver, |f| f(&p));
            match verdict {
                Verdict::Deliver => self.deliver(p),
                Verdict::Drop => {}
                Verdict::Hold => self.held.push(p),
            }
        }
    }

    pub fn release_held(&mut self) {
        for p in std::mem::take(&mut self.held) {
            self.deliver(p);
        }
        self.settle();
    }

    fn deliver(&mut self, p: Packet) {
        let sender = self.nodes[p.from].id;
        let node = &mut self.nodes[p.to];
        let comm = node.comm;
        let actions = node
            .core
            .on_incoming(comm, sender, &p.bytes, ADDRESS_VALIDITY, None);
        self.push(p.to, actions);
    }

    /// Advance simulated time by `d`, firing every timer on the way.
    pub fn run_for(&mut self, d: Duration) {
        let end = self.clock_now() + d;
        self.settle();
        loop {
            let next = self
                .nodes
                .iter_mut()
                .filter_map(|n| n.core.next_deadline())
                .min();
            match next {
                Some(at) if at <= end => {
                    if at > self.clock_now() {
                        self.clock.set(at);
                    }
                    for i in 0..self.nodes.len() {
                        let actions = self.nodes[i].core.on_timeout();
                        self.push(i, actions);
                    }
                    self.settle();
                }
                _ => break,
            }
        }
        self.clock.set(end);
        for i in 0..self.nodes.len() {
            let actions = self.nodes[i].core.on_timeout();
            self.push(i, actions);
        }
        self.settle();
    }

    pub fn clock_now(&self) -> Timestamp {
        self.nodes[0].core.now()
    }

    fn handle(&mut self, i: usize, action: Action) {
        let node = &mut self.nodes[i];
        let now = node.core.now();
        let follow = match action {
            Action::Transmit {
                communicator,
                queue,
                message_id,
                bytes,
            } => {
                if let Some(&to) = self.wires.get(&(i, queue)) {
                    self.packets.push_back(Packet { from: i, to, bytes });
                }
                if node.auto_complete {
                    node.core.on_send_complete(communicator, message_id)
                } else {
                    node.unsent.push((communicator, message_id));
                    Vec::new()
                }
            }
            Action::CreateQueue { request, .. } => node.core.on_queue_create_result(request, false),
            Action::DeliverToCore { peer, payload } => {
                node.delivered.push((peer, payload));
                if node.auto_recv_ok {
                    node.core.on_core_recv_ok(peer, 1)
                } else {
                    Vec::new()
                }
            }
            Action::CoreConnect { peer } => {
                node.connected.insert(peer);
                Vec::new()
            }
            Action::CoreDisconnect { peer } => {
                node.connected.remove(&peer);
                Vec::new()
            }
            Action::SendOk {
                peer,
                success,
                bytes_msg,
                ..
            } => {
                node.send_ok.push((peer, success, bytes_msg));
                Vec::new()
            }
            Action::PeerStoreStore {
                request,
                peer,
                key,
                value,
                expiry,
                mode,
            } => {
                let ok = node.store.store(&peer, key, value, expiry, mode).is_ok();
                node.core.on_peerstore_store_result(request, ok)
            }
            Action::PeerStoreFetch { peer, key } | Action::PeerStoreWatch { peer, key } => {
                let mut out = Vec::new();
                for r in node.store.fetch(&peer, key, now) {
                    out.extend(node.core.on_peerstore_record(peer, key, Some(r.value)));
                }
                out.extend(node.core.on_peerstore_record(peer, key, None));
                out
            }
            Action::IncomingAck { .. }
            | Action::DeliverBackchannel { .. }
            | Action::PeerStoreWatchCancel { .. }
            | Action::Monitor { .. } => Vec::new(),
        };
        self.push(i, follow);
    }
}
