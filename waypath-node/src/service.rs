//! Event loop around one `TransportCore`.
//!
//! Communicators and the upper layer talk to the loop through [`Command`]s;
//! it answers with [`CommunicatorEvent`]s on the per-communicator channel and
//! [`CoreEvent`]s on the upper-layer channel. Peer store actions are served
//! in-loop from the configured [`PeerStore`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use waypath_core::queue::{Characteristics, ConnectionStatus, NetworkType};
use waypath_core::{
    Action, AddressId, CommunicatorId, MonitorId, PeerIdentity, PeerStore, QueueSnapshot, RequestId,
    TransportCore,
};

/// Requests from communicators (first group) and the upper layer.
pub enum Command {
    ConnectCommunicator {
        name: String,
        address_prefix: String,
        characteristics: Characteristics,
        reply: oneshot::Sender<(CommunicatorId, mpsc::UnboundedReceiver<CommunicatorEvent>)>,
    },
    DisconnectCommunicator(CommunicatorId),
    AddQueue {
        communicator: CommunicatorId,
        peer: PeerIdentity,
        handle: u32,
        address: String,
        mtu: u32,
        network_type: NetworkType,
        status: ConnectionStatus,
    },
    UpdateQueue {
        communicator: CommunicatorId,
        handle: u32,
        status: ConnectionStatus,
    },
    DelQueue {
        communicator: CommunicatorId,
        handle: u32,
    },
    QueueCreateResult {
        request: RequestId,
        ok: bool,
    },
    AddAddress {
        communicator: CommunicatorId,
        address: String,
        network_type: NetworkType,
        expiration: Duration,
        reply: oneshot::Sender<Option<AddressId>>,
    },
    DelAddress {
        communicator: CommunicatorId,
        id: AddressId,
    },
    Incoming {
        communicator: CommunicatorId,
        sender: PeerIdentity,
        bytes: Vec<u8>,
        expected_validity: Duration,
        token: Option<u64>,
    },
    SendComplete {
        communicator: CommunicatorId,
        message_id: u64,
    },
    Backchannel {
        communicator: CommunicatorId,
        target: PeerIdentity,
        payload: Vec<u8>,
        target_communicator: String,
    },

    Send {
        target: PeerIdentity,
        payload: Vec<u8>,
    },
    RecvOk {
        peer: PeerIdentity,
        increase: u32,
    },
    Suggest(PeerIdentity),
    SuggestCancel(PeerIdentity),
    AddressSuggestion {
        peer: PeerIdentity,
        address: String,
    },
    MonitorStart {
        filter: Option<PeerIdentity>,
        one_shot: bool,
        reply: oneshot::Sender<(MonitorId, Vec<QueueSnapshot>)>,
    },
    MonitorStop(MonitorId),
    Statistics(oneshot::Sender<Vec<(&'static str, u64)>>),
}

/// What a communicator has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CommunicatorEvent {
    /// Send, then report `Command::SendComplete`.
    Transmit {
        queue: u32,
        message_id: u64,
        bytes: Vec<u8>,
    },
    /// Open a queue, then report `Command::QueueCreateResult`.
    CreateQueue {
        request: RequestId,
        peer: PeerIdentity,
        address: String,
    },
    IncomingAck {
        sender: PeerIdentity,
        token: u64,
    },
    Backchannel {
        sender: PeerIdentity,
        payload: Vec<u8>,
    },
}

/// What the upper layer is told.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Connect(PeerIdentity),
    Disconnect(PeerIdentity),
    Deliver {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    SendOk {
        peer: PeerIdentity,
        success: bool,
        bytes_msg: u64,
        bytes_physical: u64,
    },
    Monitor {
        monitor: MonitorId,
        snapshot: QueueSnapshot,
    },
}

pub struct Service {
    core: TransportCore,
    store: Box<dyn PeerStore + Send>,
    watches: HashSet<(PeerIdentity, &'static str)>,
    communicators: HashMap<CommunicatorId, mpsc::UnboundedSender<CommunicatorEvent>>,
    upper: mpsc::UnboundedSender<CoreEvent>,
}

impl Service {
    pub fn new(
        core: TransportCore,
        store: Box<dyn PeerStore + Send>,
    ) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (upper, rx) = mpsc::unbounded_channel();
        let service = Self {
            core,
            store,
            watches: HashSet::new(),
            communicators: HashMap::new(),
            upper,
        };
        (service, rx)
    }

    pub fn identity(&self) -> PeerIdentity {
        self.core.identity()
    }

    /// Serve commands until every sender is dropped, firing core timers in between.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(peer = %self.core.identity(), "transport service running");
        loop {
            let wait = self
                .core
                .next_deadline()
                .map(|at| at.remaining(self.core.now()));
            let timer = async move {
                match wait {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = timer => {
                    let actions = self.core.on_timeout();
                    self.perform(actions);
                }
            }
        }
        info!("transport service stopped");
    }

    pub fn handle(&mut self, cmd: Command) {
        let actions = match cmd {
            Command::ConnectCommunicator {
                name,
                address_prefix,
                characteristics,
                reply,
            } => {
                let id = self
                    .core
                    .on_communicator_connected(&name, &address_prefix, characteristics);
                let (tx, rx) = mpsc::unbounded_channel();
                self.communicators.insert(id, tx);
                if reply.send((id, rx)).is_err() {
                    debug!(communicator = %name, "communicator left before registration finished");
                }
                Vec::new()
            }
            Command::DisconnectCommunicator(id) => {
                self.communicators.remove(&id);
                self.core.on_communicator_disconnected(id)
            }
            Command::AddQueue {
                communicator,
                peer,
                handle,
                address,
                mtu,
                network_type,
                status,
            } => self
                .core
                .on_add_queue(communicator, peer, handle, &address, mtu, network_type, status),
            Command::UpdateQueue {
                communicator,
                handle,
                status,
            } => self.core.on_update_queue(communicator, handle, status),
            Command::DelQueue {
                communicator,
                handle,
            } => self.core.on_del_queue(communicator, handle),
            Command::QueueCreateResult { request, ok } => self.core.on_queue_create_result(request, ok),
            Command::AddAddress {
                communicator,
                address,
                network_type,
                expiration,
                reply,
            } => {
                let (id, actions) =
                    self.core
                        .on_add_address(communicator, &address, network_type, expiration);
                let _ = reply.send(id);
                actions
            }
            Command::DelAddress { communicator, id } => self.core.on_del_address(communicator, id),
            Command::Incoming {
                communicator,
                sender,
                bytes,
                expected_validity,
                token,
            } => self
                .core
                .on_incoming(communicator, sender, &bytes, expected_validity, token),
            Command::SendComplete {
                communicator,
                message_id,
            } => self.core.on_send_complete(communicator, message_id),
            Command::Backchannel {
                communicator,
                target,
                payload,
                target_communicator,
            } => self
                .core
                .on_communicator_backchannel(communicator, target, payload, &target_communicator),
            Command::Send { target, payload } => self.core.on_core_send(target, payload),
            Command::RecvOk { peer, increase } => self.core.on_core_recv_ok(peer, increase),
            Command::Suggest(peer) => self.core.on_suggest(peer),
            Command::SuggestCancel(peer) => self.core.on_suggest_cancel(peer),
            Command::AddressSuggestion { peer, address } => {
                self.core.on_address_suggestion(peer, &address)
            }
            Command::MonitorStart {
                filter,
                one_shot,
                reply,
            } => {
                let _ = reply.send(self.core.monitor_start(filter, one_shot));
                Vec::new()
            }
            Command::MonitorStop(id) => {
                self.core.monitor_stop(id);
                Vec::new()
            }
            Command::Statistics(reply) => {
                let _ = reply.send(self.core.statistics().iter().collect());
                Vec::new()
            }
        };
        self.perform(actions);
    }

    /// Carry out actions; peer store answers feed straight back into the core.
    pub fn perform(&mut self, actions: Vec<Action>) {
        let mut work: VecDeque<Action> = actions.into();
        while let Some(action) = work.pop_front() {
            let follow = self.perform_one(action);
            work.extend(follow);
        }
    }

    fn to_communicator(&mut self, communicator: CommunicatorId, event: CommunicatorEvent) -> bool {
        let Some(tx) = self.communicators.get(&communicator) else {
            return false;
        };
        if tx.send(event).is_err() {
            warn!(?communicator, "communicator channel closed");
            self.communicators.remove(&communicator);
            return false;
        }
        true
    }

    fn to_upper(&self, event: CoreEvent) {
        if self.upper.send(event).is_err() {
            debug!("upper layer gone, dropping event");
        }
    }

    fn perform_one(&mut self, action: Action) -> Vec<Action> {
        let now = self.core.now();
        match action {
            Action::Transmit {
                communicator,
                queue,
                message_id,
                bytes,
            } => {
                let event = CommunicatorEvent::Transmit {
                    queue,
                    message_id,
                    bytes,
                };
                if !self.to_communicator(communicator, event) {
                    // the queue went with its communicator; the frame was never sent
                    return self.core.on_communicator_disconnected(communicator);
                }
            }
            Action::CreateQueue {
                communicator,
                request,
                peer,
                address,
            } => {
                let event = CommunicatorEvent::CreateQueue {
                    request,
                    peer,
                    address,
                };
                if !self.to_communicator(communicator, event) {
                    let mut out = self.core.on_queue_create_result(request, false);
                    out.extend(self.core.on_communicator_disconnected(communicator));
                    return out;
                }
            }
            Action::IncomingAck {
                communicator,
                sender,
                token,
            } => {
                if !self.to_communicator(communicator, CommunicatorEvent::IncomingAck { sender, token }) {
                    return self.core.on_communicator_disconnected(communicator);
                }
            }
            Action::DeliverBackchannel {
                communicator,
                sender,
                payload,
            } => {
                let event = CommunicatorEvent::Backchannel { sender, payload };
                if !self.to_communicator(communicator, event) {
                    return self.core.on_communicator_disconnected(communicator);
                }
            }
            Action::DeliverToCore { peer, payload } => self.to_upper(CoreEvent::Deliver { peer, payload }),
            Action::CoreConnect { peer } => self.to_upper(CoreEvent::Connect(peer)),
            Action::CoreDisconnect { peer } => self.to_upper(CoreEvent::Disconnect(peer)),
            Action::SendOk {
                peer,
                success,
                bytes_msg,
                bytes_physical,
            } => self.to_upper(CoreEvent::SendOk {
                peer,
                success,
                bytes_msg,
                bytes_physical,
            }),
            Action::Monitor { monitor, snapshot } => self.to_upper(CoreEvent::Monitor { monitor, snapshot }),
            Action::PeerStoreStore {
                request,
                peer,
                key,
                value,
                expiry,
                mode,
            } => {
                let ok = match self.store.store(&peer, key, value.clone(), expiry, mode) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, key, "peer store write failed");
                        false
                    }
                };
                let mut out = self.core.on_peerstore_store_result(request, ok);
                if ok && self.watches.contains(&(peer, key)) {
                    out.extend(self.core.on_peerstore_record(peer, key, Some(value)));
                }
                return out;
            }
            Action::PeerStoreFetch { peer, key } => {
                let mut out = Vec::new();
                for r in self.store.fetch(&peer, key, now) {
                    out.extend(self.core.on_peerstore_record(peer, key, Some(r.value)));
                }
                out.extend(self.core.on_peerstore_record(peer, key, None));
                return out;
            }
            Action::PeerStoreWatch { peer, key } => {
                self.watches.insert((peer, key));
                let mut out = Vec::new();
                for r in self.store.fetch(&peer, key, now) {
                    out.extend(self.core.on_peerstore_record(peer, key, Some(r.value)));
                }
                return out;
            }
            Action::PeerStoreWatchCancel { peer, key } => {
                self.watches.remove(&(peer, key));
            }
        }
        Vec::new()
    }
}
