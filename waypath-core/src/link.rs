//! Neighbours (peers behind at least one queue) and virtual links (what the
//! upper layer sees as "connected").

use std::collections::VecDeque;

use crate::identity::PeerIdentity;
use crate::ids::{CommunicatorId, HopId, PendingId, QueueId};
use crate::time::Timestamp;
use crate::timer::TimerHandle;

pub struct Neighbour {
    pub pid: PeerIdentity,
    pub queues: Vec<QueueId>,
    /// DV hops whose next hop is this neighbour.
    pub dv_hops: Vec<HopId>,
    /// Newest DV-learn monotonic time seen directly from this peer as initiator.
    pub dv_monotime: Timestamp,
}

impl Neighbour {
    pub fn new(pid: PeerIdentity) -> Self {
        Self {
            pid,
            queues: Vec::new(),
            dv_hops: Vec::new(),
            dv_monotime: Timestamp::ZERO,
        }
    }
}

/// Flow-control token of a communicator delivery whose processing is not finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingToken {
    pub communicator: CommunicatorId,
    pub sender: PeerIdentity,
    pub token: u64,
}

/// Inbound payload waiting for the upper layer to open its receive window.
pub struct HeldDelivery {
    pub payload: Vec<u8>,
    pub token: Option<IncomingToken>,
}

pub struct VirtualLink {
    pub target: PeerIdentity,
    /// Outbound roots, oldest first.
    pub pending: VecDeque<PendingId>,
    /// Messages the upper layer is still willing to take.
    pub core_recv_window: i32,
    pub held: VecDeque<HeldDelivery>,
    pub link_check: Option<TimerHandle>,
    /// Wakes the link when the earliest waiting leaf becomes eligible again.
    pub retransmit: Option<(TimerHandle, Timestamp)>,
}

impl VirtualLink {
    pub fn new(target: PeerIdentity, recv_window: i32) -> Self {
        Self {
            target,
            pending: VecDeque::new(),
            core_recv_window: recv_window,
            held: VecDeque::new(),
            link_check: None,
            retransmit: None,
        }
    }
}
