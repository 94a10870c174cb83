//! Communicators, their queues, and rolling per-queue performance data.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PeerIdentity;
use crate::ids::{AddressId, CommunicatorId, PendingId, QueueId};
use crate::time::Timestamp;

/// Network a queue or address lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkType {
    Unspecified = 0,
    Loopback = 1,
    Lan = 2,
    Wan = 3,
    Wlan = 4,
    Bluetooth = 5,
}

/// Connection status the communicator reports for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created on our request, handshake pending.
    Outbound,
    /// Established by the remote peer.
    Inbound,
    Down,
}

/// Whether the communicator itself guarantees delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristics {
    Reliable,
    Unreliable,
}

pub struct Communicator {
    pub name: String,
    /// Addresses starting with `<prefix>-` belong to this communicator.
    pub address_prefix: String,
    pub characteristics: Characteristics,
    pub queues: Vec<QueueId>,
    pub addresses: Vec<AddressId>,
    /// In-flight transmissions over all of this communicator's queues.
    pub total_in_flight: u32,
}

impl Communicator {
    pub fn owns_address(&self, address: &str) -> bool {
        address
            .strip_prefix(self.address_prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

const GOODPUT_SLOTS: usize = 4;
const GOODPUT_EPOCH: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default, Clone, Copy)]
struct GoodputSample {
    epoch: u64,
    bytes_sent: u64,
    bytes_acked: u64,
}

/// Aged RTT plus sent/acked byte counters over the last four 15-minute epochs.
#[derive(Debug, Default, Clone)]
pub struct PerformanceData {
    aged_rtt: Option<Duration>,
    goodput: [GoodputSample; GOODPUT_SLOTS],
}

impl PerformanceData {
    /// New samples weigh 1/8.
    pub fn update_rtt(&mut self, rtt: Duration) {
        self.aged_rtt = Some(match self.aged_rtt {
            None => rtt,
            Some(old) => (old * 7 + rtt) / 8,
        });
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.aged_rtt
    }

    fn slot(&mut self, now: Timestamp) -> &mut GoodputSample {
        let epoch = now.as_micros() / GOODPUT_EPOCH.as_micros() as u64;
        let s = &mut self.goodput[(epoch % GOODPUT_SLOTS as u64) as usize];
        if s.epoch != epoch {
            *s = GoodputSample {
                epoch,
                ..Default::default()
            };
        }
        s
    }

    pub fn record_sent(&mut self, bytes: usize, now: Timestamp) {
        self.slot(now).bytes_sent += bytes as u64;
    }

    pub fn record_acked(&mut self, bytes: usize, now: Timestamp) {
        self.slot(now).bytes_acked += bytes as u64;
    }

    /// (sent, acked) bytes over the epochs still in the window.
    pub fn goodput(&self, now: Timestamp) -> (u64, u64) {
        let current = now.as_micros() / GOODPUT_EPOCH.as_micros() as u64;
        self.goodput
            .iter()
            .filter(|s| current.saturating_sub(s.epoch) < GOODPUT_SLOTS as u64)
            .fold((0, 0), |(s, a), g| (s + g.bytes_sent, a + g.bytes_acked))
    }
}

/// A transmission handed to the communicator and not yet completed by it.
pub struct InFlight {
    pub pending: Option<PendingId>,
    pub bytes: usize,
}

pub struct Queue {
    pub id: QueueId,
    pub communicator: CommunicatorId,
    pub neighbour: PeerIdentity,
    /// The communicator's own handle for this queue.
    pub handle: u32,
    pub address: String,
    /// Zero means unbounded.
    pub mtu: u32,
    pub network_type: NetworkType,
    pub status: ConnectionStatus,
    pub validated_until: Timestamp,
    pub pd: PerformanceData,
    pub in_flight: HashMap<u64, InFlight>,
    pub idle: bool,
    /// Control frames waiting for capacity.
    pub control_backlog: VecDeque<Vec<u8>>,
    pub pending_acks: Vec<Uuid>,
}

impl Queue {
    pub fn is_validated(&self, now: Timestamp) -> bool {
        self.validated_until > now && self.status != ConnectionStatus::Down
    }

    pub fn is_up(&self) -> bool {
        self.status != ConnectionStatus::Down
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.in_flight.values().map(|f| f.bytes as u64).sum()
    }

    /// Largest frame this queue takes.
    pub fn max_frame(&self) -> usize {
        if self.mtu == 0 {
            usize::MAX
        } else {
            self.mtu as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_ages_with_one_eighth_weight() {
        let mut pd = PerformanceData::default();
        assert_eq!(pd.rtt(), None);
        pd.update_rtt(Duration::from_millis(80));
        assert_eq!(pd.rtt(), Some(Duration::from_millis(80)));
        pd.update_rtt(Duration::from_millis(160));
        assert_eq!(pd.rtt(), Some(Duration::from_millis(90)));
    }

    #[test]
    fn goodput_window_forgets_old_epochs() {
        let mut pd = PerformanceData::default();
        let t0 = Timestamp::from_millis(1);
        pd.record_sent(100, t0);
        pd.record_acked(60, t0);
        assert_eq!(pd.goodput(t0), (100, 60));
        let later = t0 + GOODPUT_EPOCH * 5;
        assert_eq!(pd.goodput(later), (0, 0));
        pd.record_sent(10, later);
        assert_eq!(pd.goodput(later), (10, 0));
    }

    #[test]
    fn address_prefix_match() {
        let c = Communicator {
            name: "udp".into(),
            address_prefix: "udp".into(),
            characteristics: Characteristics::Unreliable,
            queues: vec![],
            addresses: vec![],
            total_in_flight: 0,
        };
        assert!(c.owns_address("udp-10.0.0.1:2086"));
        assert!(!c.owns_address("udpx-10.0.0.1:2086"));
        assert!(!c.owns_address("tcp-10.0.0.1:2086"));
    }
}
