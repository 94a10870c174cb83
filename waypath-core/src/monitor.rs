//! Queue monitoring for diagnostics tools.

use std::time::Duration;

use crate::core::{Action, TransportCore};
use crate::identity::PeerIdentity;
use crate::ids::{MonitorId, QueueId};
use crate::queue::{ConnectionStatus, NetworkType, Queue};
use crate::time::Timestamp;

/// State of one queue as seen by a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub peer: PeerIdentity,
    pub address: String,
    pub network_type: NetworkType,
    pub status: ConnectionStatus,
    pub rtt: Option<Duration>,
    /// Transmissions handed to the communicator and not yet completed.
    pub num_msg_pending: u32,
    pub num_bytes_pending: u64,
    pub validated_until: Timestamp,
    /// Bytes handed to the communicator over the last few seconds.
    pub bytes_sent: u64,
    /// Of those, bytes the peer acknowledged.
    pub bytes_acked: u64,
    /// The queue is gone; this is its last snapshot.
    pub removed: bool,
}

impl QueueSnapshot {
    fn of(q: &Queue, removed: bool, now: Timestamp) -> Self {
        let (bytes_sent, bytes_acked) = q.pd.goodput(now);
        Self {
            peer: q.neighbour,
            address: q.address.clone(),
            network_type: q.network_type,
            status: q.status,
            rtt: q.pd.rtt(),
            num_msg_pending: q.in_flight.len() as u32,
            num_bytes_pending: q.bytes_in_flight(),
            validated_until: q.validated_until,
            bytes_sent,
            bytes_acked,
            removed,
        }
    }
}

pub(crate) struct Monitor {
    filter: Option<PeerIdentity>,
}

impl Monitor {
    fn wants(&self, peer: &PeerIdentity) -> bool {
        self.filter.map_or(true, |f| f == *peer)
    }
}

impl TransportCore {
    /// Snapshot every queue matching `filter`. Unless `one_shot`, the monitor
    /// keeps receiving `Action::Monitor` on each queue change until stopped.
    pub fn monitor_start(
        &mut self,
        filter: Option<PeerIdentity>,
        one_shot: bool,
    ) -> (MonitorId, Vec<QueueSnapshot>) {
        let id = MonitorId(self.ids.next());
        let m = Monitor { filter };
        let now = self.now();
        let mut snapshots: Vec<QueueSnapshot> = self
            .queues
            .values()
            .filter(|q| m.wants(&q.neighbour))
            .map(|q| QueueSnapshot::of(q, false, now))
            .collect();
        snapshots.sort_by(|a, b| (a.peer, &a.address).cmp(&(b.peer, &b.address)));
        if !one_shot {
            self.monitors.insert(id, m);
        }
        (id, snapshots)
    }

    /// Returns false for an unknown or one-shot monitor.
    pub fn monitor_stop(&mut self, id: MonitorId) -> bool {
        self.monitors.remove(&id).is_some()
    }

    pub(crate) fn notify_monitors(&mut self, qid: QueueId) {
        if self.monitors.is_empty() {
            return;
        }
        let now = self.now();
        if let Some(q) = self.queues.get(&qid) {
            let snapshot = QueueSnapshot::of(q, false, now);
            self.broadcast(snapshot);
        }
    }

    pub(crate) fn notify_monitors_removed(&mut self, q: &Queue) {
        if !self.monitors.is_empty() {
            let now = self.now();
            self.broadcast(QueueSnapshot::of(q, true, now));
        }
    }

    fn broadcast(&mut self, snapshot: QueueSnapshot) {
        let mut ids: Vec<MonitorId> = self
            .monitors
            .iter()
            .filter(|(_, m)| m.wants(&snapshot.peer))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for monitor in ids {
            self.emit(Action::Monitor {
                monitor,
                snapshot: snapshot.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::identity::Keypair;
    use crate::queue::Characteristics;
    use crate::time::ManualClock;

    fn core() -> TransportCore {
        TransportCore::with_clock(
            Keypair::generate(),
            TransportConfig::default(),
            ManualClock::new(Timestamp::from_millis(1)),
            9,
        )
    }

    fn monitored(actions: &[Action], id: MonitorId) -> Vec<QueueSnapshot> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Monitor { monitor, snapshot } if *monitor == id => Some(snapshot.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn one_shot_lists_current_queues() {
        let mut core = core();
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let p1 = Keypair::generate().identity();
        let p2 = Keypair::generate().identity();
        core.on_add_queue(comm, p1, 1, "udp-1", 1200, NetworkType::Lan, ConnectionStatus::Inbound);
        core.on_add_queue(comm, p2, 2, "udp-2", 1200, NetworkType::Wan, ConnectionStatus::Outbound);
        let (_, all) = core.monitor_start(None, true);
        assert_eq!(all.len(), 2);
        let (id, only) = core.monitor_start(Some(p2), true);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].address, "udp-2");
        assert_eq!(only[0].network_type, NetworkType::Wan);
        assert!(!core.monitor_stop(id));
    }

    #[test]
    fn follows_queue_lifecycle() {
        let mut core = core();
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let peer = Keypair::generate().identity();
        let other = Keypair::generate().identity();
        let (id, initial) = core.monitor_start(Some(peer), false);
        assert!(initial.is_empty());

        let actions =
            core.on_add_queue(comm, peer, 1, "udp-1", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        let seen = monitored(&actions, id);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, ConnectionStatus::Outbound);
        assert!(!seen[0].removed);

        let actions =
            core.on_add_queue(comm, other, 2, "udp-2", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        assert!(monitored(&actions, id).is_empty());

        let actions = core.on_update_queue(comm, 1, ConnectionStatus::Inbound);
        assert_eq!(monitored(&actions, id)[0].status, ConnectionStatus::Inbound);

        let actions = core.on_del_queue(comm, 1);
        let seen = monitored(&actions, id);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].removed);

        assert!(core.monitor_stop(id));
        let actions =
            core.on_add_queue(comm, peer, 3, "udp-3", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        assert!(monitored(&actions, id).is_empty());
    }
}
