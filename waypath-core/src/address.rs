//! Our own addresses (signed, published to the peer store) and addresses of
//! other peers learned from their signed records or from the upper layer.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::{Action, TimerEvent, TransportCore};
use crate::identity::{self, PeerIdentity, SignaturePurpose};
use crate::ids::{AddressId, CommunicatorId};
use crate::peerstore::{self, StoreMode};
use crate::protocol::SignedAddress;
use crate::queue::NetworkType;
use crate::stats;
use crate::timer::TimerHandle;
use crate::wire;

pub(crate) struct OwnAddress {
    communicator: CommunicatorId,
    address: String,
    network_type: NetworkType,
    /// Lifetime of each signed record.
    expiration: Duration,
    timer: Option<TimerHandle>,
}

impl TransportCore {
    /// A communicator is reachable at `address`. Returns `None` for an
    /// unknown communicator.
    pub fn on_add_address(
        &mut self,
        communicator: CommunicatorId,
        address: &str,
        network_type: NetworkType,
        expiration: Duration,
    ) -> (Option<AddressId>, Vec<Action>) {
        let Some(c) = self.communicators.get_mut(&communicator) else {
            warn!(address, "address from unknown communicator");
            return (None, self.finish());
        };
        let id = AddressId(self.ids.next());
        c.addresses.push(id);
        self.own_addresses.insert(
            id,
            OwnAddress {
                communicator,
                address: address.to_string(),
                network_type,
                expiration,
                timer: None,
            },
        );
        debug!(address, "own address added");
        self.refresh_own_address(id);
        (Some(id), self.finish())
    }

    pub fn on_del_address(&mut self, communicator: CommunicatorId, id: AddressId) -> Vec<Action> {
        if self
            .own_addresses
            .get(&id)
            .is_some_and(|a| a.communicator == communicator)
        {
            self.free_own_address(id);
        }
        self.finish()
    }

    /// Sign the address afresh and publish it.
    pub(crate) fn refresh_own_address(&mut self, id: AddressId) {
        let now = self.now();
        let Some(a) = self.own_addresses.get_mut(&id) else {
            return;
        };
        a.timer = None;
        let expiry = now.saturating_add(a.expiration);
        let signature = self.keypair.sign(
            SignaturePurpose::OwnAddress,
            &SignedAddress::signed_bytes(&a.address, a.network_type, expiry),
        );
        let record = SignedAddress {
            address: a.address.clone(),
            network_type: a.network_type,
            expiration: expiry,
            signature,
        };
        let next = now.saturating_add(a.expiration / 4);
        a.timer = Some(self.timers.schedule(next, TimerEvent::AddressRefresh(id)));
        let Ok(value) = wire::to_blob(&record) else {
            return;
        };
        trace!(address = %record.address, "publishing own address");
        let request = self.next_request();
        self.store_requests.insert(request, id);
        self.emit(Action::PeerStoreStore {
            request,
            peer: self.me,
            key: peerstore::KEY_HELLO,
            value,
            expiry,
            mode: StoreMode::Multiple,
        });
    }

    pub(crate) fn own_address_store_failed(&mut self, id: AddressId) {
        let retry = self.now().saturating_add(self.config.address_refresh_retry);
        let Some(a) = self.own_addresses.get_mut(&id) else {
            return;
        };
        debug!(address = %a.address, "storing own address failed, retrying");
        self.stats.incr(stats::OWN_ADDRESS_STORE_FAILED);
        if let Some(h) = a.timer.take() {
            self.timers.cancel(h);
        }
        a.timer = Some(self.timers.schedule(retry, TimerEvent::AddressRefresh(id)));
    }

    pub(crate) fn free_own_address(&mut self, id: AddressId) {
        let Some(a) = self.own_addresses.remove(&id) else {
            return;
        };
        debug!(address = %a.address, "own address removed");
        if let Some(h) = a.timer {
            self.timers.cancel(h);
        }
        self.store_requests.retain(|_, x| *x != id);
        if let Some(c) = self.communicators.get_mut(&a.communicator) {
            c.addresses.retain(|x| *x != id);
        }
    }

    /// Signed address record of `peer`, as published under the hello key.
    pub(crate) fn hello_received(&mut self, peer: PeerIdentity, blob: &[u8]) {
        if peer == self.me {
            return;
        }
        let Ok(record) = wire::from_blob::<SignedAddress>(blob) else {
            self.stats.incr(stats::MALFORMED);
            return;
        };
        let now = self.now();
        let signed =
            SignedAddress::signed_bytes(&record.address, record.network_type, record.expiration);
        if record.expiration <= now
            || !identity::verify(&peer, SignaturePurpose::OwnAddress, &signed, &record.signature)
        {
            debug!(%peer, address = %record.address, "dropping bad hello record");
            self.stats.incr(stats::HELLO_BAD);
            return;
        }
        self.start_address_validation(peer, &record.address, record.expiration);
    }

    /// Hello record handed over by the host outside of a watch.
    pub fn on_peerstore_hello(&mut self, peer: PeerIdentity, blob: &[u8]) -> Vec<Action> {
        self.hello_received(peer, blob);
        self.finish()
    }

    /// The upper layer wants a connection to `peer`: follow its hello records.
    pub fn on_suggest(&mut self, peer: PeerIdentity) -> Vec<Action> {
        if peer != self.me && self.suggestions.insert(peer) {
            trace!(%peer, "watching hello records");
            self.emit(Action::PeerStoreWatch {
                peer,
                key: peerstore::KEY_HELLO,
            });
        }
        self.finish()
    }

    pub fn on_suggest_cancel(&mut self, peer: PeerIdentity) -> Vec<Action> {
        if self.suggestions.remove(&peer) {
            self.emit(Action::PeerStoreWatchCancel {
                peer,
                key: peerstore::KEY_HELLO,
            });
        }
        self.finish()
    }

    /// The upper layer learned `address` for `peer` out of band.
    pub fn on_address_suggestion(&mut self, peer: PeerIdentity, address: &str) -> Vec<Action> {
        let until = self
            .now()
            .saturating_add(self.config.address_validation_lifetime);
        self.start_address_validation(peer, address, until);
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::identity::Keypair;
    use crate::ids::RequestId;
    use crate::queue::Characteristics;
    use crate::time::{ManualClock, Timestamp};

    const MINUTE: Duration = Duration::from_secs(60);

    fn core(seed: u64) -> (TransportCore, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_millis(7_000_000));
        let core = TransportCore::with_clock(
            Keypair::generate(),
            TransportConfig::default(),
            clock.clone(),
            seed,
        );
        (core, clock)
    }

    fn hello_store(actions: &[Action]) -> Option<(RequestId, Vec<u8>, Timestamp)> {
        actions.iter().find_map(|a| match a {
            Action::PeerStoreStore {
                request,
                key,
                value,
                expiry,
                mode: StoreMode::Multiple,
                ..
            } if *key == peerstore::KEY_HELLO => Some((*request, value.clone(), *expiry)),
            _ => None,
        })
    }

    #[test]
    fn address_is_signed_and_refreshed() {
        let (mut core, clock) = core(1);
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let (id, actions) = core.on_add_address(comm, "udp-192.0.2.1:2086", NetworkType::Wan, 60 * MINUTE);
        assert!(id.is_some());
        let (_, blob, expiry) = hello_store(&actions).expect("hello stored");
        assert_eq!(expiry, core.now() + 60 * MINUTE);
        let record: SignedAddress = wire::from_blob(&blob).unwrap();
        assert_eq!(record.address, "udp-192.0.2.1:2086");
        assert!(identity::verify(
            &core.identity(),
            SignaturePurpose::OwnAddress,
            &SignedAddress::signed_bytes(&record.address, record.network_type, record.expiration),
            &record.signature,
        ));

        clock.advance(14 * MINUTE);
        assert!(hello_store(&core.on_timeout()).is_none());
        clock.advance(MINUTE);
        assert!(hello_store(&core.on_timeout()).is_some());
    }

    #[test]
    fn failed_store_is_retried() {
        let (mut core, clock) = core(2);
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let (_, actions) = core.on_add_address(comm, "udp-x", NetworkType::Lan, 60 * MINUTE);
        let (request, _, _) = hello_store(&actions).unwrap();
        core.on_peerstore_store_result(request, false);
        assert_eq!(core.statistics().get(stats::OWN_ADDRESS_STORE_FAILED), 1);
        clock.advance(Duration::from_secs(1));
        assert!(hello_store(&core.on_timeout()).is_some());
    }

    #[test]
    fn deleted_address_is_not_refreshed() {
        let (mut core, clock) = core(3);
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let (id, _) = core.on_add_address(comm, "udp-x", NetworkType::Lan, 4 * MINUTE);
        core.on_del_address(comm, id.unwrap());
        clock.advance(10 * MINUTE);
        assert!(hello_store(&core.on_timeout()).is_none());
    }

    #[test]
    fn unknown_communicator_gets_no_address() {
        let (mut core, _) = core(4);
        let comm = core.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        core.on_communicator_disconnected(comm);
        let (id, actions) = core.on_add_address(comm, "udp-x", NetworkType::Lan, MINUTE);
        assert!(id.is_none());
        assert!(actions.is_empty());
    }

    #[test]
    fn hello_from_peer_starts_validation() {
        let (mut a, _) = core(5);
        let (mut b, _) = core(6);
        let a_comm = a.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let b_comm = b.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let (_, actions) = b.on_add_address(b_comm, "udp-198.51.100.7:2086", NetworkType::Wan, 60 * MINUTE);
        let (_, blob, _) = hello_store(&actions).unwrap();

        let idb = b.identity();
        a.on_peerstore_record(idb, peerstore::KEY_HELLO, Some(blob.clone()));
        let actions = a.on_timeout();
        assert!(actions.iter().any(|x| matches!(
            x,
            Action::CreateQueue { communicator, peer, address, .. }
                if *communicator == a_comm && *peer == idb && address == "udp-198.51.100.7:2086"
        )));

        // the same record claimed by someone else fails verification
        let mallory = Keypair::generate().identity();
        a.on_peerstore_hello(mallory, &blob);
        assert_eq!(a.statistics().get(stats::HELLO_BAD), 1);
    }

    #[test]
    fn suggestions_watch_hellos_once() {
        let (mut core, _) = core(7);
        let peer = Keypair::generate().identity();
        let watch = Action::PeerStoreWatch {
            peer,
            key: peerstore::KEY_HELLO,
        };
        assert_eq!(core.on_suggest(peer), vec![watch]);
        assert!(core.on_suggest(peer).is_empty());
        assert_eq!(
            core.on_suggest_cancel(peer),
            vec![Action::PeerStoreWatchCancel {
                peer,
                key: peerstore::KEY_HELLO
            }]
        );
        assert!(core.on_suggest_cancel(peer).is_empty());
        assert!(core.on_suggest(core.identity()).is_empty());
    }
}
