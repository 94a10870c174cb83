//! DV boxes and the communicator backchannel.
//!
//! A box is encrypted for its target only: the sender's rotating ephemeral
//! x25519 key is combined with the target's long-term key, and HKDF over a
//! per-box IV yields the cipher and HMAC keys. Relays see the remaining hop
//! list and nothing else.

use std::time::Duration;

use rand::RngCore;
use tracing::{debug, trace};

use crate::core::{Action, Inbound, TimerEvent, TransportCore};
use crate::identity::{
    self, BoxKeys, CryptoError, EphemeralKey, PeerIdentity, Signature, SignaturePurpose,
};
use crate::ids::{CommunicatorId, HopId};
use crate::peerstore;
use crate::pending::PendingKind;
use crate::protocol::{self, BackchannelEncapsulation, BoxedPayload, DvBox, Message};
use crate::scheduler::RouteOptions;
use crate::stats;
use crate::time::Timestamp;
use crate::timer::TimerHandle;
use crate::wire;

const POLY1305_TAG_LEN: usize = 16;

/// Sender-side key material towards one DV target.
pub(crate) struct SenderEphemeral {
    key: EphemeralKey,
    dh: [u8; 32],
    sig: Signature,
    valid_until: Timestamp,
}

/// Receiver-side state for one peer that sends us boxes.
pub(crate) struct Backtalker {
    /// Newest monotonic time accepted.
    pub monotime: Timestamp,
    pub ephemeral: [u8; 32],
    pub dh: [u8; 32],
    pub timeout: Timestamp,
    pub timer: Option<TimerHandle>,
    /// The stored monotonic time has not been loaded yet.
    pub awaiting_store: bool,
    /// Newest message received while awaiting the store.
    pub held: Option<(Timestamp, Vec<u8>)>,
}

/// Bytes a DV box with `hops` remaining hops adds around its inner frame.
pub(crate) fn dv_box_overhead(hops: usize) -> usize {
    let zero = PeerIdentity::from_bytes([0u8; 32]);
    let plain = bincode::serialized_size(&BoxedPayload {
        sender: zero,
        ephemeral_sig: Signature::EMPTY,
        ephemeral_validity: Timestamp::ZERO,
        monotonic_time: Timestamp::ZERO,
        inner: Vec::new(),
    })
    .unwrap_or(0) as usize;
    let outer = wire::encoded_len(&Message::DvBox(DvBox {
        total_hops: 0,
        num_hops: 0,
        ephemeral_key: [0u8; 32],
        iv: [0u8; 16],
        hmac: [0u8; 32],
        hops: vec![zero; hops],
        ciphertext: Vec::new(),
    }))
    .unwrap_or(0);
    outer + plain + POLY1305_TAG_LEN
}

impl TransportCore {
    /// Rotate the ephemeral key towards `target` if it expired.
    fn refresh_ephemeral(&mut self, target: PeerIdentity, now: Timestamp) -> Option<()> {
        let dv = self.dvs.get_mut(&target)?;
        if dv.ephemeral.as_ref().is_some_and(|e| e.valid_until > now) {
            return Some(());
        }
        let key = EphemeralKey::generate(&mut self.rng);
        let dh = match key.dh_with_peer(&target) {
            Ok(dh) => dh,
            Err(e) => {
                debug!(%target, error = %e, "cannot derive box key");
                return None;
            }
        };
        let valid_until = now.saturating_add(self.config.ephemeral_validity);
        let sig = self.keypair.sign(
            SignaturePurpose::EphemeralConfirmation,
            &protocol::ephemeral_confirmation_bytes(&target, key.public(), valid_until),
        );
        trace!(%target, "new ephemeral key");
        dv.ephemeral = Some(SenderEphemeral {
            key,
            dh,
            sig,
            valid_until,
        });
        Some(())
    }

    /// Encrypt `inner` for the target of `hop`. The frame goes to the hop's next hop.
    pub(crate) fn dv_encapsulate(&mut self, hop: HopId, inner: &[u8]) -> Option<Vec<u8>> {
        let now = self.now();
        let h = self.hops.get(&hop)?;
        let target = h.target;
        let mut hops = h.path.clone();
        hops.push(target);
        self.refresh_ephemeral(target, now)?;
        let eph = self.dvs.get(&target)?.ephemeral.as_ref()?;
        let (ephemeral_key, dh, ephemeral_sig, ephemeral_validity) =
            (*eph.key.public(), eph.dh, eph.sig, eph.valid_until);
        let mut iv = [0u8; 16];
        self.rng.fill_bytes(&mut iv);
        let payload = BoxedPayload {
            sender: self.me,
            ephemeral_sig,
            ephemeral_validity,
            monotonic_time: self.monotonic.next(now),
            inner: inner.to_vec(),
        };
        let plain = match wire::to_blob(&payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(%target, error = %e, "cannot encode boxed payload");
                return None;
            }
        };
        let sealed = BoxKeys::derive(&dh, &iv).and_then(|k| k.seal(&plain));
        let (ciphertext, hmac) = match sealed {
            Ok(s) => s,
            Err(e) => {
                debug!(%target, error = %e, "cannot seal dv box");
                return None;
            }
        };
        let msg = DvBox {
            total_hops: 0,
            num_hops: hops.len() as u16,
            ephemeral_key,
            iv,
            hmac,
            hops,
            ciphertext,
        };
        wire::encode_frame(&Message::DvBox(msg)).ok()
    }

    pub(crate) fn handle_dv_box(&mut self, inb: &mut Inbound, dvb: DvBox) {
        if dvb.num_hops as usize != dvb.hops.len() {
            self.stats.incr(stats::MALFORMED);
            return;
        }
        if dvb.hops.is_empty() {
            self.open_dv_box(inb, dvb);
        } else {
            self.forward_dv_box(inb.sender, dvb);
        }
    }

    fn forward_dv_box(&mut self, from: PeerIdentity, mut dvb: DvBox) {
        if dvb.total_hops >= self.config.max_dv_hops_allowed {
            self.stats.incr(stats::DV_BOX_TOO_MANY_HOPS);
            return;
        }
        if dvb.hops.contains(&self.me) {
            debug!(%from, "dv box routed in a cycle");
            self.stats.incr(stats::DV_BOX_CYCLE);
            return;
        }
        let next = dvb
            .hops
            .iter()
            .rposition(|p| self.neighbours.contains_key(p) && self.links.contains_key(p));
        let Some(i) = next else {
            trace!(%from, "no neighbour on dv box path");
            self.stats.incr(stats::DV_BOX_NO_NEXT_HOP);
            return;
        };
        let next = dvb.hops[i];
        dvb.hops.drain(..=i);
        dvb.num_hops = dvb.hops.len() as u16;
        dvb.total_hops += 1;
        let Ok(frame) = wire::encode_frame(&Message::DvBox(dvb)) else {
            return;
        };
        let id = self
            .pending
            .insert_root(&mut self.ids, PendingKind::DvForward, next, frame, 0);
        if let Some(vl) = self.links.get_mut(&next) {
            vl.pending.push_back(id);
        }
        self.stats.incr(stats::DV_BOX_FORWARDED);
        self.check_link_transmission(next);
    }

    fn open_dv_box(&mut self, inb: &mut Inbound, dvb: DvBox) {
        let now = self.now();
        let cached = self
            .backtalkers
            .values()
            .find(|b| b.ephemeral == dvb.ephemeral_key)
            .map(|b| b.dh);
        let dh = cached.unwrap_or_else(|| self.keypair.dh_with_ephemeral(&dvb.ephemeral_key));
        let opened = BoxKeys::derive(&dh, &dvb.iv).and_then(|k| k.open(&dvb.ciphertext, &dvb.hmac));
        let plain = match opened {
            Ok(p) => p,
            Err(CryptoError::BadHmac) => {
                trace!(from = %inb.sender, "dv box hmac mismatch");
                self.stats.incr(stats::DV_BOX_BAD_HMAC);
                return;
            }
            Err(_) => {
                self.stats.incr(stats::DV_BOX_UNDECRYPTABLE);
                return;
            }
        };
        let Ok(payload) = wire::from_blob::<BoxedPayload>(&plain) else {
            self.stats.incr(stats::DV_BOX_UNDECRYPTABLE);
            return;
        };
        let sender = payload.sender;
        if sender == self.me {
            self.stats.incr(stats::MALFORMED);
            return;
        }
        let known = self
            .backtalkers
            .get(&sender)
            .is_some_and(|b| b.ephemeral == dvb.ephemeral_key);
        if !known {
            let confirmed = payload.ephemeral_validity > now
                && identity::verify(
                    &sender,
                    SignaturePurpose::EphemeralConfirmation,
                    &protocol::ephemeral_confirmation_bytes(
                        &self.me,
                        &dvb.ephemeral_key,
                        payload.ephemeral_validity,
                    ),
                    &payload.ephemeral_sig,
                );
            if !confirmed {
                debug!(%sender, "dv box with bad ephemeral confirmation");
                self.stats.incr(stats::DV_BOX_BAD_EPHEMERAL);
                return;
            }
        }
        let timeout = now.saturating_add(self.config.backchannel_inactivity_timeout);
        let Some(bt) = self.backtalkers.get_mut(&sender) else {
            let timer = self.timers.schedule(timeout, TimerEvent::BacktalkerExpiry(sender));
            self.backtalkers.insert(
                sender,
                Backtalker {
                    monotime: Timestamp::ZERO,
                    ephemeral: dvb.ephemeral_key,
                    dh,
                    timeout,
                    timer: Some(timer),
                    awaiting_store: true,
                    held: Some((payload.monotonic_time, payload.inner)),
                },
            );
            self.emit(Action::PeerStoreFetch {
                peer: sender,
                key: peerstore::KEY_BACKCHANNEL_MONOTIME,
            });
            return;
        };
        if !known {
            bt.ephemeral = dvb.ephemeral_key;
            bt.dh = dh;
        }
        if bt.awaiting_store {
            if bt.held.as_ref().map_or(true, |(t, _)| payload.monotonic_time > *t) {
                bt.held = Some((payload.monotonic_time, payload.inner));
            } else {
                self.stats.incr(stats::DV_BOX_REPLAY);
            }
            return;
        }
        if payload.monotonic_time <= bt.monotime {
            trace!(%sender, "replayed dv box");
            self.stats.incr(stats::DV_BOX_REPLAY);
            return;
        }
        bt.monotime = payload.monotonic_time;
        bt.timeout = timeout;
        self.store_monotime(sender, peerstore::KEY_BACKCHANNEL_MONOTIME, payload.monotonic_time);
        self.deliver_boxed(sender, inb, payload.inner);
    }

    /// Demultiplex a decrypted inner frame with `sender` as its origin.
    fn deliver_boxed(&mut self, sender: PeerIdentity, outer: &mut Inbound, inner: Vec<u8>) {
        let Some(msg) = self.decode_inner(&inner) else {
            return;
        };
        let mut inb = Inbound {
            sender,
            via_dv: true,
            communicator: outer.communicator,
            expected_validity: Duration::ZERO,
            token: outer.token.take(),
        };
        self.dispatch(msg, &mut inb);
        outer.token = inb.token;
    }

    /// Peer store answer for a backtalker's monotonic time. `None` ends the fetch.
    pub(crate) fn backtalker_monotime_loaded(&mut self, peer: PeerIdentity, value: Option<Vec<u8>>) {
        let Some(bt) = self.backtalkers.get_mut(&peer) else {
            return;
        };
        if let Some(v) = value {
            if let Ok(t) = wire::from_blob::<Timestamp>(&v) {
                bt.monotime = bt.monotime.max(t);
            }
            return;
        }
        if !bt.awaiting_store {
            return;
        }
        bt.awaiting_store = false;
        let Some((t, inner)) = bt.held.take() else {
            return;
        };
        if t <= bt.monotime {
            debug!(%peer, "held dv box older than stored monotonic time");
            self.stats.incr(stats::DV_BOX_REPLAY);
            return;
        }
        bt.monotime = t;
        self.store_monotime(peer, peerstore::KEY_BACKCHANNEL_MONOTIME, t);
        let mut inb = Inbound {
            sender: peer,
            via_dv: true,
            communicator: None,
            expected_validity: Duration::ZERO,
            token: None,
        };
        self.deliver_boxed(peer, &mut inb, inner);
    }

    pub(crate) fn expire_backtalker(&mut self, peer: PeerIdentity) {
        let now = self.now();
        let Some(bt) = self.backtalkers.get_mut(&peer) else {
            return;
        };
        if bt.timeout > now {
            bt.timer = Some(self.timers.schedule(bt.timeout, TimerEvent::BacktalkerExpiry(peer)));
            return;
        }
        trace!(%peer, "backtalker expired");
        self.backtalkers.remove(&peer);
    }

    pub(crate) fn handle_backchannel(&mut self, inb: &mut Inbound, bc: BackchannelEncapsulation) {
        let target = self
            .communicators
            .iter()
            .find(|(_, c)| c.name == bc.communicator)
            .map(|(id, _)| *id);
        let Some(communicator) = target else {
            debug!(name = %bc.communicator, "backchannel for unknown communicator");
            self.stats.incr(stats::BACKCHANNEL_NO_COMMUNICATOR);
            return;
        };
        self.emit(Action::DeliverBackchannel {
            communicator,
            sender: inb.sender,
            payload: bc.inner,
        });
    }

    /// A communicator wants `inner` delivered to communicator
    /// `target_communicator` on `target`.
    pub fn on_communicator_backchannel(
        &mut self,
        _communicator: CommunicatorId,
        target: PeerIdentity,
        inner: Vec<u8>,
        target_communicator: &str,
    ) -> Vec<Action> {
        let msg = Message::Backchannel(BackchannelEncapsulation {
            inner,
            communicator: target_communicator.to_string(),
        });
        match wire::encode_frame(&msg) {
            Ok(frame) => {
                self.route_control(target, frame, RouteOptions::ANYTHING_GOES);
            }
            Err(e) => debug!(error = %e, "cannot encode backchannel message"),
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::identity::Keypair;
    use crate::queue::{Characteristics, ConnectionStatus, NetworkType};
    use crate::time::ManualClock;

    struct Setup {
        sender: TransportCore,
        target: TransportCore,
        target_comm: CommunicatorId,
        relay: PeerIdentity,
        hop: HopId,
    }

    fn setup() -> Setup {
        let clock = ManualClock::new(Timestamp::from_millis(9_000_000));
        let mut sender =
            TransportCore::with_clock(Keypair::generate(), TransportConfig::default(), clock.clone(), 11);
        let mut target =
            TransportCore::with_clock(Keypair::generate(), TransportConfig::default(), clock, 12);
        let relay = Keypair::generate().identity();
        let comm = sender.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        sender.on_add_queue(comm, relay, 1, "udp-relay", 1200, NetworkType::Lan, ConnectionStatus::Outbound);
        let t = target.identity();
        sender.learn_path(&[relay, t], None, Timestamp::ZERO);
        let hop = sender.dvs[&t].hops[0];
        let target_comm = target.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        Setup {
            sender,
            target,
            target_comm,
            relay,
            hop,
        }
    }

    /// What the relay does before handing the box to the target.
    fn relay_to_target(frame: &[u8]) -> Vec<u8> {
        let Message::DvBox(mut dvb) = wire::decode_exact(frame).unwrap() else {
            panic!("not a dv box");
        };
        dvb.hops.clear();
        dvb.num_hops = 0;
        dvb.total_hops += 1;
        wire::encode_frame(&Message::DvBox(dvb)).unwrap()
    }

    fn backchannel_frame(payload: &[u8]) -> Vec<u8> {
        wire::encode_frame(&Message::Backchannel(BackchannelEncapsulation {
            inner: payload.to_vec(),
            communicator: "udp".into(),
        }))
        .unwrap()
    }

    #[test]
    fn overhead_matches_sealed_box() {
        let mut s = setup();
        let inner = vec![7u8; 333];
        let frame = s.sender.dv_encapsulate(s.hop, &inner).unwrap();
        assert_eq!(frame.len(), inner.len() + dv_box_overhead(1));
    }

    #[test]
    fn first_box_waits_for_stored_monotime() {
        let mut s = setup();
        let me = s.sender.identity();
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"hello")).unwrap();
        let boxed = relay_to_target(&frame);
        let actions = s
            .target
            .on_incoming(s.target_comm, s.relay, &boxed, Duration::ZERO, None);
        assert_eq!(
            actions,
            vec![Action::PeerStoreFetch {
                peer: me,
                key: peerstore::KEY_BACKCHANNEL_MONOTIME
            }]
        );
        let actions = s
            .target
            .on_peerstore_record(me, peerstore::KEY_BACKCHANNEL_MONOTIME, None);
        assert!(actions.contains(&Action::DeliverBackchannel {
            communicator: s.target_comm,
            sender: me,
            payload: b"hello".to_vec(),
        }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PeerStoreStore { key, .. } if *key == peerstore::KEY_BACKCHANNEL_MONOTIME)));

        // the same box again is a replay
        s.target
            .on_incoming(s.target_comm, s.relay, &boxed, Duration::ZERO, None);
        assert_eq!(s.target.statistics().get(stats::DV_BOX_REPLAY), 1);

        // a fresh box is delivered straight away
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"again")).unwrap();
        let actions = s
            .target
            .on_incoming(s.target_comm, s.relay, &relay_to_target(&frame), Duration::ZERO, None);
        assert!(actions.iter().any(|a| matches!(a, Action::DeliverBackchannel { payload, .. } if payload == b"again")));
    }

    #[test]
    fn stored_monotime_rejects_held_box() {
        let mut s = setup();
        let me = s.sender.identity();
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"old")).unwrap();
        s.target
            .on_incoming(s.target_comm, s.relay, &relay_to_target(&frame), Duration::ZERO, None);
        let future = wire::to_blob(&Timestamp::MAX).unwrap();
        s.target
            .on_peerstore_record(me, peerstore::KEY_BACKCHANNEL_MONOTIME, Some(future));
        let actions = s
            .target
            .on_peerstore_record(me, peerstore::KEY_BACKCHANNEL_MONOTIME, None);
        assert!(actions.is_empty());
        assert_eq!(s.target.statistics().get(stats::DV_BOX_REPLAY), 1);
    }

    #[test]
    fn tampered_box_fails_hmac() {
        let mut s = setup();
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"x")).unwrap();
        let Message::DvBox(mut dvb) = wire::decode_exact(&relay_to_target(&frame)).unwrap() else {
            panic!("not a dv box");
        };
        dvb.ciphertext[0] ^= 1;
        let bad = wire::encode_frame(&Message::DvBox(dvb)).unwrap();
        let actions = s.target.on_incoming(s.target_comm, s.relay, &bad, Duration::ZERO, None);
        assert!(actions.is_empty());
        assert_eq!(s.target.statistics().get(stats::DV_BOX_BAD_HMAC), 1);
    }

    #[test]
    fn box_for_someone_else_is_undecryptable_or_bad_hmac() {
        let mut s = setup();
        let mut other = TransportCore::new(Keypair::generate(), TransportConfig::default());
        let comm = other.on_communicator_connected("udp", "udp", Characteristics::Unreliable);
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"x")).unwrap();
        other.on_incoming(comm, s.relay, &relay_to_target(&frame), Duration::ZERO, None);
        assert_eq!(other.statistics().get(stats::DV_BOX_BAD_HMAC), 1);
    }

    #[test]
    fn relay_drops_cycles() {
        let mut s = setup();
        let frame = s.sender.dv_encapsulate(s.hop, &backchannel_frame(b"x")).unwrap();
        let Message::DvBox(mut dvb) = wire::decode_exact(&frame).unwrap() else {
            panic!("not a dv box");
        };
        dvb.hops.insert(0, s.target.identity());
        dvb.num_hops += 1;
        let looped = wire::encode_frame(&Message::DvBox(dvb)).unwrap();
        s.target
            .on_incoming(s.target_comm, s.relay, &looped, Duration::ZERO, None);
        assert_eq!(s.target.statistics().get(stats::DV_BOX_CYCLE), 1);
    }

    #[test]
    fn unknown_backchannel_communicator_is_counted() {
        let mut s = setup();
        let frame = wire::encode_frame(&Message::Backchannel(BackchannelEncapsulation {
            inner: vec![1],
            communicator: "tcp".into(),
        }))
        .unwrap();
        let actions = s
            .target
            .on_incoming(s.target_comm, s.relay, &frame, Duration::ZERO, None);
        assert!(actions.is_empty());
        assert_eq!(s.target.statistics().get(stats::BACKCHANNEL_NO_COMMUNICATOR), 1);
    }
}
