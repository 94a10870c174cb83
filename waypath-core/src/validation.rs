//! Address validation: challenge a peer at one of its addresses and trust the
//! address only after a signed response for a fresh challenge comes back.
//!
//! All states sit in one min-heap ordered by next-challenge time; a single
//! timer follows the heap root.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info, trace};

use crate::core::{Action, Inbound, QueueRequest, TimerEvent, TransportCore};
use crate::identity::{self, PeerIdentity, SignaturePurpose};
use crate::ids::QueueId;
use crate::peerstore::{self, StoreMode};
use crate::protocol::{self, ChallengeNonce, Message, ValidationChallenge, ValidationResponse};
use crate::scheduler::{self, RouteOptions};
use crate::stats;
use crate::time::{duration_micros, Timestamp};
use crate::timer::TimerHandle;
use crate::wire;

type Key = (PeerIdentity, String);

pub(crate) struct ValidationState {
    challenge: ChallengeNonce,
    /// Sender times of the first and latest challenge carrying `challenge`.
    first_challenge_use: Timestamp,
    last_challenge_use: Timestamp,
    /// How long we keep trying this address at all.
    valid_until: Timestamp,
    validated_until: Timestamp,
    next_challenge: Timestamp,
    challenge_backoff: Duration,
    validation_rtt: Option<Duration>,
    awaiting_queue: bool,
    /// Heap entry currently representing this state.
    seq: u64,
}

#[derive(Default)]
pub(crate) struct ValidationTable {
    states: HashMap<Key, ValidationState>,
    by_challenge: HashMap<ChallengeNonce, Key>,
    heap: BinaryHeap<Reverse<(Timestamp, u64)>>,
    /// Live heap entries; anything else in `heap` is stale.
    entries: HashMap<u64, Key>,
    next_seq: u64,
    pub timer: Option<TimerHandle>,
}

impl ValidationTable {
    pub fn validated_until(&self, peer: &PeerIdentity, address: &str) -> Option<Timestamp> {
        self.states
            .get(&(*peer, address.to_string()))
            .map(|s| s.validated_until)
    }

    fn reschedule(&mut self, key: &Key, at: Timestamp) {
        let Some(s) = self.states.get_mut(key) else {
            return;
        };
        self.entries.remove(&s.seq);
        self.next_seq += 1;
        s.seq = self.next_seq;
        s.next_challenge = at;
        self.entries.insert(s.seq, key.clone());
        self.heap.push(Reverse((at, s.seq)));
    }

    fn earliest(&mut self) -> Option<Timestamp> {
        while let Some(Reverse((at, seq))) = self.heap.peek() {
            if self.entries.contains_key(seq) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Timestamp) -> Option<Key> {
        let at = self.earliest()?;
        if at > now {
            return None;
        }
        let Reverse((_, seq)) = self.heap.pop()?;
        self.entries.remove(&seq)
    }

    fn remove(&mut self, key: &Key) {
        if let Some(s) = self.states.remove(key) {
            self.entries.remove(&s.seq);
            self.by_challenge.remove(&s.challenge);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

impl TransportCore {
    fn fresh_challenge(&mut self) -> ChallengeNonce {
        let mut b = [0u8; 32];
        self.rng.fill_bytes(&mut b);
        ChallengeNonce(b)
    }

    /// Validate `address` of `peer`, trying until `valid_until`.
    pub(crate) fn start_address_validation(
        &mut self,
        peer: PeerIdentity,
        address: &str,
        valid_until: Timestamp,
    ) {
        if peer == self.me {
            return;
        }
        let now = self.now();
        let key = (peer, address.to_string());
        match self.validations.states.get_mut(&key) {
            Some(s) => {
                s.valid_until = s.valid_until.max(valid_until);
                if s.validated_until > now {
                    return;
                }
                trace!(%peer, address, "validation moved up");
            }
            None => {
                let challenge = self.fresh_challenge();
                debug!(%peer, address, "validation started");
                self.validations.by_challenge.insert(challenge, key.clone());
                self.validations.states.insert(
                    key.clone(),
                    ValidationState {
                        challenge,
                        first_challenge_use: Timestamp::ZERO,
                        last_challenge_use: Timestamp::ZERO,
                        valid_until,
                        validated_until: Timestamp::ZERO,
                        next_challenge: now,
                        challenge_backoff: Duration::ZERO,
                        validation_rtt: None,
                        awaiting_queue: false,
                        seq: 0,
                    },
                );
            }
        }
        self.validations.reschedule(&key, now);
        self.update_validation_timer();
    }

    fn update_validation_timer(&mut self) {
        let at = self.validations.earliest();
        if let Some(h) = self.validations.timer.take() {
            self.timers.cancel(h);
        }
        if let Some(at) = at {
            self.validations.timer = Some(self.timers.schedule(at, TimerEvent::Validation));
        }
    }

    fn queue_for_address(&self, peer: &PeerIdentity, address: &str) -> Option<QueueId> {
        self.neighbours
            .get(peer)?
            .queues
            .iter()
            .filter_map(|q| self.queues.get(q))
            .find(|q| q.address == address && q.is_up())
            .map(|q| q.id)
    }

    /// Send every challenge that is due.
    pub(crate) fn run_validations(&mut self) {
        let now = self.now();
        while let Some(key) = self.validations.pop_due(now) {
            let Some(s) = self.validations.states.get(&key) else {
                continue;
            };
            if s.valid_until <= now && s.validated_until <= now {
                debug!(peer = %key.0, address = %key.1, "validation gave up");
                self.validations.remove(&key);
                continue;
            }
            let challenge = s.challenge;
            let backoff = scheduler::backoff(
                s.challenge_backoff,
                self.config.fast_validation_challenge_freq,
                self.config.max_validation_challenge_freq,
                &mut self.rng,
            );
            match self.queue_for_address(&key.0, &key.1) {
                Some(qid) => self.send_challenge(&key, qid, challenge, now),
                None => self.request_queue(&key),
            }
            if let Some(s) = self.validations.states.get_mut(&key) {
                s.challenge_backoff = backoff;
            }
            self.validations.reschedule(&key, now.saturating_add(backoff));
        }
        self.update_validation_timer();
    }

    fn send_challenge(&mut self, key: &Key, qid: QueueId, challenge: ChallengeNonce, now: Timestamp) {
        let sender_time = self.monotonic.next(now);
        if let Some(s) = self.validations.states.get_mut(key) {
            s.awaiting_queue = false;
            if s.first_challenge_use.is_zero() {
                s.first_challenge_use = sender_time;
            }
            s.last_challenge_use = sender_time;
        }
        let msg = Message::ValidationChallenge(ValidationChallenge {
            challenge,
            sender_time,
        });
        let Ok(frame) = wire::encode_frame(&msg) else {
            return;
        };
        trace!(peer = %key.0, address = %key.1, "sending validation challenge");
        self.stats.incr(stats::VALIDATION_CHALLENGES_SENT);
        self.send_control_on_queue(qid, frame);
    }

    /// Ask the communicator owning the address for a queue.
    fn request_queue(&mut self, key: &Key) {
        let Some(s) = self.validations.states.get_mut(key) else {
            return;
        };
        s.awaiting_queue = true;
        let owner = self
            .communicators
            .iter()
            .find(|(_, c)| c.owns_address(&key.1))
            .map(|(id, _)| *id);
        let Some(communicator) = owner else {
            trace!(address = %key.1, "no communicator for address");
            return;
        };
        let pending = self
            .queue_requests
            .values()
            .any(|r| r.peer == key.0 && r.address == key.1);
        if pending {
            return;
        }
        let request = self.next_request();
        self.queue_requests.insert(
            request,
            QueueRequest {
                communicator,
                peer: key.0,
                address: key.1.clone(),
            },
        );
        self.emit(Action::CreateQueue {
            communicator,
            request,
            peer: key.0,
            address: key.1.clone(),
        });
    }

    /// A queue to `peer` at `address` appeared.
    pub(crate) fn queue_available(&mut self, peer: PeerIdentity, address: &str) {
        let now = self.now();
        let key = (peer, address.to_string());
        self.queue_requests
            .retain(|_, r| !(r.peer == peer && r.address == address));
        match self.validations.states.get(&key) {
            Some(s) if s.awaiting_queue => {
                self.validations.reschedule(&key, now);
                self.update_validation_timer();
            }
            Some(_) => {}
            None => {
                let until = now.saturating_add(self.config.address_validation_lifetime);
                self.start_address_validation(peer, address, until);
            }
        }
    }

    pub(crate) fn handle_validation_challenge(&mut self, inb: &mut Inbound, c: ValidationChallenge) {
        let validity_duration_us = duration_micros(inb.expected_validity);
        let signature = self.keypair.sign(
            SignaturePurpose::AddressValidation,
            &protocol::validation_bytes(validity_duration_us, &c.challenge),
        );
        let msg = Message::ValidationResponse(ValidationResponse {
            challenge: c.challenge,
            origin_time: c.sender_time,
            validity_duration_us,
            signature,
        });
        if let Ok(frame) = wire::encode_frame(&msg) {
            trace!(peer = %inb.sender, "answering validation challenge");
            self.route_control(inb.sender, frame, RouteOptions::ANYTHING_GOES.redundant());
        }
    }

    pub(crate) fn handle_validation_response(&mut self, inb: &mut Inbound, r: ValidationResponse) {
        let peer = inb.sender;
        let key = match self.validations.by_challenge.get(&r.challenge) {
            Some(k) if k.0 == peer => k.clone(),
            _ => {
                trace!(%peer, "validation response for unknown challenge");
                self.stats.incr(stats::VALIDATION_UNKNOWN);
                return;
            }
        };
        let Some(s) = self.validations.states.get(&key) else {
            self.stats.incr(stats::VALIDATION_UNKNOWN);
            return;
        };
        if s.first_challenge_use.is_zero()
            || r.origin_time < s.first_challenge_use
            || r.origin_time > s.last_challenge_use
        {
            debug!(%peer, origin = %r.origin_time, "validation response outside challenge window");
            self.stats.incr(stats::VALIDATION_OUT_OF_WINDOW);
            return;
        }
        let signed = protocol::validation_bytes(r.validity_duration_us, &r.challenge);
        if !identity::verify(&peer, SignaturePurpose::AddressValidation, &signed, &r.signature) {
            debug!(%peer, "validation response with bad signature");
            self.stats.incr(stats::VALIDATION_BAD_SIG);
            return;
        }

        let now = self.now();
        let claimed = Duration::from_micros(r.validity_duration_us);
        let valid_until = now.saturating_add(claimed.min(self.config.max_address_valid_until));
        let lifetime = now.saturating_add(self.config.address_validation_lifetime);
        let rtt = now.saturating_since(r.origin_time);
        let fresh = self.fresh_challenge();
        let factor = self.config.validation_rtt_buffer_factor;
        let floor = now.saturating_add(self.config.fast_validation_challenge_freq);
        let Some(s) = self.validations.states.get_mut(&key) else {
            return;
        };
        s.valid_until = valid_until;
        s.validated_until = s.validated_until.max(valid_until.min(lifetime));
        s.validation_rtt = Some(rtt);
        self.validations.by_challenge.remove(&s.challenge);
        s.challenge = fresh;
        s.first_challenge_use = Timestamp::ZERO;
        s.last_challenge_use = Timestamp::ZERO;
        s.challenge_backoff = Duration::ZERO;
        let validated_until = s.validated_until;
        let next = validated_until
            .saturating_sub_duration(rtt.saturating_mul(factor))
            .max(floor);
        self.validations.by_challenge.insert(fresh, key.clone());
        self.validations.reschedule(&key, next);
        self.update_validation_timer();

        info!(%peer, address = %key.1, until = %validated_until, "address validated");
        self.stats.incr(stats::VALIDATIONS_SUCCEEDED);
        let updated: Vec<QueueId> = self
            .neighbours
            .get(&peer)
            .map(|n| n.queues.clone())
            .unwrap_or_default();
        for qid in updated {
            let Some(q) = self.queues.get_mut(&qid) else {
                continue;
            };
            if q.address != key.1 {
                continue;
            }
            q.validated_until = validated_until;
            q.pd.update_rtt(rtt);
            self.notify_monitors(qid);
        }
        let request = self.next_request();
        self.emit(Action::PeerStoreStore {
            request,
            peer,
            key: peerstore::KEY_VALIDATED_ADDRESS,
            value: key.1.clone().into_bytes(),
            expiry: validated_until,
            mode: StoreMode::Multiple,
        });
        if self.neighbours.contains_key(&peer) {
            self.ensure_link(peer);
            self.schedule_neighbour(peer);
        }
    }
}
