//! Distance-vector routing: the path table and DV-learn campaigns.
//!
//! A campaign floods a signed learn message outward from its initiator. Every
//! peer it passes appends itself with a signature over its predecessor and
//! successor, learns the reverse path while all links so far are
//! bidirectional, and forwards to a few neighbours not yet on the path. A peer
//! that sees a fully bidirectional path echoes the message back; the initiator
//! learns every prefix of an echoed path as confirmed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::backchannel::SenderEphemeral;
use crate::core::{Inbound, TimerEvent, TransportCore};
use crate::identity::{self, PeerIdentity, SignaturePurpose};
use crate::ids::HopId;
use crate::peerstore;
use crate::protocol::{self, ChallengeNonce, DvLearn, DvPathEntry, Message};
use crate::queue::PerformanceData;
use crate::scheduler;
use crate::stats;
use crate::time::Timestamp;
use crate::timer::TimerHandle;
use crate::wire;

/// One known path to a DV target.
pub struct DistanceVectorHop {
    pub id: HopId,
    pub target: PeerIdentity,
    /// Direct neighbour the path starts with.
    pub next_hop: PeerIdentity,
    /// Peers between `next_hop` and `target`.
    pub path: Vec<PeerIdentity>,
    /// Forgotten after this unless learned again.
    pub timeout: Timestamp,
    /// Confirmed by an echo until then; zero if never.
    pub path_valid_until: Timestamp,
    pub pd: PerformanceData,
    pub pending_acks: Vec<Uuid>,
    pub expiry_timer: Option<TimerHandle>,
}

impl DistanceVectorHop {
    /// Number of intermediate peers after the next hop.
    pub fn distance(&self) -> usize {
        self.path.len()
    }
}

pub struct DistanceVector {
    pub target: PeerIdentity,
    pub hops: Vec<HopId>,
    /// Key material for boxes we send to `target`.
    pub(crate) ephemeral: Option<SenderEphemeral>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnResult {
    Learned,
    /// Same path known; its lifetime was extended.
    Refreshed,
    /// Enough shorter paths exist already.
    NotUseful,
    /// Broken path: next hop not a neighbour, or a shortcut exists.
    Invalid,
}

/// Campaigns we started, plus the newest monotonic time seen per initiator
/// on learns relayed by others.
#[derive(Default)]
pub(crate) struct DvLearnCampaigns {
    launched: HashMap<ChallengeNonce, Timestamp>,
    order: VecDeque<ChallengeNonce>,
    initiators: HashMap<PeerIdentity, Timestamp>,
}

impl DvLearnCampaigns {
    fn insert(&mut self, challenge: ChallengeNonce, at: Timestamp, max: usize) {
        while self.order.len() >= max.max(1) {
            if let Some(old) = self.order.pop_front() {
                self.launched.remove(&old);
            }
        }
        self.launched.insert(challenge, at);
        self.order.push_back(challenge);
    }

    fn launched_at(&self, challenge: &ChallengeNonce) -> Option<Timestamp> {
        self.launched.get(challenge).copied()
    }

    /// False if `t` is before `oldest`, or older than what `initiator` sent
    /// before (or not newer, when `strict`). Records `t` otherwise.
    fn accept(
        &mut self,
        initiator: PeerIdentity,
        t: Timestamp,
        strict: bool,
        oldest: Timestamp,
    ) -> bool {
        if t < oldest {
            return false;
        }
        let last = self.initiators.entry(initiator).or_insert(Timestamp::ZERO);
        if t < *last || (strict && t == *last) {
            return false;
        }
        *last = t;
        true
    }

    /// Forget initiators whose newest learn is before `oldest`.
    fn prune(&mut self, oldest: Timestamp) {
        self.initiators.retain(|_, t| *t >= oldest);
    }
}

/// How many neighbours to forward a learn to after `hops_taken` hops.
///
/// `target_total` is discounted geometrically by distance and scaled by the
/// squared share of neighbours still eligible; a fractional result rounds up
/// with probability equal to its fraction.
pub fn fork_degree(
    hops_taken: usize,
    neighbours: usize,
    eligible: usize,
    target_total: f64,
    rng: &mut dyn RngCore,
) -> usize {
    if neighbours == 0 || hops_taken >= 64 {
        return 0;
    }
    let ratio = eligible as f64 / neighbours as f64;
    let boost = ratio * ratio;
    let mut total = target_total;
    for i in 1..hops_taken {
        total -= total * boost / (1u64 << i) as f64;
    }
    let rnd = total * boost / (1u64 << hops_taken) as f64;
    if rnd <= 0.0 {
        return 0;
    }
    let degree = rnd.floor();
    let left = rnd - degree;
    let mut degree = degree as usize;
    if rng.gen_bool(left.clamp(0.0, 1.0)) {
        degree += 1;
    }
    degree
}

/// Whether hop `j` (1-based, counted back from us) was marked bidirectional.
fn hop_is_bidirectional(bits: u32, j: usize) -> bool {
    u32::try_from(j.saturating_sub(1))
        .ok()
        .and_then(|shift| bits.checked_shr(shift))
        .is_some_and(|b| b & 1 == 1)
}

fn bit_mask(n: usize) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

impl TransportCore {
    pub(crate) fn schedule_dv_learn(&mut self, delay: Duration) {
        if let Some(h) = self.dv_learn_timer.take() {
            self.timers.cancel(h);
        }
        let at = self.now().saturating_add(delay);
        self.dv_learn_timer = Some(self.timers.schedule(at, TimerEvent::DvLearn));
    }

    /// Start a DV-learn campaign now instead of waiting for the timer.
    pub fn initiate_dv_learn(&mut self) -> Vec<crate::core::Action> {
        self.start_dv_learn();
        self.finish()
    }

    pub(crate) fn start_dv_learn(&mut self) {
        let now = self.now();
        let delay = scheduler::randomize(self.config.dv_learn_base_frequency, &mut self.rng);
        self.schedule_dv_learn(delay);
        self.dv_learns
            .prune(now.saturating_sub_duration(self.config.dv_learn_max_age));
        if self.neighbours.is_empty() {
            return;
        }
        let threshold = self.config.dv_quality_rtt_threshold;
        let quality = self
            .neighbours
            .values()
            .filter(|n| {
                n.queues
                    .iter()
                    .filter_map(|q| self.queues.get(q))
                    .any(|q| q.pd.rtt().is_some_and(|rtt| rtt < threshold))
            })
            .count();
        if quality >= self.config.dv_learn_quality_threshold {
            trace!(quality, "enough quality neighbours, no dv learn");
            return;
        }
        let mut nonce = [0u8; 32];
        self.rng.fill_bytes(&mut nonce);
        let challenge = ChallengeNonce(nonce);
        let monotonic_time = self.monotonic.next(now);
        let init_sig = self.keypair.sign(
            SignaturePurpose::DvLearnInitiator,
            &protocol::dv_learn_init_bytes(monotonic_time, &challenge),
        );
        self.dv_learns
            .insert(challenge, now, self.config.max_dv_learn_pending);
        let mut peers: Vec<PeerIdentity> = self.neighbours.keys().copied().collect();
        peers.sort();
        let Some(first) = peers.choose(&mut self.rng).copied() else {
            return;
        };
        let msg = Message::DvLearn(DvLearn {
            num_hops: 0,
            bidirectional: 0,
            non_network_delay_us: 0,
            monotonic_time,
            init_sig,
            initiator: self.me,
            challenge,
            hops: Vec::new(),
        });
        let Ok(frame) = wire::encode_frame(&msg) else {
            return;
        };
        debug!(peer = %first, "dv learn campaign started");
        self.stats.incr(stats::DV_LEARN_INITIATED);
        self.send_direct(first, frame);
    }

    /// Add or refresh a path. `path` is `[next hop, intermediates.., target]`.
    pub(crate) fn learn_path(
        &mut self,
        path: &[PeerIdentity],
        latency: Option<Duration>,
        path_valid_until: Timestamp,
    ) -> LearnResult {
        let [next_hop, mid @ .., target] = path else {
            return LearnResult::Invalid;
        };
        let (next_hop, target) = (*next_hop, *target);
        if !self.neighbours.contains_key(&next_hop)
            || target == self.me
            || self.neighbours.contains_key(&target)
        {
            return LearnResult::Invalid;
        }
        let mut seen = HashSet::from([next_hop, target]);
        for p in mid {
            if *p == self.me || self.neighbours.contains_key(p) || !seen.insert(*p) {
                return LearnResult::Invalid;
            }
        }
        let now = self.now();
        let timeout = now.saturating_add(self.config.dv_path_validity_timeout);
        let existing = self.dvs.get(&target).map(|dv| dv.hops.clone()).unwrap_or_default();
        let mut shorter = 0;
        for hid in &existing {
            let Some(h) = self.hops.get_mut(hid) else {
                continue;
            };
            if h.next_hop == next_hop && h.path == mid {
                let was_valid = h.path_valid_until > now;
                h.timeout = h.timeout.max(timeout);
                h.path_valid_until = h.path_valid_until.max(path_valid_until);
                if let Some(l) = latency {
                    h.pd.update_rtt(l);
                }
                let now_valid = h.path_valid_until > now;
                let old = h.expiry_timer.take();
                if let Some(t) = old {
                    self.timers.cancel(t);
                }
                let t = self.timers.schedule(timeout, TimerEvent::HopExpiry(*hid));
                if let Some(h) = self.hops.get_mut(hid) {
                    h.expiry_timer = Some(t);
                }
                if now_valid {
                    self.ensure_link(target);
                    if !was_valid {
                        self.check_link_transmission(target);
                    }
                }
                return LearnResult::Refreshed;
            }
            if h.distance() < mid.len() {
                shorter += 1;
            }
        }
        let max = self.config.max_dv_paths_to_target;
        if shorter >= max {
            return LearnResult::NotUseful;
        }
        if existing.len() >= max {
            let longest = existing
                .iter()
                .filter_map(|h| self.hops.get(h))
                .max_by_key(|h| h.distance())
                .map(|h| h.id);
            if let Some(h) = longest {
                self.free_dv_hop(h);
            }
        }
        let id = HopId(self.ids.next());
        let mut pd = PerformanceData::default();
        if let Some(l) = latency {
            pd.update_rtt(l);
        }
        let expiry = self.timers.schedule(timeout, TimerEvent::HopExpiry(id));
        self.hops.insert(
            id,
            DistanceVectorHop {
                id,
                target,
                next_hop,
                path: mid.to_vec(),
                timeout,
                path_valid_until,
                pd,
                pending_acks: Vec::new(),
                expiry_timer: Some(expiry),
            },
        );
        self.dvs
            .entry(target)
            .or_insert_with(|| DistanceVector {
                target,
                hops: Vec::new(),
                ephemeral: None,
            })
            .hops
            .push(id);
        if let Some(n) = self.neighbours.get_mut(&next_hop) {
            n.dv_hops.push(id);
        }
        debug!(
            %target,
            via = %next_hop,
            distance = mid.len(),
            confirmed = path_valid_until > now,
            "dv path learned"
        );
        self.stats.incr(stats::DV_PATHS_LEARNED);
        if path_valid_until > now {
            self.ensure_link(target);
            self.check_link_transmission(target);
        }
        LearnResult::Learned
    }

    /// Unlink and drop a hop. Returns its target.
    pub(crate) fn free_dv_hop(&mut self, id: HopId) -> Option<PeerIdentity> {
        let hop = self.hops.remove(&id)?;
        for u in &hop.pending_acks {
            if let Some(pa) = self.pending_acks.get_mut(u) {
                pa.hop = None;
            }
        }
        if let Some(n) = self.neighbours.get_mut(&hop.next_hop) {
            n.dv_hops.retain(|h| *h != id);
        }
        let empty = match self.dvs.get_mut(&hop.target) {
            Some(dv) => {
                dv.hops.retain(|h| *h != id);
                dv.hops.is_empty()
            }
            None => false,
        };
        if empty {
            self.dvs.remove(&hop.target);
        }
        if let Some(t) = hop.expiry_timer {
            self.timers.cancel(t);
        }
        Some(hop.target)
    }

    pub(crate) fn expire_dv_hop(&mut self, id: HopId) {
        let now = self.now();
        let Some(h) = self.hops.get_mut(&id) else {
            return;
        };
        h.expiry_timer = None;
        if h.timeout > now {
            let t = self.timers.schedule(h.timeout, TimerEvent::HopExpiry(id));
            h.expiry_timer = Some(t);
            return;
        }
        trace!(target = %h.target, "dv path timed out");
        if let Some(target) = self.free_dv_hop(id) {
            self.check_link_down(target);
        }
    }

    pub(crate) fn handle_dv_learn(&mut self, inb: &mut Inbound, dvl: DvLearn) {
        let sender = inb.sender;
        let n = dvl.hops.len();
        if dvl.num_hops as usize != n || n > self.config.max_dv_hops_allowed as usize {
            self.stats.incr(stats::MALFORMED);
            return;
        }
        let my_pos = dvl.hops.iter().position(|h| h.hop == self.me);
        let echo = dvl.initiator == self.me || my_pos.is_some();
        if echo {
            let after = my_pos.map_or(0, |p| p + 1);
            if !dvl.hops[after..].iter().any(|h| h.hop == sender) {
                self.stats.incr(stats::MALFORMED);
                return;
            }
        } else {
            let expected = dvl.hops.last().map_or(dvl.initiator, |h| h.hop);
            if sender != expected {
                self.stats.incr(stats::MALFORMED);
                return;
            }
            let mut seen = HashSet::from([dvl.initiator]);
            if !dvl.hops.iter().all(|h| seen.insert(h.hop)) {
                self.stats.incr(stats::DV_LEARN_LOOP);
                return;
            }
        }
        if !self.verify_dv_learn(&dvl, echo) {
            debug!(initiator = %dvl.initiator, %sender, "dv learn with bad signature");
            self.stats.incr(stats::DV_LEARN_BAD_SIG);
            return;
        }
        match (dvl.initiator == self.me, my_pos) {
            (true, _) => self.dv_learn_echo_at_initiator(dvl),
            (false, Some(pos)) => self.dv_learn_echo_at_intermediate(dvl, pos),
            (false, None) => self.dv_learn_flood(sender, dvl),
        }
    }

    fn verify_dv_learn(&self, dvl: &DvLearn, echo: bool) -> bool {
        let init = protocol::dv_learn_init_bytes(dvl.monotonic_time, &dvl.challenge);
        if !identity::verify(&dvl.initiator, SignaturePurpose::DvLearnInitiator, &init, &dvl.init_sig) {
            return false;
        }
        dvl.hops.iter().enumerate().all(|(i, entry)| {
            let pred = if i == 0 { dvl.initiator } else { dvl.hops[i - 1].hop };
            let succ = match dvl.hops.get(i + 1) {
                Some(next) => next.hop,
                None if echo => dvl.initiator,
                None => self.me,
            };
            identity::verify(
                &entry.hop,
                SignaturePurpose::DvLearnHop,
                &protocol::dv_learn_hop_bytes(&pred, &succ, &dvl.challenge),
                &entry.hop_sig,
            )
        })
    }

    fn dv_learn_flood(&mut self, sender: PeerIdentity, dvl: DvLearn) {
        let now = self.now();
        let n = dvl.hops.len();
        let oldest = now.saturating_sub_duration(self.config.dv_learn_max_age);
        let fresh = if n == 0 {
            match self.neighbours.get_mut(&sender) {
                Some(nb) if dvl.monotonic_time > nb.dv_monotime => {
                    nb.dv_monotime = dvl.monotonic_time;
                    true
                }
                Some(_) => false,
                None => self.dv_learns.accept(sender, dvl.monotonic_time, true, oldest),
            }
        } else {
            self.dv_learns
                .accept(dvl.initiator, dvl.monotonic_time, false, oldest)
        };
        if !fresh {
            trace!(initiator = %dvl.initiator, "replayed dv learn");
            self.stats.incr(stats::DV_LEARN_REPLAY);
            return;
        }
        if n == 0 && self.neighbours.contains_key(&sender) {
            self.store_monotime(sender, peerstore::KEY_DV_LEARN_MONOTIME, dvl.monotonic_time);
        }

        let bi_hop = self.neighbours.contains_key(&sender);
        let bits = u32::from(dvl.bidirectional);
        let mut do_fwd = true;
        if bi_hop {
            let back: Vec<PeerIdentity> = dvl
                .hops
                .iter()
                .rev()
                .map(|h| h.hop)
                .chain(std::iter::once(dvl.initiator))
                .collect();
            for j in 1..=n {
                if !hop_is_bidirectional(bits, j) {
                    break;
                }
                match self.learn_path(&back[..=j], None, Timestamp::ZERO) {
                    LearnResult::Invalid => {
                        do_fwd = false;
                        break;
                    }
                    LearnResult::NotUseful => {
                        if j == n {
                            do_fwd = false;
                        }
                        break;
                    }
                    LearnResult::Learned | LearnResult::Refreshed => {}
                }
            }
        }

        let min_len = self.config.min_dv_path_length_for_initiator;
        if (do_fwd || n < min_len) && n + 1 < self.config.max_dv_hops_allowed as usize {
            self.forward_dv_learn(sender, &dvl, bi_hop, now);
        }

        if n >= 1 && bi_hop && bits & bit_mask(n) == bit_mask(n) {
            self.echo_dv_learn(dvl);
        }
    }

    fn forward_dv_learn(&mut self, sender: PeerIdentity, dvl: &DvLearn, bi_hop: bool, now: Timestamp) {
        let mut on_path: HashSet<PeerIdentity> = dvl.hops.iter().map(|h| h.hop).collect();
        on_path.insert(dvl.initiator);
        on_path.insert(sender);
        let mut eligible: Vec<PeerIdentity> = self
            .neighbours
            .keys()
            .filter(|p| !on_path.contains(p))
            .copied()
            .collect();
        if eligible.is_empty() {
            return;
        }
        eligible.sort();
        let fork = fork_degree(
            dvl.hops.len(),
            self.neighbours.len(),
            eligible.len(),
            self.config.dv_fork_target_total,
            &mut self.rng,
        )
        .min(self.config.max_dv_discovery_selection);
        let chosen: Vec<PeerIdentity> = eligible
            .choose_multiple(&mut self.rng, fork)
            .copied()
            .collect();
        let pred = dvl.hops.last().map_or(dvl.initiator, |h| h.hop);
        let processing = self.now().saturating_since(now);
        let mask = bit_mask(self.config.max_dv_hops_allowed as usize) as u16;
        for next in chosen {
            let hop_sig = self.keypair.sign(
                SignaturePurpose::DvLearnHop,
                &protocol::dv_learn_hop_bytes(&pred, &next, &dvl.challenge),
            );
            let mut fwd = dvl.clone();
            fwd.hops.push(DvPathEntry { hop: self.me, hop_sig });
            fwd.num_hops += 1;
            fwd.bidirectional = ((dvl.bidirectional << 1) | u16::from(bi_hop)) & mask;
            fwd.non_network_delay_us = dvl
                .non_network_delay_us
                .saturating_add(crate::time::duration_micros(processing));
            let Ok(frame) = wire::encode_frame(&Message::DvLearn(fwd)) else {
                continue;
            };
            trace!(to = %next, hops = dvl.hops.len() + 1, "forwarding dv learn");
            self.stats.incr(stats::DV_LEARN_FORWARDED);
            self.send_direct(next, frame);
        }
    }

    /// Append ourselves and send the learn back towards its initiator.
    fn echo_dv_learn(&mut self, mut dvl: DvLearn) {
        let pred = dvl.hops.last().map_or(dvl.initiator, |h| h.hop);
        let hop_sig = self.keypair.sign(
            SignaturePurpose::DvLearnHop,
            &protocol::dv_learn_hop_bytes(&pred, &dvl.initiator, &dvl.challenge),
        );
        let back: Vec<PeerIdentity> = std::iter::once(dvl.initiator)
            .chain(dvl.hops.iter().map(|h| h.hop))
            .collect();
        let Some(next) = back.into_iter().find(|p| self.neighbours.contains_key(p)) else {
            return;
        };
        dvl.hops.push(DvPathEntry { hop: self.me, hop_sig });
        dvl.num_hops += 1;
        dvl.bidirectional = (dvl.bidirectional << 1) | 1;
        let Ok(frame) = wire::encode_frame(&Message::DvLearn(dvl)) else {
            return;
        };
        debug!(to = %next, "echoing dv learn");
        self.stats.incr(stats::DV_LEARN_ECHOED);
        self.send_direct(next, frame);
    }

    fn dv_learn_echo_at_intermediate(&mut self, dvl: DvLearn, pos: usize) {
        let hops: Vec<PeerIdentity> = dvl.hops.iter().map(|h| h.hop).collect();
        for k in pos + 2..hops.len() {
            if self.learn_path(&hops[pos + 1..=k], None, Timestamp::ZERO) == LearnResult::Invalid {
                break;
            }
        }
        let back: Vec<PeerIdentity> = std::iter::once(dvl.initiator)
            .chain(hops[..pos].iter().copied())
            .collect();
        let Some(next) = back.into_iter().find(|p| self.neighbours.contains_key(p)) else {
            trace!(initiator = %dvl.initiator, "no way back for dv learn echo");
            return;
        };
        let Ok(frame) = wire::encode_frame(&Message::DvLearn(dvl)) else {
            return;
        };
        self.send_direct(next, frame);
    }

    fn dv_learn_echo_at_initiator(&mut self, dvl: DvLearn) {
        let now = self.now();
        let Some(launched) = self.dv_learns.launched_at(&dvl.challenge) else {
            self.stats.incr(stats::DV_LEARN_UNKNOWN_CAMPAIGN);
            return;
        };
        let n = dvl.hops.len();
        let round_trip = now.saturating_since(launched);
        let nnd = Duration::from_micros(dvl.non_network_delay_us);
        let per_hop = round_trip.saturating_sub(nnd) / (2 * n.max(1) as u32);
        let valid_until = now.saturating_add(self.config.address_validation_lifetime);
        let hops: Vec<PeerIdentity> = dvl.hops.iter().map(|h| h.hop).collect();
        for i in 1..n {
            let latency = per_hop * 2 * (i as u32 + 1);
            if self.learn_path(&hops[..=i], Some(latency), valid_until) == LearnResult::Invalid {
                break;
            }
        }
    }
}
