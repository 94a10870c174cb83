//! Receiver side of fragmentation: per-message reassembly buffers and
//! per-peer cumulative acknowledgements.

use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::{Inbound, TimerEvent, TransportCore};
use crate::identity::PeerIdentity;
use crate::protocol::{AckEntry, FragmentBox, Message, ReliabilityAck, ReliabilityBox};
use crate::scheduler::RouteOptions;
use crate::stats;
use crate::time::{duration_micros, Timestamp};
use crate::timer::TimerHandle;
use crate::wire;

/// Entries per ack frame; keeps a DV-boxed ack under common MTUs.
const ACKS_PER_FRAME: usize = 24;

/// Result of feeding one fragment into a context.
#[derive(Debug, PartialEq)]
pub enum FragmentOutcome {
    /// Every byte was already present; ack at once.
    Duplicate,
    /// New bytes copied; ack after `ack_delay`.
    Progress { ack_delay: Duration },
    /// Last missing bytes arrived.
    Complete(Vec<u8>),
    /// Offset or size inconsistent with the context.
    BadRange,
}

pub struct ReassemblyContext {
    pub msg_size: usize,
    buffer: Vec<u8>,
    bitfield: Vec<u8>,
    missing: usize,
    first_frag: Timestamp,
    last_frag: Timestamp,
    num_frags: u32,
    /// Delivered already; kept only to ack late duplicates.
    pub completed: bool,
    pub expiry_timer: Option<TimerHandle>,
}

impl ReassemblyContext {
    pub fn new(msg_size: usize, now: Timestamp) -> Self {
        Self {
            msg_size,
            buffer: vec![0u8; msg_size],
            bitfield: vec![0u8; msg_size.div_ceil(8)],
            missing: msg_size,
            first_frag: now,
            last_frag: now,
            num_frags: 0,
            completed: false,
            expiry_timer: None,
        }
    }

    fn has(&self, i: usize) -> bool {
        self.bitfield[i / 8] & (1 << (i % 8)) != 0
    }

    fn set(&mut self, i: usize) {
        self.bitfield[i / 8] |= 1 << (i % 8);
    }

    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn add(
        &mut self,
        offset: usize,
        payload: &[u8],
        msg_size: usize,
        now: Timestamp,
        max_delay: Duration,
    ) -> FragmentOutcome {
        if msg_size != self.msg_size
            || payload.is_empty()
            || offset.checked_add(payload.len()).map_or(true, |end| end > msg_size)
        {
            return FragmentOutcome::BadRange;
        }
        if self.completed {
            return FragmentOutcome::Duplicate;
        }
        let mut fresh = 0usize;
        for (i, b) in payload.iter().enumerate() {
            let pos = offset + i;
            if !self.has(pos) {
                self.buffer[pos] = *b;
                self.set(pos);
                fresh += 1;
            }
        }
        if fresh == 0 {
            return FragmentOutcome::Duplicate;
        }
        self.missing -= fresh;
        self.num_frags += 1;
        self.last_frag = now;
        if self.missing == 0 {
            self.completed = true;
            self.bitfield = Vec::new();
            return FragmentOutcome::Complete(std::mem::take(&mut self.buffer));
        }
        let avg = self.last_frag.saturating_since(self.first_frag) / self.num_frags;
        let scaled = avg.as_secs_f64() * self.missing as f64 / payload.len() as f64;
        let ack_delay = Duration::from_secs_f64(scaled.min(max_delay.as_secs_f64()));
        FragmentOutcome::Progress { ack_delay }
    }
}

/// Acks waiting to be sent to one peer.
#[derive(Default)]
pub struct AckCumulator {
    acks: Vec<(Uuid, Timestamp)>,
    /// When the pending acks must leave at the latest.
    pub deadline: Timestamp,
    counter: u32,
    pub timer: Option<TimerHandle>,
}

impl AckCumulator {
    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn push(&mut self, ack_uuid: Uuid, now: Timestamp, deadline: Timestamp) {
        if self.acks.is_empty() || deadline < self.deadline {
            self.deadline = deadline;
        }
        self.acks.push((ack_uuid, now));
    }

    /// Build an ack message for up to `max` of the oldest uuids, reporting
    /// how long each was held.
    pub fn take(&mut self, now: Timestamp, max: usize) -> ReliabilityAck {
        self.counter = self.counter.wrapping_add(1);
        let n = max.min(self.acks.len());
        let acks = self
            .acks
            .drain(..n)
            .map(|(ack_uuid, received)| AckEntry {
                ack_uuid,
                ack_delay_us: duration_micros(now.saturating_since(received)),
            })
            .collect();
        ReliabilityAck {
            ack_counter: self.counter,
            acks,
        }
    }
}

impl TransportCore {
    pub(crate) fn handle_fragment(&mut self, inb: &mut Inbound, f: FragmentBox) {
        let now = self.now();
        self.stats.incr(stats::FRAGMENTS_RECEIVED);
        let msg_size = f.msg_size as usize;
        if msg_size == 0 {
            self.stats.incr(stats::FRAGMENTS_BAD_RANGE);
            return;
        }
        if msg_size > self.config.max_message_size {
            debug!(sender = %inb.sender, size = msg_size, "fragmented message too large");
            self.stats.incr(stats::FRAGMENTS_TOO_LARGE);
            return;
        }
        let key = (inb.sender, f.msg_uuid);
        if !self.reassembly.contains_key(&key) {
            self.make_room_for_reassembly(inb.sender);
            let mut rc = ReassemblyContext::new(msg_size, now);
            let expiry = now.saturating_add(self.config.reassembly_expiration);
            rc.expiry_timer = Some(
                self.timers
                    .schedule(expiry, TimerEvent::ReassemblyExpiry(inb.sender, f.msg_uuid)),
            );
            self.reassembly.insert(key, rc);
        }
        let max_delay = self.config.max_cumulative_ack_delay;
        let Some(rc) = self.reassembly.get_mut(&key) else {
            return;
        };
        match rc.add(f.frag_off as usize, &f.payload, msg_size, now, max_delay) {
            FragmentOutcome::BadRange => {
                debug!(
                    sender = %inb.sender,
                    off = f.frag_off,
                    size = f.msg_size,
                    "fragment out of range"
                );
                self.stats.incr(stats::FRAGMENTS_BAD_RANGE);
            }
            FragmentOutcome::Duplicate => {
                self.stats.incr(stats::FRAGMENTS_DUPLICATE);
                self.queue_ack(inb.sender, f.ack_uuid, now);
            }
            FragmentOutcome::Progress { ack_delay } => {
                self.queue_ack(inb.sender, f.ack_uuid, now.saturating_add(ack_delay));
            }
            FragmentOutcome::Complete(bytes) => {
                self.queue_ack(inb.sender, f.ack_uuid, now);
                if let Some(msg) = self.decode_inner(&bytes) {
                    self.dispatch(msg, inb);
                }
            }
        }
    }

    pub(crate) fn handle_reliability_box(&mut self, inb: &mut Inbound, rb: ReliabilityBox) {
        if let Some(msg) = self.decode_inner(&rb.inner) {
            self.dispatch(msg, inb);
        }
        let now = self.now();
        let deadline = if rb.ack_countdown == 0 {
            now
        } else {
            now.saturating_add(self.config.max_cumulative_ack_delay / 2)
        };
        self.queue_ack(inb.sender, rb.ack_uuid, deadline);
    }

    /// Remember `ack_uuid` for `peer`; the batch leaves at the earliest deadline
    /// of its entries or when it is full.
    fn queue_ack(&mut self, peer: PeerIdentity, ack_uuid: Uuid, deadline: Timestamp) {
        if ack_uuid.is_nil() {
            return;
        }
        let now = self.now();
        let max = self.config.max_cumulative_acks;
        let ac = self.ack_cumulators.entry(peer).or_default();
        ac.push(ack_uuid, now, deadline);
        if ac.len() >= max || ac.deadline <= now {
            self.flush_acks(peer);
            return;
        }
        let at = ac.deadline;
        if let Some(h) = ac.timer.take() {
            self.timers.cancel(h);
        }
        let h = self.timers.schedule(at, TimerEvent::AckFlush(peer));
        if let Some(ac) = self.ack_cumulators.get_mut(&peer) {
            ac.timer = Some(h);
        }
    }

    pub(crate) fn flush_acks(&mut self, peer: PeerIdentity) {
        let now = self.now();
        let Some(ac) = self.ack_cumulators.get_mut(&peer) else {
            return;
        };
        if let Some(h) = ac.timer.take() {
            self.timers.cancel(h);
        }
        let mut frames = Vec::new();
        while !ac.is_empty() {
            frames.push(Message::ReliabilityAck(ac.take(now, ACKS_PER_FRAME)));
        }
        for msg in frames {
            match wire::encode_frame(&msg) {
                Ok(frame) => {
                    self.stats.incr(stats::ACKS_SENT);
                    self.route_control(peer, frame, RouteOptions::ANYTHING_GOES);
                }
                Err(e) => debug!(error = %e, "cannot encode ack"),
            }
        }
    }

    /// Evict the oldest contexts of `sender` until a new one fits.
    fn make_room_for_reassembly(&mut self, sender: PeerIdentity) {
        let max = self.config.max_reassembly_per_peer.max(1);
        loop {
            let mine = self.reassembly.iter().filter(|((p, _), _)| *p == sender);
            if mine.clone().count() < max {
                return;
            }
            let Some(oldest) = mine.min_by_key(|(_, rc)| rc.first_frag).map(|(k, _)| *k) else {
                return;
            };
            if let Some(rc) = self.reassembly.remove(&oldest) {
                if let Some(h) = rc.expiry_timer {
                    self.timers.cancel(h);
                }
                trace!(%sender, missing = rc.missing(), "reassembly evicted");
                self.stats.incr(stats::REASSEMBLY_EVICTED);
            }
        }
    }

    pub(crate) fn expire_reassembly(&mut self, peer: PeerIdentity, msg_uuid: Uuid) {
        if let Some(rc) = self.reassembly.remove(&(peer, msg_uuid)) {
            if !rc.completed {
                debug!(sender = %peer, missing = rc.missing(), "reassembly expired");
                self.stats.incr(stats::REASSEMBLY_EXPIRED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: Duration = Duration::from_secs(1);

    #[test]
    fn reassembles_out_of_order_and_acks_duplicates() {
        let msg: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let t = Timestamp::from_millis(100);
        let mut rc = ReassemblyContext::new(250, t);
        assert!(matches!(
            rc.add(200, &msg[200..], 250, t, MAX),
            FragmentOutcome::Progress { .. }
        ));
        assert_eq!(rc.add(200, &msg[200..], 250, t, MAX), FragmentOutcome::Duplicate);
        assert!(matches!(
            rc.add(0, &msg[..100], 250, t, MAX),
            FragmentOutcome::Progress { .. }
        ));
        assert_eq!(rc.missing(), 100);
        match rc.add(50, &msg[50..200], 250, t, MAX) {
            FragmentOutcome::Complete(bytes) => assert_eq!(bytes, msg),
            other => panic!("expected Complete, got {:?}", other),
        }
        assert_eq!(rc.add(0, &msg[..10], 250, t, MAX), FragmentOutcome::Duplicate);
    }

    #[test]
    fn rejects_inconsistent_ranges() {
        let t = Timestamp::ZERO;
        let mut rc = ReassemblyContext::new(100, t);
        assert_eq!(rc.add(90, &[0u8; 20], 100, t, MAX), FragmentOutcome::BadRange);
        assert_eq!(rc.add(0, &[0u8; 10], 99, t, MAX), FragmentOutcome::BadRange);
        assert_eq!(rc.add(0, &[], 100, t, MAX), FragmentOutcome::BadRange);
    }

    #[test]
    fn ack_delay_shrinks_as_completion_nears() {
        let mut rc = ReassemblyContext::new(1000, Timestamp::from_millis(0));
        let chunk = [0u8; 100];
        let d1 = match rc.add(0, &chunk, 1000, Timestamp::from_millis(10), MAX) {
            FragmentOutcome::Progress { ack_delay } => ack_delay,
            _ => panic!(),
        };
        let mut last = d1;
        for i in 1..9 {
            let t = Timestamp::from_millis(10 * (i + 1));
            match rc.add(i as usize * 100, &chunk, 1000, t, MAX) {
                FragmentOutcome::Progress { ack_delay } => {
                    assert!(ack_delay <= last);
                    last = ack_delay;
                }
                _ => panic!(),
            }
        }
        assert!(last < d1);
    }

    #[test]
    fn ack_delay_is_capped() {
        let mut rc = ReassemblyContext::new(10_000, Timestamp::ZERO);
        match rc.add(0, &[1u8; 10], 10_000, Timestamp::from_millis(60_000), MAX) {
            FragmentOutcome::Progress { ack_delay } => assert_eq!(ack_delay, MAX),
            _ => panic!(),
        }
    }

    #[test]
    fn cumulator_reports_hold_time() {
        let mut ac = AckCumulator::default();
        ac.push(Uuid::from_u128(1), Timestamp::from_millis(10), Timestamp::from_millis(500));
        ac.push(Uuid::from_u128(2), Timestamp::from_millis(20), Timestamp::from_millis(30));
        assert_eq!(ac.deadline, Timestamp::from_millis(30));
        let ack = ac.take(Timestamp::from_millis(40), 10);
        assert_eq!(ack.ack_counter, 1);
        assert_eq!(ack.acks[0].ack_delay_us, 30_000);
        assert_eq!(ack.acks[1].ack_delay_us, 20_000);
        assert!(ac.is_empty());
        assert_eq!(ac.take(Timestamp::from_millis(50), 10).ack_counter, 2);
    }

    #[test]
    fn cumulator_splits_large_batches() {
        let mut ac = AckCumulator::default();
        let t = Timestamp::from_millis(1);
        for i in 0..5u128 {
            ac.push(Uuid::from_u128(i), t, t);
        }
        assert_eq!(ac.take(t, 3).acks.len(), 3);
        assert_eq!(ac.len(), 2);
        let rest = ac.take(t, 3);
        assert_eq!(rest.acks[0].ack_uuid, Uuid::from_u128(3));
        assert!(ac.is_empty());
    }

    proptest! {
        #[test]
        fn any_cut_in_any_order_reassembles(
            msg in prop::collection::vec(any::<u8>(), 1..4000),
            cuts in prop::collection::vec(0usize..4000, 0..40),
            order in prop::collection::vec(any::<usize>(), 0..80),
        ) {
            let n = msg.len();
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % n).chain([0, n]).collect();
            points.sort_unstable();
            points.dedup();
            let mut pieces: Vec<(usize, usize)> = points.windows(2).map(|w| (w[0], w[1])).collect();
            // shuffle, then replay a few pieces as duplicates
            for (i, o) in order.iter().enumerate() {
                let len = pieces.len();
                pieces.swap(i % len, o % len);
            }
            let dups: Vec<(usize, usize)> = pieces.iter().step_by(3).copied().collect();
            let t = Timestamp::from_millis(1);
            let mut rc = ReassemblyContext::new(n, t);
            let mut done = None;
            for (a, b) in pieces.iter().chain(dups.iter()) {
                match rc.add(*a, &msg[*a..*b], n, t, MAX) {
                    FragmentOutcome::Complete(bytes) => {
                        prop_assert!(done.is_none());
                        done = Some(bytes);
                    }
                    FragmentOutcome::BadRange => prop_assert!(false, "bad range"),
                    _ => {}
                }
            }
            prop_assert_eq!(done, Some(msg));
        }
    }
}
