//! Named event counters. Every dropped message is counted here under a
//! stable name; tests and monitors read them back.

use std::collections::BTreeMap;

pub const MALFORMED: &str = "messages dropped: malformed";
pub const ROUTING_FAILED: &str = "messages dropped: no route";
pub const LINK_DOWN_DELIVERY: &str = "core deliveries dropped: virtual link down";
pub const CORE_BACKLOG_FULL: &str = "core deliveries dropped: backlog full";
pub const CONTROL_BACKLOG_FULL: &str = "control messages dropped: queue backlog full";
pub const CONTROL_TOO_BIG: &str = "control messages dropped: larger than mtu";
pub const CORE_SENT: &str = "core messages completed";
pub const CORE_DELIVERED: &str = "core messages delivered";

pub const DV_LEARN_INITIATED: &str = "dv learn campaigns started";
pub const DV_LEARN_BAD_SIG: &str = "dv learn dropped: bad signature";
pub const DV_LEARN_REPLAY: &str = "dv learn dropped: replayed";
pub const DV_LEARN_LOOP: &str = "dv learn dropped: loop";
pub const DV_LEARN_UNKNOWN_CAMPAIGN: &str = "dv learn dropped: unknown challenge";
pub const DV_LEARN_FORWARDED: &str = "dv learn forwarded";
pub const DV_LEARN_ECHOED: &str = "dv learn echoed";
pub const DV_PATHS_LEARNED: &str = "dv paths learned";

pub const DV_BOX_BAD_HMAC: &str = "dv boxes dropped: bad hmac";
pub const DV_BOX_UNDECRYPTABLE: &str = "dv boxes dropped: undecryptable";
pub const DV_BOX_BAD_EPHEMERAL: &str = "dv boxes dropped: bad ephemeral confirmation";
pub const DV_BOX_REPLAY: &str = "dv boxes dropped: replayed";
pub const DV_BOX_CYCLE: &str = "dv boxes dropped: cycle";
pub const DV_BOX_TOO_MANY_HOPS: &str = "dv boxes dropped: too many hops";
pub const DV_BOX_NO_NEXT_HOP: &str = "dv boxes dropped: no next hop";
pub const DV_BOX_FORWARDED: &str = "dv boxes forwarded";
pub const INVALID_NESTING: &str = "messages dropped: invalid nesting";
pub const BACKCHANNEL_NO_COMMUNICATOR: &str = "backchannel dropped: unknown communicator";

pub const FRAGMENTS_RECEIVED: &str = "fragments received";
pub const FRAGMENTS_DUPLICATE: &str = "fragments duplicate";
pub const FRAGMENTS_BAD_RANGE: &str = "fragments dropped: bad range";
pub const FRAGMENTS_TOO_LARGE: &str = "fragments dropped: message too large";
pub const REASSEMBLY_EXPIRED: &str = "reassembly contexts expired";
pub const REASSEMBLY_EVICTED: &str = "reassembly contexts evicted";
pub const ACKS_SENT: &str = "cumulative acks sent";
pub const ACKS_UNKNOWN: &str = "acks dropped: unknown uuid";
pub const RETRANSMISSIONS: &str = "retransmissions";

pub const VALIDATION_CHALLENGES_SENT: &str = "validation challenges sent";
pub const VALIDATION_UNKNOWN: &str = "validation responses dropped: unknown challenge";
pub const VALIDATION_OUT_OF_WINDOW: &str = "validation responses dropped: origin time out of window";
pub const VALIDATION_BAD_SIG: &str = "validation responses dropped: bad signature";
pub const VALIDATIONS_SUCCEEDED: &str = "address validations succeeded";
pub const QUEUE_CREATE_FAILED: &str = "queue creation failed";

pub const HELLO_BAD: &str = "hello records dropped: bad signature or expired";
pub const OWN_ADDRESS_STORE_FAILED: &str = "own address stores failed";

#[derive(Debug, Default, Clone)]
pub struct Statistics {
    counters: BTreeMap<&'static str, u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, n: u64) {
        *self.counters.entry(name).or_insert(0) += n;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.counters.iter().map(|(k, v)| (*k, *v))
    }
}
