//! Transport tunables. Every field has a default; hosts deserialize a partial
//! table (durations in milliseconds) and override what they need.

use std::time::Duration;

use serde::Deserialize;

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms: u64 = Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod dv_hops {
    use serde::de::{Error, Unexpected};
    use serde::{Deserialize, Deserializer};
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
        let n: u16 = Deserialize::deserialize(d)?;
        if n > super::MAX_DV_HOPS {
            return Err(D::Error::invalid_value(
                Unexpected::Unsigned(n.into()),
                &"at most 16 hops",
            ));
        }
        Ok(n)
    }
}

/// Learn messages record per-hop direction in a 16-bit field.
pub const MAX_DV_HOPS: u16 = 16;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Max in-flight transmissions per queue.
    pub queue_length_limit: u32,
    /// Max in-flight transmissions across all queues of one communicator.
    pub communicator_total_queue_limit: u32,
    /// Initial upper-layer receive window per virtual link.
    pub recv_window_size: i32,
    /// Inbound deliveries held per link while the receive window is closed.
    pub core_backlog_limit: usize,
    /// Control frames waiting per queue while it is full.
    pub control_backlog_limit: usize,

    /// Capped at [`MAX_DV_HOPS`].
    #[serde(with = "dv_hops")]
    pub max_dv_hops_allowed: u16,
    pub max_dv_paths_to_target: usize,
    pub max_dv_learn_pending: usize,
    pub max_dv_discovery_selection: usize,
    /// Peers a DV-learn flood aims to reach.
    pub dv_fork_target_total: f64,
    /// Shorter paths keep being flooded even when we learned nothing from them.
    pub min_dv_path_length_for_initiator: usize,
    /// Stop initiating DV learns once this many neighbours are of good quality.
    pub dv_learn_quality_threshold: usize,
    #[serde(with = "duration_ms")]
    pub dv_learn_base_frequency: Duration,
    /// Neighbours with a lower RTT count as good quality.
    #[serde(with = "duration_ms")]
    pub dv_quality_rtt_threshold: Duration,
    /// Lifetime of a learned DV path that is not rediscovered.
    #[serde(with = "duration_ms")]
    pub dv_path_validity_timeout: Duration,
    /// Learns stamped longer ago than this by their initiator are dropped.
    #[serde(with = "duration_ms")]
    pub dv_learn_max_age: Duration,

    #[serde(with = "duration_ms")]
    pub ephemeral_validity: Duration,
    #[serde(with = "duration_ms")]
    pub backchannel_inactivity_timeout: Duration,

    /// Largest encoded message we fragment or reassemble.
    pub max_message_size: usize,
    /// Reassembly buffers kept per sender; the oldest gives way.
    pub max_reassembly_per_peer: usize,
    #[serde(with = "duration_ms")]
    pub reassembly_expiration: Duration,
    pub max_cumulative_acks: usize,
    #[serde(with = "duration_ms")]
    pub max_cumulative_ack_delay: Duration,

    #[serde(with = "duration_ms")]
    pub address_validation_lifetime: Duration,
    #[serde(with = "duration_ms")]
    pub max_address_valid_until: Duration,
    #[serde(with = "duration_ms")]
    pub fast_validation_challenge_freq: Duration,
    #[serde(with = "duration_ms")]
    pub max_validation_challenge_freq: Duration,
    pub validation_rtt_buffer_factor: u32,

    /// A leaf is retransmitted after this many RTTs without an ack.
    pub retransmit_rtt_factor: u32,
    #[serde(with = "duration_ms")]
    pub default_rtt: Duration,

    /// Retry delay after the peer store rejects an own address.
    #[serde(with = "duration_ms")]
    pub address_refresh_retry: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_length_limit: 32,
            communicator_total_queue_limit: 512,
            recv_window_size: 4,
            core_backlog_limit: 64,
            control_backlog_limit: 32,
            max_dv_hops_allowed: 16,
            max_dv_paths_to_target: 3,
            max_dv_learn_pending: 64,
            max_dv_discovery_selection: 16,
            dv_fork_target_total: 50.0,
            min_dv_path_length_for_initiator: 3,
            dv_learn_quality_threshold: 100,
            dv_learn_base_frequency: MINUTE,
            dv_quality_rtt_threshold: Duration::from_secs(1),
            dv_path_validity_timeout: 5 * MINUTE,
            dv_learn_max_age: HOUR,
            ephemeral_validity: 4 * HOUR,
            backchannel_inactivity_timeout: 5 * MINUTE,
            max_message_size: 64 * 1024,
            max_reassembly_per_peer: 16,
            reassembly_expiration: 4 * MINUTE,
            max_cumulative_acks: 64,
            max_cumulative_ack_delay: Duration::from_secs(1),
            address_validation_lifetime: 4 * HOUR,
            max_address_valid_until: 30 * DAY,
            fast_validation_challenge_freq: MINUTE,
            max_validation_challenge_freq: DAY,
            validation_rtt_buffer_factor: 3,
            retransmit_rtt_factor: 4,
            default_rtt: Duration::from_secs(1),
            address_refresh_retry: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = TransportConfig::default();
        assert_eq!(c.queue_length_limit, 32);
        assert_eq!(c.max_dv_hops_allowed, 16);
        assert_eq!(c.ephemeral_validity, Duration::from_secs(4 * 3600));
    }
}
