//! Wire protocol: message bodies exchanged between transport cores.
//!
//! Every frame carries a common header {total size, type} (see the wire
//! module) followed by the bincode body of one of the structs below. Boxes
//! that wrap another message (fragments, reliability boxes, backchannel
//! encapsulations, DV payloads) carry the inner message as a complete
//! encoded frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{PeerIdentity, Signature};
use crate::time::Timestamp;

/// Random nonce used for DV-learn campaigns and address validation challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeNonce(pub [u8; 32]);

/// All wire message types.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CoreData(CoreData),
    DvLearn(DvLearn),
    DvBox(DvBox),
    Fragment(FragmentBox),
    ReliabilityBox(ReliabilityBox),
    ReliabilityAck(ReliabilityAck),
    Backchannel(BackchannelEncapsulation),
    ValidationChallenge(ValidationChallenge),
    ValidationResponse(ValidationResponse),
}

/// Payload from the upper layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreData {
    pub payload: Vec<u8>,
}

/// One hop of a DV-learn path: the hop and its signature over
/// (predecessor, successor, challenge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvPathEntry {
    pub hop: PeerIdentity,
    pub hop_sig: Signature,
}

/// Path discovery flood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvLearn {
    /// Must equal `hops.len()`.
    pub num_hops: u16,
    /// Bit `i` set: the link `i` hops back from the latest sender is bidirectional.
    pub bidirectional: u16,
    /// Processing delay accumulated at the hops, in microseconds.
    pub non_network_delay_us: u64,
    pub monotonic_time: Timestamp,
    pub init_sig: Signature,
    pub initiator: PeerIdentity,
    pub challenge: ChallengeNonce,
    pub hops: Vec<DvPathEntry>,
}

/// Encrypted envelope routed along a DV path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvBox {
    /// Hops taken so far, including skipped ones.
    pub total_hops: u16,
    /// Must equal `hops.len()`; zero at the target.
    pub num_hops: u16,
    pub ephemeral_key: [u8; 32],
    pub iv: [u8; 16],
    pub hmac: [u8; 32],
    /// Peers still to traverse, the target last.
    pub hops: Vec<PeerIdentity>,
    pub ciphertext: Vec<u8>,
}

/// Plaintext of a [`DvBox`], visible to the target only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxedPayload {
    pub sender: PeerIdentity,
    /// Sender's signature over (target, ephemeral key, ephemeral validity).
    pub ephemeral_sig: Signature,
    pub ephemeral_validity: Timestamp,
    /// Strictly increasing per sender; blocks replay.
    pub monotonic_time: Timestamp,
    pub inner: Vec<u8>,
}

/// A byte range of a larger frame. Offsets are absolute within the root frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentBox {
    pub ack_uuid: Uuid,
    pub msg_uuid: Uuid,
    pub frag_off: u32,
    pub msg_size: u32,
    pub payload: Vec<u8>,
}

/// A whole frame that must be acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBox {
    /// Further messages the sender is about to send; zero asks for an immediate ack.
    pub ack_countdown: u32,
    pub ack_uuid: Uuid,
    pub inner: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEntry {
    pub ack_uuid: Uuid,
    /// Time the receiver held the ack before sending it, in microseconds.
    pub ack_delay_us: u64,
}

/// Cumulative acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityAck {
    pub ack_counter: u32,
    pub acks: Vec<AckEntry>,
}

/// Communicator-to-communicator message tunnelled through the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackchannelEncapsulation {
    pub inner: Vec<u8>,
    /// Name of the communicator that should receive `inner` at the target.
    pub communicator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationChallenge {
    pub challenge: ChallengeNonce,
    pub sender_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub challenge: ChallengeNonce,
    /// `sender_time` of the challenge being answered.
    pub origin_time: Timestamp,
    /// How long the responder expects the address to stay valid, in microseconds.
    pub validity_duration_us: u64,
    /// Signature over (validity duration, challenge).
    pub signature: Signature,
}

/// Signed announcement of one of our own addresses, stored in the peer store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedAddress {
    pub address: String,
    pub network_type: crate::queue::NetworkType,
    pub expiration: Timestamp,
    pub signature: Signature,
}

impl SignedAddress {
    /// Bytes covered by `signature`.
    pub fn signed_bytes(
        address: &str,
        network_type: crate::queue::NetworkType,
        expiration: Timestamp,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(address.len() + 9);
        out.extend_from_slice(address.as_bytes());
        out.push(network_type as u8);
        out.extend_from_slice(&expiration.as_micros().to_le_bytes());
        out
    }
}

/// Bytes covered by a DV-learn initiator signature.
pub fn dv_learn_init_bytes(monotonic_time: Timestamp, challenge: &ChallengeNonce) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(&monotonic_time.as_micros().to_le_bytes());
    out.extend_from_slice(&challenge.0);
    out
}

/// Bytes covered by a DV-learn hop signature.
pub fn dv_learn_hop_bytes(
    pred: &PeerIdentity,
    succ: &PeerIdentity,
    challenge: &ChallengeNonce,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(pred.as_bytes());
    out.extend_from_slice(succ.as_bytes());
    out.extend_from_slice(&challenge.0);
    out
}

/// Bytes covered by an ephemeral key confirmation.
pub fn ephemeral_confirmation_bytes(
    target: &PeerIdentity,
    ephemeral_key: &[u8; 32],
    validity: Timestamp,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(72);
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(ephemeral_key);
    out.extend_from_slice(&validity.as_micros().to_le_bytes());
    out
}

/// Bytes covered by an address validation response signature.
pub fn validation_bytes(validity_duration_us: u64, challenge: &ChallengeNonce) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(&validity_duration_us.to_le_bytes());
    out.extend_from_slice(&challenge.0);
    out
}
