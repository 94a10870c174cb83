//! Waypath transport core.
//! Host-driven: no I/O; host passes events and receives actions.
//!
//! Communicators (UDP, TCP, ...) hand the core queues to neighbours and
//! inbound frames; the core turns them into virtual links to any reachable
//! peer, direct or over distance-vector paths, with fragmentation,
//! acknowledgements and address validation on the way.

pub mod identity;
pub mod protocol;
pub mod wire;

pub mod config;
pub mod ids;
pub mod peerstore;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod time;
pub mod timer;

mod address;
mod backchannel;
pub mod core;
pub mod dv;
mod link;
pub mod monitor;
mod pending;
mod reassembly;
mod transmit;
mod validation;

pub use crate::core::{Action, PathInfo, TransportCore};
pub use config::TransportConfig;
pub use identity::{Keypair, PeerIdentity};
pub use ids::{AddressId, CommunicatorId, MonitorId, RequestId};
pub use monitor::QueueSnapshot;
pub use peerstore::{MemoryPeerStore, PeerStore, StoreMode};
pub use protocol::Message;
pub use queue::{Characteristics, ConnectionStatus, NetworkType};
pub use stats::Statistics;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
