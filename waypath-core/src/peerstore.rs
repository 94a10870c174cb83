//! Peer store contract: (subsystem, peer, key) -> blobs with expiry.
//!
//! The core only emits store/fetch/watch actions and consumes results. Hosts
//! answer them from any [`PeerStore`]; [`MemoryPeerStore`] serves tests and
//! embedders without persistence.

use std::collections::HashMap;

use crate::identity::PeerIdentity;
use crate::time::Timestamp;

pub const SUBSYSTEM: &str = "transport";

/// Signed own address (one record per address).
pub const KEY_HELLO: &str = "hello";
/// Address whose validation succeeded.
pub const KEY_VALIDATED_ADDRESS: &str = "validated-address";
/// Newest backchannel monotonic time accepted from a peer.
pub const KEY_BACKCHANNEL_MONOTIME: &str = "backchannel-monotime";
/// Newest DV-learn monotonic time accepted directly from an initiator.
pub const KEY_DV_LEARN_MONOTIME: &str = "dv-learn-monotime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Replace all records under the key.
    Replace,
    /// Add alongside existing records; an equal value only has its expiry refreshed.
    Multiple,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    pub expiry: Timestamp,
}

pub trait PeerStore {
    fn store(
        &mut self,
        peer: &PeerIdentity,
        key: &str,
        value: Vec<u8>,
        expiry: Timestamp,
        mode: StoreMode,
    ) -> Result<(), PeerStoreError>;

    /// Unexpired records under (peer, key).
    fn fetch(&self, peer: &PeerIdentity, key: &str, now: Timestamp) -> Vec<Record>;
}

#[derive(Debug, thiserror::Error)]
pub enum PeerStoreError {
    #[error("peer store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer store encoding: {0}")]
    Encoding(String),
}

#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    records: HashMap<(PeerIdentity, String), Vec<Record>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every (peer, key, record) triple, for persistence layers.
    pub fn entries(&self) -> impl Iterator<Item = (&PeerIdentity, &str, &Record)> + '_ {
        self.records
            .iter()
            .flat_map(|((p, k), rs)| rs.iter().map(move |r| (p, k.as_str(), r)))
    }

    /// Drop expired records.
    pub fn expire(&mut self, now: Timestamp) {
        for rs in self.records.values_mut() {
            rs.retain(|r| r.expiry > now);
        }
        self.records.retain(|_, rs| !rs.is_empty());
    }
}

impl PeerStore for MemoryPeerStore {
    fn store(
        &mut self,
        peer: &PeerIdentity,
        key: &str,
        value: Vec<u8>,
        expiry: Timestamp,
        mode: StoreMode,
    ) -> Result<(), PeerStoreError> {
        let rs = self.records.entry((*peer, key.to_string())).or_default();
        match mode {
            StoreMode::Replace => {
                rs.clear();
                rs.push(Record { value, expiry });
            }
            StoreMode::Multiple => match rs.iter_mut().find(|r| r.value == value) {
                Some(r) => r.expiry = r.expiry.max(expiry),
                None => rs.push(Record { value, expiry }),
            },
        }
        Ok(())
    }

    fn fetch(&self, peer: &PeerIdentity, key: &str, now: Timestamp) -> Vec<Record> {
        self.records
            .get(&(*peer, key.to_string()))
            .map(|rs| rs.iter().filter(|r| r.expiry > now).cloned().collect())
            .unwrap_or_default()
    }
}
