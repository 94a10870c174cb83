//! Peer store persisted as a JSON file, rewritten on every store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use waypath_core::peerstore::{PeerStoreError, Record};
use waypath_core::{MemoryPeerStore, PeerIdentity, PeerStore, StoreMode, Timestamp};

#[derive(Serialize, Deserialize)]
struct Entry {
    peer: String,
    key: String,
    value: String,
    expiry_us: u64,
}

pub struct FilePeerStore {
    path: PathBuf,
    records: MemoryPeerStore,
}

impl FilePeerStore {
    /// Open `path`, starting empty if it does not exist yet. Records past
    /// `now` are dropped on load.
    pub fn open(path: &Path, now: Timestamp) -> Result<Self, PeerStoreError> {
        let mut records = MemoryPeerStore::new();
        match std::fs::read(path) {
            Ok(bytes) => {
                let entries: Vec<Entry> = serde_json::from_slice(&bytes)
                    .map_err(|e| PeerStoreError::Encoding(e.to_string()))?;
                for e in entries {
                    let Some(peer) = parse_peer(&e.peer) else {
                        warn!(peer = %e.peer, "skipping peer store entry with bad peer");
                        continue;
                    };
                    let Ok(value) = hex::decode(&e.value) else {
                        warn!(key = %e.key, "skipping peer store entry with bad value");
                        continue;
                    };
                    records.store(
                        &peer,
                        &e.key,
                        value,
                        Timestamp::from_micros(e.expiry_us),
                        StoreMode::Multiple,
                    )?;
                }
                records.expire(now);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "new peer store");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    fn save(&self) -> Result<(), PeerStoreError> {
        let mut entries: Vec<Entry> = self
            .records
            .entries()
            .map(|(peer, key, r)| Entry {
                peer: hex::encode(peer.as_bytes()),
                key: key.to_string(),
                value: hex::encode(&r.value),
                expiry_us: r.expiry.as_micros(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.peer, &a.key, &a.value).cmp(&(&b.peer, &b.key, &b.value)));
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| PeerStoreError::Encoding(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_peer(s: &str) -> Option<PeerIdentity> {
    let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
    Some(PeerIdentity::from_bytes(bytes))
}

impl PeerStore for FilePeerStore {
    fn store(
        &mut self,
        peer: &PeerIdentity,
        key: &str,
        value: Vec<u8>,
        expiry: Timestamp,
        mode: StoreMode,
    ) -> Result<(), PeerStoreError> {
        self.records.store(peer, key, value, expiry, mode)?;
        self.save()
    }

    fn fetch(&self, peer: &PeerIdentity, key: &str, now: Timestamp) -> Vec<Record> {
        self.records.fetch(peer, key, now)
    }
}
