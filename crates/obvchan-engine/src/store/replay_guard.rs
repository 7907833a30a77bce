use std::collections::BTreeMap;

use obvchan_protocol::CryptoIdentity;
use serde::{Deserialize, Serialize};

/// Challenge signatures already accepted, per owned identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayGuardTable {
    seen: BTreeMap<(CryptoIdentity, Vec<u8>), u64>,
}

impl ReplayGuardTable {
    /// Record `signature` as received by `owner`. Returns `false` if it was
    /// already recorded.
    pub fn check_and_insert(&mut self, owner: &CryptoIdentity, signature: &[u8], now: u64) -> bool {
        let key = (*owner, signature.to_vec());
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    pub fn contains(&self, owner: &CryptoIdentity, signature: &[u8]) -> bool {
        self.seen.contains_key(&(*owner, signature.to_vec()))
    }

    /// Forget signatures recorded before `cutoff`.
    pub fn prune(&mut self, cutoff: u64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, recorded_at| *recorded_at >= cutoff);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
