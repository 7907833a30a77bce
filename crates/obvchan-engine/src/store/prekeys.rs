use std::collections::BTreeMap;

use obvchan_crypto::prekey::PREKEY_ID_LEN;
use obvchan_crypto::PreKey;
use obvchan_protocol::{CryptoIdentity, Uid};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyEntry {
    pub owner: CryptoIdentity,
    pub device: Uid,
    pub prekey: PreKey,
}

/// Pre-keys generated by our own devices, keyed by pre-key id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreKeyTable {
    entries: BTreeMap<[u8; PREKEY_ID_LEN], PreKeyEntry>,
}

impl PreKeyTable {
    pub fn insert(&mut self, owner: CryptoIdentity, device: Uid, prekey: PreKey) {
        self.entries.insert(
            prekey.id,
            PreKeyEntry {
                owner,
                device,
                prekey,
            },
        );
    }

    /// Pre-key `id` if it belongs to `device`.
    pub fn find(&self, device: &Uid, id: &[u8; PREKEY_ID_LEN]) -> Option<&PreKeyEntry> {
        self.entries.get(id).filter(|entry| entry.device == *device)
    }

    /// The longest-lived pre-key of `device` still valid at `now`.
    pub fn current_for(&self, device: &Uid, now: u64) -> Option<&PreKeyEntry> {
        self.entries
            .values()
            .filter(|entry| entry.device == *device && entry.prekey.is_valid_at(now))
            .max_by_key(|entry| entry.prekey.expires_at)
    }

    pub fn remove_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.prekey.is_valid_at(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obvchan_protocol::UID_LEN;

    fn identity() -> CryptoIdentity {
        CryptoIdentity {
            signing_key: [1u8; 32],
            encryption_key: [1u8; 32],
        }
    }

    #[test]
    fn lookup_is_scoped_to_device() {
        let mut table = PreKeyTable::default();
        let device = Uid([1u8; UID_LEN]);
        let prekey = PreKey::generate(0, 1_000).unwrap();
        let id = prekey.id;
        table.insert(identity(), device, prekey);

        assert!(table.find(&device, &id).is_some());
        assert!(table.find(&Uid([2u8; UID_LEN]), &id).is_none());
    }

    #[test]
    fn current_prefers_latest_expiry_and_expired_are_removed() {
        let mut table = PreKeyTable::default();
        let device = Uid([1u8; UID_LEN]);
        let short = PreKey::generate(0, 100).unwrap();
        let long = PreKey::generate(0, 1_000).unwrap();
        let long_id = long.id;
        table.insert(identity(), device, short);
        table.insert(identity(), device, long);

        assert_eq!(table.current_for(&device, 50).unwrap().prekey.id, long_id);
        assert_eq!(table.remove_expired(500), 1);
        assert_eq!(table.len(), 1);
        assert!(table.current_for(&device, 2_000).is_none());
    }
}
