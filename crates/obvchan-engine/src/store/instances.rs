use std::collections::BTreeMap;

use obvchan_protocol::{CryptoIdentity, InstanceId, ProtocolKind, Uid};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::protocol::ProtocolState;

/// Primary key of a protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub protocol: ProtocolKind,
    pub instance_id: InstanceId,
    pub owner: CryptoIdentity,
}

/// Persisted state of every running protocol instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTable {
    instances: BTreeMap<InstanceKey, ProtocolState>,
}

impl InstanceTable {
    pub fn get(&self, key: &InstanceKey) -> Option<&ProtocolState> {
        self.instances.get(key)
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn create(&mut self, key: InstanceKey, state: ProtocolState) -> Result<(), StoreError> {
        if self.instances.contains_key(&key) {
            return Err(StoreError::InstanceAlreadyExists(key));
        }
        self.instances.insert(key, state);
        Ok(())
    }

    pub fn update(&mut self, key: InstanceKey, state: ProtocolState) -> Result<(), StoreError> {
        match self.instances.get_mut(&key) {
            Some(slot) => {
                *slot = state;
                Ok(())
            }
            None => Err(StoreError::InstanceNotFound(key)),
        }
    }

    pub(crate) fn remove(&mut self, key: &InstanceKey) -> Option<ProtocolState> {
        self.instances.remove(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstanceKey, &ProtocolState)> {
        self.instances.iter()
    }

    pub fn keys_for(&self, owner: &CryptoIdentity, protocol: ProtocolKind) -> Vec<InstanceKey> {
        self.instances
            .keys()
            .filter(|key| key.owner == *owner && key.protocol == protocol)
            .copied()
            .collect()
    }
}

/// The one channel-creation instance currently in charge of each
/// (owner, contact, contact device) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelCreationIndex {
    pairs: BTreeMap<(CryptoIdentity, CryptoIdentity, Uid), InstanceId>,
}

impl ChannelCreationIndex {
    pub fn get(
        &self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
        contact_device: &Uid,
    ) -> Option<InstanceId> {
        self.pairs.get(&(*owner, *contact, *contact_device)).copied()
    }

    pub fn register(
        &mut self,
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        contact_device: Uid,
        instance_id: InstanceId,
    ) -> Option<InstanceId> {
        self.pairs.insert((owner, contact, contact_device), instance_id)
    }

    /// Drop whichever pair points at `instance_id` for `owner`.
    pub(crate) fn forget_instance(&mut self, owner: &CryptoIdentity, instance_id: &InstanceId) {
        self.pairs
            .retain(|(pair_owner, _, _), id| !(pair_owner == owner && id == instance_id));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
