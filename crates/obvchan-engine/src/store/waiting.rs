//! Waiting-for-condition entries.
//!
//! An entry asks the engine to replay a local message into an instance once
//! something happens to a contact. Entries live in an arena keyed by a
//! monotonic id, with secondary indexes by watched contact and by instance;
//! deleting an instance deletes its entries.

use std::collections::{BTreeMap, BTreeSet};

use obvchan_protocol::{CryptoIdentity, ProtocolMessage};
use serde::{Deserialize, Serialize};

use super::instances::InstanceKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForCondition {
    pub owner: CryptoIdentity,
    pub watched_contact: CryptoIdentity,
    pub instance: InstanceKey,
    /// Encoded protocol message to replay into `instance`.
    pub replay_body: Vec<u8>,
}

impl WaitingForCondition {
    pub fn replay_message(&self) -> ProtocolMessage {
        ProtocolMessage {
            protocol: self.instance.protocol,
            instance_id: self.instance.instance_id,
            body: self.replay_body.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitingTable {
    next_id: u64,
    entries: BTreeMap<u64, WaitingForCondition>,
    by_contact: BTreeMap<(CryptoIdentity, CryptoIdentity), BTreeSet<u64>>,
    by_instance: BTreeMap<InstanceKey, BTreeSet<u64>>,
}

impl WaitingTable {
    pub fn create(&mut self, entry: WaitingForCondition) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_contact
            .entry((entry.owner, entry.watched_contact))
            .or_default()
            .insert(id);
        self.by_instance.entry(entry.instance).or_default().insert(id);
        self.entries.insert(id, entry);
        id
    }

    pub fn all_for(
        &self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Vec<&WaitingForCondition> {
        self.by_contact
            .get(&(*owner, *contact))
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    /// Remove and return every entry watching `contact` for `owner`.
    pub fn take_all_for(
        &mut self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Vec<WaitingForCondition> {
        let ids = self.by_contact.remove(&(*owner, *contact)).unwrap_or_default();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn delete_for_instance(&mut self, instance: &InstanceKey) -> usize {
        let ids = self.by_instance.remove(instance).unwrap_or_default();
        ids.into_iter().filter_map(|id| self.remove(id)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitingForCondition> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, id: u64) -> Option<WaitingForCondition> {
        let entry = self.entries.remove(&id)?;
        let contact_key = (entry.owner, entry.watched_contact);
        if let Some(ids) = self.by_contact.get_mut(&contact_key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_contact.remove(&contact_key);
            }
        }
        if let Some(ids) = self.by_instance.get_mut(&entry.instance) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_instance.remove(&entry.instance);
            }
        }
        Some(entry)
    }
}
