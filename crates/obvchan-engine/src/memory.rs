//! In-memory collaborators.
//!
//! [`MemoryIdentityDirectory`] plays the identity manager of one user: owned
//! identities with their private keys, and that user's contact book.
//! [`MemoryNetwork`] plays the relay server and the user interface: it queues
//! envelopes per recipient device and collects dialogs per owner. Both are
//! safe to share between the managers of several simulated devices.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use obvchan_crypto::rng::random_array;
use obvchan_crypto::{Challenge, IdentityKeyPair};
use obvchan_protocol::{CryptoIdentity, DialogMessage, Envelope, OutboundEnvelope, Uid};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::delegates::{IdentityDelegate, IdentityUpdate, Transport};
use crate::error::{IdentityError, TransportError};
use crate::unix_millis;

struct OwnedIdentity {
    keys: IdentityKeyPair,
    /// The single device this process runs as.
    device: Uid,
    capabilities: Vec<String>,
    published_details: Vec<u8>,
}

/// What an owner knows about one contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactRecord {
    pub devices: Vec<Uid>,
    /// Cleared when the contact is revoked or blocked.
    pub active: bool,
    pub one_to_one: bool,
    pub capabilities: BTreeMap<Uid, Vec<String>>,
    pub published_details: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryIdentityDirectory {
    owned: DashMap<CryptoIdentity, OwnedIdentity>,
    /// Reverse lookup: owned device -> owner.
    device_owner: DashMap<Uid, CryptoIdentity>,
    contacts: DashMap<(CryptoIdentity, CryptoIdentity), ContactRecord>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an owned identity running on a random device.
    pub fn create_owned_identity(&self) -> Result<(CryptoIdentity, Uid), IdentityError> {
        let device = Uid(random_array()?);
        Ok((self.create_owned_identity_on(device)?, device))
    }

    pub fn create_owned_identity_on(&self, device: Uid) -> Result<CryptoIdentity, IdentityError> {
        let keys = IdentityKeyPair::generate()?;
        let identity = keys.public();
        self.owned.insert(
            identity,
            OwnedIdentity {
                keys,
                device,
                capabilities: vec!["oblivious_channels".into(), "one_to_one".into()],
                published_details: format!("owner {}", identity).into_bytes(),
            },
        );
        self.device_owner.insert(device, identity);
        debug!(%identity, %device, "created owned identity");
        Ok(identity)
    }

    /// Add `contact` with its known devices to the contact book of `owner`.
    pub fn add_contact(&self, owner: CryptoIdentity, contact: CryptoIdentity, devices: Vec<Uid>) {
        self.contacts.insert(
            (owner, contact),
            ContactRecord {
                devices,
                active: true,
                ..ContactRecord::default()
            },
        );
    }

    pub fn remove_contact(&self, owner: &CryptoIdentity, contact: &CryptoIdentity) {
        self.contacts.remove(&(*owner, *contact));
    }

    pub fn set_active(&self, owner: &CryptoIdentity, contact: &CryptoIdentity, active: bool) {
        if let Some(mut record) = self.contacts.get_mut(&(*owner, *contact)) {
            record.active = active;
        }
    }

    pub fn set_one_to_one(&self, owner: &CryptoIdentity, contact: &CryptoIdentity, one_to_one: bool) {
        if let Some(mut record) = self.contacts.get_mut(&(*owner, *contact)) {
            record.one_to_one = one_to_one;
        }
    }

    pub fn set_own_capabilities(&self, owner: &CryptoIdentity, capabilities: Vec<String>) {
        if let Some(mut owned) = self.owned.get_mut(owner) {
            owned.capabilities = capabilities;
        }
    }

    pub fn contact(&self, owner: &CryptoIdentity, contact: &CryptoIdentity) -> Option<ContactRecord> {
        self.contacts
            .get(&(*owner, *contact))
            .map(|record| record.value().clone())
    }

    fn with_owned<R>(
        &self,
        owner: &CryptoIdentity,
        f: impl FnOnce(&OwnedIdentity) -> R,
    ) -> Result<R, IdentityError> {
        self.owned
            .get(owner)
            .map(|owned| f(owned.value()))
            .ok_or(IdentityError::UnknownOwnedIdentity(*owner))
    }
}

impl IdentityDelegate for MemoryIdentityDirectory {
    fn owned_identities(&self) -> Result<Vec<CryptoIdentity>, IdentityError> {
        Ok(self.owned.iter().map(|entry| *entry.key()).collect())
    }

    fn owner_of_device(&self, device: &Uid) -> Result<Option<CryptoIdentity>, IdentityError> {
        Ok(self.device_owner.get(device).map(|owner| *owner))
    }

    fn current_device_uid(&self, owner: &CryptoIdentity) -> Result<Uid, IdentityError> {
        self.with_owned(owner, |owned| owned.device)
    }

    fn is_contact(&self, owner: &CryptoIdentity, contact: &CryptoIdentity) -> Result<bool, IdentityError> {
        Ok(self.contacts.contains_key(&(*owner, *contact)))
    }

    fn is_active(&self, owner: &CryptoIdentity, contact: &CryptoIdentity) -> Result<bool, IdentityError> {
        Ok(self
            .contacts
            .get(&(*owner, *contact))
            .is_some_and(|record| record.active))
    }

    fn contact_device_uids(
        &self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Vec<Uid>, IdentityError> {
        Ok(self
            .contacts
            .get(&(*owner, *contact))
            .map(|record| record.devices.clone())
            .unwrap_or_default())
    }

    fn is_one_to_one(&self, owner: &CryptoIdentity, contact: &CryptoIdentity) -> Result<bool, IdentityError> {
        Ok(self
            .contacts
            .get(&(*owner, *contact))
            .is_some_and(|record| record.one_to_one))
    }

    fn own_capabilities(&self, owner: &CryptoIdentity) -> Result<Vec<String>, IdentityError> {
        self.with_owned(owner, |owned| owned.capabilities.clone())
    }

    fn published_details(&self, owner: &CryptoIdentity) -> Result<Vec<u8>, IdentityError> {
        self.with_owned(owner, |owned| owned.published_details.clone())
    }

    fn solve_challenge(&self, owner: &CryptoIdentity, challenge: &Challenge) -> Result<Vec<u8>, IdentityError> {
        Ok(self.with_owned(owner, |owned| challenge.solve(&owned.keys))??)
    }

    fn open_with_identity_key(
        &self,
        owner: &CryptoIdentity,
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Option<Vec<u8>>, IdentityError> {
        self.with_owned(owner, |owned| owned.keys.open(aad, sealed).ok())
    }

    fn apply(&self, update: IdentityUpdate) -> Result<(), IdentityError> {
        trace!(?update, "applying identity update");
        match update {
            IdentityUpdate::SetOneToOne {
                owner,
                contact,
                one_to_one,
            } => self.set_one_to_one(&owner, &contact, one_to_one),
            IdentityUpdate::AddContactDevice {
                owner,
                contact,
                device,
            } => {
                if let Some(mut record) = self.contacts.get_mut(&(owner, contact)) {
                    if !record.devices.contains(&device) {
                        record.devices.push(device);
                    }
                }
            }
            IdentityUpdate::SetContactDeviceCapabilities {
                owner,
                contact,
                device,
                capabilities,
            } => {
                if let Some(mut record) = self.contacts.get_mut(&(owner, contact)) {
                    record.capabilities.insert(device, capabilities);
                }
            }
            IdentityUpdate::SetContactPublishedDetails {
                owner,
                contact,
                details,
            } => {
                if let Some(mut record) = self.contacts.get_mut(&(owner, contact)) {
                    record.published_details = details;
                }
            }
        }
        Ok(())
    }
}

/// A posted envelope as the server stored it.
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub flow_id: Uuid,
    pub envelope: Envelope,
}

#[derive(Default)]
pub struct MemoryNetwork {
    /// Per recipient device, in upload order.
    queues: DashMap<Uid, VecDeque<QueuedEnvelope>>,
    dialogs: DashMap<CryptoIdentity, Vec<DialogMessage>>,
    posted: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest undelivered envelope for `device`.
    pub fn pop_for(&self, device: &Uid) -> Option<Envelope> {
        self.queues
            .get_mut(device)
            .and_then(|mut queue| queue.pop_front())
            .map(|queued| queued.envelope)
    }

    pub fn take_for(&self, device: &Uid) -> Vec<Envelope> {
        self.queues
            .get_mut(device)
            .map(|mut queue| queue.drain(..).map(|queued| queued.envelope).collect())
            .unwrap_or_default()
    }

    /// Remove the envelope at `index` in `device`'s queue, skipping ahead of
    /// older ones.
    pub fn remove_at(&self, device: &Uid, index: usize) -> Option<Envelope> {
        self.queues
            .get_mut(device)
            .and_then(|mut queue| queue.remove(index))
            .map(|queued| queued.envelope)
    }

    /// Copies of the undelivered envelopes for `device`.
    pub fn peek_for(&self, device: &Uid) -> Vec<QueuedEnvelope> {
        self.queues
            .get(device)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_for(&self, device: &Uid) -> usize {
        self.queues.get(device).map_or(0, |queue| queue.len())
    }

    /// Devices with at least one undelivered envelope, sorted.
    pub fn devices_with_mail(&self) -> Vec<Uid> {
        let mut devices: Vec<Uid> = self
            .queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect();
        devices.sort();
        devices
    }

    pub fn posted_count(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn dialogs_for(&self, owner: &CryptoIdentity) -> Vec<DialogMessage> {
        self.dialogs
            .get(owner)
            .map(|dialogs| dialogs.clone())
            .unwrap_or_default()
    }
}

impl Transport for MemoryNetwork {
    fn post_envelope(&self, flow_id: Uuid, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        let now = unix_millis();
        let device = envelope.to_device;
        self.queues.entry(device).or_default().push_back(QueuedEnvelope {
            flow_id,
            envelope: envelope.into_inbound(now, now),
        });
        self.posted.fetch_add(1, Ordering::Relaxed);
        trace!(flow = %flow_id, %device, "envelope queued");
        Ok(())
    }

    fn post_dialog(&self, owner: &CryptoIdentity, dialog: DialogMessage) -> Result<(), TransportError> {
        self.dialogs.entry(*owner).or_default().push(dialog);
        Ok(())
    }
}
