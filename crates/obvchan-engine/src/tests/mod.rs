//! Multi-device scenarios run against in-memory collaborators.

mod decryption;

use std::sync::Arc;

use obvchan_crypto::pke;
use obvchan_protocol::{CryptoIdentity, Envelope, ProtocolKind, Uid, UID_LEN};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::decryptor::DecryptionOutcome;
use crate::memory::{MemoryIdentityDirectory, MemoryNetwork};
use crate::store::{ChannelKey, ObliviousChannel, Store};
use crate::{EngineConfig, ProtocolManager};

/// One user on one device.
pub(crate) struct Device {
    pub manager: ProtocolManager,
    pub directory: Arc<MemoryIdentityDirectory>,
    pub identity: CryptoIdentity,
    pub uid: Uid,
}

impl Device {
    pub fn new(network: &Arc<MemoryNetwork>, tag: u8) -> Self {
        Self::with_config(network, tag, EngineConfig::default())
    }

    pub fn with_config(network: &Arc<MemoryNetwork>, tag: u8, config: EngineConfig) -> Self {
        let directory = Arc::new(MemoryIdentityDirectory::new());
        let uid = Uid([tag; UID_LEN]);
        let identity = directory.create_owned_identity_on(uid).unwrap();
        let manager = ProtocolManager::builder()
            .identity(directory.clone())
            .transport(network.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            manager,
            directory,
            identity,
            uid,
        }
    }

    /// The same device after a restart from an encrypted snapshot.
    pub fn restarted(self, network: &Arc<MemoryNetwork>) -> Self {
        let blob = self.manager.export_snapshot("device password").unwrap();
        let store = Store::import_snapshot(&blob, "device password").unwrap();
        let manager = ProtocolManager::builder()
            .identity(self.directory.clone())
            .transport(network.clone())
            .store(Arc::new(store))
            .build()
            .unwrap();
        Self { manager, ..self }
    }

    pub fn channel_with(&self, peer: &Device) -> Option<ObliviousChannel> {
        let key = ChannelKey {
            owner_device: self.uid,
            remote_identity: peer.identity,
            remote_device: peer.uid,
        };
        self.manager
            .store()
            .read(|db| db.channels.get(&key).cloned())
            .unwrap()
    }

    pub fn instance_count(&self, protocol: ProtocolKind) -> usize {
        self.manager
            .store()
            .read(|db| db.instances.keys_for(&self.identity, protocol).len())
            .unwrap()
    }

    pub fn receive(&self, envelope: &Envelope) -> DecryptionOutcome {
        self.manager.receive_envelope(envelope).unwrap()
    }
}

/// Make `a` and `b` mutual contacts, each knowing the other's device.
pub(crate) fn introduce(a: &Device, b: &Device) {
    a.directory.add_contact(a.identity, b.identity, vec![b.uid]);
    b.directory.add_contact(b.identity, a.identity, vec![a.uid]);
}

fn device_for<'a>(devices: &[&'a Device], uid: &Uid) -> &'a Device {
    devices
        .iter()
        .find(|device| device.uid == *uid)
        .copied()
        .expect("envelope for an unknown device")
}

/// Deliver until every queue is empty, oldest envelope first per device.
/// Returns the number of envelopes delivered.
pub(crate) fn deliver_all(network: &MemoryNetwork, devices: &[&Device]) -> usize {
    let mut delivered = 0;
    while let Some(uid) = network.devices_with_mail().first().copied() {
        let envelope = network.pop_for(&uid).unwrap();
        device_for(devices, &uid).receive(&envelope);
        delivered += 1;
        assert!(delivered < 1_000, "delivery does not quiesce");
    }
    delivered
}

/// Independent delivery queue: asymmetric wraps and channel wraps reach a
/// device in order within their own kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Asymmetric,
    Channel,
}

fn lane_of(envelope: &Envelope) -> Lane {
    if envelope.wrapped_key.len() == pke::PKE_OVERHEAD + 32 {
        Lane::Asymmetric
    } else {
        Lane::Channel
    }
}

/// Like [`deliver_all`], but each step delivers the head of a random
/// (recipient, lane) queue.
pub(crate) fn deliver_interleaved(network: &MemoryNetwork, devices: &[&Device], seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut delivered = 0;
    loop {
        let mut heads = Vec::new();
        for uid in network.devices_with_mail() {
            let queue = network.peek_for(&uid);
            for lane in [Lane::Asymmetric, Lane::Channel] {
                if let Some(index) = queue.iter().position(|queued| lane_of(&queued.envelope) == lane) {
                    heads.push((uid, index));
                }
            }
        }
        let Some(&(uid, index)) = heads.choose(&mut rng) else {
            return delivered;
        };
        let envelope = network.remove_at(&uid, index).unwrap();
        device_for(devices, &uid).receive(&envelope);
        delivered += 1;
        assert!(delivered < 1_000, "delivery does not quiesce");
    }
}

/// Two introduced devices with a confirmed channel between them and an
/// empty network.
pub(crate) fn connected_pair(network: &Arc<MemoryNetwork>) -> (Device, Device) {
    let alice = Device::new(network, 1);
    let bob = Device::new(network, 2);
    introduce(&alice, &bob);
    alice
        .manager
        .start_channel_creation(alice.identity, bob.identity, bob.uid)
        .unwrap();
    deliver_all(network, &[&alice, &bob]);
    assert!(alice.channel_with(&bob).unwrap().confirmed);
    assert!(bob.channel_with(&alice).unwrap().confirmed);
    (alice, bob)
}
