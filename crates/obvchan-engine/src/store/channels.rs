//! Oblivious channels and their ratchet key wrapping.
//!
//! A wrapped key on a channel is `chain tag(16) || counter(8) || aead(message
//! key)`. The tag names the sending chain, so the receiver finds the channel
//! without trial decryption. Unwrapping reads but never advances state:
//! redelivery of the same envelope unwraps to the same key.

use std::collections::BTreeMap;

use obvchan_crypto::seed::{chain_key, chain_tag, ratchet_key, CHAIN_TAG_LEN};
use obvchan_crypto::{aead, Secret, Seed};
use obvchan_protocol::{CryptoIdentity, Uid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

const COUNTER_LEN: usize = 8;
const HEADER_LEN: usize = CHAIN_TAG_LEN + COUNTER_LEN;

/// Primary key of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub owner_device: Uid,
    pub remote_identity: CryptoIdentity,
    pub remote_device: Uid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObliviousChannel {
    pub owner: CryptoIdentity,
    pub key: ChannelKey,
    seed: Seed,
    pub suite_version: u8,
    /// Pending until the peer proves it installed the same seed.
    pub confirmed: bool,
    send_counter: u64,
}

impl ObliviousChannel {
    pub fn messages_sent(&self) -> u64 {
        self.send_counter
    }
}

/// A message key recovered from one of our channels.
#[derive(Debug)]
pub struct ChannelUnwrap {
    pub owner: CryptoIdentity,
    pub key: ChannelKey,
    pub confirmed: bool,
    pub message_key: Secret<32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelTable {
    channels: BTreeMap<ChannelKey, ObliviousChannel>,
}

impl ChannelTable {
    pub fn get(&self, key: &ChannelKey) -> Option<&ObliviousChannel> {
        self.channels.get(key)
    }

    pub fn exists(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    /// Install a pending channel. Never merges into an existing one.
    pub fn create(
        &mut self,
        owner: CryptoIdentity,
        key: ChannelKey,
        seed: Seed,
        suite_version: u8,
    ) -> Result<(), StoreError> {
        if self.channels.contains_key(&key) {
            return Err(StoreError::ChannelAlreadyExists {
                remote_identity: key.remote_identity,
                remote_device: key.remote_device,
            });
        }
        self.channels.insert(
            key,
            ObliviousChannel {
                owner,
                key,
                seed,
                suite_version,
                confirmed: false,
                send_counter: 0,
            },
        );
        Ok(())
    }

    pub fn confirm(&mut self, key: &ChannelKey) -> Result<(), StoreError> {
        match self.channels.get_mut(key) {
            Some(channel) => {
                channel.confirmed = true;
                Ok(())
            }
            None => Err(StoreError::ChannelNotFound {
                remote_identity: key.remote_identity,
                remote_device: key.remote_device,
            }),
        }
    }

    pub fn delete(&mut self, key: &ChannelKey) -> Option<ObliviousChannel> {
        self.channels.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObliviousChannel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Wrap `message_key` for the remote end of `key`, advancing the send counter.
    pub fn wrap(&mut self, key: &ChannelKey, message_key: &Secret<32>) -> Result<Vec<u8>, StoreError> {
        let channel = self.channels.get_mut(key).ok_or(StoreError::ChannelNotFound {
            remote_identity: key.remote_identity,
            remote_device: key.remote_device,
        })?;

        let chain = chain_key(&channel.seed, &key.owner_device, &key.remote_device)?;
        let tag = chain_tag(&chain)?;
        let counter = channel.send_counter;
        channel.send_counter += 1;

        let mut header = [0u8; HEADER_LEN];
        header[..CHAIN_TAG_LEN].copy_from_slice(&tag);
        header[CHAIN_TAG_LEN..].copy_from_slice(&counter.to_be_bytes());

        let wrapping_key = ratchet_key(&chain, counter)?;
        let sealed = aead::seal(wrapping_key.as_bytes(), &header, message_key.as_bytes())?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Find the channel of `owner_device` whose receive chain produced
    /// `wrapped`, and recover the message key.
    pub fn unwrap(
        &self,
        owner_device: &Uid,
        wrapped: &[u8],
    ) -> Result<Option<ChannelUnwrap>, StoreError> {
        if wrapped.len() <= HEADER_LEN {
            return Ok(None);
        }
        let (header, sealed) = wrapped.split_at(HEADER_LEN);
        let tag = &header[..CHAIN_TAG_LEN];
        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&header[CHAIN_TAG_LEN..]);
        let counter = u64::from_be_bytes(counter_bytes);

        for channel in self
            .channels
            .values()
            .filter(|channel| channel.key.owner_device == *owner_device)
        {
            let chain = chain_key(&channel.seed, &channel.key.remote_device, owner_device)?;
            if chain_tag(&chain)?.as_slice() != tag {
                continue;
            }
            let wrapping_key = ratchet_key(&chain, counter)?;
            let opened = match aead::open(wrapping_key.as_bytes(), header, sealed) {
                Ok(opened) => opened,
                Err(e) => {
                    debug!(remote = %channel.key.remote_identity, counter, "chain tag matched but key did not open: {}", e);
                    return Ok(None);
                }
            };
            let Ok(message_key) = <[u8; 32]>::try_from(opened.as_slice()) else {
                debug!("unwrapped key has the wrong length");
                return Ok(None);
            };
            return Ok(Some(ChannelUnwrap {
                owner: channel.owner,
                key: channel.key,
                confirmed: channel.confirmed,
                message_key: Secret::from_bytes(message_key),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obvchan_protocol::UID_LEN;

    fn identity(tag: u8) -> CryptoIdentity {
        CryptoIdentity {
            signing_key: [tag; 32],
            encryption_key: [tag; 32],
        }
    }

    struct Pair {
        alice: ChannelTable,
        bob: ChannelTable,
        alice_key: ChannelKey,
        bob_key: ChannelKey,
    }

    fn pair(alice_seed: [u8; 32], bob_seed: [u8; 32]) -> Pair {
        let alice_device = Uid([1u8; UID_LEN]);
        let bob_device = Uid([2u8; UID_LEN]);
        let alice_key = ChannelKey {
            owner_device: alice_device,
            remote_identity: identity(2),
            remote_device: bob_device,
        };
        let bob_key = ChannelKey {
            owner_device: bob_device,
            remote_identity: identity(1),
            remote_device: alice_device,
        };
        let mut alice = ChannelTable::default();
        let mut bob = ChannelTable::default();
        alice
            .create(identity(1), alice_key, Secret::from_bytes(alice_seed), 1)
            .unwrap();
        bob.create(identity(2), bob_key, Secret::from_bytes(bob_seed), 1)
            .unwrap();
        Pair {
            alice,
            bob,
            alice_key,
            bob_key,
        }
    }

    #[test]
    fn wrap_then_unwrap_on_peer() {
        let mut pair = pair([7u8; 32], [7u8; 32]);
        let message_key = Secret::from_bytes([42u8; 32]);
        let wrapped = pair.alice.wrap(&pair.alice_key, &message_key).unwrap();

        let unwrapped = pair
            .bob
            .unwrap(&pair.bob_key.owner_device, &wrapped)
            .unwrap()
            .expect("bob owns the receiving chain");
        assert_eq!(unwrapped.message_key, message_key);
        assert_eq!(unwrapped.key, pair.bob_key);
        assert!(!unwrapped.confirmed);

        // Reading does not consume: the same envelope unwraps twice.
        assert!(pair
            .bob
            .unwrap(&pair.bob_key.owner_device, &wrapped)
            .unwrap()
            .is_some());
    }

    #[test]
    fn counters_advance_per_message() {
        let mut pair = pair([7u8; 32], [7u8; 32]);
        let key = Secret::from_bytes([1u8; 32]);
        let first = pair.alice.wrap(&pair.alice_key, &key).unwrap();
        let second = pair.alice.wrap(&pair.alice_key, &key).unwrap();
        assert_ne!(first[CHAIN_TAG_LEN..HEADER_LEN], second[CHAIN_TAG_LEN..HEADER_LEN]);
        assert_eq!(pair.alice.get(&pair.alice_key).unwrap().messages_sent(), 2);
        assert!(pair.bob.unwrap(&pair.bob_key.owner_device, &second).unwrap().is_some());
    }

    #[test]
    fn mismatched_seeds_do_not_unwrap() {
        let mut pair = pair([7u8; 32], [8u8; 32]);
        let wrapped = pair
            .alice
            .wrap(&pair.alice_key, &Secret::from_bytes([3u8; 32]))
            .unwrap();
        assert!(pair
            .bob
            .unwrap(&pair.bob_key.owner_device, &wrapped)
            .unwrap()
            .is_none());
    }

    #[test]
    fn own_messages_do_not_unwrap_locally() {
        let mut pair = pair([7u8; 32], [7u8; 32]);
        let wrapped = pair
            .alice
            .wrap(&pair.alice_key, &Secret::from_bytes([3u8; 32]))
            .unwrap();
        assert!(pair
            .alice
            .unwrap(&pair.alice_key.owner_device, &wrapped)
            .unwrap()
            .is_none());
    }

    #[test]
    fn create_never_merges_and_confirm_requires_channel() {
        let mut pair = pair([7u8; 32], [7u8; 32]);
        assert!(matches!(
            pair.alice
                .create(identity(1), pair.alice_key, Secret::from_bytes([9u8; 32]), 1),
            Err(StoreError::ChannelAlreadyExists { .. })
        ));
        pair.alice.confirm(&pair.alice_key).unwrap();
        assert!(pair.alice.get(&pair.alice_key).unwrap().confirmed);

        pair.alice.delete(&pair.alice_key);
        assert!(matches!(
            pair.alice.confirm(&pair.alice_key),
            Err(StoreError::ChannelNotFound { .. })
        ));
    }
}
