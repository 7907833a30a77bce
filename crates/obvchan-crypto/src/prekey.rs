//! Short-lived pre-keys.
//!
//! A pre-key is an X25519 key pair bound to one owned device and published
//! ahead of time, so a contact can reach that device before any channel
//! exists. It stops being accepted once it expires.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::kem::KemKeyPair;
use crate::pke;
use crate::rng::random_array;

pub const PREKEY_ID_LEN: usize = 16;

/// Private pre-key record kept by the owning device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    pub id: [u8; PREKEY_ID_LEN],
    key_pair: KemKeyPair,
    /// Expiry, in ms since epoch.
    pub expires_at: u64,
}

/// The pre-key's public portion, as handed to contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPreKey {
    pub id: [u8; PREKEY_ID_LEN],
    pub public_key: [u8; 32],
    pub expires_at: u64,
}

impl PreKey {
    pub fn generate(now_millis: u64, lifetime_millis: u64) -> Result<Self, CryptoError> {
        Ok(Self {
            id: random_array()?,
            key_pair: KemKeyPair::generate()?,
            expires_at: now_millis.saturating_add(lifetime_millis),
        })
    }

    pub fn published(&self) -> PublishedPreKey {
        PublishedPreKey {
            id: self.id,
            public_key: self.key_pair.public_key(),
            expires_at: self.expires_at,
        }
    }

    pub fn is_valid_at(&self, timestamp_millis: u64) -> bool {
        self.expires_at > timestamp_millis
    }

    /// Open the part of a wrapped key that follows the pre-key id.
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        pke::open_with(&self.key_pair, aad, sealed)
    }
}

/// Seal to a published pre-key. Output: `prekey id(16) || pke output`.
pub fn seal_to_prekey(
    prekey: &PublishedPreKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let sealed = pke::seal_to(&prekey.public_key, aad, plaintext)?;
    let mut out = Vec::with_capacity(PREKEY_ID_LEN + sealed.len());
    out.extend_from_slice(&prekey.id);
    out.extend_from_slice(&sealed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_window() {
        let prekey = PreKey::generate(1_000, 500).unwrap();
        assert!(prekey.is_valid_at(1_000));
        assert!(prekey.is_valid_at(1_499));
        assert!(!prekey.is_valid_at(1_500));
    }

    #[test]
    fn seal_to_published_prekey() {
        let prekey = PreKey::generate(0, 10).unwrap();
        let wrapped = seal_to_prekey(&prekey.published(), b"aad", b"key").unwrap();
        assert_eq!(&wrapped[..PREKEY_ID_LEN], &prekey.id);
        assert_eq!(prekey.open(b"aad", &wrapped[PREKEY_ID_LEN..]).unwrap(), b"key");
    }
}
