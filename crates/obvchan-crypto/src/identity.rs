//! Identity key generation and serialization.
//!
//! Each owned identity has a long-term Ed25519 signing key (challenge
//! responses) and a long-term X25519 key (one-shot asymmetric messages),
//! generated once and persisted by the identity manager.

use std::fmt;

use obvchan_protocol::CryptoIdentity;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kem::KemKeyPair;
use crate::pke;

/// Private half of an identity, serializable for the identity store.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// PKCS#8 document holding the Ed25519 key.
    signing_pkcs8: Zeroizing<Vec<u8>>,
    signing_public: [u8; 32],
    encryption: KemKeyPair,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| CryptoError::Rng)?;
        let signing = Ed25519KeyPair::from_pkcs8(document.as_ref())
            .map_err(|_| CryptoError::InvalidKey("ed25519 pkcs8"))?;

        let mut signing_public = [0u8; 32];
        signing_public.copy_from_slice(signing.public_key().as_ref());

        Ok(Self {
            signing_pkcs8: Zeroizing::new(document.as_ref().to_vec()),
            signing_public,
            encryption: KemKeyPair::generate()?,
        })
    }

    /// The public identity other parties know us by.
    pub fn public(&self) -> CryptoIdentity {
        CryptoIdentity {
            signing_key: self.signing_public,
            encryption_key: self.encryption.public_key(),
        }
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signing = Ed25519KeyPair::from_pkcs8(&self.signing_pkcs8)
            .map_err(|_| CryptoError::InvalidKey("ed25519 pkcs8"))?;
        Ok(signing.sign(message).as_ref().to_vec())
    }

    /// Open a message sealed to this identity's public encryption key.
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        pke::open_with(&self.encryption, aad, sealed)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .field("private", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = IdentityKeyPair::generate().unwrap();
        let bytes = postcard::to_allocvec(&pair).unwrap();
        let restored: IdentityKeyPair = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn sealed_to_identity_opens() {
        let pair = IdentityKeyPair::generate().unwrap();
        let sealed = pke::seal_to(&pair.public().encryption_key, b"", b"hi").unwrap();
        assert_eq!(pair.open(b"", &sealed).unwrap(), b"hi");
    }

    #[test]
    fn debug_hides_private_key() {
        let pair = IdentityKeyPair::generate().unwrap();
        assert!(format!("{:?}", pair).contains("***"));
    }
}
