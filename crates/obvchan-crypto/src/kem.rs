//! X25519 key encapsulation.
//!
//! The ciphertext is the sender's ephemeral public key; the shared secret is
//! HKDF-SHA256 over the raw Diffie-Hellman output bound to both public keys.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::secret::Secret;

const KEM_INFO: &[u8] = b"obvchan/kem/x25519-hkdf-sha256";

/// 32-byte secret produced by encapsulation.
pub type SharedSecret = Secret<32>;

/// Encapsulation output sent to the key owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemCiphertext(pub [u8; 32]);

/// KEM key pair. Serializable so it can wait inside persisted protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemKeyPair {
    secret: Secret<32>,
    public: [u8; 32],
}

impl KemKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_secret(Secret::random()?))
    }

    pub fn from_secret(secret: Secret<32>) -> Self {
        let static_secret = StaticSecret::from(*secret.as_bytes());
        let public = PublicKey::from(&static_secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Recover the secret a peer encapsulated under our public key.
    pub fn decapsulate(&self, ciphertext: &KemCiphertext) -> Result<SharedSecret, CryptoError> {
        let static_secret = StaticSecret::from(*self.secret.as_bytes());
        let dh = static_secret.diffie_hellman(&PublicKey::from(ciphertext.0));
        if !dh.was_contributory() {
            return Err(CryptoError::InvalidKey("non-contributory x25519 point"));
        }
        kdf(dh.as_bytes(), &ciphertext.0, &self.public)
    }
}

/// Generate a fresh secret and encapsulate it under `recipient`.
pub fn encapsulate(recipient: &[u8; 32]) -> Result<(KemCiphertext, SharedSecret), CryptoError> {
    let ephemeral = KemKeyPair::generate()?;
    let static_secret = StaticSecret::from(*ephemeral.secret.as_bytes());
    let dh = static_secret.diffie_hellman(&PublicKey::from(*recipient));
    if !dh.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory x25519 point"));
    }
    let shared = kdf(dh.as_bytes(), &ephemeral.public, recipient)?;
    Ok((KemCiphertext(ephemeral.public), shared))
}

fn kdf(dh: &[u8; 32], ciphertext: &[u8; 32], recipient: &[u8; 32]) -> Result<SharedSecret, CryptoError> {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(dh);
    ikm[32..64].copy_from_slice(ciphertext);
    ikm[64..].copy_from_slice(recipient);

    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(None, &ikm)
        .expand(KEM_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(Secret::from_bytes(okm))
}
