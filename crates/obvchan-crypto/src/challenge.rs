//! Typed challenges and their randomized Ed25519 responses.
//!
//! A response is `nonce(32) || ed25519(prefix || nonce || challenge)`. The
//! nonce makes two responses to the same challenge distinct, which the
//! replay guard relies on.

use obvchan_protocol::{CryptoIdentity, Uid};
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::rng::random_array;

const CHALLENGE_PREFIX: &[u8] = b"obvchan/challenge/v1";
const NONCE_LEN: usize = 32;

/// Length of a challenge response.
pub const RESPONSE_LEN: usize = NONCE_LEN + 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Challenge {
    /// Signed by `second_identity` on `second_device`: "I trust you and hold no
    /// channel with you".
    ChannelCreation {
        first_device: Uid,
        second_device: Uid,
        first_identity: CryptoIdentity,
        second_identity: CryptoIdentity,
    },
    /// Binds a pre-key wrapped message key to its sender.
    PreKeyMessage {
        prekey_id: [u8; 16],
        to_device: Uid,
        message_key_digest: [u8; 32],
    },
}

impl Challenge {
    /// Challenge a pre-key sender signs over the message key it wrapped.
    pub fn pre_key_message(prekey_id: [u8; 16], to_device: Uid, message_key: &[u8; 32]) -> Self {
        let mut message_key_digest = [0u8; 32];
        message_key_digest.copy_from_slice(&Sha256::digest(message_key));
        Challenge::PreKeyMessage {
            prekey_id,
            to_device,
            message_key_digest,
        }
    }

    fn signed_bytes(&self, nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let encoded = postcard::to_allocvec(self)?;
        let mut bytes = Vec::with_capacity(CHALLENGE_PREFIX.len() + nonce.len() + encoded.len());
        bytes.extend_from_slice(CHALLENGE_PREFIX);
        bytes.extend_from_slice(nonce);
        bytes.extend_from_slice(&encoded);
        Ok(bytes)
    }

    /// Answer the challenge as `signer`.
    pub fn solve(&self, signer: &IdentityKeyPair) -> Result<Vec<u8>, CryptoError> {
        let nonce: [u8; NONCE_LEN] = random_array()?;
        let signature = signer.sign(&self.signed_bytes(&nonce)?)?;

        let mut response = Vec::with_capacity(RESPONSE_LEN);
        response.extend_from_slice(&nonce);
        response.extend_from_slice(&signature);
        Ok(response)
    }
}

/// Check that `response` answers `challenge` and was produced by `signer`.
pub fn verify_challenge(response: &[u8], challenge: &Challenge, signer: &CryptoIdentity) -> bool {
    if response.len() != RESPONSE_LEN {
        return false;
    }
    let (nonce, signature) = response.split_at(NONCE_LEN);
    let Ok(message) = challenge.signed_bytes(nonce) else {
        return false;
    };
    UnparsedPublicKey::new(&ED25519, signer.signing_key)
        .verify(&message, signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use obvchan_protocol::UID_LEN;

    fn channel_creation(a: &CryptoIdentity, b: &CryptoIdentity) -> Challenge {
        Challenge::ChannelCreation {
            first_device: Uid([1u8; UID_LEN]),
            second_device: Uid([2u8; UID_LEN]),
            first_identity: *a,
            second_identity: *b,
        }
    }

    #[test]
    fn solve_and_verify() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let challenge = channel_creation(&bob.public(), &alice.public());

        let response = challenge.solve(&alice).unwrap();
        assert_eq!(response.len(), RESPONSE_LEN);
        assert!(verify_challenge(&response, &challenge, &alice.public()));
    }

    #[test]
    fn wrong_signer_or_challenge_fails() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let challenge = channel_creation(&bob.public(), &alice.public());
        let response = challenge.solve(&alice).unwrap();

        assert!(!verify_challenge(&response, &challenge, &bob.public()));
        // Swapped roles are a different challenge.
        let swapped = channel_creation(&alice.public(), &bob.public());
        assert!(!verify_challenge(&response, &swapped, &alice.public()));
        assert!(!verify_challenge(&response[1..], &challenge, &alice.public()));
    }

    #[test]
    fn responses_are_randomized() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let challenge = channel_creation(&bob.public(), &alice.public());
        let first = challenge.solve(&alice).unwrap();
        let second = challenge.solve(&alice).unwrap();
        assert_ne!(first, second);
        assert!(verify_challenge(&second, &challenge, &alice.public()));
    }
}
