//! Channel seed derivation and the per-message keys derived from it.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use obvchan_protocol::Uid;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::kem::SharedSecret;
use crate::secret::Secret;

const SEED_SALT: &[u8] = b"obvchan/seed/v1";
const SEED_INFO: &[u8] = b"oblivious channel seed";
const CHAIN_INFO: &[u8] = b"obvchan/chain";
const EXTENDED_PAYLOAD_INFO: &[u8] = b"extended payload";

/// Length of the chain tag that prefixes every ratchet-wrapped key.
pub const CHAIN_TAG_LEN: usize = 16;

/// Shared secret both devices install a channel from.
pub type Seed = Secret<32>;

/// Direction-specific root of the per-message keys.
pub type ChainKey = Secret<32>;

/// Derive the channel seed. The order is fixed: `k1` is the secret
/// encapsulated by the device not in charge, `k2` the one encapsulated by the
/// device in charge.
pub fn derive_seed(k1: &SharedSecret, k2: &SharedSecret) -> Result<Seed, CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(k1.as_bytes());
    ikm[32..].copy_from_slice(k2.as_bytes());

    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(SEED_SALT), &ikm)
        .expand(SEED_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(Secret::from_bytes(okm))
}

/// Chain used by `sender` to send to `receiver` over a channel built from `seed`.
pub fn chain_key(seed: &Seed, sender: &Uid, receiver: &Uid) -> Result<ChainKey, CryptoError> {
    let mut info = Vec::with_capacity(CHAIN_INFO.len() + 64);
    info.extend_from_slice(CHAIN_INFO);
    info.extend_from_slice(sender.as_bytes());
    info.extend_from_slice(receiver.as_bytes());

    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::from_prk(seed.as_bytes())
        .map_err(|_| CryptoError::KeyDerivation)?
        .expand(&info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(Secret::from_bytes(okm))
}

fn hmac(key: &ChainKey, parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::KeyDerivation)?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Public tag identifying a chain without revealing it.
pub fn chain_tag(chain: &ChainKey) -> Result<[u8; CHAIN_TAG_LEN], CryptoError> {
    let full = hmac(chain, &[b"tag"])?;
    let mut tag = [0u8; CHAIN_TAG_LEN];
    tag.copy_from_slice(&full[..CHAIN_TAG_LEN]);
    Ok(tag)
}

/// Key wrapping the message key of message number `counter` on `chain`.
pub fn ratchet_key(chain: &ChainKey, counter: u64) -> Result<Secret<32>, CryptoError> {
    Ok(Secret::from_bytes(hmac(
        chain,
        &[b"message", &counter.to_be_bytes()],
    )?))
}

/// Key for the extended payload that travels beside a message sealed with
/// `message_key`.
pub fn extended_payload_key(message_key: &Secret<32>) -> Result<Secret<32>, CryptoError> {
    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(None, message_key.as_bytes())
        .expand(EXTENDED_PAYLOAD_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(Secret::from_bytes(okm))
}
