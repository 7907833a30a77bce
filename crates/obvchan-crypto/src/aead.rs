//! AES-256-GCM authenticated encryption with random nonces.
//!
//! Every key sealed here is fresh (per-message keys, KEM outputs), so a random
//! 96-bit nonce prepended to the ciphertext is sufficient.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

use crate::error::CryptoError;
use crate::rng::random_array;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Nonce size prepended to every ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Total encryption overhead per sealed message.
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + GCM_TAG_SIZE;

fn to_aead_key(key: &[u8; 32]) -> Result<LessSafeKey, CryptoError> {
    let unbound =
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKey("aes-256 key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// Output layout: `nonce(12) || ciphertext || tag(16)`.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aead_key = to_aead_key(key)?;
    let nonce_bytes: [u8; NONCE_SIZE] = random_array()?;

    let mut in_out = plaintext.to_vec();
    aead_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Decrypt data produced by [`seal`]. `aad` must match the value used on sealing.
pub fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < ENCRYPTION_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort {
            expected: ENCRYPTION_OVERHEAD,
            got: sealed.len(),
        });
    }

    let aead_key = to_aead_key(key)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&sealed[..NONCE_SIZE]);

    let mut in_out = sealed[NONCE_SIZE..].to_vec();
    let plaintext = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Decryption)?;

    Ok(plaintext.to_vec())
}
