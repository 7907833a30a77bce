//! Encrypted persistence for engine state.
//!
//! PBKDF2 + AES-256-GCM over a postcard encoding, with a magic/version
//! header bound as associated data.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::rng::random_array;

const MAGIC: &[u8; 4] = b"OBVS"; // "OBliVious State"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes
const PBKDF2_ITERATIONS: u32 = 600_000;

/// Derive a 256-bit AES-GCM key from password and salt.
fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<LessSafeKey, CryptoError> {
    let iterations =
        NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(CryptoError::InvalidKey("pbkdf2 iterations"))?;
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key_bytes[..],
    );
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
        .map_err(|_| CryptoError::InvalidKey("aes-256 key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn header_aad() -> [u8; 5] {
    let mut aad_bytes = [0u8; 5];
    aad_bytes[..4].copy_from_slice(MAGIC);
    aad_bytes[4] = VERSION;
    aad_bytes
}

/// Encrypt any serializable state to a binary blob for disk storage.
///
/// Blob format: [OBVS magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub fn seal_blob<T: Serialize>(value: &T, password: &str) -> Result<Vec<u8>, CryptoError> {
    let plaintext = postcard::to_allocvec(value)?;

    let salt: [u8; SALT_LEN] = random_array()?;
    let nonce_bytes: [u8; NONCE_LEN] = random_array()?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext;
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&header_aad()),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Encryption)?;

    let payload_len = in_out.len() as u32;
    let mut blob = Vec::with_capacity(HEADER_LEN + in_out.len());
    blob.extend_from_slice(MAGIC);
    blob.push(VERSION);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&payload_len.to_be_bytes());
    blob.extend_from_slice(&in_out);

    Ok(blob)
}

/// Decrypt state sealed by [`seal_blob`].
pub fn open_blob<T: DeserializeOwned>(blob: &[u8], password: &str) -> Result<T, CryptoError> {
    if blob.len() < HEADER_LEN {
        return Err(CryptoError::InvalidBlob("blob too short"));
    }
    if &blob[0..4] != MAGIC {
        return Err(CryptoError::InvalidBlob("expected OBVS header"));
    }
    if blob[4] != VERSION {
        return Err(CryptoError::InvalidBlob("unsupported version"));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&blob[5..5 + SALT_LEN]);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&blob[37..37 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&blob[49..53]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if blob.len() < HEADER_LEN + payload_len {
        return Err(CryptoError::InvalidBlob("blob truncated"));
    }

    let key = derive_key(password, &salt)?;
    let mut ciphertext = blob[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&header_aad()),
            &mut ciphertext,
        )
        .map_err(|_| CryptoError::Decryption)?;

    Ok(postcard::from_bytes(plaintext)?)
}

/// Check if a blob starts with a valid OBVS header.
pub fn has_valid_header(blob: &[u8]) -> bool {
    blob.len() >= HEADER_LEN && &blob[0..4] == MAGIC && blob[4] == VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let state = vec![(1u32, "pending".to_string()), (2, "confirmed".to_string())];
        let blob = seal_blob(&state, "hunter2").unwrap();
        assert!(has_valid_header(&blob));
        let restored: Vec<(u32, String)> = open_blob(&blob, "hunter2").unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn wrong_password_fails() {
        let blob = seal_blob(&42u64, "right").unwrap();
        assert!(matches!(
            open_blob::<u64>(&blob, "wrong"),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut blob = seal_blob(&42u64, "pw").unwrap();
        blob[0] = b'X';
        assert!(!has_valid_header(&blob));
        assert!(matches!(
            open_blob::<u64>(&blob, "pw"),
            Err(CryptoError::InvalidBlob(_))
        ));
        assert!(open_blob::<u64>(&blob[..10], "pw").is_err());
    }
}
