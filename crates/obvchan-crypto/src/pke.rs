//! Public-key encryption: one KEM encapsulation followed by AES-256-GCM.
//!
//! Output layout: `kem ciphertext(32) || aead::seal output`.

use crate::aead;
use crate::error::CryptoError;
use crate::kem::{encapsulate, KemCiphertext, KemKeyPair};

pub const PKE_OVERHEAD: usize = 32 + aead::ENCRYPTION_OVERHEAD;

pub fn seal_to(recipient: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (ciphertext, shared) = encapsulate(recipient)?;
    let sealed = aead::seal(shared.as_bytes(), aad, plaintext)?;
    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(&ciphertext.0);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn open_with(key_pair: &KemKeyPair, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < PKE_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort {
            expected: PKE_OVERHEAD,
            got: sealed.len(),
        });
    }
    let mut ct = [0u8; 32];
    ct.copy_from_slice(&sealed[..32]);
    let shared = key_pair.decapsulate(&KemCiphertext(ct))?;
    aead::open(shared.as_bytes(), aad, &sealed[32..])
}
