use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RNG failed")]
    Rng,

    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid key or tampered data")]
    Decryption,

    #[error("ciphertext too short: expected at least {expected} bytes, got {got}")]
    CiphertextTooShort { expected: usize, got: usize },

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("signing failed")]
    Signing,

    #[error("invalid blob: {0}")]
    InvalidBlob(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}
