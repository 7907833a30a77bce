//! obvchan cryptographic layer: the primitives consumed by the channel engine.
//!
//! This crate provides:
//! - Long-term identity key pairs (Ed25519 signing + X25519 encryption)
//! - X25519 key encapsulation (KEM) and public-key encryption built on it
//! - AES-256-GCM authenticated encryption
//! - Typed challenges and their randomized signatures
//! - Order-sensitive seed derivation and per-message ratchet keys
//! - Short-lived pre-keys
//! - Encrypted persistence of engine state

pub mod aead;
pub mod challenge;
pub mod error;
pub mod identity;
pub mod kem;
pub mod persistence;
pub mod pke;
pub mod prekey;
pub mod rng;
pub mod secret;
pub mod seed;

// Re-export key types for convenience
pub use challenge::{verify_challenge, Challenge};
pub use error::CryptoError;
pub use identity::IdentityKeyPair;
pub use kem::{KemCiphertext, KemKeyPair, SharedSecret};
pub use prekey::{PreKey, PublishedPreKey};
pub use secret::Secret;
pub use seed::{derive_seed, Seed};
