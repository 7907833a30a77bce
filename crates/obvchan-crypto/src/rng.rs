use ring::rand::{SecureRandom, SystemRandom};

use crate::error::CryptoError;

/// Fill a fixed-size array from the system CSPRNG.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let rng = SystemRandom::new();
    let mut out = [0u8; N];
    rng.fill(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}
