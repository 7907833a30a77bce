use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a device UID in bytes.
pub const UID_LEN: usize = 32;

fn write_short_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes.iter().take(4) {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Fixed-length random identifier of one physical device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub [u8; UID_LEN]);

impl Uid {
    pub fn from_bytes(bytes: [u8; UID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid(")?;
        write_short_hex(f, &self.0)?;
        write!(f, "..)")
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.0)
    }
}

/// Public half of a long-term identity.
///
/// The derived `Ord` is lexicographic on (signing key, encryption key) and is
/// part of the channel-creation tie-break, so field order matters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CryptoIdentity {
    /// 32-byte Ed25519 public key, verifies challenge signatures.
    pub signing_key: [u8; 32],
    /// 32-byte X25519 public key, target of one-shot asymmetric messages.
    pub encryption_key: [u8; 32],
}

impl CryptoIdentity {
    /// Canonical byte form used inside signed challenges.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing_key);
        out[32..].copy_from_slice(&self.encryption_key);
        out
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoIdentity(")?;
        write_short_hex(f, &self.signing_key)?;
        write!(f, "..)")
    }
}

impl fmt::Display for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.signing_key)
    }
}

/// 128-bit random identifier of a running protocol instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every multi-step protocol the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    ChannelCreationWithContactDevice,
    DeviceCapabilitiesDiscovery,
    OneToOneInvitation,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(first: u8) -> CryptoIdentity {
        let mut signing_key = [0u8; 32];
        signing_key[0] = first;
        CryptoIdentity {
            signing_key,
            encryption_key: [9u8; 32],
        }
    }

    #[test]
    fn device_then_identity_ordering() {
        let small_device = Uid([1u8; UID_LEN]);
        let big_device = Uid([2u8; UID_LEN]);

        // Device UID dominates even when the identity order is reversed.
        assert!((small_device, identity(9)) < (big_device, identity(1)));
        // Equal device UIDs fall back on the identity.
        assert!((small_device, identity(1)) < (small_device, identity(9)));
    }

    #[test]
    fn identity_bytes_layout() {
        let id = identity(7);
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[32..], &[9u8; 32]);
    }

    #[test]
    fn display_is_short_hex() {
        let uid = Uid([0xab; UID_LEN]);
        assert_eq!(uid.to_string(), "abababab");
        assert_eq!(format!("{:?}", uid), "Uid(abababab..)");
    }

    #[test]
    fn instance_ids_are_random() {
        assert_ne!(InstanceId::random(), InstanceId::random());
    }
}
