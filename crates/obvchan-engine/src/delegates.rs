//! Collaborators the engine consumes but does not own.
//!
//! The identity manager holds owned identities, their private keys and the
//! contact book. The transport hands sealed envelopes to the relay server and
//! dialogs to the user interface.

use obvchan_crypto::{verify_challenge, Challenge};
use obvchan_protocol::{CryptoIdentity, DialogMessage, OutboundEnvelope, Uid};
use uuid::Uuid;

use crate::error::{IdentityError, TransportError};

/// Identity mutation requested by a step.
///
/// Staged on the flow and applied only after the flow commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityUpdate {
    SetOneToOne {
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        one_to_one: bool,
    },
    AddContactDevice {
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        device: Uid,
    },
    SetContactDeviceCapabilities {
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        device: Uid,
        capabilities: Vec<String>,
    },
    SetContactPublishedDetails {
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        details: Vec<u8>,
    },
}

pub trait IdentityDelegate: Send + Sync {
    fn owned_identities(&self) -> Result<Vec<CryptoIdentity>, IdentityError>;

    /// Owned identity whose current device is `device`, if any.
    fn owner_of_device(&self, device: &Uid) -> Result<Option<CryptoIdentity>, IdentityError>;

    fn current_device_uid(&self, owner: &CryptoIdentity) -> Result<Uid, IdentityError>;

    fn is_contact(&self, owner: &CryptoIdentity, contact: &CryptoIdentity)
        -> Result<bool, IdentityError>;

    /// A contact stops being active when it is revoked or blocked.
    fn is_active(&self, owner: &CryptoIdentity, contact: &CryptoIdentity)
        -> Result<bool, IdentityError>;

    fn contact_device_uids(
        &self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Vec<Uid>, IdentityError>;

    fn is_one_to_one(
        &self,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool, IdentityError>;

    fn own_capabilities(&self, owner: &CryptoIdentity) -> Result<Vec<String>, IdentityError>;

    fn published_details(&self, owner: &CryptoIdentity) -> Result<Vec<u8>, IdentityError>;

    /// Sign `challenge` with the private key of `owner`.
    fn solve_challenge(
        &self,
        owner: &CryptoIdentity,
        challenge: &Challenge,
    ) -> Result<Vec<u8>, IdentityError>;

    fn check_signature(
        &self,
        signature: &[u8],
        challenge: &Challenge,
        signer: &CryptoIdentity,
    ) -> bool {
        verify_challenge(signature, challenge, signer)
    }

    /// Open something sealed to the public encryption key of `owner`.
    /// `Ok(None)` when the key does not open it.
    fn open_with_identity_key(
        &self,
        owner: &CryptoIdentity,
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Option<Vec<u8>>, IdentityError>;

    fn apply(&self, update: IdentityUpdate) -> Result<(), IdentityError>;
}

pub trait Transport: Send + Sync {
    fn post_envelope(&self, flow_id: Uuid, envelope: OutboundEnvelope)
        -> Result<(), TransportError>;

    fn post_dialog(&self, owner: &CryptoIdentity, dialog: DialogMessage)
        -> Result<(), TransportError>;
}
