//! Inbound envelope decryption.
//!
//! The wrapped key of an envelope is offered to each [`KeyUnwrapper`] in a
//! fixed order (ratchet channels, then pre-keys, then the owned identity key)
//! until one recovers the message key. Unwrappers only read the database, so
//! decrypting the same envelope twice gives the same answer. The content is
//! then opened and routed: protocol messages to the step engine, application
//! messages back to the caller once the sender is resolved to a contact.

use obvchan_crypto::prekey::PREKEY_ID_LEN;
use obvchan_crypto::seed::extended_payload_key;
use obvchan_crypto::{aead, Challenge, Secret};
use obvchan_protocol::codec::decode_channel_message;
use obvchan_protocol::{
    ApplicationMessage, AttachmentDescriptor, ChannelMessage, CryptoIdentity, Envelope, Uid,
};
use tracing::{debug, error, trace, warn};

use crate::context::{ObvContext, ReceptionChannelInfo};
use crate::delegates::IdentityDelegate;
use crate::error::EngineError;
use crate::manager::ProtocolManager;
use crate::outbox::{prekey_wrap_aad, PreKeyWrap, ASYMMETRIC_WRAP_AAD, CONTENT_AAD};
use crate::protocol::DispatchOutcome;
use crate::store::Database;

/// Unwrap strategies, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnwrapKind {
    RatchetChannel,
    PreKey,
    Asymmetric,
}

/// A recovered message key and the channel it came through.
#[derive(Debug)]
pub struct UnwrappedKey {
    pub message_key: Secret<32>,
    pub origin: ReceptionChannelInfo,
}

#[derive(Debug)]
pub enum UnwrapAttempt {
    Unwrapped(UnwrappedKey),
    NotForThisKey,
    /// The key opened, but it belongs to a contact we no longer trust.
    ContactRevoked,
}

pub trait KeyUnwrapper: Send + Sync {
    fn kind(&self) -> UnwrapKind;

    fn try_unwrap(
        &self,
        db: &Database,
        identity: &dyn IdentityDelegate,
        owner: &CryptoIdentity,
        envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError>;
}

fn revoked(
    identity: &dyn IdentityDelegate,
    owner: &CryptoIdentity,
    remote: &CryptoIdentity,
) -> Result<bool, EngineError> {
    Ok(identity.is_contact(owner, remote)? && !identity.is_active(owner, remote)?)
}

/// Keys wrapped on one of our oblivious channels.
pub struct RatchetChannelUnwrapper;

impl KeyUnwrapper for RatchetChannelUnwrapper {
    fn kind(&self) -> UnwrapKind {
        UnwrapKind::RatchetChannel
    }

    fn try_unwrap(
        &self,
        db: &Database,
        identity: &dyn IdentityDelegate,
        owner: &CryptoIdentity,
        envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError> {
        let Some(unwrapped) = db.channels.unwrap(&envelope.to_device, &envelope.wrapped_key)? else {
            return Ok(UnwrapAttempt::NotForThisKey);
        };
        if revoked(identity, owner, &unwrapped.key.remote_identity)? {
            return Ok(UnwrapAttempt::ContactRevoked);
        }
        Ok(UnwrapAttempt::Unwrapped(UnwrappedKey {
            origin: ReceptionChannelInfo::ObliviousChannel {
                remote_identity: unwrapped.key.remote_identity,
                remote_device: unwrapped.key.remote_device,
                confirmed: unwrapped.confirmed,
            },
            message_key: unwrapped.message_key,
        }))
    }
}

/// Keys sealed to a pre-key one of our devices published.
pub struct PreKeyUnwrapper;

impl KeyUnwrapper for PreKeyUnwrapper {
    fn kind(&self) -> UnwrapKind {
        UnwrapKind::PreKey
    }

    fn try_unwrap(
        &self,
        db: &Database,
        identity: &dyn IdentityDelegate,
        owner: &CryptoIdentity,
        envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError> {
        let wrapped = &envelope.wrapped_key;
        if wrapped.len() <= PREKEY_ID_LEN {
            return Ok(UnwrapAttempt::NotForThisKey);
        }
        let mut id = [0u8; PREKEY_ID_LEN];
        id.copy_from_slice(&wrapped[..PREKEY_ID_LEN]);
        let Some(entry) = db.prekeys.find(&envelope.to_device, &id) else {
            return Ok(UnwrapAttempt::NotForThisKey);
        };
        // The server timestamps the upload; a pre-key is honoured for
        // anything uploaded before it expired.
        if !entry.prekey.is_valid_at(envelope.upload_timestamp) {
            debug!(device = %envelope.to_device, "envelope uploaded after its pre-key expired");
            return Ok(UnwrapAttempt::NotForThisKey);
        }
        let aad = prekey_wrap_aad(&envelope.to_device);
        let Ok(opened) = entry.prekey.open(&aad, &wrapped[PREKEY_ID_LEN..]) else {
            return Ok(UnwrapAttempt::NotForThisKey);
        };
        let wrap: PreKeyWrap = match postcard::from_bytes(&opened) {
            Ok(wrap) => wrap,
            Err(e) => {
                warn!(device = %envelope.to_device, "undecodable pre-key wrap: {}", e);
                return Ok(UnwrapAttempt::NotForThisKey);
            }
        };
        let challenge = Challenge::pre_key_message(id, envelope.to_device, &wrap.message_key);
        if !identity.check_signature(&wrap.signature, &challenge, &wrap.sender) {
            warn!(sender = %wrap.sender, "pre-key wrap carries a bad signature");
            return Ok(UnwrapAttempt::NotForThisKey);
        }
        if revoked(identity, owner, &wrap.sender)? {
            return Ok(UnwrapAttempt::ContactRevoked);
        }
        Ok(UnwrapAttempt::Unwrapped(UnwrappedKey {
            message_key: Secret::from_bytes(wrap.message_key),
            origin: ReceptionChannelInfo::PreKeyChannel {
                remote_identity: wrap.sender,
                remote_device: wrap.sender_device,
            },
        }))
    }
}

/// Keys sealed to the owned identity's public encryption key.
pub struct AsymmetricUnwrapper;

impl KeyUnwrapper for AsymmetricUnwrapper {
    fn kind(&self) -> UnwrapKind {
        UnwrapKind::Asymmetric
    }

    fn try_unwrap(
        &self,
        _db: &Database,
        identity: &dyn IdentityDelegate,
        owner: &CryptoIdentity,
        envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError> {
        let Some(opened) =
            identity.open_with_identity_key(owner, ASYMMETRIC_WRAP_AAD, &envelope.wrapped_key)?
        else {
            return Ok(UnwrapAttempt::NotForThisKey);
        };
        let Ok(message_key) = <[u8; 32]>::try_from(opened.as_slice()) else {
            debug!(len = opened.len(), "asymmetric wrap holds a key of the wrong length");
            return Ok(UnwrapAttempt::NotForThisKey);
        };
        Ok(UnwrapAttempt::Unwrapped(UnwrappedKey {
            message_key: Secret::from_bytes(message_key),
            origin: ReceptionChannelInfo::AsymmetricChannel,
        }))
    }
}

/// Ordered set of unwrappers.
pub struct Decryptor {
    unwrappers: Vec<Box<dyn KeyUnwrapper>>,
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::with_unwrappers(vec![
            Box::new(RatchetChannelUnwrapper),
            Box::new(PreKeyUnwrapper),
            Box::new(AsymmetricUnwrapper),
        ])
    }
}

impl Decryptor {
    /// Unwrappers are sorted by [`UnwrapKind`] whatever order they come in.
    pub fn with_unwrappers(mut unwrappers: Vec<Box<dyn KeyUnwrapper>>) -> Self {
        unwrappers.sort_by_key(|unwrapper| unwrapper.kind());
        Self { unwrappers }
    }

    pub fn order(&self) -> Vec<UnwrapKind> {
        self.unwrappers.iter().map(|unwrapper| unwrapper.kind()).collect()
    }

    pub fn unwrap(
        &self,
        db: &Database,
        identity: &dyn IdentityDelegate,
        owner: &CryptoIdentity,
        envelope: &Envelope,
    ) -> Result<UnwrapAttempt, EngineError> {
        for unwrapper in &self.unwrappers {
            match unwrapper.try_unwrap(db, identity, owner, envelope)? {
                UnwrapAttempt::NotForThisKey => continue,
                UnwrapAttempt::Unwrapped(key) => {
                    trace!(kind = ?unwrapper.kind(), "message key unwrapped");
                    return Ok(UnwrapAttempt::Unwrapped(key));
                }
                UnwrapAttempt::ContactRevoked => {
                    warn!(kind = ?unwrapper.kind(), device = %envelope.to_device, "message from a revoked contact");
                    return Ok(UnwrapAttempt::ContactRevoked);
                }
            }
        }
        Ok(UnwrapAttempt::NotForThisKey)
    }
}

/// An application message whose sender is a known contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedApplicationMessage {
    pub owner: CryptoIdentity,
    pub remote_identity: CryptoIdentity,
    pub remote_device: Uid,
    pub payload: Vec<u8>,
    pub attachments: Vec<AttachmentDescriptor>,
    /// Key of the extended payload, when the envelope announces one.
    pub extended_payload_key: Option<Secret<32>>,
    pub upload_timestamp: u64,
    pub download_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecryptionOutcome {
    ProtocolMessageProcessed(DispatchOutcome),
    RemoteIdentityResolved(ResolvedApplicationMessage),
    UnwrapSucceededButRemoteUnknown { remote_identity: CryptoIdentity },
    ContactRevoked,
    NoKeyCouldUnwrap,
    CouldNotParse,
    UnexpectedMessageType,
}

struct Opened {
    owner: CryptoIdentity,
    origin: ReceptionChannelInfo,
    message_key: Secret<32>,
}

fn message_type(message: &ChannelMessage) -> &'static str {
    match message {
        ChannelMessage::Protocol(_) => "protocol",
        ChannelMessage::Application(_) => "application",
        ChannelMessage::Dialog(_) => "dialog",
        ChannelMessage::ServerQuery(_) => "server query",
        ChannelMessage::ServerResponse(_) => "server response",
    }
}

impl ProtocolManager {
    /// Unwrap and open `envelope`, or say why it could not be.
    fn open_envelope(
        &self,
        db: &Database,
        envelope: &Envelope,
    ) -> Result<Result<(Opened, ChannelMessage), DecryptionOutcome>, EngineError> {
        let Some(owner) = self.identity.owner_of_device(&envelope.to_device)? else {
            warn!(device = %envelope.to_device, "envelope for a device we do not own");
            return Ok(Err(DecryptionOutcome::NoKeyCouldUnwrap));
        };
        let key = match self.decryptor.unwrap(db, &*self.identity, &owner, envelope)? {
            UnwrapAttempt::Unwrapped(key) => key,
            UnwrapAttempt::ContactRevoked => return Ok(Err(DecryptionOutcome::ContactRevoked)),
            UnwrapAttempt::NotForThisKey => {
                debug!(device = %envelope.to_device, "no key could unwrap the envelope");
                return Ok(Err(DecryptionOutcome::NoKeyCouldUnwrap));
            }
        };
        let message = aead::open(key.message_key.as_bytes(), CONTENT_AAD, &envelope.encrypted_content)
            .ok()
            .and_then(|plaintext| decode_channel_message(&plaintext).ok());
        let Some(message) = message else {
            error!(device = %envelope.to_device, origin = ?key.origin, "unwrapped key does not open the content");
            return Ok(Err(DecryptionOutcome::CouldNotParse));
        };
        let opened = Opened {
            owner,
            origin: key.origin,
            message_key: key.message_key,
        };
        Ok(Ok((opened, message)))
    }

    fn resolve_application_message(
        &self,
        envelope: &Envelope,
        opened: Opened,
        message: ApplicationMessage,
    ) -> Result<DecryptionOutcome, EngineError> {
        if message.attachments.len() != envelope.known_attachment_count as usize {
            error!(
                announced = envelope.known_attachment_count,
                carried = message.attachments.len(),
                "attachment count does not match the envelope"
            );
            // Debug builds stop on the fault; this crate's own tests observe the outcome.
            #[cfg(not(test))]
            debug_assert_eq!(
                message.attachments.len(),
                envelope.known_attachment_count as usize,
                "attachment count does not match the envelope"
            );
            return Ok(DecryptionOutcome::CouldNotParse);
        }
        let (remote_identity, remote_device) = match opened.origin {
            ReceptionChannelInfo::ObliviousChannel {
                remote_identity,
                remote_device,
                confirmed: true,
            }
            | ReceptionChannelInfo::PreKeyChannel {
                remote_identity,
                remote_device,
            } => (remote_identity, remote_device),
            origin => {
                warn!(?origin, "application message on a channel that cannot carry one");
                return Ok(DecryptionOutcome::UnexpectedMessageType);
            }
        };
        if !self.identity.is_contact(&opened.owner, &remote_identity)? {
            debug!(remote = %remote_identity, "application message from a non-contact");
            return Ok(DecryptionOutcome::UnwrapSucceededButRemoteUnknown { remote_identity });
        }
        let extended_payload_key = if envelope.has_extended_payload {
            Some(extended_payload_key(&opened.message_key)?)
        } else {
            None
        };
        Ok(DecryptionOutcome::RemoteIdentityResolved(
            ResolvedApplicationMessage {
                owner: opened.owner,
                remote_identity,
                remote_device,
                payload: message.payload,
                attachments: message.attachments,
                extended_payload_key,
                upload_timestamp: envelope.upload_timestamp,
                download_timestamp: envelope.download_timestamp,
            },
        ))
    }

    /// Decrypt `envelope` inside `ctx` and route what it carries.
    pub fn decrypt_and_dispatch(
        &self,
        ctx: &mut ObvContext,
        envelope: &Envelope,
    ) -> Result<DecryptionOutcome, EngineError> {
        let (opened, message) = match self.open_envelope(ctx.db(), envelope)? {
            Ok(opened) => opened,
            Err(outcome) => return Ok(outcome),
        };
        match message {
            ChannelMessage::Protocol(protocol_message) => {
                let outcome =
                    self.process_received_message(ctx, opened.owner, &protocol_message, opened.origin)?;
                Ok(DecryptionOutcome::ProtocolMessageProcessed(outcome))
            }
            ChannelMessage::Application(application) => {
                self.resolve_application_message(envelope, opened, application)
            }
            other => {
                warn!(kind = message_type(&other), "unexpected message type from the network");
                Ok(DecryptionOutcome::UnexpectedMessageType)
            }
        }
    }

    /// Decrypt an application message without touching engine state.
    pub fn decrypt_application_message(
        &self,
        envelope: &Envelope,
    ) -> Result<ResolvedApplicationMessage, EngineError> {
        let ctx = self.store.begin()?;
        let Ok((opened, message)) = self.open_envelope(ctx.db(), envelope)? else {
            return Err(EngineError::NotAnApplicationMessage);
        };
        let ChannelMessage::Application(application) = message else {
            return Err(EngineError::NotAnApplicationMessage);
        };
        match self.resolve_application_message(envelope, opened, application)? {
            DecryptionOutcome::RemoteIdentityResolved(resolved) => Ok(resolved),
            _ => Err(EngineError::NotAnApplicationMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obvchan_protocol::UID_LEN;

    struct Fixed(UnwrapKind);

    impl KeyUnwrapper for Fixed {
        fn kind(&self) -> UnwrapKind {
            self.0
        }

        fn try_unwrap(
            &self,
            _db: &Database,
            _identity: &dyn IdentityDelegate,
            _owner: &CryptoIdentity,
            _envelope: &Envelope,
        ) -> Result<UnwrapAttempt, EngineError> {
            Ok(UnwrapAttempt::NotForThisKey)
        }
    }

    #[test]
    fn unwrappers_are_ordered_by_kind() {
        let decryptor = Decryptor::with_unwrappers(vec![
            Box::new(Fixed(UnwrapKind::Asymmetric)),
            Box::new(Fixed(UnwrapKind::RatchetChannel)),
            Box::new(Fixed(UnwrapKind::PreKey)),
        ]);
        assert_eq!(
            decryptor.order(),
            vec![UnwrapKind::RatchetChannel, UnwrapKind::PreKey, UnwrapKind::Asymmetric]
        );
        assert_eq!(Decryptor::default().order(), decryptor.order());
    }

    #[test]
    fn short_wrapped_keys_are_not_prekey_wraps() {
        let directory = crate::memory::MemoryIdentityDirectory::new();
        let envelope = Envelope {
            to_device: Uid([1u8; UID_LEN]),
            wrapped_key: vec![0u8; PREKEY_ID_LEN],
            encrypted_content: vec![],
            upload_timestamp: 0,
            download_timestamp: 0,
            known_attachment_count: 0,
            has_extended_payload: false,
        };
        let owner = CryptoIdentity {
            signing_key: [1u8; 32],
            encryption_key: [1u8; 32],
        };
        let attempt = PreKeyUnwrapper
            .try_unwrap(&Database::default(), &directory, &owner, &envelope)
            .unwrap();
        assert!(matches!(attempt, UnwrapAttempt::NotForThisKey));
    }
}
