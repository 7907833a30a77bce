//! Posting messages from inside a flow.
//!
//! Content is sealed once under a fresh message key; the key is then wrapped
//! per recipient device according to the [`SendChannel`]. Envelopes are only
//! staged here and reach the transport after the flow commits.

use obvchan_crypto::prekey::seal_to_prekey;
use obvchan_crypto::{aead, pke, Challenge, Secret};
use obvchan_protocol::codec::encode_channel_message;
use obvchan_protocol::{ChannelMessage, CryptoIdentity, OutboundEnvelope, Uid, WireError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::context::{ObvContext, SendChannel};
use crate::delegates::IdentityDelegate;
use crate::error::StepError;
use crate::store::ChannelKey;

pub(crate) const CONTENT_AAD: &[u8] = b"obvchan/content/v1";
pub(crate) const ASYMMETRIC_WRAP_AAD: &[u8] = b"obvchan/wrap/asymmetric/v1";
const PREKEY_WRAP_AAD: &[u8] = b"obvchan/wrap/prekey/v1";

/// What a pre-key wrapped key opens to.
#[derive(Serialize, Deserialize)]
pub(crate) struct PreKeyWrap {
    pub message_key: [u8; 32],
    pub sender: CryptoIdentity,
    pub sender_device: Uid,
    pub signature: Vec<u8>,
}

pub(crate) fn prekey_wrap_aad(to_device: &Uid) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PREKEY_WRAP_AAD.len() + 32);
    aad.extend_from_slice(PREKEY_WRAP_AAD);
    aad.extend_from_slice(to_device.as_bytes());
    aad
}

struct SealedContent {
    message_key: Secret<32>,
    content: Vec<u8>,
    attachment_count: u32,
}

impl SealedContent {
    fn seal(message: &ChannelMessage) -> Result<Self, StepError> {
        let attachment_count = match message {
            ChannelMessage::Application(app) => app.attachments.len() as u32,
            _ => 0,
        };
        let message_key = Secret::<32>::random()?;
        let plaintext = encode_channel_message(message)?;
        let content = aead::seal(message_key.as_bytes(), CONTENT_AAD, &plaintext)?;
        Ok(Self {
            message_key,
            content,
            attachment_count,
        })
    }

    fn envelope(&self, to_identity: CryptoIdentity, to_device: Uid, wrapped_key: Vec<u8>) -> OutboundEnvelope {
        OutboundEnvelope {
            to_identity,
            to_device,
            wrapped_key,
            encrypted_content: self.content.clone(),
            attachment_count: self.attachment_count,
            has_extended_payload: false,
        }
    }
}

/// Stage `message` for delivery over `channel`.
pub fn post(
    ctx: &mut ObvContext,
    identity: &dyn IdentityDelegate,
    message: ChannelMessage,
    channel: SendChannel,
) -> Result<(), StepError> {
    match channel {
        SendChannel::Local { owner } => match message {
            ChannelMessage::Protocol(protocol_message) => {
                ctx.push_local(owner, protocol_message);
                Ok(())
            }
            _ => Err(StepError::UnexpectedMessage(
                "only protocol messages loop back locally",
            )),
        },
        SendChannel::UserInterface { owner } => match message {
            ChannelMessage::Dialog(dialog) => {
                ctx.push_dialog(owner, dialog);
                Ok(())
            }
            _ => Err(StepError::UnexpectedMessage(
                "only dialogs go to the user interface",
            )),
        },
        SendChannel::AsymmetricBroadcast { to, device_uids } => {
            if !matches!(message, ChannelMessage::Protocol(_)) {
                return Err(StepError::UnexpectedMessage(
                    "only protocol messages travel asymmetrically",
                ));
            }
            let sealed = SealedContent::seal(&message)?;
            for device in device_uids {
                let wrapped = pke::seal_to(
                    &to.encryption_key,
                    ASYMMETRIC_WRAP_AAD,
                    sealed.message_key.as_bytes(),
                )?;
                ctx.push_envelope(sealed.envelope(to, device, wrapped));
            }
            Ok(())
        }
        SendChannel::Oblivious {
            owner: _,
            owner_device,
            to,
            device_uids,
            must_be_confirmed,
        } => {
            let sealed = SealedContent::seal(&message)?;
            let mut sent = 0;
            for device in &device_uids {
                let key = ChannelKey {
                    owner_device,
                    remote_identity: to,
                    remote_device: *device,
                };
                match ctx.db().channels.get(&key) {
                    Some(channel) if channel.confirmed || !must_be_confirmed => {}
                    Some(_) => {
                        debug!(to = %to, device = %device, "skipping unconfirmed channel");
                        continue;
                    }
                    None => {
                        debug!(to = %to, device = %device, "no channel with device");
                        continue;
                    }
                }
                let wrapped = ctx.db_mut().channels.wrap(&key, &sealed.message_key)?;
                ctx.push_envelope(sealed.envelope(to, *device, wrapped));
                sent += 1;
            }
            if sent == 0 {
                return Err(StepError::NoUsableChannel {
                    to,
                    devices: device_uids.len(),
                });
            }
            trace!(to = %to, sent, "posted over oblivious channels");
            Ok(())
        }
        SendChannel::PreKey {
            owner,
            owner_device,
            to,
            device_uid,
            prekey,
        } => {
            let sealed = SealedContent::seal(&message)?;
            let challenge =
                Challenge::pre_key_message(prekey.id, device_uid, sealed.message_key.as_bytes());
            let signature = identity.solve_challenge(&owner, &challenge)?;
            let wrap = PreKeyWrap {
                message_key: *sealed.message_key.as_bytes(),
                sender: owner,
                sender_device: owner_device,
                signature,
            };
            let plaintext = postcard::to_allocvec(&wrap).map_err(WireError::from)?;
            let wrapped = seal_to_prekey(&prekey, &prekey_wrap_aad(&device_uid), &plaintext)?;
            ctx.push_envelope(sealed.envelope(to, device_uid, wrapped));
            Ok(())
        }
    }
}
