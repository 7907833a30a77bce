use serde::{Deserialize, Serialize};

use crate::types::*;

/// Encrypted message as handed over by the relay server.
///
/// Immutable once received. `wrapped_key` hides a fresh per-message key under
/// one of the device's key materials (ratchet channel, pre-key, or the
/// identity's one-shot asymmetric key); `encrypted_content` is sealed with
/// that message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Device the sender addressed this envelope to.
    pub to_device: Uid,
    pub wrapped_key: Vec<u8>,
    pub encrypted_content: Vec<u8>,
    /// Server time (ms since epoch) at which the sender uploaded the envelope.
    pub upload_timestamp: u64,
    /// Server time (ms since epoch) at which this device fetched it.
    pub download_timestamp: u64,
    /// Attachment count announced by the server, independent of the content.
    pub known_attachment_count: u32,
    /// Whether an extended payload accompanies the message.
    #[serde(default)]
    pub has_extended_payload: bool,
}

/// Envelope produced by the local outbox, before the server stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub to_identity: CryptoIdentity,
    pub to_device: Uid,
    pub wrapped_key: Vec<u8>,
    pub encrypted_content: Vec<u8>,
    pub attachment_count: u32,
    pub has_extended_payload: bool,
}

impl OutboundEnvelope {
    /// Stamp the envelope the way the relay server does on delivery.
    pub fn into_inbound(self, upload_timestamp: u64, download_timestamp: u64) -> Envelope {
        Envelope {
            to_device: self.to_device,
            wrapped_key: self.wrapped_key,
            encrypted_content: self.encrypted_content,
            upload_timestamp,
            download_timestamp,
            known_attachment_count: self.attachment_count,
            has_extended_payload: self.has_extended_payload,
        }
    }
}

/// Plaintext carried inside an envelope.
///
/// Only `Protocol` and `Application` may arrive from the network; the other
/// variants exist for local routing and are rejected on reception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    Protocol(ProtocolMessage),
    Application(ApplicationMessage),
    Dialog(DialogMessage),
    ServerQuery(ServerQuery),
    ServerResponse(ServerResponse),
}

/// A message addressed to one protocol instance.
///
/// `body` is the postcard encoding of the protocol-specific message enum; its
/// variant is the message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub protocol: ProtocolKind,
    pub instance_id: InstanceId,
    pub body: Vec<u8>,
}

/// A user-level message, delivered to the application once decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub payload: Vec<u8>,
    pub attachments: Vec<AttachmentDescriptor>,
}

/// What the attachment download machinery needs to fetch and open one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub key: [u8; 32],
    pub length: u64,
    pub metadata: Vec<u8>,
}

/// A prompt or notice shown to the owner of a protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    pub protocol: ProtocolKind,
    pub instance_id: InstanceId,
    pub category: DialogCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogCategory {
    /// The contact invited us to a one-to-one discussion; awaits a decision.
    AcceptOneToOneInvitation { contact: CryptoIdentity },
    /// Our own invitation is pending on the contact's side.
    OneToOneInvitationSent { contact: CryptoIdentity },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerQuery {
    pub protocol: ProtocolKind,
    pub instance_id: InstanceId,
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub protocol: ProtocolKind,
    pub instance_id: InstanceId,
    pub response: Vec<u8>,
}
