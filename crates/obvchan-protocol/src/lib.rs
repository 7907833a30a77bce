//! Wire-level types shared by every obvchan crate.
//!
//! Identifiers (device UIDs, crypto identities, protocol instance ids), the
//! inbound envelope as delivered by the relay server, the plaintext channel
//! message union carried inside it, and the length-prefixed frame codec.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use error::WireError;
pub use messages::{
    ApplicationMessage, AttachmentDescriptor, ChannelMessage, DialogCategory, DialogMessage,
    Envelope, OutboundEnvelope, ProtocolMessage, ServerQuery, ServerResponse,
};
pub use types::{CryptoIdentity, InstanceId, ProtocolKind, Uid, UID_LEN};
