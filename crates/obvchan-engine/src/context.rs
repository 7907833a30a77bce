//! The transactional context a flow runs in.
//!
//! Everything a flow does is staged on its [`ObvContext`]: database edits on
//! a private copy, outbound envelopes, dialogs, local messages and identity
//! updates. Nothing leaves the context before the store accepts the commit.

use obvchan_crypto::PublishedPreKey;
use obvchan_protocol::{CryptoIdentity, DialogMessage, OutboundEnvelope, ProtocolMessage, Uid};
use uuid::Uuid;

use crate::delegates::IdentityUpdate;
use crate::store::Database;
use crate::unix_millis;

/// How a message is to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendChannel {
    /// Loop back into this device's own engine, after commit.
    Local { owner: CryptoIdentity },
    /// One-shot encryption to the contact's identity key, for each device.
    AsymmetricBroadcast { to: CryptoIdentity, device_uids: Vec<Uid> },
    /// Over established channels with the listed devices of `to`.
    Oblivious {
        owner: CryptoIdentity,
        owner_device: Uid,
        to: CryptoIdentity,
        device_uids: Vec<Uid>,
        must_be_confirmed: bool,
    },
    /// To one device through a pre-key it published.
    PreKey {
        owner: CryptoIdentity,
        owner_device: Uid,
        to: CryptoIdentity,
        device_uid: Uid,
        prekey: PublishedPreKey,
    },
    /// To the owner's user interface.
    UserInterface { owner: CryptoIdentity },
}

/// How a message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionChannelInfo {
    Local,
    AsymmetricChannel,
    ObliviousChannel {
        remote_identity: CryptoIdentity,
        remote_device: Uid,
        confirmed: bool,
    },
    PreKeyChannel {
        remote_identity: CryptoIdentity,
        remote_device: Uid,
    },
}

impl ReceptionChannelInfo {
    pub fn remote(&self) -> Option<(CryptoIdentity, Uid)> {
        match self {
            Self::ObliviousChannel {
                remote_identity,
                remote_device,
                ..
            }
            | Self::PreKeyChannel {
                remote_identity,
                remote_device,
            } => Some((*remote_identity, *remote_device)),
            Self::Local | Self::AsymmetricChannel => None,
        }
    }
}

/// Side effects released once a flow commits.
#[derive(Debug, Default)]
pub struct FlowEffects {
    pub flow_id: Uuid,
    pub envelopes: Vec<OutboundEnvelope>,
    pub dialogs: Vec<(CryptoIdentity, DialogMessage)>,
    pub local_messages: Vec<(CryptoIdentity, ProtocolMessage)>,
    pub identity_updates: Vec<IdentityUpdate>,
}

impl FlowEffects {
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
            && self.dialogs.is_empty()
            && self.local_messages.is_empty()
            && self.identity_updates.is_empty()
    }
}

pub struct ObvContext {
    flow_id: Uuid,
    base_version: u64,
    db: Database,
    dirty: bool,
    effects: FlowEffects,
    started_at: u64,
}

pub(crate) struct ContextParts {
    pub flow_id: Uuid,
    pub base_version: u64,
    pub db: Database,
    pub dirty: bool,
    pub effects: FlowEffects,
}

impl ObvContext {
    pub(crate) fn new(db: Database, base_version: u64) -> Self {
        let flow_id = Uuid::new_v4();
        Self {
            flow_id,
            base_version,
            db,
            dirty: false,
            effects: FlowEffects {
                flow_id,
                ..FlowEffects::default()
            },
            started_at: unix_millis(),
        }
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    /// Wall-clock time captured when the flow began, in ms since epoch.
    pub fn now_millis(&self) -> u64 {
        self.started_at
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Database {
        self.dirty = true;
        &mut self.db
    }

    pub fn effects(&self) -> &FlowEffects {
        &self.effects
    }

    pub(crate) fn push_envelope(&mut self, envelope: OutboundEnvelope) {
        self.effects.envelopes.push(envelope);
    }

    pub(crate) fn push_dialog(&mut self, owner: CryptoIdentity, dialog: DialogMessage) {
        self.effects.dialogs.push((owner, dialog));
    }

    pub(crate) fn push_local(&mut self, owner: CryptoIdentity, message: ProtocolMessage) {
        self.effects.local_messages.push((owner, message));
    }

    pub(crate) fn stage_identity_update(&mut self, update: IdentityUpdate) {
        self.effects.identity_updates.push(update);
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            flow_id: self.flow_id,
            base_version: self.base_version,
            db: self.db,
            dirty: self.dirty,
            effects: self.effects,
        }
    }
}
