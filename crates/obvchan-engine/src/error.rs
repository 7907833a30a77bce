use obvchan_crypto::CryptoError;
use obvchan_protocol::{CryptoIdentity, Uid, WireError};
use thiserror::Error;
use uuid::Uuid;

use crate::store::InstanceKey;

/// Errors raised by the protocol store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("flow {flow_id} conflicted with a concurrent commit")]
    CommitConflict { flow_id: Uuid },

    #[error("protocol instance already exists: {0:?}")]
    InstanceAlreadyExists(InstanceKey),

    #[error("protocol instance not found: {0:?}")]
    InstanceNotFound(InstanceKey),

    #[error("a channel with {remote_identity} on device {remote_device} already exists")]
    ChannelAlreadyExists {
        remote_identity: CryptoIdentity,
        remote_device: Uid,
    },

    #[error("no channel with {remote_identity} on device {remote_device}")]
    ChannelNotFound {
        remote_identity: CryptoIdentity,
        remote_device: Uid,
    },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors surfaced by the identity collaborator.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown owned identity: {0}")]
    UnknownOwnedIdentity(CryptoIdentity),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the network collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport failure: {0}")]
    Other(String),
}

/// Failure of a protocol step. Aborts the enclosing flow.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("no usable channel to {to} among {devices} device(s)")]
    NoUsableChannel { to: CryptoIdentity, devices: usize },

    #[error("message cannot be posted on this channel: {0}")]
    UnexpectedMessage(&'static str),

    #[error("step returned a state it does not declare: {0}")]
    UndeclaredTransition(String),

    #[error("state belongs to another protocol")]
    ForeignState,

    #[error("step invoked on mismatched input: {0}")]
    Mismatch(&'static str),
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol manager built without a {0} delegate")]
    MissingDelegate(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("step failed: {0}")]
    Step(#[from] StepError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("flow gave up after {attempts} conflicting commits")]
    RetriesExhausted { attempts: u32 },

    #[error("envelope is not an application message")]
    NotAnApplicationMessage,
}
