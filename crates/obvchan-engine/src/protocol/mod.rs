//! The multi-step protocol engine.
//!
//! A protocol is a finite state machine. Each incoming message is mapped,
//! together with the instance's current state, to at most one step through
//! a static table; the step runs inside the caller's flow and returns the
//! next state. Terminal states delete the instance.

pub mod capabilities;
pub mod channel_creation;
pub mod one_to_one;

use std::fmt;

use obvchan_protocol::{
    ChannelMessage, CryptoIdentity, InstanceId, ProtocolKind, ProtocolMessage, Uid, WireError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::{ObvContext, ReceptionChannelInfo, SendChannel};
use crate::delegates::{IdentityDelegate, IdentityUpdate};
use crate::error::StepError;
use crate::outbox;
use crate::store::InstanceKey;

pub use capabilities::CapabilitiesDiscoveryProtocol;
pub use channel_creation::ChannelCreationProtocol;
pub use one_to_one::OneToOneInvitationProtocol;

/// Persisted state of any protocol instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolState {
    ChannelCreation(channel_creation::State),
    CapabilitiesDiscovery(capabilities::State),
    OneToOneInvitation(one_to_one::State),
}

/// Channel a step requires its message to have arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReception {
    Local,
    Asymmetric,
    AnyOblivious {
        require_confirmed: bool,
    },
    ObliviousFrom {
        identity: CryptoIdentity,
        device: Option<Uid>,
        require_confirmed: bool,
    },
}

impl ExpectedReception {
    pub fn accepts(&self, reception: &ReceptionChannelInfo) -> bool {
        match (self, reception) {
            (Self::Local, ReceptionChannelInfo::Local) => true,
            (Self::Asymmetric, ReceptionChannelInfo::AsymmetricChannel) => true,
            (
                Self::AnyOblivious { require_confirmed },
                ReceptionChannelInfo::ObliviousChannel { confirmed, .. },
            ) => *confirmed || !require_confirmed,
            (
                Self::ObliviousFrom {
                    identity,
                    device,
                    require_confirmed,
                },
                ReceptionChannelInfo::ObliviousChannel {
                    remote_identity,
                    remote_device,
                    confirmed,
                },
            ) => {
                identity == remote_identity
                    && device.map_or(true, |device| device == *remote_device)
                    && (*confirmed || !require_confirmed)
            }
            _ => false,
        }
    }
}

/// Why an incoming protocol message did not run any step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UndecodableBody,
    /// No instance exists and the message cannot start one.
    NoInstance,
    /// The instance exists but its state has no step for this message.
    NoMatchingStep,
    UnexpectedReception,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed {
        step: String,
        new_state: String,
        terminal: bool,
    },
    Dropped(DropReason),
}

/// Everything a step may touch.
pub(crate) struct StepEnv<'a> {
    pub ctx: &'a mut ObvContext,
    pub identity: &'a dyn IdentityDelegate,
    pub config: &'a EngineConfig,
    pub owner: CryptoIdentity,
    pub instance_id: InstanceId,
}

impl StepEnv<'_> {
    pub fn own_device(&self) -> Result<Uid, StepError> {
        Ok(self.identity.current_device_uid(&self.owner)?)
    }

    /// A contact we may talk to: known and neither revoked nor blocked.
    pub fn is_trusted_contact(&self, contact: &CryptoIdentity) -> Result<bool, StepError> {
        Ok(self.identity.is_contact(&self.owner, contact)?
            && self.identity.is_active(&self.owner, contact)?)
    }

    pub fn now(&self) -> u64 {
        self.ctx.now_millis()
    }

    pub fn post(&mut self, message: ChannelMessage, channel: SendChannel) -> Result<(), StepError> {
        outbox::post(self.ctx, self.identity, message, channel)
    }

    /// Post a message of protocol `P` addressed to `instance_id`.
    pub fn post_protocol<P: ConcreteProtocol>(
        &mut self,
        instance_id: InstanceId,
        message: &P::Message,
        channel: SendChannel,
    ) -> Result<(), StepError> {
        let message = protocol_message::<P>(instance_id, message)?;
        self.post(ChannelMessage::Protocol(message), channel)
    }

    /// Post a message of the running protocol to this same instance id.
    pub fn send<P: ConcreteProtocol>(
        &mut self,
        message: &P::Message,
        channel: SendChannel,
    ) -> Result<(), StepError> {
        self.post_protocol::<P>(self.instance_id, message, channel)
    }

    pub fn stage(&mut self, update: IdentityUpdate) {
        self.ctx.stage_identity_update(update);
    }

    /// Oblivious channel to every known device of `contact`.
    pub fn to_contact_devices(
        &self,
        contact: &CryptoIdentity,
        must_be_confirmed: bool,
    ) -> Result<SendChannel, StepError> {
        Ok(SendChannel::Oblivious {
            owner: self.owner,
            owner_device: self.own_device()?,
            to: *contact,
            device_uids: self.identity.contact_device_uids(&self.owner, contact)?,
            must_be_confirmed,
        })
    }
}

pub(crate) fn encode_body<M: Serialize>(message: &M) -> Result<Vec<u8>, StepError> {
    postcard::to_allocvec(message).map_err(|e| StepError::Wire(WireError::from(e)))
}

pub(crate) fn protocol_message<P: ConcreteProtocol>(
    instance_id: InstanceId,
    message: &P::Message,
) -> Result<ProtocolMessage, StepError> {
    Ok(ProtocolMessage {
        protocol: P::KIND,
        instance_id,
        body: encode_body(message)?,
    })
}

/// A protocol the engine can run.
///
/// `step_for` is the static (state kind, message) table; `step_returns`
/// closes the set of states each step may lead to.
pub(crate) trait ConcreteProtocol {
    const KIND: ProtocolKind;

    type State: Into<ProtocolState> + fmt::Debug;
    type StateKind: Copy + PartialEq + fmt::Debug + 'static;
    type Message: Serialize + DeserializeOwned + fmt::Debug;
    type Step: Copy + fmt::Debug;

    fn initial_state() -> Self::State;
    fn from_state(state: ProtocolState) -> Option<Self::State>;
    fn state_kind(state: &Self::State) -> Self::StateKind;
    fn is_terminal(kind: Self::StateKind) -> bool;

    fn step_for(state: Self::StateKind, message: &Self::Message) -> Option<Self::Step>;
    fn step_returns(step: Self::Step) -> &'static [Self::StateKind];
    fn expected_reception(step: Self::Step, state: &Self::State) -> ExpectedReception;

    /// Local message that aborts a running instance, if the protocol has one.
    fn abort_message() -> Option<Self::Message>;

    fn execute(
        step: Self::Step,
        env: &mut StepEnv<'_>,
        state: Self::State,
        message: Self::Message,
        reception: &ReceptionChannelInfo,
    ) -> Result<Self::State, StepError>;
}

/// Route a protocol message to its instance and run the matching step.
pub(crate) fn process_protocol_message(
    ctx: &mut ObvContext,
    identity: &dyn IdentityDelegate,
    config: &EngineConfig,
    owner: CryptoIdentity,
    message: &ProtocolMessage,
    reception: ReceptionChannelInfo,
) -> Result<DispatchOutcome, StepError> {
    match message.protocol {
        ProtocolKind::ChannelCreationWithContactDevice => dispatch::<ChannelCreationProtocol>(
            ctx, identity, config, owner, message, reception,
        ),
        ProtocolKind::DeviceCapabilitiesDiscovery => dispatch::<CapabilitiesDiscoveryProtocol>(
            ctx, identity, config, owner, message, reception,
        ),
        ProtocolKind::OneToOneInvitation => dispatch::<OneToOneInvitationProtocol>(
            ctx, identity, config, owner, message, reception,
        ),
    }
}

fn dispatch<P: ConcreteProtocol>(
    ctx: &mut ObvContext,
    identity: &dyn IdentityDelegate,
    config: &EngineConfig,
    owner: CryptoIdentity,
    message: &ProtocolMessage,
    reception: ReceptionChannelInfo,
) -> Result<DispatchOutcome, StepError> {
    let key = InstanceKey {
        protocol: P::KIND,
        instance_id: message.instance_id,
        owner,
    };
    let body: P::Message = match postcard::from_bytes(&message.body) {
        Ok(body) => body,
        Err(e) => {
            warn!(protocol = ?P::KIND, instance = %key.instance_id, "undecodable protocol message: {}", e);
            return Ok(DispatchOutcome::Dropped(DropReason::UndecodableBody));
        }
    };

    let existing = ctx.db().instances.get(&key).cloned();
    let exists = existing.is_some();
    let state = match existing {
        Some(state) => P::from_state(state).ok_or(StepError::ForeignState)?,
        None => P::initial_state(),
    };
    let from = P::state_kind(&state);

    let Some(step) = P::step_for(from, &body) else {
        let reason = if exists {
            DropReason::NoMatchingStep
        } else {
            DropReason::NoInstance
        };
        debug!(protocol = ?P::KIND, instance = %key.instance_id, state = ?from, ?reason, "no step for {:?}", body);
        return Ok(DispatchOutcome::Dropped(reason));
    };

    let expected = P::expected_reception(step, &state);
    if !expected.accepts(&reception) {
        warn!(
            protocol = ?P::KIND,
            instance = %key.instance_id,
            ?step,
            ?expected,
            received = ?reception,
            "message arrived on an unexpected channel"
        );
        return Ok(DispatchOutcome::Dropped(DropReason::UnexpectedReception));
    }

    debug!(protocol = ?P::KIND, instance = %key.instance_id, ?step, state = ?from, "running step");
    let mut env = StepEnv {
        ctx: &mut *ctx,
        identity,
        config,
        owner,
        instance_id: key.instance_id,
    };
    let next = P::execute(step, &mut env, state, body, &reception)?;
    let to = P::state_kind(&next);

    if !P::step_returns(step).contains(&to) {
        error!(protocol = ?P::KIND, ?step, state = ?to, "step returned an undeclared state");
        return Err(StepError::UndeclaredTransition(format!("{:?} -> {:?}", step, to)));
    }

    let terminal = P::is_terminal(to);
    if terminal {
        ctx.db_mut().delete_instance(&key);
        info!(protocol = ?P::KIND, instance = %key.instance_id, state = ?to, "protocol instance finished");
    } else if exists {
        ctx.db_mut().instances.update(key, next.into())?;
    } else {
        ctx.db_mut().instances.create(key, next.into())?;
    }

    Ok(DispatchOutcome::Executed {
        step: format!("{:?}", step),
        new_state: format!("{:?}", to),
        terminal,
    })
}

/// Abort a running instance: run its abort step when the protocol has one,
/// otherwise delete it.
pub(crate) fn abort_instance(
    ctx: &mut ObvContext,
    identity: &dyn IdentityDelegate,
    config: &EngineConfig,
    key: &InstanceKey,
) -> Result<DispatchOutcome, StepError> {
    match key.protocol {
        ProtocolKind::ChannelCreationWithContactDevice => {
            abort_via::<ChannelCreationProtocol>(ctx, identity, config, key)
        }
        ProtocolKind::DeviceCapabilitiesDiscovery => {
            abort_via::<CapabilitiesDiscoveryProtocol>(ctx, identity, config, key)
        }
        ProtocolKind::OneToOneInvitation => {
            abort_via::<OneToOneInvitationProtocol>(ctx, identity, config, key)
        }
    }
}

fn abort_via<P: ConcreteProtocol>(
    ctx: &mut ObvContext,
    identity: &dyn IdentityDelegate,
    config: &EngineConfig,
    key: &InstanceKey,
) -> Result<DispatchOutcome, StepError> {
    if let Some(abort) = P::abort_message() {
        let message = protocol_message::<P>(key.instance_id, &abort)?;
        let outcome = process_protocol_message(
            ctx,
            identity,
            config,
            key.owner,
            &message,
            ReceptionChannelInfo::Local,
        )?;
        if let DispatchOutcome::Executed { .. } = outcome {
            return Ok(outcome);
        }
    }
    if ctx.db_mut().delete_instance(key) {
        info!(protocol = ?key.protocol, instance = %key.instance_id, "protocol instance aborted");
        Ok(DispatchOutcome::Executed {
            step: "Abort".into(),
            new_state: "Cancelled".into(),
            terminal: true,
        })
    } else {
        Ok(DispatchOutcome::Dropped(DropReason::NoInstance))
    }
}
