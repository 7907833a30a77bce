//! Device capabilities discovery.
//!
//! Each side of a fresh channel tells the other device what it supports.
//! A single step per side; instances never outlive their flow.

use obvchan_protocol::{CryptoIdentity, ProtocolKind, Uid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ConcreteProtocol, ExpectedReception, ProtocolState, StepEnv};
use crate::context::{ReceptionChannelInfo, SendChannel};
use crate::delegates::IdentityUpdate;
use crate::error::StepError;

pub struct CapabilitiesDiscoveryProtocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    Initial,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    Finished,
}

impl From<State> for ProtocolState {
    fn from(state: State) -> Self {
        ProtocolState::CapabilitiesDiscovery(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Local: send our capabilities to one contact device.
    AddOwnCapabilitiesToContactDevice {
        contact: CryptoIdentity,
        contact_device: Uid,
    },
    OwnCapabilities {
        capabilities: Vec<String>,
        is_response: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SendOwnCapabilities,
    ProcessContactCapabilities,
}

impl ConcreteProtocol for CapabilitiesDiscoveryProtocol {
    const KIND: ProtocolKind = ProtocolKind::DeviceCapabilitiesDiscovery;

    type State = State;
    type StateKind = StateKind;
    type Message = Message;
    type Step = Step;

    fn initial_state() -> State {
        State::Initial
    }

    fn from_state(state: ProtocolState) -> Option<State> {
        match state {
            ProtocolState::CapabilitiesDiscovery(state) => Some(state),
            _ => None,
        }
    }

    fn state_kind(state: &State) -> StateKind {
        match state {
            State::Initial => StateKind::Initial,
            State::Finished => StateKind::Finished,
        }
    }

    fn is_terminal(kind: StateKind) -> bool {
        kind == StateKind::Finished
    }

    fn step_for(state: StateKind, message: &Message) -> Option<Step> {
        match (state, message) {
            (StateKind::Initial, Message::AddOwnCapabilitiesToContactDevice { .. }) => {
                Some(Step::SendOwnCapabilities)
            }
            (StateKind::Initial, Message::OwnCapabilities { .. }) => {
                Some(Step::ProcessContactCapabilities)
            }
            (StateKind::Finished, _) => None,
        }
    }

    fn step_returns(_step: Step) -> &'static [StateKind] {
        &[StateKind::Finished]
    }

    fn expected_reception(step: Step, _state: &State) -> ExpectedReception {
        match step {
            Step::SendOwnCapabilities => ExpectedReception::Local,
            Step::ProcessContactCapabilities => ExpectedReception::AnyOblivious {
                require_confirmed: true,
            },
        }
    }

    fn abort_message() -> Option<Message> {
        None
    }

    fn execute(
        step: Step,
        env: &mut StepEnv<'_>,
        _state: State,
        message: Message,
        reception: &ReceptionChannelInfo,
    ) -> Result<State, StepError> {
        match (step, message) {
            (
                Step::SendOwnCapabilities,
                Message::AddOwnCapabilitiesToContactDevice {
                    contact,
                    contact_device,
                },
            ) => {
                send_capabilities(env, contact, contact_device, false)?;
                Ok(State::Finished)
            }
            (
                Step::ProcessContactCapabilities,
                Message::OwnCapabilities {
                    capabilities,
                    is_response,
                },
            ) => {
                let Some((contact, contact_device)) = reception.remote() else {
                    return Err(StepError::Mismatch("capabilities without a remote device"));
                };
                debug!(%contact, device = %contact_device, count = capabilities.len(), "contact capabilities received");
                env.stage(IdentityUpdate::SetContactDeviceCapabilities {
                    owner: env.owner,
                    contact,
                    device: contact_device,
                    capabilities,
                });
                if !is_response {
                    send_capabilities(env, contact, contact_device, true)?;
                }
                Ok(State::Finished)
            }
            _ => Err(StepError::Mismatch("capabilities step and message disagree")),
        }
    }
}

fn send_capabilities(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    contact_device: Uid,
    is_response: bool,
) -> Result<(), StepError> {
    let owner = env.owner;
    let capabilities = env.identity.own_capabilities(&owner)?;
    let channel = SendChannel::Oblivious {
        owner,
        owner_device: env.own_device()?,
        to: contact,
        device_uids: vec![contact_device],
        must_be_confirmed: true,
    };
    let message = Message::OwnCapabilities {
        capabilities,
        is_response,
    };
    match env.send::<CapabilitiesDiscoveryProtocol>(&message, channel) {
        Err(StepError::NoUsableChannel { .. }) => {
            warn!(%contact, device = %contact_device, "no confirmed channel for capabilities");
            Ok(())
        }
        other => other,
    }
}
