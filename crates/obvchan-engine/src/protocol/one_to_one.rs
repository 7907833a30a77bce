//! One-to-one invitations and one-to-one status synchronisation.
//!
//! An invitation waits on the contact's answer, and also on the contact
//! becoming one-to-one through some other path (a crossing invitation, a
//! sync from another device): the latter is a waiting-for-condition entry
//! replayed as `ContactUpgradedToOneToOne`.

use obvchan_protocol::{
    ChannelMessage, CryptoIdentity, DialogCategory, DialogMessage, ProtocolKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{encode_body, ConcreteProtocol, ExpectedReception, ProtocolState, StepEnv};
use crate::context::{ReceptionChannelInfo, SendChannel};
use crate::delegates::IdentityUpdate;
use crate::error::StepError;
use crate::store::{InstanceKey, WaitingForCondition};

pub struct OneToOneInvitationProtocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    Initial,
    InvitationSent { contact: CryptoIdentity },
    InvitationReceived { contact: CryptoIdentity },
    Accepted,
    Rejected,
    Cancelled,
    /// A status sync ran to completion.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    InvitationSent,
    InvitationReceived,
    Accepted,
    Rejected,
    Cancelled,
    Finished,
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Initial => StateKind::Initial,
            State::InvitationSent { .. } => StateKind::InvitationSent,
            State::InvitationReceived { .. } => StateKind::InvitationReceived,
            State::Accepted => StateKind::Accepted,
            State::Rejected => StateKind::Rejected,
            State::Cancelled => StateKind::Cancelled,
            State::Finished => StateKind::Finished,
        }
    }
}

impl From<State> for ProtocolState {
    fn from(state: State) -> Self {
        ProtocolState::OneToOneInvitation(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Local: invite `contact`.
    Initial { contact: CryptoIdentity },
    Invitation,
    /// Local: the user's answer to an `AcceptOneToOneInvitation` dialog.
    DialogResponse { accept: bool },
    Response { accepted: bool },
    /// Local replay of the waiting-for-condition entry.
    ContactUpgradedToOneToOne,
    Abort,
    /// Local: tell `contact` how we currently see it.
    InitialStatusSync { contact: CryptoIdentity },
    StatusSync { considers_one_to_one: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SendInvitation,
    ProcessInvitation,
    RespondToInvitation,
    ProcessResponse,
    ProcessContactUpgraded,
    Abort,
    SendStatusSync,
    ProcessStatusSync,
}

impl Step {
    fn for_message(message: &Message) -> Self {
        match message {
            Message::Initial { .. } => Step::SendInvitation,
            Message::Invitation => Step::ProcessInvitation,
            Message::DialogResponse { .. } => Step::RespondToInvitation,
            Message::Response { .. } => Step::ProcessResponse,
            Message::ContactUpgradedToOneToOne => Step::ProcessContactUpgraded,
            Message::Abort => Step::Abort,
            Message::InitialStatusSync { .. } => Step::SendStatusSync,
            Message::StatusSync { .. } => Step::ProcessStatusSync,
        }
    }

    fn valid_from(self) -> &'static [StateKind] {
        use StateKind::*;
        match self {
            Step::SendInvitation
            | Step::ProcessInvitation
            | Step::SendStatusSync
            | Step::ProcessStatusSync => &[Initial],
            Step::RespondToInvitation => &[InvitationReceived],
            Step::ProcessResponse | Step::ProcessContactUpgraded => &[InvitationSent],
            Step::Abort => &[InvitationSent, InvitationReceived],
        }
    }

    fn returns(self) -> &'static [StateKind] {
        use StateKind::*;
        match self {
            Step::SendInvitation => &[InvitationSent, Accepted, Cancelled],
            Step::ProcessInvitation => &[InvitationReceived, Accepted, Cancelled],
            Step::RespondToInvitation | Step::ProcessResponse => &[Accepted, Rejected],
            Step::ProcessContactUpgraded => &[InvitationSent, Accepted],
            Step::Abort => &[Cancelled],
            Step::SendStatusSync | Step::ProcessStatusSync => &[Finished],
        }
    }
}

impl ConcreteProtocol for OneToOneInvitationProtocol {
    const KIND: ProtocolKind = ProtocolKind::OneToOneInvitation;

    type State = State;
    type StateKind = StateKind;
    type Message = Message;
    type Step = Step;

    fn initial_state() -> State {
        State::Initial
    }

    fn from_state(state: ProtocolState) -> Option<State> {
        match state {
            ProtocolState::OneToOneInvitation(state) => Some(state),
            _ => None,
        }
    }

    fn state_kind(state: &State) -> StateKind {
        state.kind()
    }

    fn is_terminal(kind: StateKind) -> bool {
        matches!(
            kind,
            StateKind::Accepted | StateKind::Rejected | StateKind::Cancelled | StateKind::Finished
        )
    }

    fn step_for(state: StateKind, message: &Message) -> Option<Step> {
        let step = Step::for_message(message);
        step.valid_from().contains(&state).then_some(step)
    }

    fn step_returns(step: Step) -> &'static [StateKind] {
        step.returns()
    }

    fn expected_reception(step: Step, state: &State) -> ExpectedReception {
        match step {
            Step::SendInvitation
            | Step::RespondToInvitation
            | Step::ProcessContactUpgraded
            | Step::Abort
            | Step::SendStatusSync => ExpectedReception::Local,
            Step::ProcessInvitation | Step::ProcessStatusSync => ExpectedReception::AnyOblivious {
                require_confirmed: true,
            },
            Step::ProcessResponse => match state {
                State::InvitationSent { contact } => ExpectedReception::ObliviousFrom {
                    identity: *contact,
                    device: None,
                    require_confirmed: true,
                },
                _ => ExpectedReception::Local,
            },
        }
    }

    fn abort_message() -> Option<Message> {
        Some(Message::Abort)
    }

    fn execute(
        step: Step,
        env: &mut StepEnv<'_>,
        state: State,
        message: Message,
        reception: &ReceptionChannelInfo,
    ) -> Result<State, StepError> {
        match (step, state, message) {
            (Step::SendInvitation, _, Message::Initial { contact }) => send_invitation(env, contact),
            (Step::ProcessInvitation, _, Message::Invitation) => {
                let Some((contact, _)) = reception.remote() else {
                    return Err(StepError::Mismatch("invitation without a remote identity"));
                };
                process_invitation(env, contact)
            }
            (
                Step::RespondToInvitation,
                State::InvitationReceived { contact },
                Message::DialogResponse { accept },
            ) => {
                send_to_contact(env, contact, &Message::Response { accepted: accept })?;
                if accept {
                    upgrade(env, contact);
                    Ok(State::Accepted)
                } else {
                    info!(%contact, "one-to-one invitation declined");
                    Ok(State::Rejected)
                }
            }
            (
                Step::ProcessResponse,
                State::InvitationSent { contact },
                Message::Response { accepted },
            ) => {
                if accepted {
                    upgrade(env, contact);
                    Ok(State::Accepted)
                } else {
                    info!(%contact, "contact declined our one-to-one invitation");
                    Ok(State::Rejected)
                }
            }
            (
                Step::ProcessContactUpgraded,
                State::InvitationSent { contact },
                Message::ContactUpgradedToOneToOne,
            ) => {
                if env.identity.is_one_to_one(&env.owner, &contact)? {
                    info!(%contact, "contact became one-to-one, invitation settled");
                    Ok(State::Accepted)
                } else {
                    watch_contact(env, contact)?;
                    Ok(State::InvitationSent { contact })
                }
            }
            (Step::Abort, _, Message::Abort) => Ok(State::Cancelled),
            (Step::SendStatusSync, _, Message::InitialStatusSync { contact }) => {
                if env.is_trusted_contact(&contact)? {
                    let considers_one_to_one = env.identity.is_one_to_one(&env.owner, &contact)?;
                    send_to_contact(env, contact, &Message::StatusSync { considers_one_to_one })?;
                }
                Ok(State::Finished)
            }
            (Step::ProcessStatusSync, _, Message::StatusSync { considers_one_to_one }) => {
                let Some((contact, _)) = reception.remote() else {
                    return Err(StepError::Mismatch("status sync without a remote identity"));
                };
                let owner = env.owner;
                if !considers_one_to_one && env.identity.is_one_to_one(&owner, &contact)? {
                    info!(%contact, "contact no longer one-to-one with us, downgrading");
                    env.stage(IdentityUpdate::SetOneToOne {
                        owner,
                        contact,
                        one_to_one: false,
                    });
                }
                Ok(State::Finished)
            }
            _ => Err(StepError::Mismatch("one-to-one step, state and message disagree")),
        }
    }
}

fn upgrade(env: &mut StepEnv<'_>, contact: CryptoIdentity) {
    info!(%contact, "contact upgraded to one-to-one");
    let owner = env.owner;
    env.stage(IdentityUpdate::SetOneToOne {
        owner,
        contact,
        one_to_one: true,
    });
}

/// Send to every device of `contact`. `false` when no confirmed channel exists.
fn send_to_contact(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    message: &Message,
) -> Result<bool, StepError> {
    let channel = env.to_contact_devices(&contact, true)?;
    match env.send::<OneToOneInvitationProtocol>(message, channel) {
        Ok(()) => Ok(true),
        Err(StepError::NoUsableChannel { .. }) => {
            warn!(%contact, "no confirmed channel with contact");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn post_dialog(env: &mut StepEnv<'_>, category: DialogCategory) -> Result<(), StepError> {
    let owner = env.owner;
    let dialog = DialogMessage {
        protocol: ProtocolKind::OneToOneInvitation,
        instance_id: env.instance_id,
        category,
    };
    env.post(ChannelMessage::Dialog(dialog), SendChannel::UserInterface { owner })
}

fn send_invitation(env: &mut StepEnv<'_>, contact: CryptoIdentity) -> Result<State, StepError> {
    if !env.is_trusted_contact(&contact)? {
        error!(%contact, "cannot invite an untrusted contact");
        return Ok(State::Cancelled);
    }
    let owner = env.owner;
    if env.identity.is_one_to_one(&owner, &contact)? {
        debug!(%contact, "contact already one-to-one");
        return Ok(State::Accepted);
    }
    if !send_to_contact(env, contact, &Message::Invitation)? {
        error!(%contact, "invitation could not be sent");
        return Ok(State::Cancelled);
    }

    watch_contact(env, contact)?;
    post_dialog(env, DialogCategory::OneToOneInvitationSent { contact })?;
    info!(%contact, "one-to-one invitation sent");
    Ok(State::InvitationSent { contact })
}

/// Replay `ContactUpgradedToOneToOne` into this instance once `contact`
/// becomes one-to-one.
fn watch_contact(env: &mut StepEnv<'_>, contact: CryptoIdentity) -> Result<(), StepError> {
    let owner = env.owner;
    let instance = InstanceKey {
        protocol: ProtocolKind::OneToOneInvitation,
        instance_id: env.instance_id,
        owner,
    };
    let watched = env
        .ctx
        .db()
        .waiting
        .all_for(&owner, &contact)
        .iter()
        .any(|entry| entry.instance == instance);
    if !watched {
        let replay_body = encode_body(&Message::ContactUpgradedToOneToOne)?;
        env.ctx.db_mut().waiting.create(WaitingForCondition {
            owner,
            watched_contact: contact,
            instance,
            replay_body,
        });
    }
    Ok(())
}

fn process_invitation(env: &mut StepEnv<'_>, contact: CryptoIdentity) -> Result<State, StepError> {
    if !env.is_trusted_contact(&contact)? {
        error!(%contact, "invitation from an untrusted contact");
        return Ok(State::Cancelled);
    }
    let owner = env.owner;
    let already_one_to_one = env.identity.is_one_to_one(&owner, &contact)?;
    let crossing = has_pending_invitation_to(env, &contact);

    if already_one_to_one || crossing {
        debug!(%contact, already_one_to_one, crossing, "accepting invitation without asking");
        send_to_contact(env, contact, &Message::Response { accepted: true })?;
        if !already_one_to_one {
            upgrade(env, contact);
        }
        return Ok(State::Accepted);
    }

    post_dialog(env, DialogCategory::AcceptOneToOneInvitation { contact })?;
    info!(%contact, "one-to-one invitation received");
    Ok(State::InvitationReceived { contact })
}

fn has_pending_invitation_to(env: &StepEnv<'_>, contact: &CryptoIdentity) -> bool {
    env.ctx.db().instances.iter().any(|(key, state)| {
        key.owner == env.owner
            && matches!(
                state,
                ProtocolState::OneToOneInvitation(State::InvitationSent { contact: pending })
                    if pending == contact
            )
    })
}
