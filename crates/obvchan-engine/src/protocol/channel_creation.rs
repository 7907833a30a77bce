//! Channel creation with one contact device.
//!
//! Both devices may start at once. The device with the smaller
//! (device uid, identity) pair is in charge: it answers pings with its
//! ephemeral KEM key, the other device answers with a ping of its own.
//! The other device then encapsulates `k1` under that ephemeral key and
//! sends its own ephemeral key; the device in charge encapsulates `k2` in
//! return. Both install a pending channel from `derive_seed(k1, k2)` and
//! confirm it once the peer's acknowledgement opens on it.

use obvchan_crypto::kem::encapsulate;
use obvchan_crypto::{derive_seed, Challenge, KemCiphertext, KemKeyPair, SharedSecret};
use obvchan_protocol::{CryptoIdentity, InstanceId, ProtocolKind, Uid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    capabilities, one_to_one, CapabilitiesDiscoveryProtocol, ConcreteProtocol, ExpectedReception,
    OneToOneInvitationProtocol, ProtocolState, StepEnv,
};
use crate::context::{ReceptionChannelInfo, SendChannel};
use crate::delegates::IdentityUpdate;
use crate::error::StepError;
use crate::store::{ChannelKey, InstanceKey};

pub struct ChannelCreationProtocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    Initial,
    PingSent {
        contact: CryptoIdentity,
        contact_device: Uid,
    },
    /// In charge: our ephemeral key is out, waiting for `k1`.
    WaitingForK1 {
        contact: CryptoIdentity,
        contact_device: Uid,
        ephemeral: KemKeyPair,
    },
    /// Not in charge: `k1` is sent, waiting for `k2`.
    WaitingForK2 {
        contact: CryptoIdentity,
        contact_device: Uid,
        ephemeral: KemKeyPair,
        k1: SharedSecret,
    },
    WaitForFirstAck {
        contact: CryptoIdentity,
        contact_device: Uid,
    },
    WaitForSecondAck {
        contact: CryptoIdentity,
        contact_device: Uid,
    },
    ChannelConfirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    PingSent,
    WaitingForK1,
    WaitingForK2,
    WaitForFirstAck,
    WaitForSecondAck,
    ChannelConfirmed,
    Cancelled,
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Initial => StateKind::Initial,
            State::PingSent { .. } => StateKind::PingSent,
            State::WaitingForK1 { .. } => StateKind::WaitingForK1,
            State::WaitingForK2 { .. } => StateKind::WaitingForK2,
            State::WaitForFirstAck { .. } => StateKind::WaitForFirstAck,
            State::WaitForSecondAck { .. } => StateKind::WaitForSecondAck,
            State::ChannelConfirmed => StateKind::ChannelConfirmed,
            State::Cancelled => StateKind::Cancelled,
        }
    }

    fn peer(&self) -> Option<(CryptoIdentity, Uid)> {
        match self {
            State::PingSent {
                contact,
                contact_device,
            }
            | State::WaitingForK1 {
                contact,
                contact_device,
                ..
            }
            | State::WaitingForK2 {
                contact,
                contact_device,
                ..
            }
            | State::WaitForFirstAck {
                contact,
                contact_device,
            }
            | State::WaitForSecondAck {
                contact,
                contact_device,
            } => Some((*contact, *contact_device)),
            State::Initial | State::ChannelConfirmed | State::Cancelled => None,
        }
    }
}

impl From<State> for ProtocolState {
    fn from(state: State) -> Self {
        ProtocolState::ChannelCreation(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Local: start a handshake with `contact_device`.
    Initial {
        contact: CryptoIdentity,
        contact_device: Uid,
    },
    Ping {
        sender: CryptoIdentity,
        sender_device: Uid,
        signature: Vec<u8>,
    },
    /// Sent by the device in charge in answer to a ping.
    EphemeralKey {
        sender: CryptoIdentity,
        sender_device: Uid,
        signature: Vec<u8>,
        ephemeral_public: [u8; 32],
    },
    EphemeralKeyAndK1 {
        ephemeral_public: [u8; 32],
        c1: KemCiphertext,
    },
    K2 {
        c2: KemCiphertext,
    },
    FirstAck {
        published_details: Vec<u8>,
    },
    SecondAck {
        published_details: Vec<u8>,
    },
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SendPing,
    SendPingOrEphemeralKey,
    SendEphemeralKeyAndK1,
    RecoverK1AndSendK2AndCreateChannel,
    RecoverK2CreateChannelAndSendAck,
    ConfirmChannelAndSendAck,
    ConfirmChannel,
    Abort,
}

const RUNNING: &[StateKind] = &[
    StateKind::PingSent,
    StateKind::WaitingForK1,
    StateKind::WaitingForK2,
    StateKind::WaitForFirstAck,
    StateKind::WaitForSecondAck,
];

impl Step {
    fn for_message(message: &Message) -> Self {
        match message {
            Message::Initial { .. } => Step::SendPing,
            Message::Ping { .. } => Step::SendPingOrEphemeralKey,
            Message::EphemeralKey { .. } => Step::SendEphemeralKeyAndK1,
            Message::EphemeralKeyAndK1 { .. } => Step::RecoverK1AndSendK2AndCreateChannel,
            Message::K2 { .. } => Step::RecoverK2CreateChannelAndSendAck,
            Message::FirstAck { .. } => Step::ConfirmChannelAndSendAck,
            Message::SecondAck { .. } => Step::ConfirmChannel,
            Message::Abort => Step::Abort,
        }
    }

    fn valid_from(self) -> &'static [StateKind] {
        use StateKind::*;
        match self {
            Step::SendPing => &[Initial],
            Step::SendPingOrEphemeralKey => &[
                Initial,
                PingSent,
                WaitingForK1,
                WaitingForK2,
                WaitForFirstAck,
                WaitForSecondAck,
            ],
            Step::SendEphemeralKeyAndK1 => &[
                Initial,
                PingSent,
                WaitingForK2,
                WaitForFirstAck,
                WaitForSecondAck,
            ],
            Step::RecoverK1AndSendK2AndCreateChannel => &[WaitingForK1],
            Step::RecoverK2CreateChannelAndSendAck => &[WaitingForK2],
            Step::ConfirmChannelAndSendAck => &[WaitForFirstAck],
            Step::ConfirmChannel => &[WaitForSecondAck],
            Step::Abort => RUNNING,
        }
    }

    fn returns(self) -> &'static [StateKind] {
        use StateKind::*;
        match self {
            Step::SendPing => &[PingSent, Cancelled],
            Step::SendPingOrEphemeralKey => &[PingSent, WaitingForK1, Cancelled],
            Step::SendEphemeralKeyAndK1 => &[WaitingForK2, Cancelled],
            Step::RecoverK1AndSendK2AndCreateChannel => &[WaitForFirstAck, Cancelled],
            Step::RecoverK2CreateChannelAndSendAck => &[WaitForSecondAck, Cancelled],
            Step::ConfirmChannelAndSendAck | Step::ConfirmChannel => &[ChannelConfirmed],
            Step::Abort => &[Cancelled],
        }
    }
}

/// Total order deciding which device drives the handshake: device uid
/// first, identity only when the uids are equal.
pub fn is_in_charge(
    own_device: &Uid,
    own_identity: &CryptoIdentity,
    peer_device: &Uid,
    peer_identity: &CryptoIdentity,
) -> bool {
    (own_device, own_identity) < (peer_device, peer_identity)
}

/// What `signer` on `signer_device` signs to say it trusts `peer` and holds
/// no channel with `peer_device`.
fn ping_challenge(
    signer: CryptoIdentity,
    signer_device: Uid,
    peer: CryptoIdentity,
    peer_device: Uid,
) -> Challenge {
    Challenge::ChannelCreation {
        first_device: peer_device,
        second_device: signer_device,
        first_identity: peer,
        second_identity: signer,
    }
}

impl ConcreteProtocol for ChannelCreationProtocol {
    const KIND: ProtocolKind = ProtocolKind::ChannelCreationWithContactDevice;

    type State = State;
    type StateKind = StateKind;
    type Message = Message;
    type Step = Step;

    fn initial_state() -> State {
        State::Initial
    }

    fn from_state(state: ProtocolState) -> Option<State> {
        match state {
            ProtocolState::ChannelCreation(state) => Some(state),
            _ => None,
        }
    }

    fn state_kind(state: &State) -> StateKind {
        state.kind()
    }

    fn is_terminal(kind: StateKind) -> bool {
        matches!(kind, StateKind::ChannelConfirmed | StateKind::Cancelled)
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
            Step::SendPing | Step::Abort => ExpectedReception::Local,
            Step::SendPingOrEphemeralKey
            | Step::SendEphemeralKeyAndK1
            | Step::RecoverK1AndSendK2AndCreateChannel
            | Step::RecoverK2CreateChannelAndSendAck => ExpectedReception::Asymmetric,
            // The acknowledgements travel on the channel being confirmed.
            Step::ConfirmChannelAndSendAck | Step::ConfirmChannel => match state.peer() {
                Some((contact, contact_device)) => ExpectedReception::ObliviousFrom {
                    identity: contact,
                    device: Some(contact_device),
                    require_confirmed: false,
                },
                None => ExpectedReception::Local,
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
        _reception: &ReceptionChannelInfo,
    ) -> Result<State, StepError> {
        match (step, message) {
            (
                Step::SendPing,
                Message::Initial {
                    contact,
                    contact_device,
                },
            ) => send_ping(env, contact, contact_device),
            (
                Step::SendPingOrEphemeralKey,
                Message::Ping {
                    sender,
                    sender_device,
                    signature,
                },
            ) => send_ping_or_ephemeral_key(env, sender, sender_device, signature),
            (
                Step::SendEphemeralKeyAndK1,
                Message::EphemeralKey {
                    sender,
                    sender_device,
                    signature,
                    ephemeral_public,
                },
            ) => send_ephemeral_key_and_k1(env, sender, sender_device, signature, ephemeral_public),
            (
                Step::RecoverK1AndSendK2AndCreateChannel,
                Message::EphemeralKeyAndK1 {
                    ephemeral_public,
                    c1,
                },
            ) => recover_k1_and_send_k2(env, state, ephemeral_public, c1),
            (Step::RecoverK2CreateChannelAndSendAck, Message::K2 { c2 }) => {
                recover_k2_and_send_ack(env, state, c2)
            }
            (Step::ConfirmChannelAndSendAck, Message::FirstAck { published_details }) => {
                confirm_channel(env, state, published_details, true)
            }
            (Step::ConfirmChannel, Message::SecondAck { published_details }) => {
                confirm_channel(env, state, published_details, false)
            }
            (Step::Abort, Message::Abort) => abort(env, state),
            _ => Err(StepError::Mismatch("channel creation step and message disagree")),
        }
    }
}

fn cancelled(contact: &CryptoIdentity, reason: &str) -> Result<State, StepError> {
    error!(%contact, "channel creation cancelled: {}", reason);
    Ok(State::Cancelled)
}

fn asymmetric_to(contact: CryptoIdentity, contact_device: Uid) -> SendChannel {
    SendChannel::AsymmetricBroadcast {
        to: contact,
        device_uids: vec![contact_device],
    }
}

/// Make the current instance the only one in charge of this device pair.
/// Any older instance for the pair and any existing channel are deleted.
fn take_over_pair(env: &mut StepEnv<'_>, contact: CryptoIdentity, contact_device: Uid, own_device: Uid) {
    let owner = env.owner;
    let current = env.instance_id;
    let db = env.ctx.db_mut();

    if let Some(stale) = db.channel_creation.get(&owner, &contact, &contact_device) {
        if stale != current {
            db.delete_instance(&InstanceKey {
                protocol: ProtocolKind::ChannelCreationWithContactDevice,
                instance_id: stale,
                owner,
            });
            debug!(%contact, device = %contact_device, %stale, "superseded stale handshake");
        }
    }

    let channel = ChannelKey {
        owner_device: own_device,
        remote_identity: contact,
        remote_device: contact_device,
    };
    if db.channels.delete(&channel).is_some() {
        info!(%contact, device = %contact_device, "deleted existing channel for a new handshake");
    }
    db.channel_creation
        .register(owner, contact, contact_device, current);
}

/// Check a peer's ping-style signature and record it in the replay guard.
fn accept_signature(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    contact_device: Uid,
    own_device: Uid,
    signature: &[u8],
) -> Result<Option<&'static str>, StepError> {
    let challenge = ping_challenge(contact, contact_device, env.owner, own_device);
    if !env.identity.check_signature(signature, &challenge, &contact) {
        return Ok(Some("invalid signature"));
    }
    let owner = env.owner;
    let now = env.now();
    if !env
        .ctx
        .db_mut()
        .replay_guard
        .check_and_insert(&owner, signature, now)
    {
        return Ok(Some("signature already received"));
    }
    Ok(None)
}

fn sign_ping(
    env: &StepEnv<'_>,
    own_device: Uid,
    contact: CryptoIdentity,
    contact_device: Uid,
) -> Option<Vec<u8>> {
    let challenge = ping_challenge(env.owner, own_device, contact, contact_device);
    match env.identity.solve_challenge(&env.owner, &challenge) {
        Ok(signature) => Some(signature),
        Err(e) => {
            error!(%contact, "could not sign channel creation challenge: {}", e);
            None
        }
    }
}

fn send_ping(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    contact_device: Uid,
) -> Result<State, StepError> {
    if !env.is_trusted_contact(&contact)? {
        return cancelled(&contact, "not a trusted, active contact");
    }
    let own_device = env.own_device()?;
    if contact == env.owner && contact_device == own_device {
        return cancelled(&contact, "cannot create a channel with this device");
    }

    take_over_pair(env, contact, contact_device, own_device);

    let Some(signature) = sign_ping(env, own_device, contact, contact_device) else {
        return cancelled(&contact, "signing failed");
    };
    let ping = Message::Ping {
        sender: env.owner,
        sender_device: own_device,
        signature,
    };
    env.send::<ChannelCreationProtocol>(&ping, asymmetric_to(contact, contact_device))?;
    debug!(%contact, device = %contact_device, "ping sent");
    Ok(State::PingSent {
        contact,
        contact_device,
    })
}

fn send_ping_or_ephemeral_key(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    contact_device: Uid,
    signature: Vec<u8>,
) -> Result<State, StepError> {
    if !env.is_trusted_contact(&contact)? {
        return cancelled(&contact, "ping from an untrusted contact");
    }
    let own_device = env.own_device()?;
    if let Some(reason) = accept_signature(env, contact, contact_device, own_device, &signature)? {
        return cancelled(&contact, reason);
    }

    take_over_pair(env, contact, contact_device, own_device);

    let owner = env.owner;
    let Some(signature) = sign_ping(env, own_device, contact, contact_device) else {
        return cancelled(&contact, "signing failed");
    };

    if is_in_charge(&own_device, &owner, &contact_device, &contact) {
        let ephemeral = match KemKeyPair::generate() {
            Ok(ephemeral) => ephemeral,
            Err(e) => {
                error!(%contact, "ephemeral key generation failed: {}", e);
                return Ok(State::Cancelled);
            }
        };
        let reply = Message::EphemeralKey {
            sender: owner,
            sender_device: own_device,
            signature,
            ephemeral_public: ephemeral.public_key(),
        };
        env.send::<ChannelCreationProtocol>(&reply, asymmetric_to(contact, contact_device))?;
        debug!(%contact, device = %contact_device, "in charge, ephemeral key sent");
        Ok(State::WaitingForK1 {
            contact,
            contact_device,
            ephemeral,
        })
    } else {
        let reply = Message::Ping {
            sender: owner,
            sender_device: own_device,
            signature,
        };
        env.send::<ChannelCreationProtocol>(&reply, asymmetric_to(contact, contact_device))?;
        debug!(%contact, device = %contact_device, "not in charge, ping returned");
        Ok(State::PingSent {
            contact,
            contact_device,
        })
    }
}

fn send_ephemeral_key_and_k1(
    env: &mut StepEnv<'_>,
    contact: CryptoIdentity,
    contact_device: Uid,
    signature: Vec<u8>,
    peer_ephemeral: [u8; 32],
) -> Result<State, StepError> {
    if !env.is_trusted_contact(&contact)? {
        return cancelled(&contact, "ephemeral key from an untrusted contact");
    }
    let own_device = env.own_device()?;
    if let Some(reason) = accept_signature(env, contact, contact_device, own_device, &signature)? {
        return cancelled(&contact, reason);
    }
    if is_in_charge(&own_device, &env.owner, &contact_device, &contact) {
        return cancelled(&contact, "peer sent an ephemeral key but is not in charge");
    }

    take_over_pair(env, contact, contact_device, own_device);

    let ephemeral = match KemKeyPair::generate() {
        Ok(ephemeral) => ephemeral,
        Err(e) => {
            error!(%contact, "ephemeral key generation failed: {}", e);
            return Ok(State::Cancelled);
        }
    };
    let (c1, k1) = match encapsulate(&peer_ephemeral) {
        Ok(encapsulated) => encapsulated,
        Err(e) => {
            error!(%contact, "k1 encapsulation failed: {}", e);
            return Ok(State::Cancelled);
        }
    };

    let reply = Message::EphemeralKeyAndK1 {
        ephemeral_public: ephemeral.public_key(),
        c1,
    };
    env.send::<ChannelCreationProtocol>(&reply, asymmetric_to(contact, contact_device))?;
    Ok(State::WaitingForK2 {
        contact,
        contact_device,
        ephemeral,
        k1,
    })
}

fn recover_k1_and_send_k2(
    env: &mut StepEnv<'_>,
    state: State,
    peer_ephemeral: [u8; 32],
    c1: KemCiphertext,
) -> Result<State, StepError> {
    let State::WaitingForK1 {
        contact,
        contact_device,
        ephemeral,
    } = state
    else {
        return Err(StepError::Mismatch("expected WaitingForK1"));
    };

    let secrets = ephemeral.decapsulate(&c1).and_then(|k1| {
        let (c2, k2) = encapsulate(&peer_ephemeral)?;
        Ok((c2, derive_seed(&k1, &k2)?))
    });
    let (c2, seed) = match secrets {
        Ok(secrets) => secrets,
        Err(e) => {
            error!(%contact, "could not recover k1: {}", e);
            return Ok(State::Cancelled);
        }
    };

    let own_device = env.own_device()?;
    let channel = ChannelKey {
        owner_device: own_device,
        remote_identity: contact,
        remote_device: contact_device,
    };
    if env.ctx.db().channels.exists(&channel) {
        return restart(env, channel);
    }
    let owner = env.owner;
    let suite_version = env.config.channel_suite_version;
    env.ctx
        .db_mut()
        .channels
        .create(owner, channel, seed, suite_version)?;

    env.send::<ChannelCreationProtocol>(&Message::K2 { c2 }, asymmetric_to(contact, contact_device))?;
    debug!(%contact, device = %contact_device, "pending channel installed, k2 sent");
    Ok(State::WaitForFirstAck {
        contact,
        contact_device,
    })
}

fn recover_k2_and_send_ack(env: &mut StepEnv<'_>, state: State, c2: KemCiphertext) -> Result<State, StepError> {
    let State::WaitingForK2 {
        contact,
        contact_device,
        ephemeral,
        k1,
    } = state
    else {
        return Err(StepError::Mismatch("expected WaitingForK2"));
    };

    let seed = match ephemeral
        .decapsulate(&c2)
        .and_then(|k2| derive_seed(&k1, &k2))
    {
        Ok(seed) => seed,
        Err(e) => {
            error!(%contact, "could not recover k2: {}", e);
            return Ok(State::Cancelled);
        }
    };

    let own_device = env.own_device()?;
    let channel = ChannelKey {
        owner_device: own_device,
        remote_identity: contact,
        remote_device: contact_device,
    };
    if env.ctx.db().channels.exists(&channel) {
        return restart(env, channel);
    }
    let owner = env.owner;
    let suite_version = env.config.channel_suite_version;
    env.ctx
        .db_mut()
        .channels
        .create(owner, channel, seed, suite_version)?;

    let published_details = env.identity.published_details(&owner)?;
    env.send::<ChannelCreationProtocol>(
        &Message::FirstAck { published_details },
        SendChannel::Oblivious {
            owner,
            owner_device: own_device,
            to: contact,
            device_uids: vec![contact_device],
            must_be_confirmed: false,
        },
    )?;
    debug!(%contact, device = %contact_device, "pending channel installed, first ack sent");
    Ok(State::WaitForSecondAck {
        contact,
        contact_device,
    })
}

/// A channel appeared while none was expected: drop it and start over with
/// a fresh instance.
fn restart(env: &mut StepEnv<'_>, channel: ChannelKey) -> Result<State, StepError> {
    warn!(
        contact = %channel.remote_identity,
        device = %channel.remote_device,
        "channel already exists, restarting the handshake"
    );
    env.ctx.db_mut().channels.delete(&channel);
    let owner = env.owner;
    env.post_protocol::<ChannelCreationProtocol>(
        InstanceId::random(),
        &Message::Initial {
            contact: channel.remote_identity,
            contact_device: channel.remote_device,
        },
        SendChannel::Local { owner },
    )?;
    Ok(State::Cancelled)
}

fn confirm_channel(
    env: &mut StepEnv<'_>,
    state: State,
    peer_details: Vec<u8>,
    send_ack: bool,
) -> Result<State, StepError> {
    let Some((contact, contact_device)) = state.peer() else {
        return Err(StepError::Mismatch("acknowledgement without a peer"));
    };
    let owner = env.owner;
    let own_device = env.own_device()?;
    let channel = ChannelKey {
        owner_device: own_device,
        remote_identity: contact,
        remote_device: contact_device,
    };
    env.ctx.db_mut().channels.confirm(&channel)?;

    env.stage(IdentityUpdate::AddContactDevice {
        owner,
        contact,
        device: contact_device,
    });
    env.stage(IdentityUpdate::SetContactPublishedDetails {
        owner,
        contact,
        details: peer_details,
    });

    if send_ack {
        let published_details = env.identity.published_details(&owner)?;
        env.send::<ChannelCreationProtocol>(
            &Message::SecondAck { published_details },
            SendChannel::Oblivious {
                owner,
                owner_device: own_device,
                to: contact,
                device_uids: vec![contact_device],
                must_be_confirmed: true,
            },
        )?;
    }

    if env.config.post_confirmation_protocols {
        env.post_protocol::<CapabilitiesDiscoveryProtocol>(
            InstanceId::random(),
            &capabilities::Message::AddOwnCapabilitiesToContactDevice {
                contact,
                contact_device,
            },
            SendChannel::Local { owner },
        )?;
        env.post_protocol::<OneToOneInvitationProtocol>(
            InstanceId::random(),
            &one_to_one::Message::InitialStatusSync { contact },
            SendChannel::Local { owner },
        )?;
    }

    info!(%contact, device = %contact_device, "channel confirmed");
    Ok(State::ChannelConfirmed)
}

fn abort(env: &mut StepEnv<'_>, state: State) -> Result<State, StepError> {
    if let Some((contact, contact_device)) = state.peer() {
        let own_device = env.own_device()?;
        let channel = ChannelKey {
            owner_device: own_device,
            remote_identity: contact,
            remote_device: contact_device,
        };
        let pending = env
            .ctx
            .db()
            .channels
            .get(&channel)
            .is_some_and(|channel| !channel.confirmed);
        if pending {
            env.ctx.db_mut().channels.delete(&channel);
        }
        info!(%contact, device = %contact_device, "channel creation aborted");
    }
    Ok(State::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obvchan_protocol::UID_LEN;

    const ALL_STATES: [StateKind; 8] = [
        StateKind::Initial,
        StateKind::PingSent,
        StateKind::WaitingForK1,
        StateKind::WaitingForK2,
        StateKind::WaitForFirstAck,
        StateKind::WaitForSecondAck,
        StateKind::ChannelConfirmed,
        StateKind::Cancelled,
    ];

    const ALL_STEPS: [Step; 8] = [
        Step::SendPing,
        Step::SendPingOrEphemeralKey,
        Step::SendEphemeralKeyAndK1,
        Step::RecoverK1AndSendK2AndCreateChannel,
        Step::RecoverK2CreateChannelAndSendAck,
        Step::ConfirmChannelAndSendAck,
        Step::ConfirmChannel,
        Step::Abort,
    ];

    fn identity(tag: u8) -> CryptoIdentity {
        CryptoIdentity {
            signing_key: [tag; 32],
            encryption_key: [tag; 32],
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for step in ALL_STEPS {
            for state in step.valid_from() {
                assert!(
                    !ChannelCreationProtocol::is_terminal(*state),
                    "{:?} runs from terminal {:?}",
                    step,
                    state
                );
            }
            assert!(!step.returns().is_empty());
        }
    }

    #[test]
    fn every_running_state_can_be_left() {
        for state in ALL_STATES {
            if ChannelCreationProtocol::is_terminal(state) {
                continue;
            }
            assert!(
                ALL_STEPS.iter().any(|step| step.valid_from().contains(&state)),
                "{:?} is a dead end",
                state
            );
        }
    }

    #[test]
    fn table_lookups() {
        let ping = Message::Ping {
            sender: identity(1),
            sender_device: Uid([1u8; UID_LEN]),
            signature: vec![],
        };
        assert_eq!(
            ChannelCreationProtocol::step_for(StateKind::Initial, &ping),
            Some(Step::SendPingOrEphemeralKey)
        );
        assert_eq!(
            ChannelCreationProtocol::step_for(StateKind::ChannelConfirmed, &ping),
            None
        );
        let k2 = Message::K2 {
            c2: KemCiphertext([0u8; 32]),
        };
        assert_eq!(ChannelCreationProtocol::step_for(StateKind::WaitingForK1, &k2), None);
        assert_eq!(
            ChannelCreationProtocol::step_for(StateKind::WaitingForK2, &k2),
            Some(Step::RecoverK2CreateChannelAndSendAck)
        );
        assert_eq!(
            ChannelCreationProtocol::step_for(StateKind::Initial, &Message::Abort),
            None
        );
    }

    #[test]
    fn device_uid_decides_before_identity() {
        let small = Uid([1u8; UID_LEN]);
        let big = Uid([2u8; UID_LEN]);
        assert!(is_in_charge(&small, &identity(9), &big, &identity(1)));
        assert!(!is_in_charge(&big, &identity(1), &small, &identity(9)));
        assert!(is_in_charge(&small, &identity(1), &small, &identity(9)));
        assert!(!is_in_charge(&small, &identity(9), &small, &identity(1)));
    }

    #[test]
    fn acknowledgements_expect_the_pending_channel() {
        let state = State::WaitForFirstAck {
            contact: identity(2),
            contact_device: Uid([2u8; UID_LEN]),
        };
        assert_eq!(
            ChannelCreationProtocol::expected_reception(Step::ConfirmChannelAndSendAck, &state),
            ExpectedReception::ObliviousFrom {
                identity: identity(2),
                device: Some(Uid([2u8; UID_LEN])),
                require_confirmed: false,
            }
        );
        assert_eq!(
            ChannelCreationProtocol::expected_reception(Step::SendPing, &State::Initial),
            ExpectedReception::Local
        );
    }
}
